//! Error types for Cruise CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Duplicate item name: {0}")]
    DuplicateName(String),

    #[error("Cycle detected in structure involving: {0}")]
    CyclicStructure(String),

    #[error("Unknown item: {0}")]
    UnknownItem(String),

    #[error("Item '{item}' already belongs to '{parent}'")]
    AlreadyParented { item: String, parent: String },

    #[error("Invalid capacity for '{item}': allowed_active must be at least 1")]
    InvalidCapacity { item: String },

    // Protocol misuse
    #[error("Integration context {0} has not been admitted")]
    NotAdmitted(String),

    #[error("Integration context {0} has already completed")]
    AlreadyCompleted(String),

    #[error("Integration context {0} has already been asked to integrate")]
    AlreadyRequested(String),

    #[error("Integration context {0} already has a waiter")]
    AlreadyWaiting(String),

    #[error("Integration context {0} is not pending")]
    NotPending(String),

    #[error("Project '{project}' is not scheduled by '{item}'")]
    OutOfScope { project: String, item: String },

    // Runtime errors
    #[error("Integration failed: {0}")]
    Integration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is caused by calling the context protocol out of order.
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(
            self,
            Error::NotAdmitted(_)
                | Error::AlreadyCompleted(_)
                | Error::AlreadyRequested(_)
                | Error::AlreadyWaiting(_)
                | Error::NotPending(_)
                | Error::OutOfScope { .. }
        )
    }

    /// Whether this error was raised while validating a structure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_)
                | Error::DuplicateName(_)
                | Error::CyclicStructure(_)
                | Error::UnknownItem(_)
                | Error::AlreadyParented { .. }
                | Error::InvalidCapacity { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::NotAdmitted("ctx_1".into()).is_protocol_misuse());
        assert!(!Error::NotAdmitted("ctx_1".into()).is_configuration());
        assert!(Error::InvalidCapacity { item: "q".into() }.is_configuration());
        assert!(!Error::Internal("boom".into()).is_protocol_misuse());
    }
}
