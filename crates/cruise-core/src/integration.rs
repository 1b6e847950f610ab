//! Integration request and outcome types.

use crate::ids::RequestId;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Why a build was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuildCondition {
    /// Build only when the source has changed.
    IfModificationExists,
    /// Build regardless of modifications.
    ForceBuild,
}

impl BuildCondition {
    pub fn is_forced(&self) -> bool {
        matches!(self, BuildCondition::ForceBuild)
    }
}

/// An immutable description of a requested integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IntegrationRequest {
    id: RequestId,
    condition: BuildCondition,
    source: String,
    timestamp: DateTime<Utc>,
}

impl IntegrationRequest {
    pub fn new(condition: BuildCondition, source: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            condition,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }

    /// A forced request, as raised by an operator.
    pub fn force(source: impl Into<String>) -> Self {
        Self::new(BuildCondition::ForceBuild, source)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn condition(&self) -> BuildCondition {
        self.condition
    }

    /// Name of the trigger that raised the request.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Result of an integration as reported by the build executor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    #[default]
    Unknown,
    Success,
    Failure,
    Error,
    Cancelled,
}

impl IntegrationStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, IntegrationStatus::Success)
    }
}

/// Record of the last integration of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IntegrationSummary {
    pub request_id: RequestId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: IntegrationStatus,
}

impl IntegrationSummary {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}
