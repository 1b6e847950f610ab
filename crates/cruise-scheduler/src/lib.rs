//! Integration scheduling for Cruise CI.
//!
//! The scheduling tree decides when a project may integrate. Projects hang
//! off composite items (queues, gates, pipelines and round-robins), each of
//! which applies its own admission policy to requests passing through it.

pub mod config;
pub mod context;
pub mod gate;
pub mod item;
pub mod pipeline;
pub mod project;
pub mod queue;
pub mod round_robin;
pub mod runner;
pub mod server;
pub mod triggers;

pub use config::{ItemConfig, RunnerSettings, StructureConfig};
pub use context::{ContextState, IntegrationContext};
pub use gate::{GatePolicy, PassSummary};
pub use item::{ItemKind, ItemType, ServerItem};
pub use project::ProjectSettings;
pub use queue::{DuplicateMode, QueueSettings};
pub use runner::ProjectRunner;
pub use server::{ItemStatus, Server, ServerHandle};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a node or context mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
