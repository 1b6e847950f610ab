//! Cruise CI Core
//!
//! Core domain types, traits, and error handling for Cruise CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler and its collaborators.

pub mod error;
pub mod ids;
pub mod integration;
pub mod ports;

pub use error::{Error, Result};
pub use ids::*;
pub use integration::{BuildCondition, IntegrationRequest, IntegrationStatus, IntegrationSummary};
