//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and the
//! external collaborators that raise requests and execute builds.

use crate::Result;
use crate::integration::{IntegrationRequest, IntegrationStatus};
use async_trait::async_trait;

/// Source of integration requests for a project.
#[async_trait]
pub trait Trigger: Send + Sync {
    /// Name reported as the request source.
    fn name(&self) -> &str;

    /// Check whether the trigger has tripped.
    async fn check(&self) -> Option<IntegrationRequest>;

    /// Reset after an integration has been attempted.
    async fn reset(&self) {}
}

/// Executes an admitted integration.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Run the build for a project and report its status.
    async fn integrate(
        &self,
        project: &str,
        request: &IntegrationRequest,
    ) -> Result<IntegrationStatus>;
}
