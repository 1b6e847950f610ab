//! Local simulation of a scheduling tree with timed fake builds.

use async_trait::async_trait;
use cruise_core::ports::BuildExecutor;
use cruise_core::{Error, IntegrationRequest, IntegrationStatus, Result};
use cruise_scheduler::{ContextState, IntegrationContext, Server};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Build executor that sleeps instead of building.
pub struct SimulatedBuild {
    duration: Duration,
    failing: HashSet<String>,
    started: Mutex<Vec<String>>,
}

impl SimulatedBuild {
    pub fn new(duration: Duration, failing: impl IntoIterator<Item = String>) -> Self {
        Self {
            duration,
            failing: failing.into_iter().collect(),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Projects in the order their builds started.
    pub fn started(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BuildExecutor for SimulatedBuild {
    async fn integrate(
        &self,
        project: &str,
        _request: &IntegrationRequest,
    ) -> Result<IntegrationStatus> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(project.to_string());
        tokio::time::sleep(self.duration).await;

        if self.failing.contains(project) {
            Ok(IntegrationStatus::Failure)
        } else {
            Ok(IntegrationStatus::Success)
        }
    }
}

/// What happened to one simulated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub project: String,
    pub status: Option<IntegrationStatus>,
    pub cancelled: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub admission_order: Vec<String>,
    pub outcomes: Vec<Outcome>,
}

/// Ask for every request in order, then let each one wait for admission and
/// run its build concurrently.
pub async fn run(
    server: Arc<Server>,
    requests: &[String],
    executor: Arc<SimulatedBuild>,
    timeout: Duration,
) -> Result<SimulationReport> {
    let mut contexts = Vec::with_capacity(requests.len());
    for name in requests {
        let project = server
            .project(name)
            .ok_or_else(|| Error::UnknownItem(name.clone()))?;
        let context = IntegrationContext::new(&project, IntegrationRequest::force("simulate"));
        project.ask_to_integrate(&context)?;
        contexts.push(context);
    }

    let attempts = contexts.into_iter().map(|context| {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { attempt(context, executor.as_ref(), timeout).await })
    });

    let mut outcomes = Vec::with_capacity(requests.len());
    for joined in join_all(attempts).await {
        let outcome = joined.map_err(|e| Error::Internal(e.to_string()))??;
        outcomes.push(outcome);
    }

    Ok(SimulationReport {
        admission_order: executor.started(),
        outcomes,
    })
}

async fn attempt(
    context: Arc<IntegrationContext>,
    executor: &dyn BuildExecutor,
    timeout: Duration,
) -> Result<Outcome> {
    let project = context.project_name().to_string();

    let mut admitted = context.wait_async(timeout).await?;
    if !admitted && context.state() == ContextState::Pending {
        // Admission can still land between the timeout and the withdrawal.
        admitted = context.cancel().is_err() && context.state() == ContextState::Admitted;
    }
    if !admitted {
        debug!(project = %project, "Simulated request not admitted");
        return Ok(Outcome {
            project,
            status: None,
            cancelled: context.cancel_reason(),
        });
    }

    let status = executor
        .integrate(&project, context.request())
        .await
        .unwrap_or(IntegrationStatus::Error);
    context.complete_with(status)?;
    Ok(Outcome {
        project,
        status: Some(status),
        cancelled: None,
    })
}
