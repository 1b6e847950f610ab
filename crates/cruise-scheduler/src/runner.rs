//! Per-project integration loop.

use crate::config::RunnerSettings;
use crate::context::{ContextState, IntegrationContext};
use crate::item::ServerItem;
use crate::server::ServerHandle;
use chrono::Utc;
use cruise_core::ports::{BuildExecutor, Trigger};
use cruise_core::{Error, IntegrationRequest, IntegrationStatus, IntegrationSummary, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Polls a project's triggers and drives each integration through the tree.
///
/// The project is looked up in the current tree on every attempt, so a
/// reload takes effect from the next integration onwards.
pub struct ProjectRunner {
    server: Arc<ServerHandle>,
    project: String,
    triggers: Vec<Arc<dyn Trigger>>,
    executor: Arc<dyn BuildExecutor>,
    settings: RunnerSettings,
}

impl ProjectRunner {
    pub fn new(
        server: Arc<ServerHandle>,
        project: impl Into<String>,
        executor: Arc<dyn BuildExecutor>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            server,
            project: project.into(),
            triggers: Vec::new(),
            executor,
            settings,
        }
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn Trigger>) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Run until `shutdown` turns true or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.poll_interval().max(Duration::from_millis(1)));

        info!(
            project = %self.project,
            triggers = self.triggers.len(),
            poll_interval_ms = self.settings.poll_interval_ms,
            "Starting project runner"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        result = self.check_for_integration() => {
                            if let Err(e) = result {
                                error!(
                                    project = %self.project,
                                    error = %e,
                                    "Integration attempt failed"
                                );
                            }
                        }
                        _ = shutdown.changed() => {}
                    }
                }
                _ = shutdown.changed() => {}
            }
            if shutdown.has_changed().is_err() || *shutdown.borrow() {
                info!(project = %self.project, "Project runner shutting down");
                break;
            }
        }
    }

    /// Poll the triggers once and, if one tripped, run one integration.
    ///
    /// Returns the summary of the build, or `None` when nothing was built.
    pub async fn check_for_integration(&self) -> Result<Option<IntegrationSummary>> {
        let Some(request) = self.poll_triggers().await else {
            return Ok(None);
        };

        let server = self.server.current();
        let project = server
            .project(&self.project)
            .ok_or_else(|| Error::UnknownItem(self.project.clone()))?;
        let context = IntegrationContext::new(&project, request.clone());
        let attempt = Attempt(Arc::clone(&context));

        debug!(
            project = %self.project,
            context = %context.id(),
            source = %request.source(),
            condition = ?request.condition(),
            "Trigger tripped"
        );
        project.ask_to_integrate(&context)?;

        if !context.wait_async(self.settings.admission_timeout()).await? {
            if context.state() == ContextState::Pending && context.cancel().is_ok() {
                warn!(
                    project = %self.project,
                    context = %context.id(),
                    timeout_secs = self.settings.admission_timeout_secs,
                    "Gave up waiting for admission"
                );
                self.reset_triggers().await;
                return Ok(None);
            }
            if context.state() != ContextState::Admitted {
                info!(
                    project = %self.project,
                    reason = context.cancel_reason().as_deref().unwrap_or("unknown"),
                    "Integration request was cancelled"
                );
                self.reset_triggers().await;
                return Ok(None);
            }
        }

        let summary = self.integrate(&project, &request).await;
        context.complete_with(summary.status)?;
        drop(attempt);
        self.reset_triggers().await;
        Ok(Some(summary))
    }

    async fn integrate(
        &self,
        project: &ServerItem,
        request: &IntegrationRequest,
    ) -> IntegrationSummary {
        let details = project.as_project();
        if let Some(details) = details {
            details.mark_running();
        }

        let started_at = Utc::now();
        info!(project = %self.project, request = %request.id(), "Integration started");
        let status = match self.executor.integrate(&self.project, request).await {
            Ok(status) => status,
            Err(e) => {
                error!(project = %self.project, error = %e, "Build executor failed");
                IntegrationStatus::Error
            }
        };
        let summary = IntegrationSummary {
            request_id: request.id(),
            started_at,
            finished_at: Utc::now(),
            status,
        };
        info!(
            project = %self.project,
            ?status,
            duration_ms = summary.duration_ms(),
            "Integration finished"
        );

        if let Some(details) = details {
            details.record(summary.clone());
        }
        summary
    }

    async fn poll_triggers(&self) -> Option<IntegrationRequest> {
        for trigger in &self.triggers {
            if let Some(request) = trigger.check().await {
                return Some(request);
            }
        }
        None
    }

    async fn reset_triggers(&self) {
        for trigger in &self.triggers {
            trigger.reset().await;
        }
    }
}

/// Gives the tree back whatever an abandoned attempt still holds.
struct Attempt(Arc<IntegrationContext>);

impl Drop for Attempt {
    fn drop(&mut self) {
        let outcome = match self.0.state() {
            ContextState::Pending => self.0.cancel(),
            ContextState::Admitted => self.0.complete_with(IntegrationStatus::Cancelled),
            ContextState::Completed | ContextState::Cancelled => return,
        };
        if let Err(e) = outcome {
            debug!(context = %self.0.id(), error = %e, "Abandoned attempt already settled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use crate::triggers::ManualTrigger;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
        result: fn() -> Result<IntegrationStatus>,
    }

    impl RecordingExecutor {
        fn new(result: fn() -> Result<IntegrationStatus>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                result,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BuildExecutor for RecordingExecutor {
        async fn integrate(
            &self,
            project: &str,
            _request: &IntegrationRequest,
        ) -> Result<IntegrationStatus> {
            self.calls.lock().unwrap().push(project.to_string());
            (self.result)()
        }
    }

    fn handle() -> Arc<ServerHandle> {
        let queue = ServerItem::queue(
            "q",
            vec![ServerItem::project("a"), ServerItem::project("b")],
        )
        .unwrap();
        Arc::new(ServerHandle::new(Server::new("test", vec![queue]).unwrap()))
    }

    fn settings(admission_timeout_secs: u64) -> RunnerSettings {
        RunnerSettings {
            poll_interval_ms: 10,
            admission_timeout_secs,
        }
    }

    #[tokio::test]
    async fn test_nothing_to_do_without_tripped_trigger() {
        let executor = RecordingExecutor::new(|| Ok(IntegrationStatus::Success));
        let runner = ProjectRunner::new(handle(), "a", executor.clone(), settings(5))
            .with_trigger(Arc::new(ManualTrigger::new("manual")));

        assert!(runner.check_for_integration().await.unwrap().is_none());
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_integration_records_summary_and_releases_queue() {
        let server = handle();
        let trigger = Arc::new(ManualTrigger::new("manual"));
        let executor = RecordingExecutor::new(|| Ok(IntegrationStatus::Success));
        let runner = ProjectRunner::new(server.clone(), "a", executor.clone(), settings(5))
            .with_trigger(trigger.clone());

        trigger.request();
        let summary = runner.check_for_integration().await.unwrap().unwrap();

        assert_eq!(summary.status, IntegrationStatus::Success);
        assert_eq!(executor.calls(), vec!["a"]);
        let tree = server.current();
        let project = tree.project("a").unwrap();
        let details = project.as_project().unwrap();
        assert!(!details.is_running());
        assert_eq!(details.last_integration().unwrap().request_id, summary.request_id);
        assert!(tree.find("q").unwrap().active_requests().is_empty());

        assert!(runner.check_for_integration().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_executor_error_maps_to_error_status() {
        let trigger = Arc::new(ManualTrigger::new("manual"));
        let executor =
            RecordingExecutor::new(|| Err(Error::Integration("compiler crashed".to_string())));
        let runner = ProjectRunner::new(handle(), "a", executor, settings(5))
            .with_trigger(trigger.clone());

        trigger.request();
        let summary = runner.check_for_integration().await.unwrap().unwrap();
        assert_eq!(summary.status, IntegrationStatus::Error);
    }

    #[tokio::test]
    async fn test_admission_timeout_withdraws_request() {
        let server = handle();
        let tree = server.current();
        let holder = IntegrationContext::new(
            &tree.project("a").unwrap(),
            IntegrationRequest::force("test"),
        );
        tree.project("a").unwrap().ask_to_integrate(&holder).unwrap();

        let trigger = Arc::new(ManualTrigger::new("manual"));
        let executor = RecordingExecutor::new(|| Ok(IntegrationStatus::Success));
        let runner = ProjectRunner::new(server.clone(), "b", executor.clone(), settings(0))
            .with_trigger(trigger.clone());

        trigger.request();
        assert!(runner.check_for_integration().await.unwrap().is_none());
        assert!(executor.calls().is_empty());
        assert!(tree.find("q").unwrap().pending_requests().is_empty());
        assert!(tree.project("b").unwrap().active_requests().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_project_is_an_error() {
        let trigger = Arc::new(ManualTrigger::new("manual"));
        let executor = RecordingExecutor::new(|| Ok(IntegrationStatus::Success));
        let runner = ProjectRunner::new(handle(), "missing", executor, settings(5))
            .with_trigger(trigger.clone());

        trigger.request();
        assert!(matches!(
            runner.check_for_integration().await,
            Err(Error::UnknownItem(_))
        ));
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let trigger = Arc::new(ManualTrigger::new("manual"));
        let executor = RecordingExecutor::new(|| Ok(IntegrationStatus::Success));
        let runner = Arc::new(
            ProjectRunner::new(handle(), "a", executor.clone(), settings(5))
                .with_trigger(trigger.clone()),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(shutdown_rx).await })
        };

        trigger.request();
        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
