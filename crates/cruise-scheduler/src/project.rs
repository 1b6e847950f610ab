//! Project leaf: the unit that originates integration requests.

use crate::context::{Admission, FollowUp, IntegrationContext};
use crate::lock;
use cruise_core::{IntegrationStatus, IntegrationSummary};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Static settings of a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProjectSettings {
    /// Queue priority. 0 always goes to the back; lower positive values go first.
    #[serde(default)]
    pub queue_priority: u32,
}

#[derive(Default)]
struct ProjectState {
    active: Option<Arc<IntegrationContext>>,
    pending: VecDeque<Arc<IntegrationContext>>,
    running: bool,
    last_integration: Option<IntegrationSummary>,
}

/// A project integrates at most once at a time; further attempts wait here.
pub struct Project {
    settings: ProjectSettings,
    state: Mutex<ProjectState>,
}

impl Project {
    pub(crate) fn new(settings: ProjectSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(ProjectState::default()),
        }
    }

    pub fn settings(&self) -> &ProjectSettings {
        &self.settings
    }

    /// Whether a build is currently executing.
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn last_integration(&self) -> Option<IntegrationSummary> {
        lock(&self.state).last_integration.clone()
    }

    pub(crate) fn mark_running(&self) {
        lock(&self.state).running = true;
    }

    pub(crate) fn record(&self, summary: IntegrationSummary) {
        let mut state = lock(&self.state);
        state.running = false;
        state.last_integration = Some(summary);
    }

    pub(crate) fn active_requests(&self) -> Vec<Arc<IntegrationContext>> {
        lock(&self.state).active.iter().cloned().collect()
    }

    pub(crate) fn pending_requests(&self) -> Vec<Arc<IntegrationContext>> {
        lock(&self.state).pending.iter().cloned().collect()
    }

    pub(crate) fn request_counts(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (usize::from(state.active.is_some()), state.pending.len())
    }

    pub(crate) fn admit(&self, name: &str, context: &Arc<IntegrationContext>) -> Admission {
        let mut state = lock(&self.state);
        if state.active.is_none() {
            state.active = Some(Arc::clone(context));
            Admission::Granted
        } else {
            debug!(
                project = %name,
                context = %context.id(),
                "Project busy, waiting for current integration"
            );
            state.pending.push_back(Arc::clone(context));
            Admission::Parked
        }
    }

    pub(crate) fn finish(
        &self,
        name: &str,
        context: &Arc<IntegrationContext>,
        _outcome: Option<IntegrationStatus>,
    ) -> FollowUp {
        let mut follow_up = FollowUp::default();
        let mut state = lock(&self.state);

        if state.active.as_ref().is_some_and(|a| a.id() == context.id()) {
            state.active = None;
        } else {
            state.pending.retain(|p| p.id() != context.id());
        }

        if state.active.is_none()
            && let Some(next) = state.pending.pop_front()
        {
            debug!(project = %name, context = %next.id(), "Next integration attempt admitted");
            state.active = Some(Arc::clone(&next));
            follow_up.admit(next);
        }
        follow_up
    }
}
