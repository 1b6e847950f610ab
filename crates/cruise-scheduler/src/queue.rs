//! Capacity-limited FIFO admission.

use crate::context::{Admission, FollowUp, IntegrationContext};
use crate::item::ServerItem;
use crate::lock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// What to do when a project asks again while already pending in a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMode {
    /// Queue every request.
    #[default]
    Allow,
    /// Keep the request already pending and cancel the new one.
    UseFirst,
    /// A forced request replaces a non-forced pending one in place.
    ReplaceWithForce,
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct QueueSettings {
    /// Maximum number of concurrently admitted requests.
    #[serde(default = "default_allowed_active")]
    pub allowed_active: usize,
    #[serde(default)]
    pub duplicates: DuplicateMode,
    /// Requests arriving while this many are pending are cancelled.
    #[serde(default)]
    pub max_pending: Option<usize>,
}

fn default_allowed_active() -> usize {
    1
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            allowed_active: default_allowed_active(),
            duplicates: DuplicateMode::default(),
            max_pending: None,
        }
    }
}

impl QueueSettings {
    pub fn with_allowed_active(allowed_active: usize) -> Self {
        Self {
            allowed_active,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct QueueState {
    active: Vec<Arc<IntegrationContext>>,
    pending: VecDeque<Arc<IntegrationContext>>,
}

impl QueueState {
    /// Position for a new pending entry: priority 0 goes last, otherwise in
    /// front of the first entry with no priority or a larger one.
    fn insert_position(&self, priority: u32) -> usize {
        if priority == 0 {
            return self.pending.len();
        }
        self.pending
            .iter()
            .position(|p| p.priority() == 0 || p.priority() > priority)
            .unwrap_or(self.pending.len())
    }
}

/// Admits up to `allowed_active` requests at once; the rest wait in order.
pub struct Queue {
    settings: QueueSettings,
    children: Vec<Arc<ServerItem>>,
    state: Mutex<QueueState>,
}

impl Queue {
    pub(crate) fn new(settings: QueueSettings, children: Vec<Arc<ServerItem>>) -> Self {
        Self {
            settings,
            children,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn allowed_active(&self) -> usize {
        self.settings.allowed_active
    }

    pub(crate) fn children(&self) -> &[Arc<ServerItem>] {
        &self.children
    }

    pub fn active_requests(&self) -> Vec<Arc<IntegrationContext>> {
        lock(&self.state).active.clone()
    }

    pub fn pending_requests(&self) -> Vec<Arc<IntegrationContext>> {
        lock(&self.state).pending.iter().cloned().collect()
    }

    pub fn request_counts(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.active.len(), state.pending.len())
    }

    pub(crate) fn admit(
        &self,
        name: &str,
        context: &Arc<IntegrationContext>,
    ) -> (Admission, FollowUp) {
        let mut follow_up = FollowUp::default();
        let mut state = lock(&self.state);

        if let Some(index) = state.pending.iter().position(|p| p.is_same_project(context)) {
            match self.settings.duplicates {
                DuplicateMode::Allow => {}
                DuplicateMode::UseFirst => {
                    info!(
                        queue = %name,
                        project = %context.project_name(),
                        "Project already queued, ignoring new request"
                    );
                    return (
                        Admission::Rejected(format!("already queued in '{name}'")),
                        follow_up,
                    );
                }
                DuplicateMode::ReplaceWithForce => {
                    let existing = &state.pending[index];
                    if context.request().condition().is_forced()
                        && !existing.request().condition().is_forced()
                    {
                        info!(
                            queue = %name,
                            project = %context.project_name(),
                            "Forced request replaces queued request"
                        );
                        let replaced =
                            std::mem::replace(&mut state.pending[index], Arc::clone(context));
                        follow_up.cancel(
                            replaced,
                            format!("replaced by a forced request in '{name}'"),
                        );
                        return (Admission::Parked, follow_up);
                    }
                    info!(
                        queue = %name,
                        project = %context.project_name(),
                        "Project already queued, ignoring new request"
                    );
                    return (
                        Admission::Rejected(format!("already queued in '{name}'")),
                        follow_up,
                    );
                }
            }
        }

        if state.active.len() < self.settings.allowed_active {
            state.active.push(Arc::clone(context));
            debug!(
                queue = %name,
                context = %context.id(),
                active = state.active.len(),
                "Admitted by queue"
            );
            return (Admission::Granted, follow_up);
        }

        if let Some(max) = self.settings.max_pending
            && state.pending.len() >= max
        {
            info!(
                queue = %name,
                project = %context.project_name(),
                max,
                "Queue full, rejecting request"
            );
            return (
                Admission::Rejected(format!("queue '{name}' is full")),
                follow_up,
            );
        }

        let position = state.insert_position(context.priority());
        state.pending.insert(position, Arc::clone(context));
        info!(queue = %name, project = %context.project_name(), position, "Added to queue");
        (Admission::Parked, follow_up)
    }

    pub(crate) fn finish(&self, name: &str, context: &Arc<IntegrationContext>) -> FollowUp {
        let mut follow_up = FollowUp::default();
        let mut state = lock(&self.state);

        let before = state.active.len();
        state.active.retain(|a| a.id() != context.id());
        if state.active.len() == before {
            state.pending.retain(|p| p.id() != context.id());
        }

        while state.active.len() < self.settings.allowed_active {
            let Some(next) = state.pending.pop_front() else {
                break;
            };
            info!(
                queue = %name,
                project = %next.project_name(),
                "First in queue, starting integration"
            );
            state.active.push(Arc::clone(&next));
            follow_up.admit(next);
        }
        follow_up
    }
}
