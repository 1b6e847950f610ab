//! Barrier over a group of sibling items.
//!
//! A gate adds no queuing of its own. It tracks passes: a pass opens with
//! the first request from any child and closes once every request seen
//! during the pass has finished. Under [`GatePolicy::Success`] a pass that
//! closes with a failed child blocks the later stages of the enclosing
//! pipeline until a later pass succeeds.

use crate::context::{Admission, IntegrationContext};
use crate::item::ServerItem;
use crate::lock;
use chrono::{DateTime, Utc};
use cruise_core::IntegrationStatus;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What a pass needs before later stages may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Every requested child has finished, whatever its result.
    #[default]
    Completion,
    /// Every requested child has finished successfully.
    Success,
}

/// Outcome of a closed pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub number: u64,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub succeeded: bool,
}

struct Pass {
    number: u64,
    started_at: DateTime<Utc>,
    requested: BTreeSet<Option<usize>>,
    completed: BTreeSet<Option<usize>>,
    failed: BTreeSet<Option<usize>>,
}

#[derive(Default)]
struct GateState {
    open: usize,
    granted: Vec<Arc<IntegrationContext>>,
    pass: Option<Pass>,
    passes: u64,
    last_pass: Option<PassSummary>,
}

pub struct Gate {
    policy: GatePolicy,
    children: Vec<Arc<ServerItem>>,
    state: Mutex<GateState>,
    blocked: AtomicBool,
}

impl Gate {
    pub(crate) fn new(policy: GatePolicy, children: Vec<Arc<ServerItem>>) -> Self {
        Self {
            policy,
            children,
            state: Mutex::new(GateState::default()),
            blocked: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    pub(crate) fn children(&self) -> &[Arc<ServerItem>] {
        &self.children
    }

    /// Whether a pass is currently open.
    pub fn is_open(&self) -> bool {
        lock(&self.state).pass.is_some()
    }

    /// Number of requests seen in the current pass that have not finished.
    pub fn outstanding(&self) -> usize {
        lock(&self.state).open
    }

    pub fn last_pass(&self) -> Option<PassSummary> {
        lock(&self.state).last_pass.clone()
    }

    /// Whether the last closed pass failed under [`GatePolicy::Success`].
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub(crate) fn active_requests(&self) -> Vec<Arc<IntegrationContext>> {
        lock(&self.state).granted.clone()
    }

    pub(crate) fn enter(&self, name: &str, context: &Arc<IntegrationContext>, via: Option<usize>) {
        let mut state = lock(&self.state);
        state.open += 1;
        if state.pass.is_none() {
            state.passes += 1;
            debug!(gate = %name, pass = state.passes, "Gate pass opened");
            state.pass = Some(Pass {
                number: state.passes,
                started_at: Utc::now(),
                requested: BTreeSet::new(),
                completed: BTreeSet::new(),
                failed: BTreeSet::new(),
            });
        }
        if let Some(pass) = state.pass.as_mut() {
            pass.requested.insert(via);
        }
        debug!(gate = %name, context = %context.id(), open = state.open, "Request entered gate");
    }

    pub(crate) fn admit(&self, context: &Arc<IntegrationContext>) -> Admission {
        lock(&self.state).granted.push(Arc::clone(context));
        Admission::Granted
    }

    pub(crate) fn finish(
        &self,
        name: &str,
        context: &Arc<IntegrationContext>,
        via: Option<usize>,
        outcome: Option<IntegrationStatus>,
    ) {
        let mut state = lock(&self.state);
        state.granted.retain(|g| g.id() != context.id());

        let Some(open) = state.open.checked_sub(1) else {
            warn!(gate = %name, context = %context.id(), "Finished a request the gate never saw");
            return;
        };
        state.open = open;

        if let (Some(status), Some(pass)) = (outcome, state.pass.as_mut()) {
            pass.completed.insert(via);
            if !status.is_success() {
                pass.failed.insert(via);
            }
        }

        if state.open > 0 {
            return;
        }
        let Some(pass) = state.pass.take() else {
            return;
        };

        let succeeded = pass.failed.is_empty();
        let summary = PassSummary {
            number: pass.number,
            started_at: pass.started_at,
            closed_at: Utc::now(),
            completed: self.names(&pass.completed),
            failed: self.names(&pass.failed),
            succeeded,
        };
        if self.policy == GatePolicy::Success {
            self.blocked.store(!succeeded, Ordering::Release);
        }
        info!(
            gate = %name,
            pass = summary.number,
            requested = pass.requested.len(),
            completed = summary.completed.len(),
            succeeded,
            blocked = self.is_blocked(),
            "Gate pass closed"
        );
        state.last_pass = Some(summary);
    }

    fn names(&self, children: &BTreeSet<Option<usize>>) -> Vec<String> {
        children
            .iter()
            .map(|via| match via.and_then(|i| self.children.get(i)) {
                Some(child) => child.name().to_string(),
                None => "(external)".to_string(),
            })
            .collect()
    }
}
