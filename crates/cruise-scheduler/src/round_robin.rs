//! Fair multiplexer over child items.
//!
//! Every child keeps its own FIFO of requests waiting here. When a slot
//! frees up the cursor picks the next child with demand, starting from the
//! one after the child that was granted last.

use crate::context::{Admission, FollowUp, IntegrationContext};
use crate::item::ServerItem;
use crate::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

struct RoundRobinState {
    active: Vec<(usize, Arc<IntegrationContext>)>,
    pending: Vec<VecDeque<Arc<IntegrationContext>>>,
    cursor: usize,
}

impl RoundRobinState {
    fn has_demand(&self) -> bool {
        self.pending.iter().any(|p| !p.is_empty())
    }

    fn grant(&mut self, child: usize, context: Arc<IntegrationContext>) {
        self.active.push((child, context));
        self.cursor = (child + 1) % self.pending.len().max(1);
    }

    /// Next child with demand, scanning from the cursor.
    fn next_child(&self) -> Option<usize> {
        let count = self.pending.len();
        (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&child| !self.pending[child].is_empty())
    }
}

pub struct RoundRobin {
    allowed_active: usize,
    children: Vec<Arc<ServerItem>>,
    state: Mutex<RoundRobinState>,
}

impl RoundRobin {
    pub(crate) fn new(allowed_active: usize, children: Vec<Arc<ServerItem>>) -> Self {
        let state = RoundRobinState {
            active: Vec::new(),
            pending: vec![VecDeque::new(); children.len()],
            cursor: 0,
        };
        Self {
            allowed_active,
            children,
            state: Mutex::new(state),
        }
    }

    pub fn allowed_active(&self) -> usize {
        self.allowed_active
    }

    pub(crate) fn children(&self) -> &[Arc<ServerItem>] {
        &self.children
    }

    /// Index of the child that is offered the next free slot first.
    pub fn cursor(&self) -> usize {
        lock(&self.state).cursor
    }

    pub(crate) fn active_requests(&self) -> Vec<Arc<IntegrationContext>> {
        lock(&self.state).active.iter().map(|(_, c)| Arc::clone(c)).collect()
    }

    /// Waiting requests in the order the cursor would grant them.
    pub(crate) fn pending_requests(&self) -> Vec<Arc<IntegrationContext>> {
        let state = lock(&self.state);
        let count = state.pending.len();
        (0..count)
            .flat_map(|offset| state.pending[(state.cursor + offset) % count].iter())
            .cloned()
            .collect()
    }

    pub(crate) fn request_counts(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.active.len(), state.pending.iter().map(VecDeque::len).sum())
    }

    pub(crate) fn admit(
        &self,
        name: &str,
        context: &Arc<IntegrationContext>,
        via: Option<usize>,
    ) -> Admission {
        let Some(child) = via.filter(|&i| i < self.children.len()) else {
            return Admission::Rejected(format!(
                "round robin '{name}' only admits its own children"
            ));
        };
        let mut state = lock(&self.state);
        if state.active.len() < self.allowed_active && !state.has_demand() {
            state.grant(child, Arc::clone(context));
            return Admission::Granted;
        }
        debug!(round_robin = %name, child, context = %context.id(), "Waiting for a turn");
        state.pending[child].push_back(Arc::clone(context));
        Admission::Parked
    }

    pub(crate) fn finish(&self, name: &str, context: &Arc<IntegrationContext>) -> FollowUp {
        let mut follow_up = FollowUp::default();
        let mut state = lock(&self.state);

        state.active.retain(|(_, a)| a.id() != context.id());
        for pending in &mut state.pending {
            pending.retain(|p| p.id() != context.id());
        }

        while state.active.len() < self.allowed_active {
            let Some(child) = state.next_child() else {
                break;
            };
            let Some(next) = state.pending[child].pop_front() else {
                break;
            };
            debug!(
                round_robin = %name,
                child = %self.children[child].name(),
                context = %next.id(),
                "Turn granted"
            );
            state.grant(child, Arc::clone(&next));
            follow_up.admit(next);
        }
        follow_up
    }
}
