//! Ordered stages.
//!
//! A request for stage `k` is admitted only while no request for an earlier
//! stage is outstanding. Requests count as outstanding from the moment they
//! are asked for, so later stages cannot overtake earlier work that is still
//! waiting further down the tree.

use crate::context::{Admission, FollowUp, IntegrationContext};
use crate::item::ServerItem;
use crate::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

struct PipelineState {
    outstanding: Vec<usize>,
    granted: Vec<(usize, Arc<IntegrationContext>)>,
    parked: VecDeque<(usize, Arc<IntegrationContext>)>,
}

enum StageCheck {
    Clear,
    Waiting,
    Blocked(String),
}

pub struct Pipeline {
    stages: Vec<Arc<ServerItem>>,
    state: Mutex<PipelineState>,
}

impl Pipeline {
    pub(crate) fn new(stages: Vec<Arc<ServerItem>>) -> Self {
        let state = PipelineState {
            outstanding: vec![0; stages.len()],
            granted: Vec::new(),
            parked: VecDeque::new(),
        };
        Self {
            stages,
            state: Mutex::new(state),
        }
    }

    pub fn stages(&self) -> &[Arc<ServerItem>] {
        &self.stages
    }

    /// Requests registered per stage that have not finished yet.
    pub fn outstanding(&self) -> Vec<usize> {
        lock(&self.state).outstanding.clone()
    }

    pub(crate) fn active_requests(&self) -> Vec<Arc<IntegrationContext>> {
        lock(&self.state).granted.iter().map(|(_, c)| Arc::clone(c)).collect()
    }

    pub(crate) fn pending_requests(&self) -> Vec<Arc<IntegrationContext>> {
        lock(&self.state).parked.iter().map(|(_, c)| Arc::clone(c)).collect()
    }

    pub(crate) fn request_counts(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.granted.len(), state.parked.len())
    }

    pub(crate) fn enter(&self, via: Option<usize>) {
        if let Some(stage) = via {
            let mut state = lock(&self.state);
            if let Some(count) = state.outstanding.get_mut(stage) {
                *count += 1;
            }
        }
    }

    pub(crate) fn admit(
        &self,
        name: &str,
        context: &Arc<IntegrationContext>,
        via: Option<usize>,
    ) -> Admission {
        let Some(stage) = via else {
            return Admission::Rejected(format!("pipeline '{name}' only admits its own stages"));
        };
        let mut state = lock(&self.state);
        match self.check(&state, stage) {
            StageCheck::Clear => {
                state.granted.push((stage, Arc::clone(context)));
                Admission::Granted
            }
            StageCheck::Waiting => {
                debug!(
                    pipeline = %name,
                    stage,
                    context = %context.id(),
                    "Waiting for earlier stages"
                );
                state.parked.push_back((stage, Arc::clone(context)));
                Admission::Parked
            }
            StageCheck::Blocked(reason) => Admission::Rejected(reason),
        }
    }

    pub(crate) fn finish(
        &self,
        name: &str,
        context: &Arc<IntegrationContext>,
        via: Option<usize>,
    ) -> FollowUp {
        let mut follow_up = FollowUp::default();
        let mut state = lock(&self.state);

        if let Some(stage) = via {
            match state.outstanding.get_mut(stage) {
                Some(count) if *count > 0 => *count -= 1,
                _ => warn!(pipeline = %name, stage, "Stage finished more often than requested"),
            }
        }
        state.granted.retain(|(_, g)| g.id() != context.id());
        state.parked.retain(|(_, p)| p.id() != context.id());

        let parked = std::mem::take(&mut state.parked);
        for (stage, waiting) in parked {
            match self.check(&state, stage) {
                StageCheck::Clear => {
                    debug!(pipeline = %name, stage, context = %waiting.id(), "Stage released");
                    state.granted.push((stage, Arc::clone(&waiting)));
                    follow_up.admit(waiting);
                }
                StageCheck::Waiting => state.parked.push_back((stage, waiting)),
                StageCheck::Blocked(reason) => follow_up.cancel(waiting, reason),
            }
        }
        follow_up
    }

    fn check(&self, state: &PipelineState, stage: usize) -> StageCheck {
        if state.outstanding[..stage.min(state.outstanding.len())]
            .iter()
            .any(|count| *count > 0)
        {
            return StageCheck::Waiting;
        }
        match self.stages[..stage.min(self.stages.len())]
            .iter()
            .find(|s| s.blocks_downstream())
        {
            Some(blocker) => StageCheck::Blocked(format!(
                "stage '{}' did not pass",
                blocker.name()
            )),
            None => StageCheck::Clear,
        }
    }
}
