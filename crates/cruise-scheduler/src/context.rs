//! Per-attempt admission handle.
//!
//! An [`IntegrationContext`] is created by a project for one integration
//! attempt. Asking the tree to integrate plans a route from the asked item up
//! to the root, with the project itself moved to the end; every item on the
//! route must grant the request before the context is signalled as admitted.
//! Completing (or cancelling) the context walks the same route again,
//! releasing whatever each item holds and admitting the next waiters before
//! the call returns.
//!
//! Locking: a thread holds at most one context route lock at a time, and
//! item locks are only ever taken inside it, never the other way round.

use crate::item::ServerItem;
use crate::lock;
use chrono::{DateTime, Utc};
use cruise_core::ids::ContextId;
use cruise_core::{Error, IntegrationRequest, IntegrationStatus, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Lifecycle of an integration context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Pending,
    Admitted,
    Completed,
    Cancelled,
}

impl ContextState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContextState::Completed | ContextState::Cancelled)
    }
}

/// Decision of a single item on a request passing through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    Granted,
    Parked,
    Rejected(String),
}

/// Work produced by an item state change, run once the item lock is released.
#[derive(Default)]
pub(crate) struct FollowUp {
    admitted: Vec<Arc<IntegrationContext>>,
    cancelled: Vec<(Arc<IntegrationContext>, String)>,
}

enum Step {
    Resume(Arc<IntegrationContext>),
    Cancel(Arc<IntegrationContext>, String),
}

impl FollowUp {
    /// A parked context was granted by an item and must continue its route.
    pub(crate) fn admit(&mut self, context: Arc<IntegrationContext>) {
        self.admitted.push(context);
    }

    pub(crate) fn cancel(&mut self, context: Arc<IntegrationContext>, reason: impl Into<String>) {
        self.cancelled.push((context, reason.into()));
    }

    pub(crate) fn extend(&mut self, other: FollowUp) {
        self.admitted.extend(other.admitted);
        self.cancelled.extend(other.cancelled);
    }

    fn into_steps(self) -> impl Iterator<Item = Step> {
        self.admitted
            .into_iter()
            .map(Step::Resume)
            .chain(self.cancelled.into_iter().map(|(c, r)| Step::Cancel(c, r)))
    }

    /// Drain the work list on the calling thread.
    pub(crate) fn run(self) {
        let mut work: VecDeque<Step> = self.into_steps().collect();
        while let Some(step) = work.pop_front() {
            let next = match step {
                Step::Resume(context) => context.resume(),
                Step::Cancel(context, reason) => context.abort(&reason),
            };
            work.extend(next.into_steps());
        }
    }
}

struct Hop {
    item: Weak<ServerItem>,
    via: Option<usize>,
}

#[derive(Default)]
struct Route {
    requested: bool,
    hops: Vec<Hop>,
    position: usize,
}

struct Signal {
    state: ContextState,
    waiting: bool,
    status: Option<IntegrationStatus>,
    reason: Option<String>,
}

/// Synchronization handle for one integration attempt of one project.
pub struct IntegrationContext {
    id: ContextId,
    project: Weak<ServerItem>,
    project_name: String,
    priority: u32,
    request: IntegrationRequest,
    created_at: DateTime<Utc>,
    route: Mutex<Route>,
    signal: Mutex<Signal>,
    changed: Condvar,
    notify: Notify,
}

impl IntegrationContext {
    pub fn new(project: &Arc<ServerItem>, request: IntegrationRequest) -> Arc<Self> {
        let priority = project
            .as_project()
            .map(|p| p.settings().queue_priority)
            .unwrap_or(0);

        Arc::new(Self {
            id: ContextId::new(),
            project: Arc::downgrade(project),
            project_name: project.name().to_string(),
            priority,
            request,
            created_at: Utc::now(),
            route: Mutex::new(Route::default()),
            signal: Mutex::new(Signal {
                state: ContextState::Pending,
                waiting: false,
                status: None,
                reason: None,
            }),
            changed: Condvar::new(),
            notify: Notify::new(),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The project this attempt belongs to, if it is still part of a tree.
    pub fn project(&self) -> Option<Arc<ServerItem>> {
        self.project.upgrade()
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn request(&self) -> &IntegrationRequest {
        &self.request
    }

    /// Queue priority of the originating project; 0 means none.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ContextState {
        lock(&self.signal).state
    }

    /// Status recorded by [`complete_with`](Self::complete_with).
    pub fn status(&self) -> Option<IntegrationStatus> {
        lock(&self.signal).status
    }

    /// Why the context was cancelled, if it was.
    pub fn cancel_reason(&self) -> Option<String> {
        lock(&self.signal).reason.clone()
    }

    pub(crate) fn is_same_project(&self, other: &IntegrationContext) -> bool {
        Weak::ptr_eq(&self.project, &other.project)
    }

    pub(crate) fn belongs_to(&self, item: &Arc<ServerItem>) -> bool {
        std::ptr::eq(self.project.as_ptr(), Arc::as_ptr(item))
    }

    /// Block until admitted or until `timeout` elapses.
    ///
    /// Returns `true` once admitted and `false` on timeout or cancellation.
    /// A timeout leaves the request where it is.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut signal = lock(&self.signal);
        match signal.state {
            ContextState::Admitted => return Ok(true),
            ContextState::Cancelled => return Ok(false),
            ContextState::Completed => return Err(Error::AlreadyCompleted(self.id.to_string())),
            ContextState::Pending => {}
        }
        if signal.waiting {
            return Err(Error::AlreadyWaiting(self.id.to_string()));
        }
        signal.waiting = true;

        let (mut signal, _) = self
            .changed
            .wait_timeout_while(signal, timeout, |s| s.state == ContextState::Pending)
            .unwrap_or_else(PoisonError::into_inner);
        signal.waiting = false;
        Ok(signal.state == ContextState::Admitted)
    }

    /// Async counterpart of [`wait`](Self::wait).
    pub async fn wait_async(&self, timeout: Duration) -> Result<bool> {
        // Timeouts too large to represent wait without a deadline.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        {
            let mut signal = lock(&self.signal);
            match signal.state {
                ContextState::Admitted => return Ok(true),
                ContextState::Cancelled => return Ok(false),
                ContextState::Completed => {
                    return Err(Error::AlreadyCompleted(self.id.to_string()));
                }
                ContextState::Pending => {}
            }
            if signal.waiting {
                return Err(Error::AlreadyWaiting(self.id.to_string()));
            }
            signal.waiting = true;
        }
        let _guard = WaitGuard(self);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state() {
                ContextState::Pending => {}
                state => return Ok(state == ContextState::Admitted),
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(self.state() == ContextState::Admitted);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Complete with an unknown status.
    pub fn complete(self: &Arc<Self>) -> Result<()> {
        self.complete_with(IntegrationStatus::Unknown)
    }

    /// Mark the integration finished and release everything it holds.
    ///
    /// The next waiters are admitted before this returns.
    pub fn complete_with(self: &Arc<Self>, status: IntegrationStatus) -> Result<()> {
        let follow_up = {
            let mut route = lock(&self.route);
            match self.state() {
                ContextState::Admitted => {}
                ContextState::Pending => return Err(Error::NotAdmitted(self.id.to_string())),
                ContextState::Completed | ContextState::Cancelled => {
                    return Err(Error::AlreadyCompleted(self.id.to_string()));
                }
            }
            self.settle(ContextState::Completed, Some(status), None);
            debug!(
                context = %self.id,
                project = %self.project_name,
                ?status,
                "Integration completed"
            );
            self.release_route(&mut route, Some(status))
        };
        follow_up.run();
        Ok(())
    }

    /// Withdraw a request that has not been admitted yet.
    pub fn cancel(self: &Arc<Self>) -> Result<()> {
        let follow_up = {
            let mut route = lock(&self.route);
            match self.state() {
                ContextState::Pending => {}
                ContextState::Admitted => return Err(Error::NotPending(self.id.to_string())),
                ContextState::Completed | ContextState::Cancelled => {
                    return Err(Error::AlreadyCompleted(self.id.to_string()));
                }
            }
            self.cancel_locked(&mut route, "withdrawn")
        };
        follow_up.run();
        Ok(())
    }

    pub(crate) fn request_admission(self: &Arc<Self>, start: &Arc<ServerItem>) -> Result<()> {
        let follow_up = {
            let mut route = lock(&self.route);
            if route.requested {
                return Err(Error::AlreadyRequested(self.id.to_string()));
            }
            if self.state() != ContextState::Pending {
                return Err(Error::NotPending(self.id.to_string()));
            }

            route.hops = self.plan_route(start)?;
            route.requested = true;
            route.position = 0;
            for hop in &route.hops {
                if let Some(item) = hop.item.upgrade() {
                    item.enter(self, hop.via);
                }
            }

            debug!(
                context = %self.id,
                project = %self.project_name,
                hops = route.hops.len(),
                "Asking to integrate"
            );
            self.advance(&mut route)
        };
        follow_up.run();
        Ok(())
    }

    /// Cancel with a reason chosen by the scheduler rather than the caller.
    pub(crate) fn abort(self: &Arc<Self>, reason: &str) -> FollowUp {
        let mut route = lock(&self.route);
        if self.state() != ContextState::Pending {
            return FollowUp::default();
        }
        self.cancel_locked(&mut route, reason)
    }

    fn cancel_locked(self: &Arc<Self>, route: &mut Route, reason: &str) -> FollowUp {
        self.settle(ContextState::Cancelled, None, Some(reason));
        info!(
            context = %self.id,
            project = %self.project_name,
            reason,
            "Integration request cancelled"
        );
        self.release_route(route, None)
    }

    /// Continue the route after the item at the current position granted it.
    fn resume(self: &Arc<Self>) -> FollowUp {
        let mut route = lock(&self.route);
        if self.state() != ContextState::Pending {
            // Withdrawn after the grant; the withdrawal already gave the slot back.
            return FollowUp::default();
        }
        route.position += 1;
        self.advance(&mut route)
    }

    fn plan_route(&self, start: &Arc<ServerItem>) -> Result<Vec<Hop>> {
        let lineage = self
            .project
            .upgrade()
            .map(|p| p.lineage())
            .unwrap_or_default();

        let mut previous = lineage
            .iter()
            .position(|item| Arc::ptr_eq(item, start))
            .and_then(|index| index.checked_sub(1))
            .map(|index| Arc::clone(&lineage[index]));

        let mut hops = Vec::new();
        let mut current = Some(Arc::clone(start));
        while let Some(item) = current {
            let via = previous.as_ref().and_then(|child| item.child_index(child));
            if !item.accepts(self, via) {
                return Err(Error::OutOfScope {
                    project: self.project_name.clone(),
                    item: item.name().to_string(),
                });
            }
            hops.push(Hop {
                item: Arc::downgrade(&item),
                via,
            });
            current = item.parent();
            previous = Some(item);
        }

        // The project hop goes last: a second attempt waits in the queues
        // above it, where duplicates are visible, and only holds the project
        // once every other item has granted it.
        if start.as_project().is_some() && hops.len() > 1 {
            hops.rotate_left(1);
        }
        Ok(hops)
    }

    fn advance(self: &Arc<Self>, route: &mut Route) -> FollowUp {
        let mut follow_up = FollowUp::default();
        while route.position < route.hops.len() {
            let hop = &route.hops[route.position];
            let Some(item) = hop.item.upgrade() else {
                warn!(
                    context = %self.id,
                    project = %self.project_name,
                    "Scheduling item dropped while a request was in flight"
                );
                follow_up.cancel(Arc::clone(self), "scheduling structure was replaced");
                return follow_up;
            };

            let (admission, extra) = item.admit(self, hop.via);
            follow_up.extend(extra);
            match admission {
                Admission::Granted => {
                    debug!(context = %self.id, item = %item.name(), "Granted");
                    route.position += 1;
                }
                Admission::Parked => {
                    debug!(context = %self.id, item = %item.name(), "Parked");
                    return follow_up;
                }
                Admission::Rejected(reason) => {
                    debug!(context = %self.id, item = %item.name(), %reason, "Rejected");
                    follow_up.cancel(Arc::clone(self), reason);
                    return follow_up;
                }
            }
        }

        self.settle(ContextState::Admitted, None, None);
        debug!(context = %self.id, project = %self.project_name, "Admitted");
        follow_up
    }

    fn release_route(
        self: &Arc<Self>,
        route: &mut Route,
        outcome: Option<IntegrationStatus>,
    ) -> FollowUp {
        let mut follow_up = FollowUp::default();
        for hop in route.hops.drain(..) {
            if let Some(item) = hop.item.upgrade() {
                follow_up.extend(item.finish(self, hop.via, outcome));
            }
        }
        route.position = 0;
        follow_up
    }

    fn settle(&self, state: ContextState, status: Option<IntegrationStatus>, reason: Option<&str>) {
        {
            let mut signal = lock(&self.signal);
            signal.state = state;
            signal.status = status;
            signal.reason = reason.map(str::to_string);
        }
        self.changed.notify_all();
        self.notify.notify_waiters();
    }
}

impl fmt::Debug for IntegrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationContext")
            .field("id", &self.id)
            .field("project", &self.project_name)
            .field("state", &self.state())
            .finish()
    }
}

struct WaitGuard<'a>(&'a IntegrationContext);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        lock(&self.0.signal).waiting = false;
    }
}
