//! Root of the scheduling tree.

use crate::context::{ContextState, IntegrationContext};
use crate::item::{ItemType, ServerItem};
use cruise_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

const RELOAD_REASON: &str = "scheduling structure was reloaded";

/// Point-in-time view of one node and its subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatus {
    pub name: String,
    pub item_type: ItemType,
    pub active: usize,
    pub pending: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ItemStatus>,
}

impl ItemStatus {
    fn capture(item: &ServerItem) -> Self {
        let (active, pending) = item.request_counts();
        Self {
            name: item.name().to_string(),
            item_type: item.item_type(),
            active,
            pending,
            children: item.children().iter().map(|c| Self::capture(c)).collect(),
        }
    }
}

/// The set of top-level items making up one scheduling structure.
pub struct Server {
    name: String,
    roots: Vec<Arc<ServerItem>>,
    projects: HashMap<String, Arc<ServerItem>>,
}

impl Server {
    pub fn new(name: impl Into<String>, roots: Vec<Arc<ServerItem>>) -> Result<Self> {
        let mut root_names = HashSet::new();
        let mut projects = HashMap::new();

        for root in &roots {
            if let Some(parent) = root.parent() {
                return Err(Error::AlreadyParented {
                    item: root.name().to_string(),
                    parent: parent.name().to_string(),
                });
            }
            if !root_names.insert(root.name().to_string()) {
                return Err(Error::DuplicateName(root.name().to_string()));
            }
            for item in descendants(root) {
                if item.item_type() == ItemType::Project
                    && projects
                        .insert(item.name().to_string(), Arc::clone(&item))
                        .is_some()
                {
                    return Err(Error::DuplicateName(item.name().to_string()));
                }
            }
        }

        Ok(Self {
            name: name.into(),
            roots,
            projects,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roots(&self) -> &[Arc<ServerItem>] {
        &self.roots
    }

    /// Any item in the tree by name, searching roots in order.
    pub fn find(&self, name: &str) -> Option<Arc<ServerItem>> {
        self.roots.iter().find_map(|r| r.find(name))
    }

    pub fn project(&self, name: &str) -> Option<Arc<ServerItem>> {
        self.projects.get(name).cloned()
    }

    /// Project names in alphabetical order.
    pub fn project_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.projects.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn status(&self) -> Vec<ItemStatus> {
        self.roots.iter().map(|r| ItemStatus::capture(r)).collect()
    }

    /// Cancel every request that has not been admitted yet.
    ///
    /// Requests are drained in an order where releasing one does not hand a
    /// slot to another request that is about to be drained.
    pub fn cancel_pending(&self) -> usize {
        let mut cancelled = 0;
        loop {
            let pending = self.pending_contexts();
            if pending.is_empty() {
                break;
            }
            for context in pending {
                debug!(server = %self.name, context = %context.id(), "Draining request");
                context.abort(RELOAD_REASON).run();
                if context.state() == ContextState::Cancelled {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    /// Pending contexts, bottom-up through the scheduling items and then the
    /// projects, since a request waiting at its project holds every item above.
    fn pending_contexts(&self) -> Vec<Arc<IntegrationContext>> {
        let mut order: Vec<_> = self
            .roots
            .iter()
            .flat_map(|root| descendants(root).into_iter().rev())
            .collect();
        order.sort_by_key(|item| item.as_project().is_some());

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for item in order {
            for context in item.pending_requests() {
                if context.state() == ContextState::Pending && seen.insert(context.id()) {
                    pending.push(context);
                }
            }
        }
        pending
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("roots", &self.roots.len())
            .field("projects", &self.projects.len())
            .finish()
    }
}

/// Pre-order walk of an item and everything below it.
fn descendants(item: &Arc<ServerItem>) -> Vec<Arc<ServerItem>> {
    let mut out = Vec::new();
    let mut stack = vec![Arc::clone(item)];
    while let Some(next) = stack.pop() {
        stack.extend(next.children().iter().rev().cloned());
        out.push(next);
    }
    out
}

/// Shared access to the live tree, replaceable at runtime.
pub struct ServerHandle {
    current: RwLock<Arc<Server>>,
}

impl ServerHandle {
    pub fn new(server: Server) -> Self {
        Self {
            current: RwLock::new(Arc::new(server)),
        }
    }

    pub fn current(&self) -> Arc<Server> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a new tree and drain the old one.
    ///
    /// Returns how many pending requests were cancelled. Admitted requests
    /// keep running against the old tree.
    pub fn reload(&self, server: Server) -> usize {
        let previous = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, Arc::new(server))
        };
        let cancelled = previous.cancel_pending();
        info!(
            server = %self.current().name(),
            previous = %previous.name(),
            cancelled,
            "Scheduling structure reloaded"
        );
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GatePolicy;
    use cruise_core::IntegrationRequest;

    fn ask(project: &Arc<ServerItem>) -> Arc<IntegrationContext> {
        let context = IntegrationContext::new(project, IntegrationRequest::force("test"));
        project.ask_to_integrate(&context).unwrap();
        context
    }

    fn sample() -> Server {
        let queue = ServerItem::queue(
            "q",
            vec![ServerItem::project("a"), ServerItem::project("b")],
        )
        .unwrap();
        let gate = ServerItem::gate("g", GatePolicy::default(), vec![ServerItem::project("c")])
            .unwrap();
        Server::new("local", vec![queue, gate]).unwrap()
    }

    #[test]
    fn test_project_names_must_be_unique_across_roots() {
        let first = ServerItem::queue("q1", vec![ServerItem::project("same")]).unwrap();
        let second = ServerItem::queue("q2", vec![ServerItem::project("same")]).unwrap();

        let err = Server::new("local", vec![first, second]).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(name) if name == "same"));
    }

    #[test]
    fn test_nested_item_cannot_be_a_root() {
        let project = ServerItem::project("p");
        let _queue = ServerItem::queue("q", vec![Arc::clone(&project)]).unwrap();

        assert!(matches!(
            Server::new("local", vec![project]),
            Err(Error::AlreadyParented { .. })
        ));
    }

    #[test]
    fn test_lookup() {
        let server = sample();
        assert_eq!(server.project_names(), vec!["a", "b", "c"]);
        assert!(server.project("c").is_some());
        assert!(server.project("q").is_none());
        assert_eq!(server.find("g").unwrap().item_type(), ItemType::Gate);
    }

    #[test]
    fn test_status_reports_counts() {
        let server = sample();
        let _a = ask(&server.project("a").unwrap());
        let _b = ask(&server.project("b").unwrap());

        let status = server.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "q");
        assert_eq!((status[0].active, status[0].pending), (1, 1));
        assert_eq!(status[0].children.len(), 2);

        let json = serde_json::to_value(&status[1]).unwrap();
        assert_eq!(json["item_type"], "Gate");
        assert_eq!(json["children"][0]["name"], "c");
    }

    #[test]
    fn test_reload_cancels_pending_requests() {
        let handle = ServerHandle::new(sample());
        let old = handle.current();
        let running = ask(&old.project("a").unwrap());
        let waiting = ask(&old.project("b").unwrap());
        drop(old);

        let cancelled = handle.reload(sample());

        assert_eq!(cancelled, 1);
        assert_eq!(waiting.state(), ContextState::Cancelled);
        assert_eq!(running.state(), ContextState::Admitted);
        running.complete().unwrap();

        let fresh = ask(&handle.current().project("b").unwrap());
        assert_eq!(fresh.state(), ContextState::Admitted);
    }
}
