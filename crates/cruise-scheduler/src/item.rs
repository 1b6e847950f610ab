//! Nodes of the scheduling tree.

use crate::context::{Admission, FollowUp, IntegrationContext};
use crate::gate::{Gate, GatePolicy};
use crate::pipeline::Pipeline;
use crate::project::{Project, ProjectSettings};
use crate::queue::{Queue, QueueSettings};
use crate::round_robin::RoundRobin;
use cruise_core::{Error, IntegrationStatus, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

/// Discriminator used for display and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ItemType {
    Project,
    Queue,
    Gate,
    Pipeline,
    RoundRobin,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Project => "Project",
            ItemType::Queue => "Queue",
            ItemType::Gate => "Gate",
            ItemType::Pipeline => "Pipeline",
            ItemType::RoundRobin => "RoundRobin",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-variant state and policy.
pub enum ItemKind {
    Project(Project),
    Queue(Queue),
    Gate(Gate),
    Pipeline(Pipeline),
    RoundRobin(RoundRobin),
}

/// A node of the scheduling tree.
///
/// Parents own their children; children keep a weak link back to the parent
/// so requests can travel towards the root.
pub struct ServerItem {
    name: String,
    parent: OnceLock<Weak<ServerItem>>,
    kind: ItemKind,
}

impl ServerItem {
    pub fn project(name: impl Into<String>) -> Arc<Self> {
        Self::project_with(name, ProjectSettings::default())
    }

    pub fn project_with(name: impl Into<String>, settings: ProjectSettings) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: OnceLock::new(),
            kind: ItemKind::Project(Project::new(settings)),
        })
    }

    /// A queue with the default capacity of one.
    pub fn queue(name: impl Into<String>, children: Vec<Arc<ServerItem>>) -> Result<Arc<Self>> {
        Self::queue_with(name, QueueSettings::default(), children)
    }

    pub fn queue_with(
        name: impl Into<String>,
        settings: QueueSettings,
        children: Vec<Arc<ServerItem>>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if settings.allowed_active == 0 {
            return Err(Error::InvalidCapacity { item: name });
        }
        Self::composite(name, children, |children| {
            ItemKind::Queue(Queue::new(settings, children))
        })
    }

    pub fn gate(
        name: impl Into<String>,
        policy: GatePolicy,
        children: Vec<Arc<ServerItem>>,
    ) -> Result<Arc<Self>> {
        Self::composite(name.into(), children, |children| {
            ItemKind::Gate(Gate::new(policy, children))
        })
    }

    /// A pipeline whose stages are admitted strictly in order.
    pub fn pipeline(name: impl Into<String>, stages: Vec<Arc<ServerItem>>) -> Result<Arc<Self>> {
        Self::composite(name.into(), stages, |stages| {
            ItemKind::Pipeline(Pipeline::new(stages))
        })
    }

    pub fn round_robin(
        name: impl Into<String>,
        allowed_active: usize,
        children: Vec<Arc<ServerItem>>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if allowed_active == 0 {
            return Err(Error::InvalidCapacity { item: name });
        }
        Self::composite(name, children, |children| {
            ItemKind::RoundRobin(RoundRobin::new(allowed_active, children))
        })
    }

    fn composite(
        name: String,
        children: Vec<Arc<ServerItem>>,
        make: impl FnOnce(Vec<Arc<ServerItem>>) -> ItemKind,
    ) -> Result<Arc<Self>> {
        if name.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "item names must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for child in &children {
            if !seen.insert(child.name()) {
                return Err(Error::DuplicateName(format!("{}/{}", name, child.name())));
            }
            if let Some(parent) = child.parent() {
                return Err(Error::AlreadyParented {
                    item: child.name().to_string(),
                    parent: parent.name().to_string(),
                });
            }
        }

        let item = Arc::new(Self {
            name,
            parent: OnceLock::new(),
            kind: make(children),
        });
        for child in item.children() {
            if child.parent.set(Arc::downgrade(&item)).is_err() {
                return Err(Error::AlreadyParented {
                    item: child.name().to_string(),
                    parent: "another item".to_string(),
                });
            }
        }
        Ok(item)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn item_type(&self) -> ItemType {
        match &self.kind {
            ItemKind::Project(_) => ItemType::Project,
            ItemKind::Queue(_) => ItemType::Queue,
            ItemKind::Gate(_) => ItemType::Gate,
            ItemKind::Pipeline(_) => ItemType::Pipeline,
            ItemKind::RoundRobin(_) => ItemType::RoundRobin,
        }
    }

    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    pub fn children(&self) -> &[Arc<ServerItem>] {
        match &self.kind {
            ItemKind::Project(_) => &[],
            ItemKind::Queue(q) => q.children(),
            ItemKind::Gate(g) => g.children(),
            ItemKind::Pipeline(p) => p.stages(),
            ItemKind::RoundRobin(r) => r.children(),
        }
    }

    pub fn parent(&self) -> Option<Arc<ServerItem>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    /// This item followed by its ancestors, nearest first.
    pub fn lineage(self: &Arc<Self>) -> Vec<Arc<ServerItem>> {
        let mut lineage = vec![Arc::clone(self)];
        let mut current = self.parent();
        while let Some(item) = current {
            current = item.parent();
            lineage.push(item);
        }
        lineage
    }

    /// Slash-separated path from the root to this item.
    pub fn path(self: &Arc<Self>) -> String {
        let mut names: Vec<_> = self.lineage().iter().map(|i| i.name().to_string()).collect();
        names.reverse();
        names.join("/")
    }

    pub fn child(&self, name: &str) -> Option<&Arc<ServerItem>> {
        self.children().iter().find(|c| c.name() == name)
    }

    /// Depth-first search for a descendant (or self) by name.
    pub fn find(self: &Arc<Self>, name: &str) -> Option<Arc<ServerItem>> {
        if self.name == name {
            return Some(Arc::clone(self));
        }
        self.children().iter().find_map(|c| c.find(name))
    }

    pub fn as_project(&self) -> Option<&Project> {
        match &self.kind {
            ItemKind::Project(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_queue(&self) -> Option<&Queue> {
        match &self.kind {
            ItemKind::Queue(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_gate(&self) -> Option<&Gate> {
        match &self.kind {
            ItemKind::Gate(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_pipeline(&self) -> Option<&Pipeline> {
        match &self.kind {
            ItemKind::Pipeline(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_round_robin(&self) -> Option<&RoundRobin> {
        match &self.kind {
            ItemKind::RoundRobin(r) => Some(r),
            _ => None,
        }
    }

    /// Ask this item (and everything above it) to admit `context`.
    ///
    /// Returns once the request has been either admitted or parked; use
    /// [`IntegrationContext::wait`] to find out which.
    pub fn ask_to_integrate(self: &Arc<Self>, context: &Arc<IntegrationContext>) -> Result<()> {
        context.request_admission(self)
    }

    /// Contexts currently admitted by this item.
    pub fn active_requests(&self) -> Vec<Arc<IntegrationContext>> {
        match &self.kind {
            ItemKind::Project(p) => p.active_requests(),
            ItemKind::Queue(q) => q.active_requests(),
            ItemKind::Gate(g) => g.active_requests(),
            ItemKind::Pipeline(p) => p.active_requests(),
            ItemKind::RoundRobin(r) => r.active_requests(),
        }
    }

    /// Contexts parked at this item, in admission order where one exists.
    pub fn pending_requests(&self) -> Vec<Arc<IntegrationContext>> {
        match &self.kind {
            ItemKind::Project(p) => p.pending_requests(),
            ItemKind::Queue(q) => q.pending_requests(),
            ItemKind::Gate(_) => Vec::new(),
            ItemKind::Pipeline(p) => p.pending_requests(),
            ItemKind::RoundRobin(r) => r.pending_requests(),
        }
    }

    /// Active and pending counts read under a single lock of the item.
    pub fn request_counts(&self) -> (usize, usize) {
        match &self.kind {
            ItemKind::Project(p) => p.request_counts(),
            ItemKind::Queue(q) => q.request_counts(),
            ItemKind::Gate(g) => (g.active_requests().len(), 0),
            ItemKind::Pipeline(p) => p.request_counts(),
            ItemKind::RoundRobin(r) => r.request_counts(),
        }
    }

    /// Whether this item stops later pipeline stages from being admitted.
    pub(crate) fn blocks_downstream(&self) -> bool {
        self.as_gate().is_some_and(Gate::is_blocked)
    }

    pub(crate) fn child_index(&self, child: &Arc<ServerItem>) -> Option<usize> {
        self.children().iter().position(|c| Arc::ptr_eq(c, child))
    }

    pub(crate) fn accepts(
        self: &Arc<Self>,
        context: &IntegrationContext,
        via: Option<usize>,
    ) -> bool {
        match &self.kind {
            ItemKind::Project(_) => context.belongs_to(self),
            ItemKind::Queue(_) | ItemKind::Gate(_) => true,
            ItemKind::Pipeline(_) | ItemKind::RoundRobin(_) => via.is_some(),
        }
    }

    pub(crate) fn enter(&self, context: &Arc<IntegrationContext>, via: Option<usize>) {
        match &self.kind {
            ItemKind::Gate(g) => g.enter(&self.name, context, via),
            ItemKind::Pipeline(p) => p.enter(via),
            _ => {}
        }
    }

    pub(crate) fn admit(
        &self,
        context: &Arc<IntegrationContext>,
        via: Option<usize>,
    ) -> (Admission, FollowUp) {
        match &self.kind {
            ItemKind::Project(p) => (p.admit(&self.name, context), FollowUp::default()),
            ItemKind::Queue(q) => q.admit(&self.name, context),
            ItemKind::Gate(g) => (g.admit(context), FollowUp::default()),
            ItemKind::Pipeline(p) => (p.admit(&self.name, context, via), FollowUp::default()),
            ItemKind::RoundRobin(r) => (r.admit(&self.name, context, via), FollowUp::default()),
        }
    }

    pub(crate) fn finish(
        &self,
        context: &Arc<IntegrationContext>,
        via: Option<usize>,
        outcome: Option<IntegrationStatus>,
    ) -> FollowUp {
        match &self.kind {
            ItemKind::Project(p) => p.finish(&self.name, context, outcome),
            ItemKind::Queue(q) => q.finish(&self.name, context),
            ItemKind::Gate(g) => {
                g.finish(&self.name, context, via, outcome);
                FollowUp::default()
            }
            ItemKind::Pipeline(p) => p.finish(&self.name, context, via),
            ItemKind::RoundRobin(r) => r.finish(&self.name, context),
        }
    }
}

impl fmt::Debug for ServerItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerItem")
            .field("name", &self.name)
            .field("item_type", &self.item_type())
            .field("children", &self.children().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_types() {
        let project = ServerItem::project("p");
        assert_eq!(project.item_type().as_str(), "Project");
        assert_eq!(ServerItem::queue("q", vec![]).unwrap().item_type().as_str(), "Queue");
        assert_eq!(
            ServerItem::gate("g", GatePolicy::default(), vec![])
                .unwrap()
                .item_type()
                .as_str(),
            "Gate"
        );
        assert_eq!(
            ServerItem::pipeline("pl", vec![]).unwrap().item_type().to_string(),
            "Pipeline"
        );
        assert_eq!(
            ServerItem::round_robin("rr", 1, vec![]).unwrap().item_type().to_string(),
            "RoundRobin"
        );
    }

    #[test]
    fn test_adding_children_sets_parent() {
        let project = ServerItem::project("p");
        let inner = ServerItem::queue("inner", vec![Arc::clone(&project)]).unwrap();
        let outer = ServerItem::queue("outer", vec![Arc::clone(&inner)]).unwrap();

        assert!(Arc::ptr_eq(&project.parent().unwrap(), &inner));
        assert!(Arc::ptr_eq(&inner.parent().unwrap(), &outer));
        assert!(outer.parent().is_none());
        assert_eq!(project.path(), "outer/inner/p");
    }

    #[test]
    fn test_child_cannot_have_two_parents() {
        let project = ServerItem::project("p");
        let _first = ServerItem::queue("first", vec![Arc::clone(&project)]).unwrap();

        let err = ServerItem::queue("second", vec![project]).unwrap_err();
        assert!(matches!(err, Error::AlreadyParented { .. }));
    }

    #[test]
    fn test_duplicate_sibling_names_rejected() {
        let err = ServerItem::queue(
            "q",
            vec![ServerItem::project("same"), ServerItem::project("same")],
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let settings = QueueSettings {
            allowed_active: 0,
            ..Default::default()
        };
        assert!(matches!(
            ServerItem::queue_with("q", settings, vec![]),
            Err(Error::InvalidCapacity { .. })
        ));
        assert!(matches!(
            ServerItem::round_robin("rr", 0, vec![]),
            Err(Error::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_find_descends_tree() {
        let project = ServerItem::project("deep");
        let gate = ServerItem::gate("g", GatePolicy::default(), vec![project]).unwrap();
        let pipeline = ServerItem::pipeline("pl", vec![gate]).unwrap();

        let found = pipeline.find("deep").unwrap();
        assert_eq!(found.item_type(), ItemType::Project);
        assert!(pipeline.find("missing").is_none());
        assert!(pipeline.child("g").is_some());
    }
}
