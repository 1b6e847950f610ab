//! Declarative structure configuration.
//!
//! Items are listed flat; composites name their children. The loader turns
//! the list into a parent/child graph, checks that it forms a forest and
//! builds the tree bottom-up.

use crate::gate::GatePolicy;
use crate::item::ServerItem;
use crate::project::ProjectSettings;
use crate::queue::{DuplicateMode, QueueSettings};
use crate::server::Server;
use cruise_core::{Error, Result};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Root of a structure file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StructureConfig {
    /// Display name of the server.
    #[serde(default = "default_server_name")]
    pub server: String,

    #[serde(default)]
    pub runner: RunnerSettings,

    pub items: Vec<ItemConfig>,
}

fn default_server_name() -> String {
    "cruise".to_string()
}

/// One item of the scheduling tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemConfig {
    Project {
        name: String,
        #[serde(default)]
        queue_priority: u32,
    },
    Queue {
        name: String,
        #[serde(default = "default_allowed_active")]
        allowed_active: usize,
        #[serde(default)]
        duplicates: DuplicateMode,
        #[serde(default)]
        max_pending: Option<usize>,
        #[serde(default)]
        children: Vec<String>,
    },
    Gate {
        name: String,
        #[serde(default)]
        policy: GatePolicy,
        children: Vec<String>,
    },
    Pipeline {
        name: String,
        stages: Vec<String>,
    },
    RoundRobin {
        name: String,
        #[serde(default = "default_allowed_active")]
        allowed_active: usize,
        children: Vec<String>,
    },
}

fn default_allowed_active() -> usize {
    1
}

impl ItemConfig {
    pub fn name(&self) -> &str {
        match self {
            ItemConfig::Project { name, .. }
            | ItemConfig::Queue { name, .. }
            | ItemConfig::Gate { name, .. }
            | ItemConfig::Pipeline { name, .. }
            | ItemConfig::RoundRobin { name, .. } => name,
        }
    }

    /// Children in declaration order.
    pub fn children(&self) -> &[String] {
        match self {
            ItemConfig::Project { .. } => &[],
            ItemConfig::Queue { children, .. }
            | ItemConfig::Gate { children, .. }
            | ItemConfig::RoundRobin { children, .. } => children,
            ItemConfig::Pipeline { stages, .. } => stages,
        }
    }

    fn requires_children(&self) -> bool {
        matches!(
            self,
            ItemConfig::Gate { .. } | ItemConfig::Pipeline { .. } | ItemConfig::RoundRobin { .. }
        )
    }

    fn build(&self, children: Vec<Arc<ServerItem>>) -> Result<Arc<ServerItem>> {
        match self {
            ItemConfig::Project {
                name,
                queue_priority,
            } => Ok(ServerItem::project_with(
                name.clone(),
                ProjectSettings {
                    queue_priority: *queue_priority,
                },
            )),
            ItemConfig::Queue {
                name,
                allowed_active,
                duplicates,
                max_pending,
                ..
            } => ServerItem::queue_with(
                name.clone(),
                QueueSettings {
                    allowed_active: *allowed_active,
                    duplicates: *duplicates,
                    max_pending: *max_pending,
                },
                children,
            ),
            ItemConfig::Gate { name, policy, .. } => {
                ServerItem::gate(name.clone(), *policy, children)
            }
            ItemConfig::Pipeline { name, .. } => ServerItem::pipeline(name.clone(), children),
            ItemConfig::RoundRobin {
                name,
                allowed_active,
                ..
            } => ServerItem::round_robin(name.clone(), *allowed_active, children),
        }
    }
}

/// Timing of the project runner loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunnerSettings {
    /// How often triggers are polled.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a runner waits for admission before withdrawing.
    #[serde(default = "default_admission_timeout_secs")]
    pub admission_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_admission_timeout_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            admission_timeout_secs: default_admission_timeout_secs(),
        }
    }
}

impl RunnerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }
}

impl StructureConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loaded structure file");
        Self::from_yaml(&yaml)
    }

    /// Validate the structure and build the tree.
    pub fn build(&self) -> Result<Server> {
        if self.items.is_empty() {
            return Err(Error::InvalidConfiguration(
                "structure must contain at least one item".to_string(),
            ));
        }

        let graph = StructureGraph::new(&self.items)?;
        let order = toposort(&graph.graph, None).map_err(|cycle| {
            Error::CyclicStructure(self.items[graph.graph[cycle.node_id()]].name().to_string())
        })?;

        let mut built: HashMap<NodeIndex, Arc<ServerItem>> = HashMap::new();
        for &node in order.iter().rev() {
            let config = &self.items[graph.graph[node]];
            let mut children = Vec::with_capacity(config.children().len());
            for child in config.children() {
                let index = graph.index[child.as_str()];
                let item = built.remove(&index).ok_or_else(|| {
                    Error::Internal(format!("child '{child}' was not built before its parent"))
                })?;
                children.push(item);
            }
            built.insert(node, config.build(children)?);
        }

        let roots: Vec<_> = graph
            .graph
            .node_indices()
            .filter(|&n| {
                graph
                    .graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|n| built.remove(&n))
            .collect();

        let server = Server::new(self.server.clone(), roots)?;
        info!(
            server = %server.name(),
            items = self.items.len(),
            roots = server.roots().len(),
            projects = server.project_names().len(),
            "Scheduling structure built"
        );
        Ok(server)
    }
}

/// Parent to child edges between item definitions.
struct StructureGraph<'a> {
    graph: DiGraph<usize, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> StructureGraph<'a> {
    fn new(items: &'a [ItemConfig]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for (position, item) in items.iter().enumerate() {
            if item.name().trim().is_empty() {
                return Err(Error::InvalidConfiguration(
                    "item names must not be empty".to_string(),
                ));
            }
            if index.insert(item.name(), graph.add_node(position)).is_some() {
                return Err(Error::DuplicateName(item.name().to_string()));
            }
        }

        let mut parents: HashMap<&str, &str> = HashMap::new();
        for item in items {
            if item.requires_children() && item.children().is_empty() {
                return Err(Error::InvalidConfiguration(format!(
                    "'{}' must have at least one child",
                    item.name()
                )));
            }
            if let ItemConfig::Queue { allowed_active: 0, name, .. }
            | ItemConfig::RoundRobin { allowed_active: 0, name, .. } = item
            {
                return Err(Error::InvalidCapacity { item: name.clone() });
            }

            let parent = index[item.name()];
            for child in item.children() {
                let Some(&child_index) = index.get(child.as_str()) else {
                    return Err(Error::UnknownItem(format!(
                        "'{child}' referenced by '{}'",
                        item.name()
                    )));
                };
                if let Some(previous) = parents.insert(child.as_str(), item.name()) {
                    return Err(Error::AlreadyParented {
                        item: child.clone(),
                        parent: previous.to_string(),
                    });
                }
                graph.add_edge(parent, child_index, ());
            }
        }

        Ok(Self { graph, index })
    }
}
