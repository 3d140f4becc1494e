//! Saving a workflow to a directory and loading it back.
//!
//! A saved workflow is a directory holding `workflow.json` plus one
//! `internals/<node>` directory per executed node with private files.
//! Loading is tolerant: unknown node types and dangling connections are
//! skipped with a warning, and nodes whose saved results can not be trusted
//! come back CONFIGURED.

use crate::config::RuntimeConfig;
use crate::connection::ConnectionContainer;
use crate::container::{ContainerKind, LeafContainer, NodeContainer};
use crate::graph::Workflow;
use crate::manager::{Core, WorkflowManager};
use crate::registry::NodeRegistry;
use chrono::{DateTime, Utc};
use flowcore::{
    FlowError, InternalState, Node, NodeId, NodeMessage, NodeSettings, NodeState,
    PortDefinition, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const FORMAT_VERSION: u32 = 1;
pub const WORKFLOW_FILE: &str = "workflow.json";
const INTERNALS_DIR: &str = "internals";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub format_version: u32,
    pub id: Uuid,
    pub name: String,
    pub saved_at: DateTime<Utc>,
    pub graph: GraphDocument,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub in_ports: Vec<PortDefinition>,
    #[serde(default)]
    pub out_ports: Vec<PortDefinition>,
    #[serde(default)]
    pub next_index: u32,
    #[serde(default)]
    pub nodes: Vec<NodeDocument>,
    #[serde(default)]
    pub connections: Vec<ConnectionContainer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeDocument {
    Leaf {
        id: NodeId,
        name: String,
        node_type: String,
        #[serde(default)]
        settings: NodeSettings,
        state: NodeState,
        #[serde(default)]
        message: NodeMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        internals: Option<InternalState>,
    },
    Workflow {
        id: NodeId,
        name: String,
        #[serde(default)]
        message: NodeMessage,
        graph: GraphDocument,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadEntry {
    pub severity: LoadSeverity,
    pub node: Option<NodeId>,
    pub message: String,
}

impl fmt::Display for LoadEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            LoadSeverity::Warning => "WARNING",
            LoadSeverity::Error => "ERROR",
        };
        match &self.node {
            Some(node) => write!(f, "{} [{}]: {}", level, node, self.message),
            None => write!(f, "{}: {}", level, self.message),
        }
    }
}

/// Outcome of loading a workflow. `manager` is `None` only when the file
/// could not be used at all.
pub struct LoadResult {
    pub manager: Option<WorkflowManager>,
    pub entries: Vec<LoadEntry>,
}

impl LoadResult {
    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.severity == LoadSeverity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.entries.iter().any(|e| e.severity == LoadSeverity::Warning)
    }
}

struct Loader<'a> {
    registry: &'a NodeRegistry,
    dir: &'a Path,
    entries: Vec<LoadEntry>,
    saved_outputs: HashMap<NodeId, Vec<Value>>,
}

impl Loader<'_> {
    fn warn(&mut self, node: Option<NodeId>, message: String) {
        tracing::warn!("{}", message);
        self.entries.push(LoadEntry {
            severity: LoadSeverity::Warning,
            node,
            message,
        });
    }

    fn build(&mut self, id: NodeId, name: String, doc: GraphDocument) -> Workflow {
        let mut wf = Workflow::new(id, name, doc.in_ports, doc.out_ports);
        for node in doc.nodes {
            let container = match node {
                NodeDocument::Leaf {
                    id,
                    name,
                    node_type,
                    settings,
                    state,
                    message,
                    outputs,
                    internals,
                } => {
                    if !wf.id.is_parent_of(&id) {
                        self.warn(Some(id.clone()), format!("Node {} is misplaced in {}", id, wf.id));
                        continue;
                    }
                    let body = match self.registry.create_node(&node_type, &settings) {
                        Ok(body) => body,
                        Err(e) => {
                            self.warn(Some(id.clone()), format!("Node {} skipped: {}", id, e));
                            continue;
                        }
                    };
                    let mut leaf = LeafContainer::new(node_type, body, settings);
                    if state.is_executed() {
                        if let Err(e) = leaf.body.load_internals(&internals_dir(self.dir, &id)) {
                            self.warn(Some(id.clone()), format!("Internals of {} not restored: {}", id, e));
                        }
                        if let Some(internals) = internals {
                            leaf.internals = Arc::new(RwLock::new(internals));
                        }
                        if let Some(outputs) = outputs {
                            self.saved_outputs.insert(id.clone(), outputs);
                        }
                    }
                    let mut container = NodeContainer::leaf(id, name, leaf);
                    container.message = message;
                    container
                }
                NodeDocument::Workflow {
                    id,
                    name,
                    message,
                    graph,
                } => {
                    if !wf.id.is_parent_of(&id) {
                        self.warn(Some(id.clone()), format!("Workflow {} is misplaced in {}", id, wf.id));
                        continue;
                    }
                    let inner = self.build(id.clone(), name.clone(), graph);
                    let mut container = NodeContainer::nested(id, name, inner);
                    container.message = message;
                    container
                }
            };
            wf.nodes.insert(container.id().index(), container);
        }
        let highest = wf.nodes.keys().max().copied().unwrap_or(0);
        wf.next_index = doc.next_index.max(highest + 1);

        for conn in doc.connections {
            match check_connection(&wf, &conn) {
                Ok(()) => wf.connections.push(conn),
                Err(reason) => {
                    self.warn(Some(conn.dest.clone()), format!("Connection {} dropped: {}", conn, reason))
                }
            }
        }
        wf
    }
}

fn check_connection(wf: &Workflow, conn: &ConnectionContainer) -> Result<(), String> {
    if ConnectionContainer::classify(&conn.source, &conn.dest) != Some(conn.kind) {
        return Err("endpoints do not match the connection kind".into());
    }
    let port_count = |id: &NodeId, boundary: usize, outputs: bool| -> Result<usize, String> {
        if *id == wf.id {
            return Ok(boundary);
        }
        let container = wf
            .nodes
            .get(&id.index())
            .filter(|c| c.id() == id)
            .ok_or_else(|| format!("node {} does not exist", id))?;
        Ok(if outputs {
            container.out_port_count()
        } else {
            container.in_port_count()
        })
    };
    let source_ports = port_count(&conn.source, wf.in_ports.len(), true)?;
    let dest_ports = port_count(&conn.dest, wf.out_ports.len(), false)?;
    if conn.source_port >= source_ports || conn.dest_port >= dest_ports {
        return Err("port out of range".into());
    }
    if wf.incoming(&conn.dest, conn.dest_port).is_some() {
        return Err("input port already connected".into());
    }
    Ok(())
}

fn internals_dir(dir: &Path, id: &NodeId) -> PathBuf {
    dir.join(INTERNALS_DIR).join(id.to_string().replace(':', "_"))
}

fn graph_document(wf: &Workflow, executed: &mut Vec<(NodeId, Arc<dyn Node>)>) -> GraphDocument {
    let nodes = wf
        .nodes
        .values()
        .map(|container| match &container.kind {
            ContainerKind::Leaf(leaf) => {
                let done = leaf.state.is_executed();
                // work in flight is not saved
                let state = match leaf.state {
                    NodeState::Idle => NodeState::Idle,
                    NodeState::Executed => NodeState::Executed,
                    _ => NodeState::Configured,
                };
                if done {
                    executed.push((container.id().clone(), leaf.body.clone()));
                }
                NodeDocument::Leaf {
                    id: container.id().clone(),
                    name: container.name().to_string(),
                    node_type: leaf.node_type.clone(),
                    settings: leaf.settings.clone(),
                    state,
                    message: container.message().clone(),
                    outputs: leaf
                        .out_data
                        .as_ref()
                        .filter(|_| done)
                        .map(|data| data.iter().map(|d| (**d).clone()).collect()),
                    internals: leaf
                        .internals
                        .try_read()
                        .ok()
                        .filter(|i| done && !i.is_empty())
                        .map(|i| i.clone()),
                }
            }
            ContainerKind::Nested(inner) => NodeDocument::Workflow {
                id: container.id().clone(),
                name: container.name().to_string(),
                message: container.message().clone(),
                graph: graph_document(inner, executed),
            },
        })
        .collect();
    GraphDocument {
        in_ports: wf.in_ports.clone(),
        out_ports: wf.out_ports.clone(),
        next_index: wf.next_index,
        nodes,
        connections: wf.connections.clone(),
    }
}

const RESTORE_PATH: [NodeState; 6] = [
    NodeState::ConfiguredMarkedForExec,
    NodeState::ConfiguredQueued,
    NodeState::PreExecute,
    NodeState::Executing,
    NodeState::PostExecute,
    NodeState::Executed,
];

impl Core {
    /// Configure a freshly loaded tree and bring back saved results where
    /// every input is itself restored.
    fn restore(&mut self, mut saved_outputs: HashMap<NodeId, Vec<Value>>) -> Vec<LoadEntry> {
        let mut entries = Vec::new();
        let leaves = self.root.leaves();
        self.configure_nodes(leaves.clone());
        for id in self.root.topo_order(leaves) {
            let Some(values) = saved_outputs.remove(&id) else {
                continue;
            };
            let usable = self.leaf_state(&id) == Some(NodeState::Configured)
                && self.inputs_available(&id)
                && self.root.leaf(&id).map_or(false, |l| l.out_ports.len() == values.len());
            if usable {
                // walk the regular path; the events are dropped below
                for next in RESTORE_PATH {
                    self.set_state(&id, next);
                }
                if let Some(leaf) = self.root.leaf_mut(&id) {
                    leaf.out_data = Some(values.into_iter().map(Arc::new).collect());
                }
            } else {
                if let Some(leaf) = self.root.leaf_mut(&id) {
                    leaf.clear_execution_results(false);
                }
                let message = format!("Node {} was saved executed but its inputs were not, it will run again", id);
                tracing::warn!("{}", message);
                entries.push(LoadEntry {
                    severity: LoadSeverity::Warning,
                    node: Some(id),
                    message,
                });
            }
        }
        self.pending.clear();
        entries
    }
}

impl WorkflowManager {
    /// Write the workflow into `dir`, creating it if needed. The document
    /// is written to a temporary file first and renamed into place.
    pub fn save(&self, dir: &Path) -> Result<(), FlowError> {
        let (document, executed) = self.shared.read(|core| {
            let mut executed = Vec::new();
            let graph = graph_document(&core.root, &mut executed);
            let document = WorkflowDocument {
                format_version: FORMAT_VERSION,
                id: self.id(),
                name: core.root.name.clone(),
                saved_at: Utc::now(),
                graph,
            };
            (document, executed)
        });

        std::fs::create_dir_all(dir)?;
        let internals_root = dir.join(INTERNALS_DIR);
        if internals_root.exists() {
            std::fs::remove_dir_all(&internals_root)?;
        }
        for (id, body) in &executed {
            let node_dir = internals_dir(dir, id);
            std::fs::create_dir_all(&node_dir)?;
            body.save_internals(&node_dir)?;
        }

        let tmp = dir.join(format!("{}.tmp", WORKFLOW_FILE));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&document)?)?;
        std::fs::rename(&tmp, dir.join(WORKFLOW_FILE))?;
        tracing::info!("Saved workflow {} to {}", document.id, dir.display());
        Ok(())
    }

    pub fn read_document(dir: &Path) -> Result<WorkflowDocument, FlowError> {
        let text = std::fs::read_to_string(dir.join(WORKFLOW_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load a workflow saved with [`WorkflowManager::save`]. Must be called
    /// from within a Tokio runtime.
    pub fn load(dir: &Path, registry: Arc<NodeRegistry>, config: RuntimeConfig) -> LoadResult {
        let document = match Self::read_document(dir) {
            Ok(document) => document,
            Err(e) => {
                tracing::error!("Can not load workflow from {}: {}", dir.display(), e);
                return LoadResult {
                    manager: None,
                    entries: vec![LoadEntry {
                        severity: LoadSeverity::Error,
                        node: None,
                        message: format!("Can not read {}: {}", dir.display(), e),
                    }],
                };
            }
        };
        if document.format_version != FORMAT_VERSION {
            return LoadResult {
                manager: None,
                entries: vec![LoadEntry {
                    severity: LoadSeverity::Error,
                    node: None,
                    message: format!(
                        "Unsupported format version {} (expected {})",
                        document.format_version, FORMAT_VERSION
                    ),
                }],
            };
        }

        let mut loader = Loader {
            registry: &registry,
            dir,
            entries: Vec::new(),
            saved_outputs: HashMap::new(),
        };
        let root = loader.build(NodeId::root(), document.name, document.graph);
        let Loader {
            mut entries,
            saved_outputs,
            ..
        } = loader;

        let manager = WorkflowManager::from_root(document.id, root, registry.clone(), config);
        entries.extend(manager.shared.with_core(|core| core.restore(saved_outputs)));
        tracing::info!(
            "Loaded workflow {} from {} with {} issues",
            manager.id(),
            dir.display(),
            entries.len()
        );
        LoadResult {
            manager: Some(manager),
            entries,
        }
    }
}
