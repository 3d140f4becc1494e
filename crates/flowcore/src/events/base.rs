use crate::{NodeId, NodeMessage, NodeState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by a workflow manager. They are collected while the
/// manager lock is held and published after it is released.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    StateChanged {
        node_id: NodeId,
        old_state: NodeState,
        new_state: NodeState,
        timestamp: DateTime<Utc>,
    },
    MessageChanged {
        node_id: NodeId,
        message: NodeMessage,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        node_id: NodeId,
        node_type: String,
        iteration: Option<u32>,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        node_id: NodeId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowChanged {
        change: WorkflowChange,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn state_changed(node_id: NodeId, old_state: NodeState, new_state: NodeState) -> Self {
        ExecutionEvent::StateChanged {
            node_id,
            old_state,
            new_state,
            timestamp: Utc::now(),
        }
    }

    pub fn workflow_changed(change: WorkflowChange) -> Self {
        ExecutionEvent::WorkflowChanged {
            change,
            timestamp: Utc::now(),
        }
    }
}

/// Structural edits of a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change")]
pub enum WorkflowChange {
    NodeAdded { node_id: NodeId },
    NodeRemoved { node_id: NodeId },
    ConnectionAdded { source: NodeId, source_port: usize, dest: NodeId, dest_port: usize },
    ConnectionRemoved { source: NodeId, source_port: usize, dest: NodeId, dest_port: usize },
    PortsChanged { node_id: NodeId },
}

/// Events specific to node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    Progress { fraction: f64, message: Option<String> },
}

/// Observer of state transitions.
///
/// Called after the manager lock has been released, in transition order
/// within each batch of changes.
/// Implementations may query the manager but should not block for long.
pub trait StateListener: Send + Sync {
    fn on_state_changed(&self, node_id: &NodeId, old_state: NodeState, new_state: NodeState);
}

/// Event emitter for node bodies to send progress and log lines
#[derive(Clone)]
pub struct EventEmitter {
    node_id: NodeId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(node_id: NodeId, sender: broadcast::Sender<ExecutionEvent>) -> Self {
        Self { node_id, sender }
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            node_id: self.node_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    /// Emit info message
    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    /// Emit warning message
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    /// Emit progress update, `fraction` in `0.0..=1.0`
    pub fn progress(&self, fraction: f64, message: Option<String>) {
        self.emit(NodeEvent::Progress { fraction, message });
    }
}

/// Broadcast bus owned by a workflow manager
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, node_id: NodeId) -> EventEmitter {
        EventEmitter::new(node_id, self.sender.clone())
    }
}
