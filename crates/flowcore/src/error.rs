use crate::{NodeId, NodeState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by node bodies during configure or execute.
///
/// These never escape the workflow manager; they end up as node messages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Execution canceled")]
    Cancelled,
}

impl NodeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NodeError::Cancelled)
    }
}

/// Rejected structural mutations and lookups.
///
/// Returning one of these guarantees that the graph was left untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid node: {0}")]
    InvalidNode(String),

    #[error("Node {0} is not a workflow")]
    NotAWorkflow(NodeId),

    #[error("Connection would create a cycle: {source_node} -> {dest}")]
    CyclicConnection { source_node: NodeId, dest: NodeId },

    #[error("Input port {port} of {node} is already connected")]
    PortOccupied { node: NodeId, port: usize },

    #[error("Port {port} does not exist on {node}")]
    InvalidPort { node: NodeId, port: usize },

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Execution in progress at or downstream of {0}")]
    ExecutionInProgress(NodeId),

    #[error("Node {0} can not be reset")]
    NotResetable(NodeId),

    #[error("Node {0} is claimed for a structural mutation")]
    ClaimedForMutation(NodeId),

    #[error("Invalid port mapping: {0}")]
    InvalidPortMapping(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Illegal state transition {from} -> {to}")]
    IllegalTransition { from: NodeState, to: NodeState },
}
