use crate::graph::Workflow;
use flowcore::{
    InternalState, LoopRole, Node, NodeId, NodeMessage, NodeSettings, NodeState, PortData,
    PortDefinition, PortSpec,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Iteration bookkeeping owned by an active loop start.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopContext {
    /// Loop start owning this context
    pub start: NodeId,
    /// Distinguishes successive runs of the same loop start
    pub generation: u64,
    pub iteration: u32,
    /// Set by the loop start body: the current pass is the last one
    pub terminate: bool,
    /// Loop end that requested the current restart
    pub tail: Option<NodeId>,
}

/// A schedulable unit: a leaf computation or a nested workflow.
pub struct NodeContainer {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) message: NodeMessage,
    pub(crate) kind: ContainerKind,
}

pub(crate) enum ContainerKind {
    Leaf(LeafContainer),
    Nested(Box<Workflow>),
}

pub(crate) struct LeafContainer {
    pub node_type: String,
    pub body: Arc<dyn Node>,
    pub settings: NodeSettings,
    pub state: NodeState,
    pub in_ports: Vec<PortDefinition>,
    pub out_ports: Vec<PortDefinition>,
    pub out_specs: Option<Vec<PortSpec>>,
    pub out_data: Option<Vec<PortData>>,
    pub internals: Arc<RwLock<InternalState>>,
    pub role: LoopRole,
    /// Loop starts enclosing the data leaving this node, innermost last
    pub scope_stack: Vec<NodeId>,
    /// For loop ends: the loop start found on top of the incoming scope
    pub loop_start: Option<NodeId>,
    pub loop_context: Option<LoopContext>,
    /// For loop ends: outputs of the previous, non-final pass
    pub loop_feedback: Option<Vec<PortData>>,
    /// Loop starts whose restart waits for this node to finish
    pub waiting_loops: Vec<NodeId>,
    pub cancel: Option<CancellationToken>,
    /// Message was produced by configure and goes away with a good configure
    pub config_message: bool,
}

impl LeafContainer {
    pub fn new(node_type: String, body: Arc<dyn Node>, settings: NodeSettings) -> Self {
        let in_ports = body.input_ports();
        let out_ports = body.output_ports();
        let role = body.loop_role();
        Self {
            node_type,
            body,
            settings,
            state: NodeState::Idle,
            in_ports,
            out_ports,
            out_specs: None,
            out_data: None,
            internals: Arc::new(RwLock::new(InternalState::default())),
            role,
            scope_stack: Vec::new(),
            loop_start: None,
            loop_context: None,
            loop_feedback: None,
            waiting_loops: Vec::new(),
            cancel: None,
            config_message: false,
        }
    }

    /// Drop everything a previous execution produced. The state itself is
    /// changed by the caller.
    pub fn clear_execution_results(&mut self, keep_loop_context: bool) {
        self.out_data = None;
        self.loop_feedback = None;
        if !keep_loop_context {
            self.loop_context = None;
        }
        // a fresh lock: bodies still holding the old handle can not leak
        // state into the next run
        self.internals = Arc::new(RwLock::new(InternalState::default()));
        self.body.reset();
    }
}

impl NodeContainer {
    pub(crate) fn leaf(id: NodeId, name: String, leaf: LeafContainer) -> Self {
        Self {
            id,
            name,
            message: NodeMessage::none(),
            kind: ContainerKind::Leaf(leaf),
        }
    }

    pub(crate) fn nested(id: NodeId, name: String, workflow: Workflow) -> Self {
        Self {
            id,
            name,
            message: NodeMessage::none(),
            kind: ContainerKind::Nested(Box::new(workflow)),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &NodeMessage {
        &self.message
    }

    pub fn is_workflow(&self) -> bool {
        matches!(self.kind, ContainerKind::Nested(_))
    }

    pub(crate) fn as_leaf(&self) -> Option<&LeafContainer> {
        match &self.kind {
            ContainerKind::Leaf(leaf) => Some(leaf),
            ContainerKind::Nested(_) => None,
        }
    }

    pub(crate) fn as_leaf_mut(&mut self) -> Option<&mut LeafContainer> {
        match &mut self.kind {
            ContainerKind::Leaf(leaf) => Some(leaf),
            ContainerKind::Nested(_) => None,
        }
    }

    pub(crate) fn as_workflow(&self) -> Option<&Workflow> {
        match &self.kind {
            ContainerKind::Nested(wf) => Some(wf),
            ContainerKind::Leaf(_) => None,
        }
    }

    pub(crate) fn as_workflow_mut(&mut self) -> Option<&mut Workflow> {
        match &mut self.kind {
            ContainerKind::Nested(wf) => Some(wf),
            ContainerKind::Leaf(_) => None,
        }
    }

    pub fn in_port_count(&self) -> usize {
        match &self.kind {
            ContainerKind::Leaf(leaf) => leaf.in_ports.len(),
            ContainerKind::Nested(wf) => wf.in_ports.len(),
        }
    }

    pub fn out_port_count(&self) -> usize {
        match &self.kind {
            ContainerKind::Leaf(leaf) => leaf.out_ports.len(),
            ContainerKind::Nested(wf) => wf.out_ports.len(),
        }
    }
}
