use crate::{
    events::EventEmitter, NodeError, NodeId, NodeSettings, PortData, PortDefinition, PortSpec,
    Value,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Part a node plays in a loop construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopRole {
    #[default]
    None,
    Start,
    End,
}

/// Body of a leaf node container.
///
/// The engine drives `configure` whenever upstream specs change and
/// `execute` once all inputs are available; everything else is optional.
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "source.constant", "loop.count_start")
    fn node_type(&self) -> &str;

    fn input_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    fn loop_role(&self) -> LoopRole {
        LoopRole::None
    }

    /// Validate settings when the node is created or its settings change
    fn validate_settings(&self, _settings: &NodeSettings) -> Result<(), NodeError> {
        Ok(())
    }

    /// Compute output specs from input specs without producing data.
    /// `inputs[i]` is `None` for an unconnected optional port.
    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError>;

    /// Produce one value per output port.
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Drop anything cached by a previous execution.
    fn reset(&self) {}

    /// Persist node-private files next to the saved workflow
    fn save_internals(&self, _dir: &Path) -> Result<(), NodeError> {
        Ok(())
    }

    fn load_internals(&self, _dir: &Path) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Loop bookkeeping visible to loop start and loop end bodies
#[derive(Debug, Clone, PartialEq)]
pub struct LoopInfo {
    pub start: NodeId,
    /// Zero-based pass number
    pub iteration: u32,
    /// Whether the loop start declared this pass to be the last one.
    /// Always `false` while the loop start itself executes.
    pub terminate: bool,
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    /// Id of the executing container
    pub node_id: NodeId,

    /// Input data by port index, `None` for unconnected optional ports
    pub inputs: Vec<Option<PortData>>,

    /// Settings of this node
    pub settings: NodeSettings,

    /// Private state surviving across loop iterations, cleared on reset
    pub internals: Arc<RwLock<InternalState>>,

    /// Event emitter for progress and messages
    pub events: EventEmitter,

    /// Set when the user cancels this node
    pub cancellation: CancellationToken,

    /// Present for loop start and loop end nodes
    pub loop_info: Option<LoopInfo>,

    /// Longest stretch a body should run without checking for cancellation
    pub poll_interval: Duration,
}

impl NodeContext {
    pub fn input(&self, index: usize) -> Option<&Value> {
        self.inputs.get(index).and_then(|d| d.as_deref())
    }

    /// Get required input or return error
    pub fn require_input(&self, index: usize) -> Result<&Value, NodeError> {
        self.input(index)
            .ok_or_else(|| NodeError::MissingInput(format!("port {}", index)))
    }

    pub fn check_canceled(&self) -> Result<(), NodeError> {
        if self.cancellation.is_cancelled() {
            Err(NodeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking up early with `Cancelled` when the node
    /// is cancelled.
    pub async fn pause(&self, duration: Duration) -> Result<(), NodeError> {
        tokio::select! {
            _ = self.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub fn iteration(&self) -> u32 {
        self.loop_info.as_ref().map(|l| l.iteration).unwrap_or(0)
    }
}

/// Private state of a node instance
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalState {
    pub data: HashMap<String, Value>,
}

impl InternalState {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// Values by output port index
    pub outputs: Vec<Value>,

    /// Loop starts answer whether the current pass is the last one
    pub terminate_loop: Option<bool>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, value: impl Into<Value>) -> Self {
        self.outputs.push(value.into());
        self
    }

    pub fn terminate_loop(mut self, terminate: bool) -> Self {
        self.terminate_loop = Some(terminate);
        self
    }
}
