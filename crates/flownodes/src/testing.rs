//! Instrumented nodes for exercising the engine: a node that always fails,
//! one that waits on a lock held by the test, and one that counts its
//! executions. Shared handles are injected through the factories.

use async_trait::async_trait;
use flowcore::{
    Node, NodeContext, NodeError, NodeOutput, NodeSettings, PortDefinition, PortSpec, Value,
};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

fn pass_through_ports() -> (Vec<PortDefinition>, Vec<PortDefinition>) {
    (
        vec![PortDefinition::optional("in")],
        vec![PortDefinition::required("out")],
    )
}

fn pass_through_spec(inputs: &[Option<PortSpec>]) -> Vec<PortSpec> {
    vec![inputs.first().cloned().flatten().unwrap_or_else(PortSpec::any)]
}

fn pass_through_output(ctx: &NodeContext) -> NodeOutput {
    NodeOutput::new().with_output(ctx.input(0).cloned().unwrap_or(Value::Null))
}

/// Fails on every execution with the `message` setting
pub struct FailNode;

#[async_trait]
impl Node for FailNode {
    fn node_type(&self) -> &str {
        "test.fail"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        pass_through_ports().0
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        pass_through_ports().1
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        Ok(pass_through_spec(inputs))
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .settings
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("failure requested");
        Err(NodeError::ExecutionFailed(message.to_string()))
    }
}

pub struct FailNodeFactory;

impl NodeFactory for FailNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(FailNode))
    }

    fn node_type(&self) -> &str {
        "test.fail"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Always fails (setting: message)".to_string(),
            category: "testing".to_string(),
            inputs: FailNode.input_ports(),
            outputs: FailNode.output_ports(),
        }
    }
}

/// Waits until it can take the shared gate, then passes its input on.
/// Hold the gate's guard in a test to keep the node EXECUTING.
pub struct BlockingNode {
    gate: Arc<Mutex<()>>,
}

#[async_trait]
impl Node for BlockingNode {
    fn node_type(&self) -> &str {
        "test.blocking"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        pass_through_ports().0
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        pass_through_ports().1
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        Ok(pass_through_spec(inputs))
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
            _guard = self.gate.lock() => Ok(pass_through_output(&ctx)),
        }
    }
}

pub struct BlockingNodeFactory {
    gate: Arc<Mutex<()>>,
}

impl BlockingNodeFactory {
    pub fn new(gate: Arc<Mutex<()>>) -> Self {
        Self { gate }
    }
}

impl NodeFactory for BlockingNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(BlockingNode {
            gate: self.gate.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        "test.blocking"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Waits on an injected lock".to_string(),
            category: "testing".to_string(),
            inputs: pass_through_ports().0,
            outputs: pass_through_ports().1,
        }
    }
}

/// Counts how often it was executed, then passes its input on
pub struct CountingNode {
    executions: Arc<AtomicUsize>,
}

#[async_trait]
impl Node for CountingNode {
    fn node_type(&self) -> &str {
        "test.counter"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        pass_through_ports().0
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        pass_through_ports().1
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        Ok(pass_through_spec(inputs))
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(pass_through_output(&ctx))
    }
}

pub struct CountingNodeFactory {
    executions: Arc<AtomicUsize>,
}

impl CountingNodeFactory {
    pub fn new(executions: Arc<AtomicUsize>) -> Self {
        Self { executions }
    }
}

impl NodeFactory for CountingNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(CountingNode {
            executions: self.executions.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        "test.counter"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Counts its executions".to_string(),
            category: "testing".to_string(),
            inputs: pass_through_ports().0,
            outputs: pass_through_ports().1,
        }
    }
}

/// Pairs two required inputs into an array
pub struct JoinNode;

impl JoinNode {
    fn ports() -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("left"),
            PortDefinition::required("right"),
        ]
    }
}

#[async_trait]
impl Node for JoinNode {
    fn node_type(&self) -> &str {
        "test.join"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        Self::ports()
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("pair")]
    }

    fn configure(
        &self,
        _inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        Ok(vec![PortSpec::of("array")])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let pair = (0..2)
            .map(|port| ctx.input(port).cloned().unwrap_or(Value::Null))
            .collect();
        Ok(NodeOutput::new().with_output(Value::Array(pair)))
    }
}

pub struct JoinNodeFactory;

impl NodeFactory for JoinNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(JoinNode))
    }

    fn node_type(&self) -> &str {
        "test.join"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Pairs two inputs".to_string(),
            category: "testing".to_string(),
            inputs: JoinNode::ports(),
            outputs: JoinNode.output_ports(),
        }
    }
}
