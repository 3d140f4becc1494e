use async_trait::async_trait;
use flowcore::{
    Node, NodeContext, NodeError, NodeOutput, NodeSettings, PortDefinition, PortSpec, Value,
};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;

/// Simple debug node that logs its input
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("message")]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("message")]
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        let spec = inputs.first().cloned().flatten();
        Ok(vec![spec.unwrap_or_else(|| PortSpec::of("string"))])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = match ctx.input(0) {
            Some(value) => value.clone(),
            None => {
                ctx.events.warn("Nothing connected to log");
                Value::from("(no message)")
            }
        };

        match value.as_str() {
            Some(text) => ctx.events.info(format!("DEBUG: {}", text)),
            None => ctx.events.info(format!("DEBUG: {:?}", value)),
        }
        tracing::info!("Node {} logged a {}", ctx.node_id, value.type_name());

        Ok(NodeOutput::new().with_output(value))
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
            inputs: DebugNode.input_ports(),
            outputs: DebugNode.output_ports(),
        }
    }
}
