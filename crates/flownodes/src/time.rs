use async_trait::async_trait;
use flowcore::{
    Node, NodeContext, NodeError, NodeOutput, NodeSettings, PortDefinition, PortSpec, Value,
};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;
use tokio::time::Duration;

const DEFAULT_DELAY_MS: u64 = 1000;

/// Delay execution for a specified duration, then pass the input on
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("in")]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("out")]
    }

    fn validate_settings(&self, settings: &NodeSettings) -> Result<(), NodeError> {
        settings.get_u64("delay_ms").map(|_| ())
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        self.validate_settings(settings)?;
        let spec = inputs.first().cloned().flatten();
        Ok(vec![spec.unwrap_or_else(|| PortSpec::of("null"))])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx.settings.get_u64("delay_ms")?.unwrap_or(DEFAULT_DELAY_MS);

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        ctx.pause(Duration::from_millis(delay_ms)).await?;

        let value = ctx.input(0).cloned().unwrap_or(Value::Null);
        Ok(NodeOutput::new().with_output(value))
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            inputs: DelayNode.input_ports(),
            outputs: DelayNode.output_ports(),
        }
    }
}
