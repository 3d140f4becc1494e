use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutput, NodeSettings, PortDefinition, PortSpec};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;

/// Emits the value stored in its `value` setting
pub struct ConstantNode;

#[async_trait]
impl Node for ConstantNode {
    fn node_type(&self) -> &str {
        "source.constant"
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("value")]
    }

    fn validate_settings(&self, settings: &NodeSettings) -> Result<(), NodeError> {
        settings.require("value").map(|_| ())
    }

    fn configure(
        &self,
        _inputs: &[Option<PortSpec>],
        settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        let value = settings.require("value")?;
        Ok(vec![PortSpec::of(value.type_name())])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.settings.require("value")?.clone();
        Ok(NodeOutput::new().with_output(value))
    }
}

pub struct ConstantNodeFactory;

impl NodeFactory for ConstantNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(ConstantNode))
    }

    fn node_type(&self) -> &str {
        "source.constant"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Emit a constant value".to_string(),
            category: "source".to_string(),
            inputs: vec![],
            outputs: ConstantNode.output_ports(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_follows_value_type() {
        let settings = NodeSettings::new().with("value", 3.0);
        let specs = ConstantNode.configure(&[], &settings).unwrap();
        assert_eq!(specs, vec![PortSpec::of("number")]);
    }

    #[test]
    fn missing_value_is_rejected() {
        assert!(ConstantNode.validate_settings(&NodeSettings::new()).is_err());
        assert!(ConstantNode.configure(&[], &NodeSettings::new()).is_err());
    }
}
