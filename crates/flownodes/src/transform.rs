use async_trait::async_trait;
use flowcore::{
    Node, NodeContext, NodeError, NodeOutput, NodeSettings, PortDefinition, PortSpec, Value,
};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;

fn require_spec(inputs: &[Option<PortSpec>], index: usize) -> Result<&PortSpec, NodeError> {
    inputs
        .get(index)
        .and_then(|s| s.as_ref())
        .ok_or_else(|| NodeError::MissingInput(format!("port {}", index)))
}

/// Forwards its input unchanged
pub struct PassNode;

#[async_trait]
impl Node for PassNode {
    fn node_type(&self) -> &str {
        "transform.pass"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("in")]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("out")]
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        Ok(vec![require_spec(inputs, 0)?.clone()])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input(0)?.clone();
        Ok(NodeOutput::new().with_output(value))
    }
}

pub struct PassNodeFactory;

impl NodeFactory for PassNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(PassNode))
    }

    fn node_type(&self) -> &str {
        "transform.pass"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Pass the input through".to_string(),
            category: "transform".to_string(),
            inputs: PassNode.input_ports(),
            outputs: PassNode.output_ports(),
        }
    }
}

/// Parse JSON string to Value
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("json")]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("parsed")]
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        let spec = require_spec(inputs, 0)?;
        if !spec.is_compatible_with("string") {
            return Err(NodeError::InvalidInputType {
                field: "json".to_string(),
                expected: "string".to_string(),
                actual: spec.type_name.clone(),
            });
        }
        Ok(vec![PortSpec::of("json")])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input(0)?;
        let text = input.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "json".to_string(),
            expected: "string".to_string(),
            actual: input.type_name().to_string(),
        })?;

        let parsed: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::new().with_output(Value::Json(parsed)))
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(JsonParseNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
            inputs: JsonParseNode.input_ports(),
            outputs: JsonParseNode.output_ports(),
        }
    }
}

/// Stringify Value to JSON
pub struct JsonStringifyNode;

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("value")]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("json")]
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        require_spec(inputs, 0)?;
        Ok(vec![PortSpec::of("string")])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input(0)?;

        // raw JSON is written as-is, everything else in its tagged form
        let json_str = match value.as_json() {
            Some(json) => serde_json::to_string_pretty(json),
            None => serde_json::to_string_pretty(value),
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::new().with_output(json_str))
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(JsonStringifyNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
            inputs: JsonStringifyNode.input_ports(),
            outputs: JsonStringifyNode.output_ports(),
        }
    }
}
