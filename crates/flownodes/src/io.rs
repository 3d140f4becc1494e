use async_trait::async_trait;
use flowcore::{
    Node, NodeContext, NodeError, NodeOutput, NodeSettings, PortDefinition, PortSpec, Value,
};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;

fn path_setting(settings: &NodeSettings) -> Result<&str, NodeError> {
    let value = settings.require("path")?;
    value.as_str().ok_or_else(|| NodeError::InvalidInputType {
        field: "path".to_string(),
        expected: "string".to_string(),
        actual: value.type_name().to_string(),
    })
}

/// Writes its input to the file named by the `path` setting. Strings are
/// written verbatim, anything else as JSON.
pub struct WriteFileNode;

#[async_trait]
impl Node for WriteFileNode {
    fn node_type(&self) -> &str {
        "io.write_file"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("content")]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("path")]
    }

    fn validate_settings(&self, settings: &NodeSettings) -> Result<(), NodeError> {
        path_setting(settings).map(|_| ())
    }

    fn configure(
        &self,
        _inputs: &[Option<PortSpec>],
        settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        path_setting(settings)?;
        Ok(vec![PortSpec::of("string")])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let path = path_setting(&ctx.settings)?.to_string();
        let content = match ctx.require_input(0)? {
            Value::String(text) => text.clone(),
            Value::Json(json) => serde_json::to_string_pretty(json)
                .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?,
            other => serde_json::to_string_pretty(other)
                .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?,
        };

        ctx.check_canceled()?;
        tokio::fs::write(&path, content.as_bytes())
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Writing {} failed: {}", path, e)))?;
        ctx.events.info(format!("Wrote {} bytes to {}", content.len(), path));

        Ok(NodeOutput::new().with_output(path))
    }
}

pub struct WriteFileNodeFactory;

impl NodeFactory for WriteFileNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(WriteFileNode))
    }

    fn node_type(&self) -> &str {
        "io.write_file"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Write the input to a file (setting: path)".to_string(),
            category: "io".to_string(),
            inputs: WriteFileNode.input_ports(),
            outputs: WriteFileNode.output_ports(),
        }
    }
}
