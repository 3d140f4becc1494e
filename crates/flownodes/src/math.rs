use async_trait::async_trait;
use flowcore::{
    Node, NodeContext, NodeError, NodeOutput, NodeSettings, PortDefinition, PortSpec, Value,
};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;

fn number_setting(settings: &NodeSettings, key: &str, default: f64) -> Result<f64, NodeError> {
    match settings.get(key) {
        None => Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| NodeError::InvalidInputType {
            field: key.to_string(),
            expected: "number".to_string(),
            actual: value.type_name().to_string(),
        }),
    }
}

fn check_numeric(spec: Option<&PortSpec>, field: &str) -> Result<(), NodeError> {
    match spec {
        Some(spec) if !spec.is_compatible_with("number") && !spec.is_compatible_with("array") => {
            Err(NodeError::InvalidInputType {
                field: field.to_string(),
                expected: "number".to_string(),
                actual: spec.type_name.clone(),
            })
        }
        _ => Ok(()),
    }
}

/// Numbers in `value`: the number itself or every element of an array.
fn numbers(value: &Value, field: &str) -> Result<Vec<f64>, NodeError> {
    let invalid = |actual: &Value| NodeError::InvalidInputType {
        field: field.to_string(),
        expected: "number".to_string(),
        actual: actual.type_name().to_string(),
    };
    match value {
        Value::Number(n) => Ok(vec![*n]),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_f64().ok_or_else(|| invalid(item)))
            .collect(),
        other => Err(invalid(other)),
    }
}

/// `value * factor + offset`, element-wise on arrays
pub struct MapNode;

#[async_trait]
impl Node for MapNode {
    fn node_type(&self) -> &str {
        "math.map"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("value")]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("result")]
    }

    fn validate_settings(&self, settings: &NodeSettings) -> Result<(), NodeError> {
        number_setting(settings, "factor", 1.0)?;
        number_setting(settings, "offset", 0.0)?;
        Ok(())
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        self.validate_settings(settings)?;
        let spec = inputs.first().and_then(|s| s.as_ref());
        check_numeric(spec, "value")?;
        Ok(vec![spec.cloned().unwrap_or_else(|| PortSpec::of("number"))])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let factor = number_setting(&ctx.settings, "factor", 1.0)?;
        let offset = number_setting(&ctx.settings, "offset", 0.0)?;
        let input = ctx.require_input(0)?;
        let map = |n: f64| n * factor + offset;
        let result = match input {
            Value::Number(n) => Value::Number(map(*n)),
            other => Value::Array(
                numbers(other, "value")?
                    .into_iter()
                    .map(|n| Value::Number(map(n)))
                    .collect(),
            ),
        };
        Ok(NodeOutput::new().with_output(result))
    }
}

pub struct MapNodeFactory;

impl NodeFactory for MapNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(MapNode))
    }

    fn node_type(&self) -> &str {
        "math.map"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Scale and shift numbers (settings: factor, offset)".to_string(),
            category: "math".to_string(),
            inputs: MapNode.input_ports(),
            outputs: MapNode.output_ports(),
        }
    }
}

/// Sum of every number on both inputs; arrays are summed element-wise
pub struct SumNode;

#[async_trait]
impl Node for SumNode {
    fn node_type(&self) -> &str {
        "math.sum"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("a"),
            PortDefinition::optional("b"),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("sum")]
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        check_numeric(inputs.first().and_then(|s| s.as_ref()), "a")?;
        check_numeric(inputs.get(1).and_then(|s| s.as_ref()), "b")?;
        Ok(vec![PortSpec::of("number")])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut total: f64 = numbers(ctx.require_input(0)?, "a")?.into_iter().sum();
        if let Some(b) = ctx.input(1) {
            total += numbers(b, "b")?.into_iter().sum::<f64>();
        }
        Ok(NodeOutput::new().with_output(total))
    }
}

pub struct SumNodeFactory;

impl NodeFactory for SumNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(SumNode))
    }

    fn node_type(&self) -> &str {
        "math.sum"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Add up numbers".to_string(),
            category: "math".to_string(),
            inputs: SumNode.input_ports(),
            outputs: SumNode.output_ports(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_flatten_to_numbers() {
        let value = Value::Array(vec![Value::Number(1.0), Value::Number(2.5)]);
        assert_eq!(numbers(&value, "a").unwrap(), vec![1.0, 2.5]);
        assert!(numbers(&Value::from("x"), "a").is_err());
    }

    #[test]
    fn map_rejects_text_input() {
        let inputs = [Some(PortSpec::of("string"))];
        assert!(MapNode.configure(&inputs, &NodeSettings::new()).is_err());
    }

    #[test]
    fn sum_accepts_missing_optional_input() {
        let inputs = [Some(PortSpec::of("number")), None];
        let specs = SumNode.configure(&inputs, &NodeSettings::new()).unwrap();
        assert_eq!(specs, vec![PortSpec::of("number")]);
    }
}
