//! Loop constructs: a counting start paired with a collecting end, and a
//! recursive pair that feeds the end's output back into the start.

use async_trait::async_trait;
use flowcore::{
    LoopRole, Node, NodeContext, NodeError, NodeOutput, NodeSettings, PortDefinition, PortSpec,
    Value,
};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;

const COLLECTED: &str = "collected";
const DEFAULT_MAX_ITERATIONS: u64 = 10;

fn positive_setting(settings: &NodeSettings, key: &str) -> Result<Option<u64>, NodeError> {
    match settings.get_u64(key)? {
        Some(0) => Err(NodeError::Configuration(format!("{} must be at least 1", key))),
        other => Ok(other),
    }
}

/// Runs its body `count` times. Emits the incoming data (or null) and the
/// zero-based iteration number.
pub struct CountLoopStartNode;

#[async_trait]
impl Node for CountLoopStartNode {
    fn node_type(&self) -> &str {
        "loop.count_start"
    }

    fn loop_role(&self) -> LoopRole {
        LoopRole::Start
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("data")]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("data"),
            PortDefinition::required("iteration"),
        ]
    }

    fn validate_settings(&self, settings: &NodeSettings) -> Result<(), NodeError> {
        positive_setting(settings, "count")?
            .map(|_| ())
            .ok_or_else(|| NodeError::Configuration("Missing setting: count".to_string()))
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        self.validate_settings(settings)?;
        let data = inputs.first().cloned().flatten();
        Ok(vec![
            data.unwrap_or_else(|| PortSpec::of("null")),
            PortSpec::of("number"),
        ])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let count = positive_setting(&ctx.settings, "count")?.unwrap_or(1);
        let iteration = ctx.iteration();
        let data = ctx.input(0).cloned().unwrap_or(Value::Null);
        ctx.events.progress(
            f64::from(iteration + 1) / count as f64,
            Some(format!("Iteration {} of {}", iteration + 1, count)),
        );

        Ok(NodeOutput::new()
            .with_output(data)
            .with_output(iteration)
            .terminate_loop(u64::from(iteration) + 1 >= count))
    }
}

pub struct CountLoopStartNodeFactory;

impl NodeFactory for CountLoopStartNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(CountLoopStartNode))
    }

    fn node_type(&self) -> &str {
        "loop.count_start"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Start of a loop running `count` iterations".to_string(),
            category: "loop".to_string(),
            inputs: CountLoopStartNode.input_ports(),
            outputs: CountLoopStartNode.output_ports(),
        }
    }
}

/// Collects one value per iteration and emits them as an array.
/// Intermediate passes emit what has been collected so far.
pub struct CollectLoopEndNode;

#[async_trait]
impl Node for CollectLoopEndNode {
    fn node_type(&self) -> &str {
        "loop.collect_end"
    }

    fn loop_role(&self) -> LoopRole {
        LoopRole::End
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("value")]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("collected")]
    }

    fn configure(
        &self,
        _inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        Ok(vec![PortSpec::of("array")])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input(0)?.clone();
        let mut internals = ctx.internals.write().await;
        if ctx.iteration() == 0 {
            internals.data.remove(COLLECTED);
        }
        let slot = internals
            .data
            .entry(COLLECTED.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        let collected = match slot {
            Value::Array(items) => {
                items.push(value);
                items.clone()
            }
            other => {
                return Err(NodeError::ExecutionFailed(format!(
                    "Collected state holds a {}",
                    other.type_name()
                )));
            }
        };
        tracing::debug!(
            "Node {} collected {} values in iteration {}",
            ctx.node_id,
            collected.len(),
            ctx.iteration()
        );
        Ok(NodeOutput::new().with_output(Value::Array(collected)))
    }
}

pub struct CollectLoopEndNodeFactory;

impl NodeFactory for CollectLoopEndNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(CollectLoopEndNode))
    }

    fn node_type(&self) -> &str {
        "loop.collect_end"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "End of a loop collecting one value per iteration".to_string(),
            category: "loop".to_string(),
            inputs: CollectLoopEndNode.input_ports(),
            outputs: CollectLoopEndNode.output_ports(),
        }
    }
}

/// Start of a recursive loop. The first pass emits `initial`; later passes
/// emit what the loop end produced on the `feedback` port.
pub struct RecursiveLoopStartNode;

#[async_trait]
impl Node for RecursiveLoopStartNode {
    fn node_type(&self) -> &str {
        "loop.recursive_start"
    }

    fn loop_role(&self) -> LoopRole {
        LoopRole::Start
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("initial"),
            PortDefinition::optional("feedback"),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("data")]
    }

    fn validate_settings(&self, settings: &NodeSettings) -> Result<(), NodeError> {
        positive_setting(settings, "max_iterations").map(|_| ())
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        self.validate_settings(settings)?;
        let initial = inputs
            .first()
            .cloned()
            .flatten()
            .ok_or_else(|| NodeError::MissingInput("initial".to_string()))?;
        Ok(vec![initial])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let max = positive_setting(&ctx.settings, "max_iterations")?
            .unwrap_or(DEFAULT_MAX_ITERATIONS);
        let iteration = ctx.iteration();
        let data = match ctx.input(1) {
            Some(previous) if iteration > 0 => previous.clone(),
            _ => ctx.require_input(0)?.clone(),
        };

        Ok(NodeOutput::new()
            .with_output(data)
            .terminate_loop(u64::from(iteration) + 1 >= max))
    }
}

pub struct RecursiveLoopStartNodeFactory;

impl NodeFactory for RecursiveLoopStartNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(RecursiveLoopStartNode))
    }

    fn node_type(&self) -> &str {
        "loop.recursive_start"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Start of a loop fed back by its loop end".to_string(),
            category: "loop".to_string(),
            inputs: RecursiveLoopStartNode.input_ports(),
            outputs: RecursiveLoopStartNode.output_ports(),
        }
    }
}

/// End of a recursive loop: hands the body's result back to the start and
/// emits the result of the last pass.
pub struct RecursiveLoopEndNode;

#[async_trait]
impl Node for RecursiveLoopEndNode {
    fn node_type(&self) -> &str {
        "loop.recursive_end"
    }

    fn loop_role(&self) -> LoopRole {
        LoopRole::End
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("data")]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("data")]
    }

    fn configure(
        &self,
        inputs: &[Option<PortSpec>],
        _settings: &NodeSettings,
    ) -> Result<Vec<PortSpec>, NodeError> {
        Ok(vec![inputs.first().cloned().flatten().unwrap_or_else(PortSpec::any)])
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let data = ctx.require_input(0)?.clone();
        Ok(NodeOutput::new().with_output(data))
    }
}

pub struct RecursiveLoopEndNodeFactory;

impl NodeFactory for RecursiveLoopEndNodeFactory {
    fn create(&self, _settings: &NodeSettings) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(RecursiveLoopEndNode))
    }

    fn node_type(&self) -> &str {
        "loop.recursive_end"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "End of a recursive loop".to_string(),
            category: "loop".to_string(),
            inputs: RecursiveLoopEndNode.input_ports(),
            outputs: RecursiveLoopEndNode.output_ports(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_must_be_positive() {
        let node = CountLoopStartNode;
        assert!(node.validate_settings(&NodeSettings::new()).is_err());
        assert!(node
            .validate_settings(&NodeSettings::new().with("count", 0i64))
            .is_err());
        assert!(node
            .validate_settings(&NodeSettings::new().with("count", 3i64))
            .is_ok());
    }

    #[test]
    fn loop_roles() {
        assert_eq!(CountLoopStartNode.loop_role(), LoopRole::Start);
        assert_eq!(CollectLoopEndNode.loop_role(), LoopRole::End);
        assert_eq!(RecursiveLoopStartNode.loop_role(), LoopRole::Start);
        assert_eq!(RecursiveLoopEndNode.loop_role(), LoopRole::End);
    }
}
