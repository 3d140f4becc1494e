//! Standard node library
//!
//! Collection of built-in nodes for common operations, loop constructs and
//! the instrumented nodes the engine tests are built from.

mod debug;
mod io;
mod loops;
mod math;
mod source;
pub mod testing;
mod time;
mod transform;

pub use debug::DebugNode;
pub use io::WriteFileNode;
pub use loops::{CollectLoopEndNode, CountLoopStartNode, RecursiveLoopEndNode, RecursiveLoopStartNode};
pub use math::{MapNode, SumNode};
pub use source::ConstantNode;
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode, PassNode};
use flowruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(source::ConstantNodeFactory));
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(transform::PassNodeFactory));
    registry.register(Arc::new(transform::JsonParseNodeFactory));
    registry.register(Arc::new(transform::JsonStringifyNodeFactory));
    registry.register(Arc::new(math::MapNodeFactory));
    registry.register(Arc::new(math::SumNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
    registry.register(Arc::new(io::WriteFileNodeFactory));
    registry.register(Arc::new(loops::CountLoopStartNodeFactory));
    registry.register(Arc::new(loops::CollectLoopEndNodeFactory));
    registry.register(Arc::new(loops::RecursiveLoopStartNodeFactory));
    registry.register(Arc::new(loops::RecursiveLoopEndNodeFactory));
    registry.register(Arc::new(testing::FailNodeFactory));
    registry.register(Arc::new(testing::JoinNodeFactory));
}

/// A registry holding every standard node
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
