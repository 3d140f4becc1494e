//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: node identifiers, the node state machine, port
//! payloads and the contract node bodies implement.

mod error;
pub mod events;
mod id;
mod node;
mod port;
mod settings;
mod state;
mod value;

pub use error::{FlowError, NodeError, StateError, WorkflowError};
pub use events::*;
pub use id::{NodeId, ParseNodeIdError};
pub use node::{InternalState, LoopInfo, LoopRole, Node, NodeContext, NodeOutput};
pub use port::{PortDefinition, PortSpec};
pub use settings::NodeSettings;
pub use state::{MessageKind, NodeMessage, NodeState};
pub use value::{PortData, Value};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
