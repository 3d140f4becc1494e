//! Workflow execution runtime
//!
//! This crate provides the workflow manager that owns a graph of nodes,
//! drives their state machine, schedules node bodies on a bounded worker
//! pool and persists workflows to disk.

mod batch;
mod config;
mod connection;
mod container;
mod graph;
mod manager;
mod persist;
mod registry;
mod scheduler;

pub use batch::{BatchExecutor, BatchStatus};
pub use config::RuntimeConfig;
pub use connection::{ConnectionContainer, ConnectionKind};
pub use manager::{MutationClaim, PortReconfiguration, WorkflowManager};
pub use persist::{
    GraphDocument, LoadEntry, LoadResult, LoadSeverity, NodeDocument, WorkflowDocument,
    FORMAT_VERSION, WORKFLOW_FILE,
};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry};
