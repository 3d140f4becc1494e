use flowcore::FlowError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a workflow manager and its worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of node bodies allowed to run at the same time
    pub max_parallel_nodes: usize,
    /// Capacity of the broadcast channel behind `subscribe()`
    pub event_buffer_size: usize,
    /// Longest stretch a node body should run without looking at its
    /// cancellation token; handed to bodies through their context
    pub cancel_poll_interval_ms: u64,
    /// Fallback poll period of `wait_until_done` between state notifications
    pub wait_poll_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            cancel_poll_interval_ms: 50,
            wait_poll_interval_ms: 250,
        }
    }
}

impl RuntimeConfig {
    pub fn from_file(path: &Path) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_max_parallel_nodes(mut self, max_parallel_nodes: usize) -> Self {
        self.max_parallel_nodes = max_parallel_nodes;
        self
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms.max(1))
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms.max(1))
    }
}
