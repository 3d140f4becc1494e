use crate::config::RuntimeConfig;
use crate::manager::WorkflowManager;
use crate::persist::{LoadEntry, LoadSeverity};
use crate::registry::NodeRegistry;
use flowcore::{FlowError, NodeId, NodeMessage};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a batch run, usable as a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Success = 0,
    ExecutionFailed = 1,
    Timeout = 2,
    /// Loaded with warnings, part of the graph may be missing
    LoadErrors = 3,
    /// Nothing could be loaded
    LoadFatal = 4,
}

impl BatchStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    fn priority(self) -> u8 {
        match self {
            BatchStatus::Success => 0,
            BatchStatus::LoadErrors => 1,
            BatchStatus::ExecutionFailed => 2,
            BatchStatus::Timeout => 3,
            BatchStatus::LoadFatal => 4,
        }
    }

    /// The more severe of two outcomes.
    pub fn combine(self, other: BatchStatus) -> BatchStatus {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }
}

/// Load / execute / wait / save / shutdown driver for non-interactive
/// callers such as the CLI.
pub struct BatchExecutor {
    registry: Arc<NodeRegistry>,
    config: RuntimeConfig,
    manager: Option<WorkflowManager>,
    entries: Vec<LoadEntry>,
    status: BatchStatus,
}

impl BatchExecutor {
    pub fn new(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        Self {
            registry,
            config,
            manager: None,
            entries: Vec::new(),
            status: BatchStatus::Success,
        }
    }

    pub fn manager(&self) -> Option<&WorkflowManager> {
        self.manager.as_ref()
    }

    pub fn load_entries(&self) -> &[LoadEntry] {
        &self.entries
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    fn record(&mut self, status: BatchStatus) -> BatchStatus {
        self.status = self.status.combine(status);
        status
    }

    /// Must be called from within a Tokio runtime.
    pub fn load_workflow(&mut self, dir: &Path) -> BatchStatus {
        tracing::info!("Loading workflow from {}", dir.display());
        let result = WorkflowManager::load(dir, self.registry.clone(), self.config.clone());
        self.entries = result.entries;
        self.manager = result.manager;
        let status = if self.manager.is_none() {
            BatchStatus::LoadFatal
        } else if self
            .entries
            .iter()
            .any(|e| matches!(e.severity, LoadSeverity::Warning | LoadSeverity::Error))
        {
            BatchStatus::LoadErrors
        } else {
            BatchStatus::Success
        };
        self.record(status)
    }

    fn loaded(&self) -> Result<&WorkflowManager, FlowError> {
        self.manager
            .as_ref()
            .ok_or_else(|| FlowError::Execution("no workflow loaded".to_string()))
    }

    pub fn execute_all(&self) -> Result<(), FlowError> {
        let manager = self.loaded()?;
        tracing::info!("Executing all nodes of {}", manager.name());
        manager.execute_all();
        Ok(())
    }

    /// Wait for the loaded workflow to halt and classify the result.
    pub async fn wait_until_done(&mut self, timeout: Option<Duration>) -> BatchStatus {
        let Some(manager) = self.manager.clone() else {
            return self.record(BatchStatus::LoadFatal);
        };
        let status = if !manager.wait_until_done(timeout).await {
            tracing::warn!("Workflow {} still running after timeout", manager.name());
            BatchStatus::Timeout
        } else if manager.state().is_executed() {
            BatchStatus::Success
        } else {
            BatchStatus::ExecutionFailed
        };
        self.record(status)
    }

    /// Nodes carrying an error or warning message.
    pub fn failures(&self) -> Vec<(NodeId, NodeMessage)> {
        self.manager
            .as_ref()
            .map(|m| m.messages())
            .unwrap_or_default()
    }

    pub fn save(&self, dir: &Path) -> Result<(), FlowError> {
        self.loaded()?.save(dir)
    }

    pub async fn shutdown(&self, timeout: Duration) -> bool {
        match &self.manager {
            Some(manager) => manager.shutdown(timeout).await,
            None => true,
        }
    }

    /// Load, execute everything, wait, optionally save, shut down.
    pub async fn run(
        &mut self,
        dir: &Path,
        timeout: Option<Duration>,
        save_to: Option<&Path>,
    ) -> BatchStatus {
        if self.load_workflow(dir) == BatchStatus::LoadFatal {
            return self.status;
        }
        if let Err(e) = self.execute_all() {
            tracing::error!("Execution request failed: {}", e);
            self.record(BatchStatus::ExecutionFailed);
        }
        self.wait_until_done(timeout).await;
        if let Some(target) = save_to {
            if let Err(e) = self.save(target) {
                tracing::error!("Saving to {} failed: {}", target.display(), e);
                self.record(BatchStatus::ExecutionFailed);
            }
        }
        let grace = self.config.cancel_poll_interval() * 20;
        if !self.shutdown(grace).await {
            tracing::warn!("Workers did not stop within {:?}", grace);
        }
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn more_severe_status_wins() {
        use BatchStatus::*;
        assert_eq!(Success.combine(LoadErrors), LoadErrors);
        assert_eq!(LoadErrors.combine(ExecutionFailed), ExecutionFailed);
        assert_eq!(Timeout.combine(ExecutionFailed), Timeout);
        assert_eq!(Timeout.combine(LoadFatal), LoadFatal);
        assert_eq!(LoadFatal.combine(Success), LoadFatal);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(BatchStatus::Success.code(), 0);
        assert_eq!(BatchStatus::ExecutionFailed.code(), 1);
        assert_eq!(BatchStatus::Timeout.code(), 2);
        assert_eq!(BatchStatus::LoadErrors.code(), 3);
        assert_eq!(BatchStatus::LoadFatal.code(), 4);
    }
}
