#![allow(dead_code)]

use flowcore::{NodeId, NodeSettings, NodeState, StateListener};
use flownodes::testing::{BlockingNodeFactory, CountingNodeFactory};
use flowruntime::{NodeRegistry, RuntimeConfig, WorkflowManager};
use parking_lot::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Handles injected into the instrumented test nodes
pub struct Harness {
    pub gate: Arc<tokio::sync::Mutex<()>>,
    pub executions: Arc<AtomicUsize>,
    pub registry: Arc<NodeRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        let executions = Arc::new(AtomicUsize::new(0));
        let mut registry = flownodes::standard_registry();
        registry.register(Arc::new(BlockingNodeFactory::new(gate.clone())));
        registry.register(Arc::new(CountingNodeFactory::new(executions.clone())));
        Self {
            gate,
            executions,
            registry: Arc::new(registry),
        }
    }

    pub fn manager(&self) -> WorkflowManager {
        self.manager_with(RuntimeConfig::default())
    }

    pub fn manager_with(&self, config: RuntimeConfig) -> WorkflowManager {
        WorkflowManager::new(self.registry.clone(), config)
    }
}

pub fn constant(manager: &WorkflowManager, value: f64) -> NodeId {
    manager
        .add_node(
            &manager.root_id(),
            "source.constant",
            NodeSettings::new().with("value", value),
        )
        .unwrap()
}

pub fn node(manager: &WorkflowManager, node_type: &str) -> NodeId {
    manager
        .add_node(&manager.root_id(), node_type, NodeSettings::new())
        .unwrap()
}

pub fn connect(manager: &WorkflowManager, source: &NodeId, dest: &NodeId) {
    manager.add_connection(source, 0, dest, 0).unwrap();
}

/// Poll until `id` reaches `state`.
pub async fn wait_for_state(manager: &WorkflowManager, id: &NodeId, state: NodeState) {
    let reached = tokio::time::timeout(WAIT, async {
        while manager.node_state(id) != Some(state) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "{} never reached {}, stuck in {:?}",
        id,
        state,
        manager.node_state(id)
    );
}

/// Records every transition it is told about.
#[derive(Default)]
pub struct Recorder {
    pub transitions: Mutex<Vec<(NodeId, NodeState, NodeState)>>,
}

impl Recorder {
    pub fn states_of(&self, id: &NodeId) -> Vec<NodeState> {
        self.transitions
            .lock()
            .iter()
            .filter(|(n, _, _)| n == id)
            .map(|(_, _, new)| *new)
            .collect()
    }
}

impl StateListener for Recorder {
    fn on_state_changed(&self, node_id: &NodeId, old_state: NodeState, new_state: NodeState) {
        self.transitions
            .lock()
            .push((node_id.clone(), old_state, new_state));
    }
}
