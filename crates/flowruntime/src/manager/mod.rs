//! The workflow manager: graph structure, node states and scheduling.
//!
//! All state lives behind one lock per root workflow. Operations run under
//! it and collect their events and jobs; those are published and dispatched
//! after the lock is released, so listeners may call back into the manager.

mod configure;
mod engine;
mod execution;
mod loops;
mod structure;

pub use structure::PortReconfiguration;

use crate::config::RuntimeConfig;
use crate::connection::ConnectionContainer;
use crate::graph::Workflow;
use crate::registry::NodeRegistry;
use crate::scheduler::{Job, Scheduler};
pub(crate) use engine::Core;
use flowcore::{
    EventBus, ExecutionEvent, NodeId, NodeMessage, NodeSettings, NodeState, PortData,
    PortDefinition, PortSpec, StateListener, WorkflowError,
};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

pub(crate) struct Shared {
    id: Uuid,
    core: Mutex<Core>,
    bus: Arc<EventBus>,
    listeners: RwLock<Vec<Arc<dyn StateListener>>>,
    scheduler: Scheduler,
    /// Bumped after every batch containing state changes
    settled: watch::Sender<u64>,
    config: RuntimeConfig,
}

impl Shared {
    /// Run `f` under the lock, then publish what it produced.
    pub(crate) fn with_core<R>(self: &Arc<Self>, f: impl FnOnce(&mut Core) -> R) -> R {
        let (result, events, jobs) = {
            let mut core = self.core.lock();
            let result = f(&mut core);
            let events = std::mem::take(&mut core.pending);
            let jobs = std::mem::take(&mut core.jobs);
            (result, events, jobs)
        };
        self.publish(events);
        for job in jobs {
            self.scheduler.spawn(run_job(Arc::clone(self), job));
        }
        result
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&Core) -> R) -> R {
        let core = self.core.lock();
        f(&core)
    }

    fn publish(&self, events: Vec<ExecutionEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        let mut state_changed = false;
        for event in events {
            if let ExecutionEvent::StateChanged {
                node_id,
                old_state,
                new_state,
                ..
            } = &event
            {
                state_changed = true;
                for listener in &listeners {
                    listener.on_state_changed(node_id, *old_state, *new_state);
                }
            }
            self.bus.emit(event);
        }
        if state_changed {
            self.settled.send_modify(|n| *n = n.wrapping_add(1));
        }
    }
}

/// One queued node, from waiting for a worker slot to recording the result.
async fn run_job(shared: Arc<Shared>, job: Job) {
    let Some(_permit) = shared.scheduler.acquire(&job.token).await else {
        tracing::debug!("Job for {} canceled before it started", job.node_id);
        return;
    };
    let Some(ctx) = shared.with_core(|core| core.before_execution(&job.node_id, &job.token)) else {
        return;
    };
    let started = Instant::now();
    let result = shared
        .scheduler
        .run_body(job.body.clone(), ctx, &job.token)
        .await;
    shared.with_core(|core| core.after_execution(&job.node_id, result, started.elapsed()));
}

/// Handle to a workflow graph and its execution. Cheap to clone; all
/// clones drive the same workflow.
#[derive(Clone)]
pub struct WorkflowManager {
    pub(crate) shared: Arc<Shared>,
}

/// Holds nodes out of execution while a structural change is prepared.
/// Released on drop.
pub struct MutationClaim {
    shared: Weak<Shared>,
    nodes: Vec<NodeId>,
}

impl MutationClaim {
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }
}

impl Drop for MutationClaim {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let nodes = std::mem::take(&mut self.nodes);
            shared.with_core(|core| core.release(&nodes));
        }
    }
}

impl WorkflowManager {
    /// Create an empty workflow. Must be called from within a Tokio
    /// runtime; node bodies run on that runtime.
    pub fn new(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        Self::with_name("workflow", registry, config)
    }

    pub fn with_name(name: &str, registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let root = Workflow::new(NodeId::root(), name, Vec::new(), Vec::new());
        Self::from_root(Uuid::new_v4(), root, registry, config)
    }

    pub(crate) fn from_root(
        id: Uuid,
        root: Workflow,
        registry: Arc<NodeRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let bus = Arc::new(EventBus::new(config.event_buffer_size));
        let core = Core::new(root, registry, bus.clone(), config.cancel_poll_interval());
        let (settled, _) = watch::channel(0);
        tracing::debug!(
            "Creating workflow manager {} with {} workers",
            id,
            config.max_parallel_nodes
        );
        Self {
            shared: Arc::new(Shared {
                id,
                core: Mutex::new(core),
                bus,
                listeners: RwLock::new(Vec::new()),
                scheduler: Scheduler::new(config.max_parallel_nodes),
                settled,
                config,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> String {
        self.shared.read(|core| core.root.name.clone())
    }

    pub fn root_id(&self) -> NodeId {
        NodeId::root()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn max_parallel_nodes(&self) -> usize {
        self.shared.scheduler.max_parallel()
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        self.shared.read(|core| core.registry.clone())
    }

    // ----- structure -----

    /// Create a leaf from the registry inside workflow `parent` and
    /// configure it.
    pub fn add_node(
        &self,
        parent: &NodeId,
        node_type: &str,
        settings: NodeSettings,
    ) -> Result<NodeId, WorkflowError> {
        self.shared
            .with_core(|core| core.add_leaf(parent, node_type, None, settings))
    }

    pub fn add_named_node(
        &self,
        parent: &NodeId,
        node_type: &str,
        name: &str,
        settings: NodeSettings,
    ) -> Result<NodeId, WorkflowError> {
        self.shared.with_core(|core| {
            core.add_leaf(parent, node_type, Some(name.to_string()), settings)
        })
    }

    /// Create an empty nested workflow with the given boundary ports.
    pub fn add_workflow(
        &self,
        parent: &NodeId,
        name: &str,
        in_ports: Vec<PortDefinition>,
        out_ports: Vec<PortDefinition>,
    ) -> Result<NodeId, WorkflowError> {
        self.shared
            .with_core(|core| core.add_workflow(parent, name, in_ports, out_ports))
    }

    pub fn can_remove_node(&self, id: &NodeId) -> bool {
        self.shared.read(|core| core.can_remove_node(id))
    }

    pub fn remove_node(&self, id: &NodeId) -> Result<(), WorkflowError> {
        self.shared.with_core(|core| core.remove_node(id))
    }

    pub fn can_add_connection(
        &self,
        source: &NodeId,
        source_port: usize,
        dest: &NodeId,
        dest_port: usize,
    ) -> bool {
        self.shared
            .read(|core| core.can_add_connection(source, source_port, dest, dest_port))
    }

    /// Connect `source[source_port]` to `dest[dest_port]`. Either end may be
    /// the enclosing workflow's boundary. Rejected connections leave the
    /// graph untouched.
    pub fn add_connection(
        &self,
        source: &NodeId,
        source_port: usize,
        dest: &NodeId,
        dest_port: usize,
    ) -> Result<ConnectionContainer, WorkflowError> {
        self.shared
            .with_core(|core| core.add_connection(source, source_port, dest, dest_port))
    }

    pub fn can_remove_connection(&self, conn: &ConnectionContainer) -> bool {
        self.shared.read(|core| core.can_remove_connection(conn))
    }

    pub fn remove_connection(&self, conn: &ConnectionContainer) -> Result<(), WorkflowError> {
        self.shared.with_core(|core| core.remove_connection(conn))
    }

    /// Connections owned by workflow `graph`.
    pub fn connections(&self, graph: &NodeId) -> Vec<ConnectionContainer> {
        self.shared.read(|core| {
            core.root
                .graph(graph)
                .map(|g| g.connections.clone())
                .unwrap_or_default()
        })
    }

    /// Connection feeding input `port` of `node`, seen from its parent.
    pub fn incoming_connection(&self, node: &NodeId, port: usize) -> Option<ConnectionContainer> {
        self.shared.read(|core| {
            let parent = node.parent()?;
            core.root.graph(&parent)?.incoming(node, port).cloned()
        })
    }

    pub fn outgoing_connections(&self, node: &NodeId) -> Vec<ConnectionContainer> {
        self.shared.read(|core| {
            node.parent()
                .and_then(|p| core.root.graph(&p))
                .map(|g| {
                    g.connections
                        .iter()
                        .filter(|c| &c.source == node)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    pub fn reconfigure_ports(
        &self,
        id: &NodeId,
        reconfiguration: PortReconfiguration,
    ) -> Result<(), WorkflowError> {
        self.shared
            .with_core(|core| core.reconfigure_ports(id, reconfiguration))
    }

    pub fn load_node_settings(
        &self,
        id: &NodeId,
        settings: NodeSettings,
    ) -> Result<(), WorkflowError> {
        self.shared.with_core(|core| core.load_node_settings(id, settings))
    }

    pub fn node_settings(&self, id: &NodeId) -> Option<NodeSettings> {
        self.shared
            .read(|core| core.root.leaf(id).map(|l| l.settings.clone()))
    }

    /// Direct children of workflow `graph`.
    pub fn node_ids(&self, graph: &NodeId) -> Vec<NodeId> {
        self.shared.read(|core| {
            core.root
                .graph(graph)
                .map(|g| g.nodes.values().map(|c| c.id().clone()).collect())
                .unwrap_or_default()
        })
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.shared.read(|core| core.root.container(id).is_some())
    }

    pub fn node_name(&self, id: &NodeId) -> Option<String> {
        self.shared
            .read(|core| core.root.container(id).map(|c| c.name().to_string()))
    }

    pub fn node_type(&self, id: &NodeId) -> Option<String> {
        self.shared
            .read(|core| core.root.leaf(id).map(|l| l.node_type.clone()))
    }

    pub fn is_workflow(&self, id: &NodeId) -> bool {
        self.shared.read(|core| core.root.graph(id).is_some())
    }

    pub fn in_ports(&self, id: &NodeId) -> Option<Vec<PortDefinition>> {
        self.shared.read(|core| match core.root.graph(id) {
            Some(g) => Some(g.in_ports.clone()),
            None => core.root.leaf(id).map(|l| l.in_ports.clone()),
        })
    }

    pub fn out_ports(&self, id: &NodeId) -> Option<Vec<PortDefinition>> {
        self.shared.read(|core| match core.root.graph(id) {
            Some(g) => Some(g.out_ports.clone()),
            None => core.root.leaf(id).map(|l| l.out_ports.clone()),
        })
    }

    // ----- execution -----

    /// Mark the given nodes and all their unexecuted predecessors; nodes
    /// whose inputs are ready are queued right away.
    pub fn execute_up_to_here(&self, ids: &[NodeId]) -> Result<(), WorkflowError> {
        self.shared.with_core(|core| core.execute_up_to_here(ids))
    }

    pub fn execute_all(&self) {
        self.shared.with_core(|core| core.execute_all())
    }

    pub fn mark_and_queue(&self, id: &NodeId) -> bool {
        self.shared.with_core(|core| core.mark_and_queue(id))
    }

    /// CONFIGURED with every input available.
    pub fn can_execute_node(&self, id: &NodeId) -> bool {
        self.shared.read(|core| core.can_execute(id))
    }

    pub fn cancel_execution(&self, id: &NodeId) -> Result<(), WorkflowError> {
        self.shared.with_core(|core| core.cancel_execution(id))
    }

    pub fn cancel_all(&self) {
        self.shared.with_core(|core| core.cancel_all())
    }

    pub fn can_reset_node(&self, id: &NodeId) -> bool {
        self.shared.read(|core| core.can_reset(id))
    }

    pub fn reset_and_configure_node(&self, id: &NodeId) -> Result<(), WorkflowError> {
        self.shared.with_core(|core| core.reset_and_configure(id))
    }

    pub fn reset_all(&self) -> Result<(), WorkflowError> {
        self.shared.with_core(|core| core.reset_all())
    }

    /// Nothing is marked, queued or running.
    pub fn is_halted(&self) -> bool {
        self.shared.read(|core| core.is_halted())
    }

    /// Wait until the workflow halts. Returns `false` on timeout.
    pub async fn wait_until_done(&self, timeout: Option<Duration>) -> bool {
        let mut settled = self.shared.settled.subscribe();
        let poll = self.shared.config.wait_poll_interval();
        let halted = async {
            while !self.is_halted() {
                tokio::select! {
                    _ = settled.changed() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, halted).await.is_ok(),
            None => {
                halted.await;
                true
            }
        }
    }

    /// Execute everything and wait. `true` if the whole workflow ended up
    /// EXECUTED within `timeout`.
    pub async fn execute_all_and_wait_until_done(&self, timeout: Option<Duration>) -> bool {
        self.execute_all();
        if !self.wait_until_done(timeout).await {
            tracing::warn!("Workflow {} did not finish in time", self.id());
            return false;
        }
        self.state().is_executed()
    }

    /// Refuse new work, cancel everything and wait for workers to drain.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        tracing::info!("Shutting down workflow {}", self.id());
        self.shared.with_core(|core| {
            core.shut_down = true;
            core.cancel_all();
        });
        self.wait_until_done(Some(timeout)).await
    }

    pub fn claim_for_mutation(&self, ids: &[NodeId]) -> Result<MutationClaim, WorkflowError> {
        self.shared.with_core(|core| {
            for id in ids {
                if core.root.container(id).is_none() && *id != core.root.id {
                    return Err(WorkflowError::NodeNotFound(id.clone()));
                }
                if core.in_progress(id) || core.successors_in_progress(id) {
                    return Err(WorkflowError::ExecutionInProgress(id.clone()));
                }
            }
            core.claim(ids);
            Ok(())
        })?;
        Ok(MutationClaim {
            shared: Arc::downgrade(&self.shared),
            nodes: ids.to_vec(),
        })
    }

    // ----- queries -----

    /// State of a leaf, or the derived state of a workflow.
    pub fn node_state(&self, id: &NodeId) -> Option<NodeState> {
        self.shared.read(|core| core.root.state_of(id))
    }

    /// Derived state of the root workflow.
    pub fn state(&self) -> NodeState {
        self.shared.read(|core| core.root.workflow_state(&core.root))
    }

    pub fn node_message(&self, id: &NodeId) -> Option<NodeMessage> {
        self.shared.read(|core| {
            if *id == core.root.id {
                return Some(NodeMessage::none());
            }
            core.root.container(id).map(|c| c.message().clone())
        })
    }

    /// Data on output `port` of an executed node or workflow.
    pub fn output(&self, id: &NodeId, port: usize) -> Option<PortData> {
        self.shared.read(|core| {
            let (leaf, port) = match core.root.graph(id) {
                Some(wf) => core.root.output_producer(wf, port)?,
                None => (id.clone(), port),
            };
            let leaf = core.root.leaf(&leaf)?;
            if !leaf.state.is_executed() {
                return None;
            }
            leaf.out_data.as_ref()?.get(port).cloned()
        })
    }

    pub fn output_spec(&self, id: &NodeId, port: usize) -> Option<PortSpec> {
        self.shared.read(|core| {
            let (leaf, port) = match core.root.graph(id) {
                Some(wf) => core.root.output_producer(wf, port)?,
                None => (id.clone(), port),
            };
            core.root.leaf(&leaf)?.out_specs.as_ref()?.get(port).cloned()
        })
    }

    /// Every container with a non-empty message.
    pub fn messages(&self) -> Vec<(NodeId, NodeMessage)> {
        self.shared.read(|core| {
            let mut out = Vec::new();
            collect_messages(&core.root, &mut out);
            out
        })
    }

    /// Current pass of an active loop headed by `start`.
    pub fn loop_iteration(&self, start: &NodeId) -> Option<u32> {
        self.shared.read(|core| {
            core.root
                .leaf(start)?
                .loop_context
                .as_ref()
                .map(|c| c.iteration)
        })
    }

    // ----- observers -----

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.shared.bus.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.shared.listeners.write().push(listener);
    }
}

fn collect_messages(wf: &Workflow, out: &mut Vec<(NodeId, NodeMessage)>) {
    for container in wf.nodes.values() {
        if !container.message().is_none() {
            out.push((container.id().clone(), container.message().clone()));
        }
        if let Some(inner) = container.as_workflow() {
            collect_messages(inner, out);
        }
    }
}
