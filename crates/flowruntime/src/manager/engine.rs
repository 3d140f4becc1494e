use crate::graph::Workflow;
use crate::registry::NodeRegistry;
use crate::scheduler::Job;
use chrono::Utc;
use flowcore::{EventBus, ExecutionEvent, NodeId, NodeMessage, NodeState, WorkflowChange};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Everything guarded by the manager lock.
///
/// Nested workflows live inside `root`, so one lock covers the whole tree.
/// Events and jobs produced while it is held are buffered here and flushed
/// by the manager once the lock is released.
pub(crate) struct Core {
    pub root: Workflow,
    pub registry: Arc<NodeRegistry>,
    pub bus: Arc<EventBus>,
    pub pending: Vec<ExecutionEvent>,
    pub jobs: Vec<Job>,
    pub shut_down: bool,
    pub poll_interval: Duration,
    claims: HashMap<NodeId, usize>,
    generation: u64,
}

impl Core {
    pub fn new(
        root: Workflow,
        registry: Arc<NodeRegistry>,
        bus: Arc<EventBus>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            root,
            registry,
            bus,
            pending: Vec::new(),
            jobs: Vec::new(),
            shut_down: false,
            poll_interval,
            claims: HashMap::new(),
            generation: 0,
        }
    }

    pub fn emit(&mut self, event: ExecutionEvent) {
        self.pending.push(event);
    }

    pub fn emit_change(&mut self, change: WorkflowChange) {
        self.pending.push(ExecutionEvent::workflow_changed(change));
    }

    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn leaf_state(&self, id: &NodeId) -> Option<NodeState> {
        self.root.leaf(id).map(|l| l.state)
    }

    /// The single place where leaf states change. Illegal transitions are
    /// logged and refused.
    pub fn set_state(&mut self, id: &NodeId, next: NodeState) -> bool {
        let Some(old) = self.leaf_state(id) else {
            tracing::warn!("State change for unknown node {}", id);
            return false;
        };
        if old == next {
            return true;
        }
        if let Err(e) = old.transition(next) {
            tracing::error!("Node {}: {}", id, e);
            return false;
        }
        let enclosing_before = self.enclosing_states(id);
        if let Some(leaf) = self.root.leaf_mut(id) {
            leaf.state = next;
        }
        tracing::debug!("Node {} {} -> {}", id, old, next);
        self.emit(ExecutionEvent::state_changed(id.clone(), old, next));

        let enclosing_after = self.enclosing_states(id);
        for ((wf, before), (_, after)) in enclosing_before.into_iter().zip(enclosing_after) {
            if before != after {
                self.emit(ExecutionEvent::state_changed(wf, before, after));
            }
        }
        true
    }

    /// Derived states of the nested workflows around `id`, innermost first.
    fn enclosing_states(&self, id: &NodeId) -> Vec<(NodeId, NodeState)> {
        let mut out = Vec::new();
        let mut current = id.parent();
        while let Some(parent) = current {
            if parent == self.root.id {
                break;
            }
            if let Some(wf) = self.root.graph(&parent) {
                out.push((parent.clone(), self.root.workflow_state(wf)));
            }
            current = parent.parent();
        }
        out
    }

    pub fn set_message(&mut self, id: &NodeId, message: NodeMessage) {
        let Some(container) = self.root.container_mut(id) else {
            return;
        };
        if container.message == message {
            return;
        }
        container.message = message.clone();
        self.emit(ExecutionEvent::MessageChanged {
            node_id: id.clone(),
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn in_progress(&self, id: &NodeId) -> bool {
        self.root.in_progress_under(id)
    }

    pub fn successors_in_progress(&self, id: &NodeId) -> bool {
        let mut seeds = self.root.leaves_under(id);
        seeds.push(id.clone());
        self.root.downstream_closure(&seeds).iter().any(|s| {
            self.leaf_state(s)
                .map(|st| st.is_execution_in_progress())
                .unwrap_or(false)
        })
    }

    // ----- mutation claims -----

    pub fn claim(&mut self, ids: &[NodeId]) {
        for id in ids {
            *self.claims.entry(id.clone()).or_insert(0) += 1;
        }
    }

    pub fn release(&mut self, ids: &[NodeId]) {
        for id in ids {
            if let Some(count) = self.claims.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    self.claims.remove(id);
                }
            }
        }
    }

    fn is_claimed(&self, id: &NodeId) -> bool {
        self.claims
            .keys()
            .any(|claimed| claimed == id || claimed.is_ancestor_of(id))
    }

    /// Whether `id` or anything downstream of it is held by a claim; such
    /// nodes are not marked for execution.
    pub fn blocked_by_claim(&self, id: &NodeId) -> Option<NodeId> {
        if self.claims.is_empty() {
            return None;
        }
        if self.is_claimed(id) {
            return Some(id.clone());
        }
        self.root
            .downstream_closure(std::slice::from_ref(id))
            .into_iter()
            .find(|s| self.is_claimed(s))
    }
}
