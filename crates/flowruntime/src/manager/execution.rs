use super::engine::Core;
use crate::container::LoopContext;
use crate::scheduler::Job;
use chrono::Utc;
use flowcore::{
    ExecutionEvent, LoopInfo, LoopRole, NodeContext, NodeError, NodeId, NodeMessage, NodeOutput,
    NodeState, PortData, WorkflowError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

impl Core {
    pub fn execute_up_to_here(&mut self, targets: &[NodeId]) -> Result<(), WorkflowError> {
        if let Some(missing) = targets.iter().find(|t| self.root.container(t).is_none()) {
            return Err(WorkflowError::NodeNotFound(missing.clone()));
        }
        if let Some(claimed) = targets.iter().find_map(|t| self.blocked_by_claim(t)) {
            return Err(WorkflowError::ClaimedForMutation(claimed));
        }
        for target in targets {
            if !self.mark_node_and_predecessors(target) {
                tracing::debug!("Node {} can not be executed", target);
            }
        }
        Ok(())
    }

    pub fn execute_all(&mut self) {
        let leaves = self.root.topo_order(self.root.leaves());
        for leaf in leaves {
            if self.blocked_by_claim(&leaf).is_none() {
                self.mark_node_and_predecessors(&leaf);
            }
        }
    }

    pub fn mark_and_queue(&mut self, id: &NodeId) -> bool {
        if self.blocked_by_claim(id).is_some() {
            return false;
        }
        self.mark_node_and_predecessors(id)
    }

    /// Mark `id` and every predecessor that still has to run. Returns
    /// `false` without marking anything if some required input can never
    /// be produced.
    pub fn mark_node_and_predecessors(&mut self, id: &NodeId) -> bool {
        if self.shut_down {
            return false;
        }
        if let Some(wf) = self.root.graph(id) {
            let leaves = self.root.topo_order(wf.leaves());
            let mut all = true;
            for leaf in leaves {
                all &= self.mark_node_and_predecessors(&leaf);
            }
            return all;
        }
        if !self.markable(id, &mut HashSet::new()) {
            return false;
        }
        self.mark_leaf_and_predecessors(id);
        true
    }

    /// Whether `id` and all of its unfinished ancestors are fully
    /// connected and free of claims.
    fn markable(&self, id: &NodeId, seen: &mut HashSet<NodeId>) -> bool {
        if !seen.insert(id.clone()) {
            return true;
        }
        let Some(leaf) = self.root.leaf(id) else {
            return false;
        };
        if leaf.state.is_executed() || leaf.state.is_execution_in_progress() {
            return true;
        }
        if self.blocked_by_claim(id).is_some() {
            return false;
        }
        leaf.in_ports
            .iter()
            .enumerate()
            .all(|(port, def)| match self.root.upstream(id, port) {
                None if def.required => {
                    tracing::debug!("Node {} has unconnected input '{}'", id, def.name);
                    false
                }
                None => true,
                Some(up) if up.feedback => true,
                Some(up) => self.markable(&up.leaf, seen),
            })
    }

    fn mark_leaf_and_predecessors(&mut self, id: &NodeId) {
        let Some(leaf) = self.root.leaf(id) else {
            return;
        };
        let state = leaf.state;
        if state.is_executed() || state.is_execution_in_progress() {
            return;
        }
        for port in 0..leaf.in_ports.len() {
            if let Some(up) = self.root.upstream(id, port).filter(|u| !u.feedback) {
                self.mark_leaf_and_predecessors(&up.leaf);
            }
        }
        let marked = if state.is_configured() {
            NodeState::ConfiguredMarkedForExec
        } else {
            NodeState::UnconfiguredMarkedForExec
        };
        self.set_state(id, marked);
        self.queue_if_queueable(id);
    }

    /// Whether every non-feedback input of `id` has data available.
    pub fn inputs_available(&self, id: &NodeId) -> bool {
        let Some(leaf) = self.root.leaf(id) else {
            return false;
        };
        leaf.in_ports.iter().enumerate().all(|(port, def)| {
            match self.root.upstream(id, port) {
                None => !def.required,
                Some(up) if up.feedback => true,
                Some(up) => self
                    .root
                    .leaf(&up.leaf)
                    .filter(|p| p.state.is_executed())
                    .and_then(|p| p.out_data.as_ref())
                    .map_or(false, |data| data.len() > up.port),
            }
        })
    }

    pub fn can_execute(&self, id: &NodeId) -> bool {
        self.leaf_state(id) == Some(NodeState::Configured) && self.inputs_available(id)
    }

    /// Hand a marked node whose inputs are ready to the scheduler.
    pub fn queue_if_queueable(&mut self, id: &NodeId) -> bool {
        let Some(state) = self.leaf_state(id) else {
            return false;
        };
        if !state.is_marked() || !self.inputs_available(id) {
            return false;
        }
        if state == NodeState::UnconfiguredMarkedForExec {
            // all data is there and configure still fails
            tracing::debug!("Node {} is not configured, unmarking", id);
            self.disable_for_execution(id);
            return false;
        }
        self.set_state(id, NodeState::ConfiguredQueued);
        let token = CancellationToken::new();
        let Some(leaf) = self.root.leaf_mut(id) else {
            return false;
        };
        leaf.cancel = Some(token.clone());
        let body = leaf.body.clone();
        self.jobs.push(Job {
            node_id: id.clone(),
            body,
            token,
        });
        true
    }

    /// Unmark `id` and every marked successor.
    pub fn disable_for_execution(&mut self, id: &NodeId) {
        let mut todo = vec![id.clone()];
        let mut seen = HashSet::new();
        while let Some(current) = todo.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let Some(state) = self.leaf_state(&current) else {
                continue;
            };
            match state {
                NodeState::ConfiguredMarkedForExec => {
                    self.set_state(&current, NodeState::Configured);
                }
                NodeState::UnconfiguredMarkedForExec => {
                    self.set_state(&current, NodeState::Idle);
                }
                _ if current != *id => continue,
                _ => {}
            }
            let waiting = self
                .root
                .leaf_mut(&current)
                .map(|l| std::mem::take(&mut l.waiting_loops))
                .unwrap_or_default();
            for start in waiting {
                self.abandon_loop(&start);
            }
            for d in self.root.downstream(&current, None) {
                if !d.feedback {
                    todo.push(d.leaf);
                }
            }
        }
    }

    /// QUEUED -> PREEXECUTE -> EXECUTING, gathering everything the body
    /// needs. `None` means the job is stale and must not run.
    pub fn before_execution(
        &mut self,
        id: &NodeId,
        token: &CancellationToken,
    ) -> Option<NodeContext> {
        if token.is_cancelled() || self.leaf_state(id) != Some(NodeState::ConfiguredQueued) {
            return None;
        }
        self.set_state(id, NodeState::PreExecute);
        if let Some(leaf) = self.root.leaf_mut(id) {
            leaf.config_message = false;
        }
        self.set_message(id, NodeMessage::none());

        match self.prepare_context(id, token) {
            Ok(ctx) => {
                self.set_state(id, NodeState::Executing);
                let node_type = self
                    .root
                    .leaf(id)
                    .map(|l| l.node_type.clone())
                    .unwrap_or_default();
                self.emit(ExecutionEvent::NodeStarted {
                    node_id: id.clone(),
                    node_type,
                    iteration: ctx.loop_info.as_ref().map(|l| l.iteration),
                    timestamp: Utc::now(),
                });
                Some(ctx)
            }
            Err(e) => {
                tracing::error!("Node {} failed to start: {}", id, e);
                self.set_state(id, NodeState::Configured);
                self.fail(id, &e);
                None
            }
        }
    }

    fn prepare_context(
        &mut self,
        id: &NodeId,
        token: &CancellationToken,
    ) -> Result<NodeContext, NodeError> {
        let role = self
            .root
            .leaf(id)
            .map(|l| l.role)
            .ok_or_else(|| NodeError::ExecutionFailed(format!("node {} vanished", id)))?;

        let loop_info = match role {
            LoopRole::Start => {
                if self.root.leaf(id).map_or(false, |l| l.loop_context.is_none()) {
                    let generation = self.next_generation();
                    tracing::debug!("Loop {} begins run {}", id, generation);
                    if let Some(leaf) = self.root.leaf_mut(id) {
                        leaf.loop_context = Some(LoopContext {
                            start: id.clone(),
                            generation,
                            iteration: 0,
                            terminate: false,
                            tail: None,
                        });
                    }
                }
                self.root
                    .leaf(id)
                    .and_then(|l| l.loop_context.as_ref())
                    .map(|ctx| LoopInfo {
                        start: id.clone(),
                        iteration: ctx.iteration,
                        terminate: false,
                    })
            }
            LoopRole::End => {
                let start = self
                    .root
                    .leaf(id)
                    .and_then(|l| l.loop_start.clone())
                    .ok_or_else(|| {
                        NodeError::Configuration(
                            "Encountered loop end without corresponding loop start".to_string(),
                        )
                    })?;
                let ctx = self
                    .root
                    .leaf(&start)
                    .and_then(|l| l.loop_context.as_ref())
                    .ok_or_else(|| {
                        NodeError::ExecutionFailed(format!(
                            "Loop start {} has no active loop, reset it and execute the whole loop again",
                            start
                        ))
                    })?;
                Some(LoopInfo {
                    start: start.clone(),
                    iteration: ctx.iteration,
                    terminate: ctx.terminate,
                })
            }
            LoopRole::None => None,
        };

        let leaf = self
            .root
            .leaf(id)
            .ok_or_else(|| NodeError::ExecutionFailed(format!("node {} vanished", id)))?;
        let iteration = leaf.loop_context.as_ref().map_or(0, |c| c.iteration);
        let mut inputs: Vec<Option<PortData>> = Vec::with_capacity(leaf.in_ports.len());
        for (port, def) in leaf.in_ports.iter().enumerate() {
            let value = match self.root.upstream(id, port) {
                None => None,
                Some(up) if up.feedback => {
                    if iteration == 0 {
                        None
                    } else {
                        self.root
                            .leaf(&up.leaf)
                            .and_then(|p| p.loop_feedback.as_ref())
                            .and_then(|d| d.get(up.port).cloned())
                    }
                }
                Some(up) => self
                    .root
                    .leaf(&up.leaf)
                    .and_then(|p| p.out_data.as_ref())
                    .and_then(|d| d.get(up.port).cloned()),
            };
            if value.is_none() && def.required {
                return Err(NodeError::MissingInput(def.name.clone()));
            }
            inputs.push(value);
        }

        Ok(NodeContext {
            node_id: id.clone(),
            inputs,
            settings: leaf.settings.clone(),
            internals: leaf.internals.clone(),
            events: self.bus.create_emitter(id.clone()),
            cancellation: token.clone(),
            loop_info,
            poll_interval: self.poll_interval,
        })
    }

    /// EXECUTING -> EXECUTED (or back to CONFIGURED) and everything that
    /// follows from it: loop restarts and queueing successors.
    pub fn after_execution(
        &mut self,
        id: &NodeId,
        result: Result<NodeOutput, NodeError>,
        elapsed: Duration,
    ) {
        let Some(leaf) = self.root.leaf(id) else {
            tracing::warn!("Node {} was removed while executing", id);
            return;
        };
        if leaf.state != NodeState::Executing {
            tracing::warn!("Node {} finished in unexpected state {}", id, leaf.state);
            return;
        }
        let expected = leaf.out_ports.len();
        let role = leaf.role;
        let result = result.and_then(|out| {
            if out.outputs.len() == expected {
                Ok(out)
            } else {
                Err(NodeError::ExecutionFailed(format!(
                    "produced {} outputs for {} ports",
                    out.outputs.len(),
                    expected
                )))
            }
        });

        match result {
            Err(NodeError::Cancelled) => {
                tracing::info!("Node {} canceled", id);
                self.set_state(id, NodeState::Configured);
                if let Some(leaf) = self.root.leaf_mut(id) {
                    leaf.cancel = None;
                }
                self.set_message(id, NodeMessage::canceled());
                self.disable_for_execution(id);
                self.abandon_loops_touching(std::slice::from_ref(id));
            }
            Err(e) => {
                tracing::error!("Node {} failed: {}", id, e);
                self.set_state(id, NodeState::PostExecute);
                self.set_state(id, NodeState::Configured);
                self.fail(id, &e);
            }
            Ok(output) => {
                let duration_ms = elapsed.as_millis() as u64;
                tracing::info!("Node {} completed in {}ms", id, duration_ms);
                self.set_state(id, NodeState::PostExecute);
                let data: Vec<PortData> = output.outputs.into_iter().map(Arc::new).collect();
                match role {
                    LoopRole::Start => {
                        if let Some(ctx) = self.root.leaf_mut(id).and_then(|l| l.loop_context.as_mut()) {
                            // a start that does not answer runs a single pass
                            ctx.terminate = output.terminate_loop.unwrap_or(true);
                        }
                        if self.find_loop_end(id).is_none() {
                            if let Some(leaf) = self.root.leaf_mut(id) {
                                leaf.loop_context = None;
                            }
                        }
                        self.finish_executed(id, data);
                    }
                    LoopRole::End => self.finish_loop_end(id, data),
                    LoopRole::None => self.finish_executed(id, data),
                }
                self.emit(ExecutionEvent::NodeCompleted {
                    node_id: id.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Record a failure on a node that is already back in CONFIGURED.
    fn fail(&mut self, id: &NodeId, error: &NodeError) {
        if let Some(leaf) = self.root.leaf_mut(id) {
            leaf.cancel = None;
        }
        self.set_message(id, NodeMessage::error(error.to_string()));
        self.emit(ExecutionEvent::NodeFailed {
            node_id: id.clone(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        self.disable_for_execution(id);
        self.abandon_loops_touching(std::slice::from_ref(id));
    }

    fn finish_loop_end(&mut self, id: &NodeId, data: Vec<PortData>) {
        let start = self.root.leaf(id).and_then(|l| l.loop_start.clone());
        let terminate = start
            .as_ref()
            .and_then(|s| self.root.leaf(s))
            .and_then(|l| l.loop_context.as_ref())
            .map_or(true, |c| c.terminate);
        let Some(start) = start.filter(|_| !terminate) else {
            if let Some(start) = self.root.leaf(id).and_then(|l| l.loop_start.clone()) {
                if let Some(leaf) = self.root.leaf_mut(&start) {
                    leaf.loop_context = None;
                }
            }
            self.finish_executed(id, data);
            return;
        };

        tracing::debug!("Loop end {} requests another pass of {}", id, start);
        if let Some(leaf) = self.root.leaf_mut(id) {
            leaf.loop_feedback = Some(data);
            leaf.cancel = None;
        }
        self.set_state(id, NodeState::ConfiguredMarkedForExec);
        if let Some(ctx) = self.root.leaf_mut(&start).and_then(|l| l.loop_context.as_mut()) {
            ctx.tail = Some(id.clone());
        }
        // successors wait, unconfigured, until the final pass
        let successors = self.root.downstream_closure(std::slice::from_ref(id));
        self.configure_nodes(successors);
        self.restart_loop(&start);
    }

    fn finish_executed(&mut self, id: &NodeId, data: Vec<PortData>) {
        self.set_state(id, NodeState::Executed);
        let waiting = match self.root.leaf_mut(id) {
            Some(leaf) => {
                leaf.out_data = Some(data);
                leaf.cancel = None;
                std::mem::take(&mut leaf.waiting_loops)
            }
            None => return,
        };

        let successors = self.root.downstream_closure(std::slice::from_ref(id));
        self.configure_nodes(successors);
        for d in self.root.downstream(id, None) {
            if !d.feedback {
                self.queue_if_queueable(&d.leaf);
            }
        }

        for start in waiting {
            self.restart_loop(&start);
        }
    }

    pub fn cancel_execution(&mut self, id: &NodeId) -> Result<(), WorkflowError> {
        if self.root.container(id).is_none() && *id != self.root.id {
            return Err(WorkflowError::NodeNotFound(id.clone()));
        }
        let leaves = self.root.topo_order(self.root.leaves_under(id));
        for leaf in &leaves {
            let Some(state) = self.leaf_state(leaf) else {
                continue;
            };
            match state {
                NodeState::ConfiguredMarkedForExec | NodeState::UnconfiguredMarkedForExec => {
                    self.disable_for_execution(leaf);
                }
                NodeState::ConfiguredQueued => {
                    if let Some(token) = self.root.leaf_mut(leaf).and_then(|l| l.cancel.take()) {
                        token.cancel();
                    }
                    self.set_state(leaf, NodeState::Configured);
                    self.set_message(leaf, NodeMessage::canceled());
                    self.disable_for_execution(leaf);
                }
                NodeState::PreExecute | NodeState::Executing | NodeState::PostExecute => {
                    // the worker finishes the transition
                    if let Some(token) = self.root.leaf(leaf).and_then(|l| l.cancel.as_ref()) {
                        token.cancel();
                    }
                }
                _ => {}
            }
        }
        self.abandon_loops_touching(&leaves);
        Ok(())
    }

    pub fn cancel_all(&mut self) {
        let root = self.root.id.clone();
        let _ = self.cancel_execution(&root);
    }

    /// Nothing marked, queued or running anywhere in the tree.
    pub fn is_halted(&self) -> bool {
        !self.in_progress(&self.root.id)
    }
}
