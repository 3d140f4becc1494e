use super::engine::Core;
use flowcore::{LoopRole, NodeError, NodeId, NodeMessage, NodeState};
use std::collections::{BTreeSet, VecDeque};

impl Core {
    pub fn find_loop_end(&self, start: &NodeId) -> Option<NodeId> {
        self.root.leaves().into_iter().find(|id| {
            self.root
                .leaf(id)
                .map_or(false, |l| l.role == LoopRole::End && l.loop_start.as_ref() == Some(start))
        })
    }

    /// Every bound (loop start, loop end) pair in the tree.
    pub fn loop_pairs(&self) -> Vec<(NodeId, NodeId)> {
        self.root
            .leaves()
            .into_iter()
            .filter_map(|id| {
                let leaf = self.root.leaf(&id)?;
                if leaf.role != LoopRole::End {
                    return None;
                }
                leaf.loop_start.clone().map(|start| (start, id))
            })
            .collect()
    }

    /// Nodes re-executed on every pass: reachable from `start` without
    /// crossing `end`, minus whatever hangs off `end` itself.
    pub fn loop_region(&self, start: &NodeId, end: Option<&NodeId>) -> BTreeSet<NodeId> {
        match end {
            Some(end) => {
                let mut body = self.root.reachable_until(start, end);
                body.remove(end);
                let beyond = self.root.downstream_closure(std::slice::from_ref(end));
                body.retain(|n| !beyond.contains(n));
                body
            }
            None => self.root.downstream_closure(std::slice::from_ref(start)),
        }
    }

    fn loop_body(&self, start: &NodeId, end: &NodeId) -> Result<Vec<NodeId>, NodeError> {
        let body = self.loop_region(start, Some(end));
        let scope = start.parent();
        let escapes = end.parent() != scope
            || body
                .iter()
                .any(|n| !scope.as_ref().map_or(false, |s| s.is_ancestor_of(n)));
        if escapes {
            return Err(NodeError::Configuration(
                "Loops are not permitted to leave workflows".to_string(),
            ));
        }
        Ok(body.into_iter().collect())
    }

    fn upstream_closure(&self, id: &NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(current) = queue.pop_front() {
            let ports = self.root.leaf(&current).map_or(0, |l| l.in_ports.len());
            for port in 0..ports {
                if let Some(up) = self.root.upstream(&current, port) {
                    if !up.feedback && seen.insert(up.leaf.clone()) {
                        queue.push_back(up.leaf);
                    }
                }
            }
        }
        seen
    }

    /// Start, end and the nodes on paths between them.
    pub fn loop_members(&self, start: &NodeId, end: &NodeId) -> BTreeSet<NodeId> {
        let feeding_end = self.upstream_closure(end);
        let mut members: BTreeSet<NodeId> = self
            .loop_region(start, Some(end))
            .into_iter()
            .filter(|n| feeding_end.contains(n))
            .collect();
        members.insert(start.clone());
        members.insert(end.clone());
        members
    }

    /// Add the loop start of every loop that `roots` reaches into.
    pub fn expand_loop_roots(&self, mut roots: BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        let loops: Vec<(NodeId, BTreeSet<NodeId>)> = self
            .loop_pairs()
            .into_iter()
            .map(|(start, end)| {
                let members = self.loop_members(&start, &end);
                (start, members)
            })
            .collect();
        loop {
            let mut changed = false;
            for (start, members) in &loops {
                if !roots.contains(start) && members.iter().any(|m| roots.contains(m)) {
                    roots.insert(start.clone());
                    changed = true;
                }
            }
            if !changed {
                return roots;
            }
        }
    }

    fn register_waiting(&mut self, node: &NodeId, start: &NodeId) {
        if let Some(leaf) = self.root.leaf_mut(node) {
            if !leaf.waiting_loops.contains(start) {
                leaf.waiting_loops.push(start.clone());
            }
        }
    }

    /// Run the next pass of the loop headed by `start`. If part of the body
    /// is still busy the restart is parked on that node and retried once it
    /// finishes.
    pub fn restart_loop(&mut self, start: &NodeId) {
        let Some(end) = self
            .root
            .leaf(start)
            .and_then(|l| l.loop_context.as_ref())
            .and_then(|c| c.tail.clone())
        else {
            tracing::warn!("Loop start {} has no pending restart", start);
            return;
        };
        let body = match self.loop_body(start, &end) {
            Ok(body) => body,
            Err(e) => {
                self.fail_loop(start, &end, &e);
                return;
            }
        };

        for node in &body {
            let Some(state) = self.leaf_state(node) else {
                continue;
            };
            if state.is_execution_in_progress() {
                tracing::debug!("Loop {} waits for {}", start, node);
                self.register_waiting(node, start);
                return;
            }
            if self.can_execute(node) {
                // a branch that never ran: let it catch up first
                self.mark_node_and_predecessors(node);
                self.register_waiting(node, start);
                return;
            }
        }

        for node in &body {
            self.reset_leaf(node);
        }
        // the start keeps its loop context and internals across passes
        if self.leaf_state(start) == Some(NodeState::Executed) {
            self.set_state(start, NodeState::Configured);
        }
        if let Some(leaf) = self.root.leaf_mut(start) {
            leaf.out_data = None;
        }
        let mut to_configure = body.clone();
        to_configure.push(end.clone());
        self.configure_nodes(to_configure);
        if self.leaf_state(&end) != Some(NodeState::ConfiguredMarkedForExec) {
            let error =
                NodeError::Configuration("Loop end can not be configured for the next pass".into());
            self.fail_loop(start, &end, &error);
            return;
        }

        let (generation, iteration) = self
            .root
            .leaf_mut(start)
            .and_then(|l| l.loop_context.as_mut())
            .map(|ctx| {
                ctx.iteration += 1;
                (ctx.generation, ctx.iteration)
            })
            .unwrap_or_default();
        tracing::debug!("Loop {} run {} starting iteration {}", start, generation, iteration);

        self.set_state(start, NodeState::ConfiguredMarkedForExec);
        for node in self.root.topo_order(body) {
            self.mark_node_and_predecessors(&node);
        }
        self.queue_if_queueable(start);
    }

    fn fail_loop(&mut self, start: &NodeId, end: &NodeId, error: &NodeError) {
        tracing::error!("Loop {} failed: {}", start, error);
        self.set_message(end, NodeMessage::error(error.to_string()));
        self.abandon_loop(start);
    }

    /// Discard the active loop context of `start` and bring the loop back
    /// to CONFIGURED. Messages already recorded on members are kept.
    pub fn abandon_loop(&mut self, start: &NodeId) {
        let Some(ctx) = self.root.leaf_mut(start).and_then(|l| l.loop_context.take()) else {
            return;
        };
        tracing::info!(
            "Abandoning loop {} run {} at iteration {}",
            start,
            ctx.generation,
            ctx.iteration
        );
        let end = ctx.tail.or_else(|| self.find_loop_end(start));
        let mut members = self.loop_region(start, end.as_ref());
        members.insert(start.clone());
        if let Some(end) = &end {
            members.insert(end.clone());
        }

        for member in &members {
            let Some(state) = self.leaf_state(member) else {
                continue;
            };
            match state {
                NodeState::ConfiguredMarkedForExec => {
                    self.set_state(member, NodeState::Configured);
                }
                NodeState::UnconfiguredMarkedForExec => {
                    self.set_state(member, NodeState::Idle);
                }
                NodeState::ConfiguredQueued => {
                    if let Some(token) = self.root.leaf_mut(member).and_then(|l| l.cancel.take()) {
                        token.cancel();
                    }
                    self.set_state(member, NodeState::Configured);
                }
                NodeState::PreExecute | NodeState::Executing | NodeState::PostExecute => {
                    if let Some(token) = self.root.leaf(member).and_then(|l| l.cancel.as_ref()) {
                        token.cancel();
                    }
                }
                NodeState::Executed => {
                    self.reset_leaf(member);
                    continue;
                }
                NodeState::Idle | NodeState::Configured => {}
            }
            if let Some(leaf) = self.root.leaf_mut(member) {
                leaf.clear_execution_results(false);
                leaf.waiting_loops.clear();
            }
        }

        if let Some(end) = end {
            self.disable_for_execution(&end);
            let successors = self.root.downstream_closure(std::slice::from_ref(&end));
            self.configure_nodes(successors);
        }
    }

    /// Abandon every active loop that has one of `ids` as a member.
    pub fn abandon_loops_touching(&mut self, ids: &[NodeId]) {
        let active: Vec<NodeId> = self
            .root
            .leaves()
            .into_iter()
            .filter(|id| self.root.leaf(id).map_or(false, |l| l.loop_context.is_some()))
            .collect();
        for start in active {
            let end = self
                .root
                .leaf(&start)
                .and_then(|l| l.loop_context.as_ref())
                .and_then(|c| c.tail.clone())
                .or_else(|| self.find_loop_end(&start));
            let mut members = self.loop_region(&start, end.as_ref());
            members.insert(start.clone());
            if let Some(end) = end {
                members.insert(end);
            }
            if ids.iter().any(|id| members.contains(id)) {
                self.abandon_loop(&start);
            }
        }
    }
}
