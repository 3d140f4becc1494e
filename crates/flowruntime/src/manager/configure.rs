use super::engine::Core;
use flowcore::{LoopRole, NodeError, NodeId, NodeMessage, NodeState, PortSpec, WorkflowError};
use std::collections::BTreeSet;

impl Core {
    /// Configure `ids` producers first.
    pub fn configure_nodes<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = NodeId>,
    {
        for id in self.root.topo_order(ids) {
            self.configure_leaf(&id);
        }
    }

    /// Recompute output specs of a leaf from its inputs. Only nodes that
    /// are idle, configured or merely marked are touched.
    pub fn configure_leaf(&mut self, id: &NodeId) {
        let Some(leaf) = self.root.leaf(id) else {
            return;
        };
        let state = leaf.state;
        if !matches!(
            state,
            NodeState::Idle
                | NodeState::Configured
                | NodeState::UnconfiguredMarkedForExec
                | NodeState::ConfiguredMarkedForExec
        ) {
            return;
        }
        let role = leaf.role;
        let body = leaf.body.clone();
        let settings = leaf.settings.clone();
        let in_ports = leaf.in_ports.clone();
        let out_count = leaf.out_ports.len();
        let had_config_message = leaf.config_message;

        let mut specs: Vec<Option<PortSpec>> = Vec::with_capacity(in_ports.len());
        let mut scopes: Vec<Vec<NodeId>> = Vec::new();
        let mut missing = None;
        for (port, def) in in_ports.iter().enumerate() {
            let mut spec = None;
            if let Some(up) = self.root.upstream(id, port).filter(|u| !u.feedback) {
                if let Some(pred) = self.root.leaf(&up.leaf) {
                    scopes.push(pred.scope_stack.clone());
                    // a loop end mid-loop has nothing to offer yet
                    let hidden = pred.role == LoopRole::End && pred.state.is_execution_in_progress();
                    if !hidden {
                        spec = pred.out_specs.as_ref().and_then(|s| s.get(up.port).cloned());
                    }
                }
            }
            if spec.is_none() && def.required && missing.is_none() {
                missing = Some(def.name.clone());
            }
            specs.push(spec);
        }

        let outcome = match missing {
            Some(port) => {
                tracing::debug!("Node {} waits for input '{}'", id, port);
                Ok(None)
            }
            None => resolve_scope(id, role, &scopes).and_then(|(stack, loop_start)| {
                let out = body.configure(&specs, &settings)?;
                if out.len() != out_count {
                    return Err(NodeError::Configuration(format!(
                        "configure returned {} specs for {} output ports",
                        out.len(),
                        out_count
                    )));
                }
                Ok(Some((out, stack, loop_start)))
            }),
        };

        let next = match outcome {
            Ok(Some((out, stack, loop_start))) => {
                if let Some(leaf) = self.root.leaf_mut(id) {
                    leaf.out_specs = Some(out);
                    leaf.scope_stack = stack;
                    leaf.loop_start = loop_start;
                    leaf.config_message = false;
                }
                if had_config_message {
                    self.set_message(id, NodeMessage::none());
                }
                match state {
                    NodeState::Idle => NodeState::Configured,
                    NodeState::UnconfiguredMarkedForExec => NodeState::ConfiguredMarkedForExec,
                    other => other,
                }
            }
            Ok(None) => {
                self.clear_specs(id, false);
                if had_config_message {
                    self.set_message(id, NodeMessage::none());
                }
                unconfigured(state)
            }
            Err(e) => {
                tracing::warn!("Configure of {} failed: {}", id, e);
                self.clear_specs(id, true);
                self.set_message(id, NodeMessage::error(e.to_string()));
                unconfigured(state)
            }
        };
        self.set_state(id, next);
    }

    fn clear_specs(&mut self, id: &NodeId, config_message: bool) {
        if let Some(leaf) = self.root.leaf_mut(id) {
            leaf.out_specs = None;
            leaf.scope_stack.clear();
            leaf.loop_start = None;
            leaf.config_message = config_message;
        }
    }

    /// Drop the results of a leaf and bring an executed one back to
    /// CONFIGURED. Nodes in progress are left alone.
    pub fn reset_leaf(&mut self, id: &NodeId) {
        let Some(state) = self.leaf_state(id) else {
            return;
        };
        if state.is_execution_in_progress() {
            tracing::warn!("Not resetting {} while {}", id, state);
            return;
        }
        if state.is_executed() {
            self.set_state(id, NodeState::Configured);
        }
        if let Some(leaf) = self.root.leaf_mut(id) {
            leaf.clear_execution_results(false);
            leaf.waiting_loops.clear();
            leaf.config_message = false;
        }
        self.set_message(id, NodeMessage::none());
    }

    /// Leaves to reset when `seeds` change: the seeds, the loops they are
    /// part of, and everything downstream. Fails without touching anything
    /// when part of that region is busy.
    pub fn reset_region(&self, seeds: &[NodeId]) -> Result<BTreeSet<NodeId>, WorkflowError> {
        let mut roots = BTreeSet::new();
        for seed in seeds {
            roots.extend(self.root.leaves_under(seed));
        }
        let roots = self.expand_loop_roots(roots);
        let root_list: Vec<NodeId> = roots.iter().cloned().collect();
        let mut region = roots;
        region.extend(self.root.downstream_closure(&root_list));
        if let Some(busy) = region.iter().find(|id| {
            self.leaf_state(id)
                .map_or(false, |s| s.is_execution_in_progress())
        }) {
            return Err(WorkflowError::ExecutionInProgress(busy.clone()));
        }
        Ok(region)
    }

    pub fn apply_reset(&mut self, region: &BTreeSet<NodeId>) {
        for id in region {
            self.reset_leaf(id);
        }
    }

    fn check_resetable(&self, id: &NodeId) -> Result<BTreeSet<NodeId>, WorkflowError> {
        let container = self
            .root
            .container(id)
            .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))?;
        if self.in_progress(id) {
            return Err(WorkflowError::ExecutionInProgress(id.clone()));
        }
        let resetable = |state: NodeState| {
            matches!(state, NodeState::Configured | NodeState::Executed)
        };
        let ok = match container.as_leaf() {
            Some(leaf) => resetable(leaf.state),
            None => self
                .root
                .leaves_under(id)
                .iter()
                .any(|l| self.leaf_state(l).map_or(false, resetable)),
        };
        if !ok {
            return Err(WorkflowError::NotResetable(id.clone()));
        }
        self.reset_region(std::slice::from_ref(id))
    }

    pub fn can_reset(&self, id: &NodeId) -> bool {
        self.check_resetable(id).is_ok()
    }

    /// Reset `id`, its loop and its successors, then configure them again.
    /// On a CONFIGURED node without results this changes nothing.
    pub fn reset_and_configure(&mut self, id: &NodeId) -> Result<(), WorkflowError> {
        let region = self.check_resetable(id)?;
        tracing::debug!("Resetting {} and {} dependent nodes", id, region.len().saturating_sub(1));
        self.apply_reset(&region);
        self.configure_nodes(region);
        Ok(())
    }

    pub fn reset_all(&mut self) -> Result<(), WorkflowError> {
        let root = self.root.id.clone();
        if self.in_progress(&root) {
            return Err(WorkflowError::ExecutionInProgress(root));
        }
        let region: BTreeSet<NodeId> = self.root.leaves().into_iter().collect();
        self.apply_reset(&region);
        self.configure_nodes(region);
        Ok(())
    }
}

fn unconfigured(state: NodeState) -> NodeState {
    match state {
        NodeState::Configured => NodeState::Idle,
        NodeState::ConfiguredMarkedForExec => NodeState::UnconfiguredMarkedForExec,
        other => other,
    }
}

/// Merge the loop scopes arriving on the inputs and apply the node's own
/// loop role. Scopes must agree up to nesting depth.
fn resolve_scope(
    id: &NodeId,
    role: LoopRole,
    scopes: &[Vec<NodeId>],
) -> Result<(Vec<NodeId>, Option<NodeId>), NodeError> {
    let mut merged: Vec<NodeId> = Vec::new();
    for stack in scopes {
        let consistent = if stack.len() > merged.len() {
            stack.starts_with(&merged)
        } else {
            merged.starts_with(stack)
        };
        if !consistent {
            return Err(NodeError::Configuration(
                "Inputs come from different loops".to_string(),
            ));
        }
        if stack.len() > merged.len() {
            merged = stack.clone();
        }
    }
    match role {
        LoopRole::Start => {
            merged.push(id.clone());
            Ok((merged, None))
        }
        LoopRole::End => {
            let start = merged.pop().ok_or_else(|| {
                NodeError::Configuration(
                    "Encountered loop end without corresponding loop start".to_string(),
                )
            })?;
            if start.parent() != id.parent() {
                return Err(NodeError::Configuration(
                    "Loops are not permitted to leave workflows".to_string(),
                ));
            }
            Ok((merged, Some(start)))
        }
        LoopRole::None => Ok((merged, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_merge_by_prefix() {
        let root = NodeId::root();
        let outer = root.child(1);
        let inner = root.child(2);
        let node = root.child(3);

        let (stack, start) = resolve_scope(
            &node,
            LoopRole::None,
            &[vec![], vec![outer.clone()], vec![outer.clone(), inner.clone()]],
        )
        .unwrap();
        assert_eq!(stack, vec![outer.clone(), inner.clone()]);
        assert_eq!(start, None);

        let conflict = resolve_scope(&node, LoopRole::None, &[vec![outer], vec![inner]]);
        assert!(conflict.is_err());
    }

    #[test]
    fn loop_end_pops_its_start() {
        let root = NodeId::root();
        let start = root.child(1);
        let end = root.child(4);

        let (stack, found) =
            resolve_scope(&end, LoopRole::End, &[vec![start.clone()]]).unwrap();
        assert!(stack.is_empty());
        assert_eq!(found, Some(start));

        let err = resolve_scope(&end, LoopRole::End, &[vec![]]).unwrap_err();
        assert!(err.to_string().contains("without corresponding loop start"));
    }

    #[test]
    fn loop_may_not_cross_workflow_boundary() {
        let root = NodeId::root();
        let start = root.child(1);
        let end = root.child(2).child(1);
        assert!(resolve_scope(&end, LoopRole::End, &[vec![start]]).is_err());
    }

    #[test]
    fn configure_failure_keeps_marked_flag() {
        assert_eq!(unconfigured(NodeState::Configured), NodeState::Idle);
        assert_eq!(
            unconfigured(NodeState::ConfiguredMarkedForExec),
            NodeState::UnconfiguredMarkedForExec
        );
        assert_eq!(unconfigured(NodeState::Idle), NodeState::Idle);
    }
}
