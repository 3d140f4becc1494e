use super::engine::Core;
use crate::connection::{ConnectionContainer, ConnectionKind};
use crate::container::{LeafContainer, NodeContainer};
use crate::graph::Workflow;
use flowcore::{
    LoopRole, NodeId, NodeSettings, PortDefinition, WorkflowChange, WorkflowError,
};
use std::collections::BTreeSet;

/// New boundary ports for a nested workflow.
///
/// `in_mapping[old] = Some(new)` moves the connections of old input port
/// `old` to new port `new`; `None` drops them. Both mappings must have one
/// entry per current port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortReconfiguration {
    pub in_ports: Vec<PortDefinition>,
    pub out_ports: Vec<PortDefinition>,
    pub in_mapping: Vec<Option<usize>>,
    pub out_mapping: Vec<Option<usize>>,
}

impl PortReconfiguration {
    pub fn new(in_ports: Vec<PortDefinition>, out_ports: Vec<PortDefinition>) -> Self {
        Self {
            in_ports,
            out_ports,
            ..Default::default()
        }
    }

    pub fn with_in_mapping(mut self, mapping: Vec<Option<usize>>) -> Self {
        self.in_mapping = mapping;
        self
    }

    pub fn with_out_mapping(mut self, mapping: Vec<Option<usize>>) -> Self {
        self.out_mapping = mapping;
        self
    }
}

impl Core {
    pub fn graph_for(&self, id: &NodeId) -> Result<&Workflow, WorkflowError> {
        match self.root.graph(id) {
            Some(graph) => Ok(graph),
            None if self.root.container(id).is_some() => Err(WorkflowError::NotAWorkflow(id.clone())),
            None => Err(WorkflowError::NodeNotFound(id.clone())),
        }
    }

    fn graph_for_mut(&mut self, id: &NodeId) -> Result<&mut Workflow, WorkflowError> {
        self.graph_for(id)?;
        self.root
            .graph_mut(id)
            .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))
    }

    pub fn add_leaf(
        &mut self,
        parent: &NodeId,
        node_type: &str,
        name: Option<String>,
        settings: NodeSettings,
    ) -> Result<NodeId, WorkflowError> {
        self.graph_for(parent)?;
        let body = self.registry.create_node(node_type, &settings)?;
        let leaf = LeafContainer::new(node_type.to_string(), body, settings);
        let name = name.unwrap_or_else(|| node_type.to_string());

        let graph = self.graph_for_mut(parent)?;
        let id = graph.allocate_id();
        graph
            .nodes
            .insert(id.index(), NodeContainer::leaf(id.clone(), name, leaf));
        tracing::info!("Added node {} ({})", id, node_type);
        self.emit_change(WorkflowChange::NodeAdded { node_id: id.clone() });
        self.configure_leaf(&id);
        Ok(id)
    }

    pub fn add_workflow(
        &mut self,
        parent: &NodeId,
        name: &str,
        in_ports: Vec<PortDefinition>,
        out_ports: Vec<PortDefinition>,
    ) -> Result<NodeId, WorkflowError> {
        let graph = self.graph_for_mut(parent)?;
        let id = graph.allocate_id();
        let inner = Workflow::new(id.clone(), name, in_ports, out_ports);
        graph
            .nodes
            .insert(id.index(), NodeContainer::nested(id.clone(), name.to_string(), inner));
        tracing::info!("Added workflow {} ({})", id, name);
        self.emit_change(WorkflowChange::NodeAdded { node_id: id.clone() });
        Ok(id)
    }

    fn plan_removal(&self, id: &NodeId) -> Result<BTreeSet<NodeId>, WorkflowError> {
        if *id == self.root.id {
            return Err(WorkflowError::InvalidNode("the root workflow can not be removed".into()));
        }
        if self.root.container(id).is_none() {
            return Err(WorkflowError::NodeNotFound(id.clone()));
        }
        if self.in_progress(id) {
            return Err(WorkflowError::ExecutionInProgress(id.clone()));
        }
        let own: BTreeSet<NodeId> = self.root.leaves_under(id).into_iter().collect();
        let mut seeds = vec![id.clone()];
        seeds.extend(self.root.downstream(id, None).into_iter().map(|d| d.leaf));
        let mut region = self.reset_region(&seeds)?;
        region.retain(|n| !own.contains(n));
        Ok(region)
    }

    pub fn can_remove_node(&self, id: &NodeId) -> bool {
        self.plan_removal(id).is_ok()
    }

    pub fn remove_node(&mut self, id: &NodeId) -> Result<(), WorkflowError> {
        let region = self.plan_removal(id)?;
        let parent = id
            .parent()
            .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))?;
        self.apply_reset(&region);

        let graph = self.graph_for_mut(&parent)?;
        let (dropped, kept): (Vec<_>, Vec<_>) =
            graph.connections.drain(..).partition(|c| c.touches(id));
        graph.connections = kept;
        graph.nodes.remove(&id.index());
        for conn in dropped {
            self.emit_change(connection_removed(&conn));
        }
        tracing::info!("Removed node {}", id);
        self.emit_change(WorkflowChange::NodeRemoved { node_id: id.clone() });
        self.configure_nodes(region);
        Ok(())
    }

    fn is_loop_feedback(&self, source: &NodeId, dest: &NodeId, dest_port: usize) -> bool {
        let Some(end) = self.root.leaf(source) else {
            return false;
        };
        let Some(start) = self.root.leaf(dest) else {
            return false;
        };
        end.role == LoopRole::End
            && end.loop_start.as_ref() == Some(dest)
            && start.role == LoopRole::Start
            && start.in_ports.get(dest_port).map_or(false, |p| !p.required)
    }

    fn plan_connection(
        &self,
        source: &NodeId,
        source_port: usize,
        dest: &NodeId,
        dest_port: usize,
    ) -> Result<(ConnectionContainer, BTreeSet<NodeId>), WorkflowError> {
        let kind = ConnectionContainer::classify(source, dest).ok_or_else(|| {
            WorkflowError::InvalidConnection(format!(
                "{} and {} are not in the same workflow",
                source, dest
            ))
        })?;
        let owner = match kind {
            ConnectionKind::Std => source
                .parent()
                .ok_or_else(|| WorkflowError::InvalidConnection("root has no outputs".into()))?,
            ConnectionKind::WorkflowIn | ConnectionKind::WorkflowThrough => source.clone(),
            ConnectionKind::WorkflowOut => dest.clone(),
        };
        let graph = self.graph_for(&owner)?;

        let source_ports = if *source == owner {
            graph.in_ports.len()
        } else {
            self.root
                .container(source)
                .ok_or_else(|| WorkflowError::NodeNotFound(source.clone()))?
                .out_port_count()
        };
        let dest_ports = if *dest == owner {
            graph.out_ports.len()
        } else {
            self.root
                .container(dest)
                .ok_or_else(|| WorkflowError::NodeNotFound(dest.clone()))?
                .in_port_count()
        };
        if source_port >= source_ports {
            return Err(WorkflowError::InvalidPort {
                node: source.clone(),
                port: source_port,
            });
        }
        if dest_port >= dest_ports {
            return Err(WorkflowError::InvalidPort {
                node: dest.clone(),
                port: dest_port,
            });
        }
        if graph.incoming(dest, dest_port).is_some() {
            return Err(WorkflowError::PortOccupied {
                node: dest.clone(),
                port: dest_port,
            });
        }
        if *source != owner && self.in_progress(source) {
            return Err(WorkflowError::ExecutionInProgress(source.clone()));
        }

        let mut feedback = false;
        if kind == ConnectionKind::Std && self.root.would_create_cycle(&owner, source, dest) {
            if self.is_loop_feedback(source, dest, dest_port) {
                feedback = true;
            } else {
                return Err(WorkflowError::CyclicConnection {
                    source_node: source.clone(),
                    dest: dest.clone(),
                });
            }
        }

        let consumers: Vec<NodeId> = self
            .root
            .consumers_of(&owner, dest, dest_port)
            .into_iter()
            .map(|d| d.leaf)
            .collect();
        let region = self.reset_region(&consumers)?;
        let conn = ConnectionContainer {
            source: source.clone(),
            source_port,
            dest: dest.clone(),
            dest_port,
            kind,
            feedback,
        };
        Ok((conn, region))
    }

    pub fn can_add_connection(
        &self,
        source: &NodeId,
        source_port: usize,
        dest: &NodeId,
        dest_port: usize,
    ) -> bool {
        self.plan_connection(source, source_port, dest, dest_port).is_ok()
    }

    pub fn add_connection(
        &mut self,
        source: &NodeId,
        source_port: usize,
        dest: &NodeId,
        dest_port: usize,
    ) -> Result<ConnectionContainer, WorkflowError> {
        let (conn, region) = self.plan_connection(source, source_port, dest, dest_port)?;
        let owner = conn
            .owner()
            .ok_or_else(|| WorkflowError::InvalidConnection(conn.to_string()))?;
        self.apply_reset(&region);
        self.graph_for_mut(&owner)?.connections.push(conn.clone());
        tracing::info!("Connected {}{}", conn, if conn.feedback { " (loop feedback)" } else { "" });
        self.emit_change(WorkflowChange::ConnectionAdded {
            source: conn.source.clone(),
            source_port,
            dest: conn.dest.clone(),
            dest_port,
        });
        self.configure_nodes(region);
        Ok(conn)
    }

    fn plan_disconnect(
        &self,
        conn: &ConnectionContainer,
    ) -> Result<(NodeId, usize, BTreeSet<NodeId>), WorkflowError> {
        let owner = conn
            .owner()
            .ok_or_else(|| WorkflowError::InvalidConnection(conn.to_string()))?;
        let graph = self.graph_for(&owner)?;
        let index = graph
            .connections
            .iter()
            .position(|c| {
                c.source == conn.source
                    && c.source_port == conn.source_port
                    && c.dest == conn.dest
                    && c.dest_port == conn.dest_port
            })
            .ok_or_else(|| WorkflowError::InvalidConnection(format!("no connection {}", conn)))?;
        if conn.source != owner && self.in_progress(&conn.source) {
            return Err(WorkflowError::ExecutionInProgress(conn.source.clone()));
        }
        let consumers: Vec<NodeId> = self
            .root
            .consumers_of(&owner, &conn.dest, conn.dest_port)
            .into_iter()
            .map(|d| d.leaf)
            .collect();
        let region = self.reset_region(&consumers)?;
        Ok((owner, index, region))
    }

    pub fn can_remove_connection(&self, conn: &ConnectionContainer) -> bool {
        self.plan_disconnect(conn).is_ok()
    }

    /// Remove a connection. Its former destinations are reset and
    /// configured again; the source is left as it is.
    pub fn remove_connection(&mut self, conn: &ConnectionContainer) -> Result<(), WorkflowError> {
        let (owner, index, region) = self.plan_disconnect(conn)?;
        self.apply_reset(&region);
        let removed = self.graph_for_mut(&owner)?.connections.remove(index);
        tracing::info!("Disconnected {}", removed);
        self.emit_change(connection_removed(&removed));
        self.configure_nodes(region);
        Ok(())
    }

    /// Replace the boundary ports of a nested workflow, carrying
    /// connections over as `rc` says. Nothing changes if the mapping is
    /// invalid or part of the affected region is executing.
    pub fn reconfigure_ports(
        &mut self,
        id: &NodeId,
        rc: PortReconfiguration,
    ) -> Result<(), WorkflowError> {
        if *id == self.root.id {
            return Err(WorkflowError::InvalidPortMapping(
                "the root workflow has no ports".into(),
            ));
        }
        let wf = self.graph_for(id)?;
        validate_mapping(&rc.in_mapping, wf.in_ports.len(), rc.in_ports.len(), "input")?;
        validate_mapping(&rc.out_mapping, wf.out_ports.len(), rc.out_ports.len(), "output")?;
        let parent = id
            .parent()
            .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))?;

        let mut seeds = vec![id.clone()];
        seeds.extend(self.root.downstream(id, None).into_iter().map(|d| d.leaf));
        let region = self.reset_region(&seeds)?;

        let (inner_kept, inner_dropped): (Vec<_>, Vec<_>) = wf
            .connections
            .iter()
            .map(|c| (c, remap_inner(c, &rc)))
            .partition(|(_, remapped)| remapped.is_some());
        let outer = &self.graph_for(&parent)?.connections;
        let (outer_kept, outer_dropped): (Vec<_>, Vec<_>) = outer
            .iter()
            .map(|c| (c, remap_outer(c, id, &rc)))
            .partition(|(_, remapped)| remapped.is_some());

        let inner_kept: Vec<ConnectionContainer> =
            inner_kept.into_iter().filter_map(|(_, c)| c).collect();
        let outer_kept: Vec<ConnectionContainer> =
            outer_kept.into_iter().filter_map(|(_, c)| c).collect();
        let dropped: Vec<ConnectionContainer> = inner_dropped
            .into_iter()
            .chain(outer_dropped)
            .map(|(c, _)| c.clone())
            .collect();

        self.apply_reset(&region);
        {
            let wf = self.graph_for_mut(id)?;
            wf.in_ports = rc.in_ports;
            wf.out_ports = rc.out_ports;
            wf.connections = inner_kept;
        }
        self.graph_for_mut(&parent)?.connections = outer_kept;
        for conn in &dropped {
            self.emit_change(connection_removed(conn));
        }
        tracing::info!("Reconfigured ports of {}, dropped {} connections", id, dropped.len());
        self.emit_change(WorkflowChange::PortsChanged { node_id: id.clone() });
        self.configure_nodes(region);
        Ok(())
    }

    /// Replace a leaf's settings, resetting it and its successors.
    pub fn load_node_settings(
        &mut self,
        id: &NodeId,
        settings: NodeSettings,
    ) -> Result<(), WorkflowError> {
        let leaf = match self.root.container(id) {
            None => return Err(WorkflowError::NodeNotFound(id.clone())),
            Some(c) => c.as_leaf().ok_or_else(|| {
                WorkflowError::InvalidNode(format!("{} is a workflow and has no settings", id))
            })?,
        };
        leaf.body.validate_settings(&settings).map_err(|e| {
            WorkflowError::InvalidNode(format!("Invalid settings for {}: {}", id, e))
        })?;
        let region = self.reset_region(std::slice::from_ref(id))?;
        self.apply_reset(&region);
        if let Some(leaf) = self.root.leaf_mut(id) {
            leaf.settings = settings;
        }
        self.configure_nodes(region);
        Ok(())
    }
}

fn connection_removed(conn: &ConnectionContainer) -> WorkflowChange {
    WorkflowChange::ConnectionRemoved {
        source: conn.source.clone(),
        source_port: conn.source_port,
        dest: conn.dest.clone(),
        dest_port: conn.dest_port,
    }
}

fn validate_mapping(
    mapping: &[Option<usize>],
    current: usize,
    new: usize,
    side: &str,
) -> Result<(), WorkflowError> {
    if mapping.len() != current {
        return Err(WorkflowError::InvalidPortMapping(format!(
            "{} mapping has {} entries for {} ports",
            side,
            mapping.len(),
            current
        )));
    }
    let mut used = BTreeSet::new();
    for target in mapping.iter().flatten() {
        if *target >= new {
            return Err(WorkflowError::InvalidPortMapping(format!(
                "{} port {} does not exist",
                side, target
            )));
        }
        if !used.insert(*target) {
            return Err(WorkflowError::InvalidPortMapping(format!(
                "{} port {} is mapped twice",
                side, target
            )));
        }
    }
    Ok(())
}

fn remap(port: usize, mapping: &[Option<usize>]) -> Option<usize> {
    mapping.get(port).copied().flatten()
}

/// Connection inside the reconfigured workflow, with boundary ports moved.
fn remap_inner(conn: &ConnectionContainer, rc: &PortReconfiguration) -> Option<ConnectionContainer> {
    let mut conn = conn.clone();
    match conn.kind {
        ConnectionKind::Std => {}
        ConnectionKind::WorkflowIn => conn.source_port = remap(conn.source_port, &rc.in_mapping)?,
        ConnectionKind::WorkflowOut => conn.dest_port = remap(conn.dest_port, &rc.out_mapping)?,
        ConnectionKind::WorkflowThrough => {
            conn.source_port = remap(conn.source_port, &rc.in_mapping)?;
            conn.dest_port = remap(conn.dest_port, &rc.out_mapping)?;
        }
    }
    Some(conn)
}

/// Connection in the parent workflow, with ends on `id` moved.
fn remap_outer(
    conn: &ConnectionContainer,
    id: &NodeId,
    rc: &PortReconfiguration,
) -> Option<ConnectionContainer> {
    let mut conn = conn.clone();
    if conn.dest == *id {
        conn.dest_port = remap(conn.dest_port, &rc.in_mapping)?;
    }
    if conn.source == *id {
        conn.source_port = remap(conn.source_port, &rc.out_mapping)?;
    }
    Some(conn)
}
