use crate::connection::{ConnectionContainer, ConnectionKind};
use crate::container::{ContainerKind, LeafContainer, NodeContainer};
use flowcore::{NodeId, NodeState, PortDefinition};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// One level of the workflow tree: its nodes, the connections between
/// them and, for nested workflows, the boundary ports.
pub(crate) struct Workflow {
    pub id: NodeId,
    pub name: String,
    pub nodes: BTreeMap<u32, NodeContainer>,
    pub connections: Vec<ConnectionContainer>,
    /// Never decremented, so ids are not reused after removal
    pub next_index: u32,
    pub in_ports: Vec<PortDefinition>,
    pub out_ports: Vec<PortDefinition>,
}

/// Real producer of an input port, seen through any nesting
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Upstream {
    pub leaf: NodeId,
    pub port: usize,
    pub feedback: bool,
}

/// Real consumer of an output port, seen through any nesting
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Downstream {
    pub leaf: NodeId,
    pub port: usize,
    pub feedback: bool,
}

impl Workflow {
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        in_ports: Vec<PortDefinition>,
        out_ports: Vec<PortDefinition>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            nodes: BTreeMap::new(),
            connections: Vec::new(),
            next_index: 1,
            in_ports,
            out_ports,
        }
    }

    pub fn allocate_id(&mut self) -> NodeId {
        let index = self.next_index;
        self.next_index += 1;
        self.id.child(index)
    }

    /// Connection feeding `port` of `dest`, among this level's connections.
    pub fn incoming(&self, dest: &NodeId, port: usize) -> Option<&ConnectionContainer> {
        self.connections
            .iter()
            .find(|c| &c.dest == dest && c.dest_port == port)
    }

    // ----- navigation, `self` being the root of the tree -----

    pub fn container(&self, id: &NodeId) -> Option<&NodeContainer> {
        if self.id.is_parent_of(id) {
            return self.nodes.get(&id.index());
        }
        if !self.id.is_ancestor_of(id) {
            return None;
        }
        let next = id.path()[self.id.depth()];
        self.nodes.get(&next)?.as_workflow()?.container(id)
    }

    pub fn container_mut(&mut self, id: &NodeId) -> Option<&mut NodeContainer> {
        if self.id.is_parent_of(id) {
            return self.nodes.get_mut(&id.index());
        }
        if !self.id.is_ancestor_of(id) {
            return None;
        }
        let next = id.path()[self.id.depth()];
        self.nodes.get_mut(&next)?.as_workflow_mut()?.container_mut(id)
    }

    pub fn graph(&self, id: &NodeId) -> Option<&Workflow> {
        if *id == self.id {
            Some(self)
        } else {
            self.container(id)?.as_workflow()
        }
    }

    pub fn graph_mut(&mut self, id: &NodeId) -> Option<&mut Workflow> {
        if *id == self.id {
            Some(self)
        } else {
            self.container_mut(id)?.as_workflow_mut()
        }
    }

    pub fn leaf(&self, id: &NodeId) -> Option<&LeafContainer> {
        self.container(id)?.as_leaf()
    }

    pub fn leaf_mut(&mut self, id: &NodeId) -> Option<&mut LeafContainer> {
        self.container_mut(id)?.as_leaf_mut()
    }

    /// Every leaf below this level, depth first.
    pub fn leaves(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<NodeId>) {
        for container in self.nodes.values() {
            match &container.kind {
                ContainerKind::Leaf(_) => out.push(container.id.clone()),
                ContainerKind::Nested(inner) => inner.collect_leaves(out),
            }
        }
    }

    /// The leaf itself, or every leaf of a nested workflow.
    pub fn leaves_under(&self, id: &NodeId) -> Vec<NodeId> {
        match self.graph(id) {
            Some(wf) => wf.leaves(),
            None if self.leaf(id).is_some() => vec![id.clone()],
            None => Vec::new(),
        }
    }

    // ----- flattened topology -----

    /// Leaf producing the data on input `port` of `node`, where `node` is a
    /// leaf or a nested workflow seen from its parent.
    pub fn upstream(&self, node: &NodeId, port: usize) -> Option<Upstream> {
        let owner = self.graph(&node.parent()?)?;
        let conn = owner.incoming(node, port)?;
        let (leaf, port) = self.resolve_source(&owner.id, &conn.source, conn.source_port)?;
        Some(Upstream {
            leaf,
            port,
            feedback: conn.feedback,
        })
    }

    fn resolve_source(
        &self,
        owner: &NodeId,
        source: &NodeId,
        port: usize,
    ) -> Option<(NodeId, usize)> {
        if source == owner {
            // data enters `owner` through its input port
            return self.upstream(owner, port).map(|u| (u.leaf, u.port));
        }
        match &self.container(source)?.kind {
            ContainerKind::Leaf(_) => Some((source.clone(), port)),
            ContainerKind::Nested(inner) => {
                let conn = inner.incoming(&inner.id, port)?;
                self.resolve_source(&inner.id, &conn.source, conn.source_port)
            }
        }
    }

    /// Leaf feeding output `port` of the nested workflow `wf`, if any.
    pub fn output_producer(&self, wf: &Workflow, port: usize) -> Option<(NodeId, usize)> {
        let conn = wf.incoming(&wf.id, port)?;
        self.resolve_source(&wf.id, &conn.source, conn.source_port)
    }

    /// Leaves consuming `node`'s outputs (all ports when `port` is `None`).
    pub fn downstream(&self, node: &NodeId, port: Option<usize>) -> Vec<Downstream> {
        let mut out = Vec::new();
        self.collect_downstream(node, port, &mut out);
        out
    }

    fn collect_downstream(&self, node: &NodeId, port: Option<usize>, out: &mut Vec<Downstream>) {
        let Some(owner) = node.parent().and_then(|p| self.graph(&p)) else {
            return;
        };
        for conn in owner
            .connections
            .iter()
            .filter(|c| &c.source == node && port.map_or(true, |p| p == c.source_port))
        {
            self.resolve_dest(&owner.id, &conn.dest, conn.dest_port, conn.feedback, out);
        }
    }

    /// Leaves fed by an edge ending at `dest`/`port` inside `owner`.
    pub fn consumers_of(&self, owner: &NodeId, dest: &NodeId, port: usize) -> Vec<Downstream> {
        let mut out = Vec::new();
        self.resolve_dest(owner, dest, port, false, &mut out);
        out
    }

    fn resolve_dest(
        &self,
        owner: &NodeId,
        dest: &NodeId,
        port: usize,
        feedback: bool,
        out: &mut Vec<Downstream>,
    ) {
        if dest == owner {
            // leaving `owner` through its output port
            self.collect_downstream(owner, Some(port), out);
            return;
        }
        match self.container(dest).map(|c| &c.kind) {
            Some(ContainerKind::Leaf(_)) => out.push(Downstream {
                leaf: dest.clone(),
                port,
                feedback,
            }),
            Some(ContainerKind::Nested(inner)) => {
                for conn in inner
                    .connections
                    .iter()
                    .filter(|c| c.source == inner.id && c.source_port == port)
                {
                    self.resolve_dest(&inner.id, &conn.dest, conn.dest_port, false, out);
                }
            }
            None => {}
        }
    }

    /// Strict successors of `seeds` (leaves or nested workflows), following
    /// data edges but not loop feedback edges.
    pub fn downstream_closure(&self, seeds: &[NodeId]) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = seeds.iter().cloned().collect();
        while let Some(current) = queue.pop_front() {
            for d in self.downstream(&current, None) {
                if !d.feedback && seen.insert(d.leaf.clone()) {
                    queue.push_back(d.leaf);
                }
            }
        }
        seen
    }

    /// Leaves reachable from `start` without passing through `stop`.
    pub fn reachable_until(&self, start: &NodeId, stop: &NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.clone()]);
        while let Some(current) = queue.pop_front() {
            if &current == stop {
                continue;
            }
            for d in self.downstream(&current, None) {
                if !d.feedback && seen.insert(d.leaf.clone()) {
                    queue.push_back(d.leaf);
                }
            }
        }
        seen
    }

    /// Order `subset` so that producers come before consumers.
    pub fn topo_order<I>(&self, subset: I) -> Vec<NodeId>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let set: BTreeSet<NodeId> = subset.into_iter().collect();
        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
        for id in &set {
            index.insert(id.clone(), graph.add_node(id.clone()));
        }
        for id in &set {
            let ports = self.leaf(id).map(|l| l.in_ports.len()).unwrap_or(0);
            for port in 0..ports {
                if let Some(up) = self.upstream(id, port) {
                    if up.feedback {
                        continue;
                    }
                    if let (Some(from), Some(to)) = (index.get(&up.leaf), index.get(id)) {
                        graph.add_edge(*from, *to, ());
                    }
                }
            }
        }
        match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(|ix| graph[ix].clone()).collect(),
            Err(_) => {
                tracing::warn!("Cycle among data edges, falling back to id order");
                set.into_iter().collect()
            }
        }
    }

    /// Whether a new edge `source -> dest` between two children of `owner`
    /// would close a cycle at that level.
    pub fn would_create_cycle(&self, owner: &NodeId, source: &NodeId, dest: &NodeId) -> bool {
        if source == dest {
            return true;
        }
        let Some(wf) = self.graph(owner) else {
            return false;
        };
        let mut graph: DiGraph<u32, ()> = DiGraph::new();
        let mut index: HashMap<u32, NodeIndex> = HashMap::new();
        for key in wf.nodes.keys() {
            index.insert(*key, graph.add_node(*key));
        }
        for conn in wf
            .connections
            .iter()
            .filter(|c| c.kind == ConnectionKind::Std && !c.feedback)
        {
            if let (Some(from), Some(to)) = (
                index.get(&conn.source.index()),
                index.get(&conn.dest.index()),
            ) {
                graph.add_edge(*from, *to, ());
            }
        }
        match (index.get(&dest.index()), index.get(&source.index())) {
            (Some(from), Some(to)) => has_path_connecting(&graph, *from, *to, None),
            _ => false,
        }
    }

    /// Externally visible state of the nested workflow `wf`: the least
    /// advanced state among the producers of its output ports (all inner
    /// leaves when it has none). An unconnected output counts as IDLE.
    pub fn workflow_state(&self, wf: &Workflow) -> NodeState {
        let states: Vec<NodeState> = if wf.out_ports.is_empty() {
            wf.leaves()
                .iter()
                .filter_map(|id| self.leaf(id).map(|l| l.state))
                .collect()
        } else {
            (0..wf.out_ports.len())
                .map(|port| {
                    self.output_producer(wf, port)
                        .and_then(|(leaf, _)| self.leaf(&leaf))
                        .map(|l| l.state)
                        .unwrap_or(NodeState::Idle)
                })
                .collect()
        };
        states
            .into_iter()
            .min_by_key(|s| s.progress_rank())
            .unwrap_or(NodeState::Executed)
    }

    /// State of any container: leaf state or aggregate of a nested workflow.
    pub fn state_of(&self, id: &NodeId) -> Option<NodeState> {
        if let Some(wf) = self.graph(id) {
            return Some(self.workflow_state(wf));
        }
        self.leaf(id).map(|l| l.state)
    }

    pub fn in_progress_under(&self, id: &NodeId) -> bool {
        self.leaves_under(id).iter().any(|leaf| {
            self.leaf(leaf)
                .map(|l| l.state.is_execution_in_progress())
                .unwrap_or(false)
        })
    }
}
