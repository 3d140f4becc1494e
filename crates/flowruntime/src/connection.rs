use flowcore::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a connection sits relative to the workflow that owns it.
///
/// Inside a nested workflow the workflow's own id stands for its boundary:
/// as a source it means "inner side of an input port", as a destination
/// "inner side of an output port".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Node to node inside one workflow
    Std,
    /// Workflow input port to an inner node
    WorkflowIn,
    /// Inner node to a workflow output port
    WorkflowOut,
    /// Workflow input port straight to a workflow output port
    WorkflowThrough,
}

/// Directed edge from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionContainer {
    pub source: NodeId,
    pub source_port: usize,
    pub dest: NodeId,
    pub dest_port: usize,
    pub kind: ConnectionKind,
    /// Loop end back into its loop start; ignored for scheduling and reset
    #[serde(default)]
    pub feedback: bool,
}

impl ConnectionContainer {
    /// Id of the workflow holding this connection
    pub fn owner(&self) -> Option<NodeId> {
        match self.kind {
            ConnectionKind::Std => self.source.parent(),
            ConnectionKind::WorkflowIn | ConnectionKind::WorkflowThrough => {
                Some(self.source.clone())
            }
            ConnectionKind::WorkflowOut => Some(self.dest.clone()),
        }
    }

    pub fn touches(&self, id: &NodeId) -> bool {
        &self.source == id || &self.dest == id
    }

    /// Classify an edge between two ids, or `None` if they can not be
    /// connected directly.
    pub(crate) fn classify(source: &NodeId, dest: &NodeId) -> Option<ConnectionKind> {
        if source == dest {
            // only a nested workflow may feed itself, port to port
            return Some(ConnectionKind::WorkflowThrough);
        }
        if source.parent().is_some() && source.parent() == dest.parent() {
            Some(ConnectionKind::Std)
        } else if source.is_parent_of(dest) {
            Some(ConnectionKind::WorkflowIn)
        } else if dest.is_parent_of(source) {
            Some(ConnectionKind::WorkflowOut)
        } else {
            None
        }
    }
}

impl fmt::Display for ConnectionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] -> {}[{}]",
            self.source, self.source_port, self.dest, self.dest_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_path() {
        let root = NodeId::root();
        let a = root.child(1);
        let meta = root.child(2);
        let inner = meta.child(1);

        assert_eq!(ConnectionContainer::classify(&a, &meta), Some(ConnectionKind::Std));
        assert_eq!(
            ConnectionContainer::classify(&meta, &inner),
            Some(ConnectionKind::WorkflowIn)
        );
        assert_eq!(
            ConnectionContainer::classify(&inner, &meta),
            Some(ConnectionKind::WorkflowOut)
        );
        assert_eq!(
            ConnectionContainer::classify(&meta, &meta),
            Some(ConnectionKind::WorkflowThrough)
        );
        assert_eq!(ConnectionContainer::classify(&a, &inner), None);
    }

    #[test]
    fn owner_is_the_enclosing_workflow() {
        let meta = NodeId::root().child(2);
        let inner = meta.child(1);
        let conn = ConnectionContainer {
            source: inner.clone(),
            source_port: 0,
            dest: meta.clone(),
            dest_port: 0,
            kind: ConnectionKind::WorkflowOut,
            feedback: false,
        };
        assert_eq!(conn.owner(), Some(meta));
    }
}
