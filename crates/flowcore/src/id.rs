use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Hierarchical identifier of a node container.
///
/// The path starts at the root workflow (`0`) and adds one index per nesting
/// level, so `0:5:2` is node 2 inside the workflow held by node 5 of the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Vec<u32>);

impl NodeId {
    pub fn root() -> Self {
        NodeId(vec![0])
    }

    pub fn from_path(path: Vec<u32>) -> Option<Self> {
        if path.is_empty() {
            None
        } else {
            Some(NodeId(path))
        }
    }

    pub fn child(&self, index: u32) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        NodeId(path)
    }

    /// Id of the workflow that contains this node; `None` for a root.
    pub fn parent(&self) -> Option<NodeId> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(NodeId(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Index within the parent workflow.
    pub fn index(&self) -> u32 {
        // never empty, see constructors
        self.0[self.0.len() - 1]
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn path(&self) -> &[u32] {
        &self.0
    }

    /// True if `other` lives somewhere below this id.
    pub fn is_ancestor_of(&self, other: &NodeId) -> bool {
        other.0.len() > self.0.len() && other.0.starts_with(&self.0)
    }

    pub fn is_parent_of(&self, other: &NodeId) -> bool {
        other.0.len() == self.0.len() + 1 && other.0.starts_with(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for index in &self.0 {
            if !first {
                f.write_str(":")?;
            }
            write!(f, "{}", index)?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseNodeIdError(String);

impl fmt::Display for ParseNodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node id '{}'", self.0)
    }
}

impl std::error::Error for ParseNodeIdError {}

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = s
            .split(':')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ParseNodeIdError(s.to_string()))?;
        NodeId::from_path(path).ok_or_else(|| ParseNodeIdError(s.to_string()))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_prefix_is_parent() {
        let root = NodeId::root();
        let meta = root.child(5);
        let inner = meta.child(2);

        assert_eq!(inner.to_string(), "0:5:2");
        assert_eq!(inner.parent(), Some(meta.clone()));
        assert_eq!(meta.parent(), Some(root.clone()));
        assert_eq!(root.parent(), None);
        assert!(root.is_ancestor_of(&inner));
        assert!(meta.is_parent_of(&inner));
        assert!(!root.is_parent_of(&inner));
        assert_eq!(inner.index(), 2);
    }

    #[test]
    fn parses_display_form() {
        let id: NodeId = "0:12:3".parse().unwrap();
        assert_eq!(id.path(), &[0, 12, 3]);
        assert!("".parse::<NodeId>().is_err());
        assert!("0:x".parse::<NodeId>().is_err());
    }

    #[test]
    fn serializes_as_string() {
        let id = NodeId::root().child(7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0:7\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
