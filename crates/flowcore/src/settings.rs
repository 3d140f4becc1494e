use crate::{NodeError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque key/value settings of a node. The engine stores and persists them
/// but never looks inside.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeSettings {
    entries: BTreeMap<String, Value>,
}

impl NodeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Get setting or return a configuration error
    pub fn require(&self, key: &str) -> Result<&Value, NodeError> {
        self.entries
            .get(key)
            .ok_or_else(|| NodeError::Configuration(format!("Missing setting: {}", key)))
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, NodeError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| NodeError::InvalidInputType {
                field: key.to_string(),
                expected: "non-negative integer".to_string(),
                actual: value.type_name().to_string(),
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
