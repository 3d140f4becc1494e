use serde::{Deserialize, Serialize};

/// Declared port of a node or of a nested workflow's boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Only meaningful for input ports: an unconnected required input keeps
    /// the node IDLE.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl PortDefinition {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required: false,
        }
    }
}

/// Shape of the data a port will carry, computed by configure without
/// producing the data itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub type_name: String,
}

impl PortSpec {
    pub fn of(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }

    /// Spec accepted by every consumer.
    pub fn any() -> Self {
        Self::of("any")
    }

    pub fn is_compatible_with(&self, expected: &str) -> bool {
        expected == "any" || self.type_name == "any" || self.type_name == expected
    }
}
