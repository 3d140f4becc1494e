use crate::StateError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a node container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "CONFIGURED")]
    Configured,
    #[serde(rename = "UNCONFIGURED_MARKEDFOREXEC")]
    UnconfiguredMarkedForExec,
    #[serde(rename = "CONFIGURED_MARKEDFOREXEC")]
    ConfiguredMarkedForExec,
    #[serde(rename = "CONFIGURED_QUEUED")]
    ConfiguredQueued,
    #[serde(rename = "PREEXECUTE")]
    PreExecute,
    #[serde(rename = "EXECUTING")]
    Executing,
    #[serde(rename = "POSTEXECUTE")]
    PostExecute,
    #[serde(rename = "EXECUTED")]
    Executed,
}

impl NodeState {
    pub const ALL: [NodeState; 9] = [
        NodeState::Idle,
        NodeState::Configured,
        NodeState::UnconfiguredMarkedForExec,
        NodeState::ConfiguredMarkedForExec,
        NodeState::ConfiguredQueued,
        NodeState::PreExecute,
        NodeState::Executing,
        NodeState::PostExecute,
        NodeState::Executed,
    ];

    pub fn is_executed(self) -> bool {
        self == NodeState::Executed
    }

    pub fn is_idle(self) -> bool {
        self == NodeState::Idle
    }

    /// Configured and doing nothing else.
    pub fn is_configured(self) -> bool {
        self == NodeState::Configured
    }

    /// Marked, queued or running.
    pub fn is_execution_in_progress(self) -> bool {
        matches!(
            self,
            NodeState::UnconfiguredMarkedForExec
                | NodeState::ConfiguredMarkedForExec
                | NodeState::ConfiguredQueued
                | NodeState::PreExecute
                | NodeState::Executing
                | NodeState::PostExecute
        )
    }

    pub fn is_marked(self) -> bool {
        matches!(
            self,
            NodeState::UnconfiguredMarkedForExec | NodeState::ConfiguredMarkedForExec
        )
    }

    /// How far along the execution pipeline this state is; used to pick the
    /// least advanced state when aggregating nested workflows.
    pub fn progress_rank(self) -> u8 {
        match self {
            NodeState::Idle => 0,
            NodeState::UnconfiguredMarkedForExec => 1,
            NodeState::Configured => 2,
            NodeState::ConfiguredMarkedForExec => 3,
            NodeState::ConfiguredQueued => 4,
            NodeState::PreExecute => 5,
            NodeState::Executing => 6,
            NodeState::PostExecute => 7,
            NodeState::Executed => 8,
        }
    }

    /// The legal transition table. Every state change of a leaf container
    /// goes through this check.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Idle, Configured)
                | (Idle, UnconfiguredMarkedForExec)
                | (Configured, Idle)
                | (Configured, ConfiguredMarkedForExec)
                | (UnconfiguredMarkedForExec, Idle)
                | (UnconfiguredMarkedForExec, ConfiguredMarkedForExec)
                | (ConfiguredMarkedForExec, Configured)
                | (ConfiguredMarkedForExec, UnconfiguredMarkedForExec)
                | (ConfiguredMarkedForExec, ConfiguredQueued)
                | (ConfiguredQueued, Configured)
                | (ConfiguredQueued, PreExecute)
                | (PreExecute, Configured)
                | (PreExecute, Executing)
                | (Executing, Configured)
                | (Executing, PostExecute)
                | (PostExecute, Configured)
                | (PostExecute, ConfiguredMarkedForExec)
                | (PostExecute, Executed)
                | (Executed, Configured)
                | (Executed, Idle)
        )
    }

    pub fn transition(self, next: NodeState) -> Result<NodeState, StateError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StateError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Idle => "IDLE",
            NodeState::Configured => "CONFIGURED",
            NodeState::UnconfiguredMarkedForExec => "UNCONFIGURED_MARKEDFOREXEC",
            NodeState::ConfiguredMarkedForExec => "CONFIGURED_MARKEDFOREXEC",
            NodeState::ConfiguredQueued => "CONFIGURED_QUEUED",
            NodeState::PreExecute => "PREEXECUTE",
            NodeState::Executing => "EXECUTING",
            NodeState::PostExecute => "POSTEXECUTE",
            NodeState::Executed => "EXECUTED",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MessageKind {
    #[default]
    None,
    Warning,
    Error,
}

/// Side channel next to the state: a cancelled node is CONFIGURED with a
/// warning, a failed one CONFIGURED with an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeMessage {
    pub kind: MessageKind,
    pub text: String,
}

impl NodeMessage {
    pub const CANCELED: &'static str = "Execution canceled";

    pub fn none() -> Self {
        Self::default()
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Warning,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            text: text.into(),
        }
    }

    pub fn canceled() -> Self {
        Self::warning(Self::CANCELED)
    }

    pub fn is_none(&self) -> bool {
        self.kind == MessageKind::None
    }
}

impl fmt::Display for NodeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MessageKind::None => Ok(()),
            MessageKind::Warning => write!(f, "WARNING: {}", self.text),
            MessageKind::Error => write!(f, "ERROR: {}", self.text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [
            NodeState::Idle,
            NodeState::Configured,
            NodeState::ConfiguredMarkedForExec,
            NodeState::ConfiguredQueued,
            NodeState::PreExecute,
            NodeState::Executing,
            NodeState::PostExecute,
            NodeState::Executed,
            NodeState::Configured,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn states_are_not_skipped() {
        assert!(!NodeState::Configured.can_transition_to(NodeState::Executing));
        assert!(!NodeState::Configured.can_transition_to(NodeState::Executed));
        assert!(!NodeState::Idle.can_transition_to(NodeState::ConfiguredQueued));
        assert!(!NodeState::ConfiguredQueued.can_transition_to(NodeState::Executed));
        assert!(NodeState::Executing.transition(NodeState::Executed).is_err());
    }

    #[test]
    fn cancel_returns_to_configured() {
        for state in [
            NodeState::ConfiguredMarkedForExec,
            NodeState::ConfiguredQueued,
            NodeState::PreExecute,
            NodeState::Executing,
        ] {
            assert!(state.can_transition_to(NodeState::Configured));
        }
    }

    #[test]
    fn in_progress_predicate() {
        let in_progress: Vec<_> = NodeState::ALL
            .iter()
            .filter(|s| s.is_execution_in_progress())
            .collect();
        assert_eq!(in_progress.len(), 6);
        assert!(!NodeState::Idle.is_execution_in_progress());
        assert!(!NodeState::Configured.is_execution_in_progress());
        assert!(!NodeState::Executed.is_execution_in_progress());
    }

    #[test]
    fn resting_state_predicates() {
        assert!(NodeState::Idle.is_idle());
        assert!(NodeState::Configured.is_configured());
        assert!(NodeState::Executed.is_executed());
        assert!(!NodeState::ConfiguredMarkedForExec.is_configured());
        assert!(!NodeState::UnconfiguredMarkedForExec.is_idle());
    }

    #[test]
    fn serde_names_match_display() {
        for state in NodeState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }
}
