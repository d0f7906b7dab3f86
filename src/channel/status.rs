use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::NodeChannel;

/// Execution status of a node channel.
///
/// ```text
/// Connecting -> Handshaking -> Active <-> Executing
///                                  \         /
///                               Failed | Disabled
/// ```
///
/// `Failed` and `Disabled` are terminal for a connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Connecting,
    Handshaking,
    Active,
    Executing,
    Failed,
    Disabled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Disabled)
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (a, _) if a.is_terminal() => false,
            (_, Failed) | (_, Disabled) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Active) => true,
            (Active, Executing) | (Executing, Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Connecting => "connecting",
            ExecutionStatus::Handshaking => "handshaking",
            ExecutionStatus::Active => "active",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Event consumed by the pool-membership updater.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    StatusChanged {
        channel: Arc<NodeChannel>,
        old: ExecutionStatus,
        new: ExecutionStatus,
    },
    /// Job count or capacity changed without a status change
    Refresh(Arc<NodeChannel>),
}

#[cfg(test)]
mod tests {
    use super::ExecutionStatus::*;

    #[test]
    fn lifecycle_transitions() {
        assert!(Connecting.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Active));
        assert!(Active.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Active));
        assert!(Executing.can_transition_to(Failed));
        assert!(Active.can_transition_to(Disabled));
    }

    #[test]
    fn invalid_transitions() {
        assert!(!Connecting.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Active));
        assert!(!Disabled.can_transition_to(Executing));
        assert!(!Failed.can_transition_to(Disabled));
        assert!(!Handshaking.can_transition_to(Executing));
    }
}
