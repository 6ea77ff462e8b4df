//! Message lifecycle states and the transition table both peers honor.

use serde::{Deserialize, Serialize};

/// Stage of one message's processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Thinking,
    Generating,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 7] = [
        LifecycleState::Pending,
        LifecycleState::Thinking,
        LifecycleState::Generating,
        LifecycleState::Streaming,
        LifecycleState::Complete,
        LifecycleState::Error,
        LifecycleState::Cancelled,
    ];

    /// No transitions leave a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Complete | LifecycleState::Error | LifecycleState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Thinking => "thinking",
            LifecycleState::Generating => "generating",
            LifecycleState::Streaming => "streaming",
            LifecycleState::Complete => "complete",
            LifecycleState::Error => "error",
            LifecycleState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition table for [`LifecycleState`].
///
/// ```text
/// pending    -> thinking, error, cancelled
/// thinking   -> generating, error, cancelled
/// generating -> streaming, complete, error, cancelled
/// streaming  -> streaming, complete, error, cancelled
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageStateMachine;

impl MessageStateMachine {
    pub fn new() -> Self {
        Self
    }

    pub fn allowed_targets(&self, from: LifecycleState) -> &'static [LifecycleState] {
        use LifecycleState::*;
        match from {
            Pending => &[Thinking, Error, Cancelled],
            Thinking => &[Generating, Error, Cancelled],
            Generating => &[Streaming, Complete, Error, Cancelled],
            Streaming => &[Streaming, Complete, Error, Cancelled],
            Complete | Error | Cancelled => &[],
        }
    }

    pub fn is_valid_transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.allowed_targets(from).contains(&to)
    }
}
