//! Lifecycle states of a runner and the transitions allowed between them.

use std::fmt;

use serde::Serialize;

/// Runner lifecycle state.
///
/// States only move forward, with two exceptions: `Running -> Ready` once a
/// unit of work finishes, and `ShuttingDown` is reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::{
            Initializing, Ready, Running, ShuttingDown, Stopped, Uninitialized,
        };
        match (self, next) {
            (Uninitialized, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready, Running) => true,
            (Running, Ready) => true,
            (Stopped, _) => false,
            (_, ShuttingDown) => true,
            (ShuttingDown, Stopped) => true,
            _ => false,
        }
    }

    /// Whether new units of work may be admitted in this state.
    pub fn accepts_work(self) -> bool {
        matches!(self, LifecycleState::Ready | LifecycleState::Running)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::{
        Initializing, Ready, Running, ShuttingDown, Stopped, Uninitialized,
    };

    #[test]
    fn happy_path_is_allowed() {
        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Ready));
        assert!(Running.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Stopped));
    }

    #[test]
    fn backwards_moves_are_rejected() {
        assert!(!Ready.can_transition_to(Initializing));
        assert!(!Initializing.can_transition_to(Uninitialized));
        assert!(!Ready.can_transition_to(Uninitialized));
        assert!(!Uninitialized.can_transition_to(Ready));
        assert!(!ShuttingDown.can_transition_to(Ready));
    }

    #[test]
    fn shutdown_reachable_from_everywhere_but_stopped() {
        for state in [Uninitialized, Initializing, Ready, Running] {
            assert!(state.can_transition_to(ShuttingDown), "{state}");
        }
        assert!(!Stopped.can_transition_to(ShuttingDown));
        assert!(!Stopped.can_transition_to(Ready));
    }

    #[test]
    fn only_ready_and_running_accept_work() {
        assert!(Ready.accepts_work());
        assert!(Running.accepts_work());
        assert!(!Initializing.accepts_work());
        assert!(!ShuttingDown.accepts_work());
    }
}
