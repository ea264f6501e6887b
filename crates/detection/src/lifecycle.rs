//! Monitor lifecycle state machine

use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Whether events are forwarded to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MonitorState {
    /// Events are drained and discarded
    #[default]
    Stopped,
    /// Events are forwarded to the registered callbacks
    Running,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Stopped => write!(f, "stopped"),
            MonitorState::Running => write!(f, "running"),
        }
    }
}

/// Stopped/Running state machine
///
/// `start` and `stop` are idempotent and report whether they caused a
/// transition, so the caller only does its start/stop work once.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: Mutex<MonitorState>,
}

impl Lifecycle {
    /// Create a lifecycle in the `Stopped` state
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to `Running`; false if already running
    pub fn start(&self) -> bool {
        self.transition(MonitorState::Running)
    }

    /// Transition to `Stopped`; false if already stopped
    pub fn stop(&self) -> bool {
        self.transition(MonitorState::Stopped)
    }

    /// Current state
    pub fn state(&self) -> MonitorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if monitoring is running
    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    fn transition(&self, target: MonitorState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == target {
            return false;
        }
        *state = target;
        info!("Monitoring {}", target);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), MonitorState::Stopped);
        assert!(!lifecycle.is_running());
    }

    #[test]
    fn test_start_stop_are_idempotent() {
        let lifecycle = Lifecycle::new();

        assert!(lifecycle.start());
        assert!(!lifecycle.start());
        assert!(lifecycle.is_running());

        assert!(lifecycle.stop());
        assert!(!lifecycle.stop());
        assert_eq!(lifecycle.state(), MonitorState::Stopped);

        assert!(lifecycle.start());
    }
}
