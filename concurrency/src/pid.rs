//! Process identity types.
//!
//! This module provides the foundational types for process identification:
//! - `Pid`: A unique identifier for each lightweight process
//! - `ExitReason`: Why a process terminated
//! - `ProcessState`: Where a process is in its lifecycle

use std::fmt;

use crate::value::Value;

/// A unique process identifier.
///
/// Pids are issued by a runtime's registry from a monotonically increasing
/// counter and never reused. `Pid::MAIN` (0) is reserved for the initial
/// process, the thread that owns the [`Runtime`](crate::Runtime).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid {
    id: u64,
}

impl Pid {
    /// The main/initial process.
    pub const MAIN: Pid = Pid { id: 0 };

    pub(crate) const fn from_raw(id: u64) -> Self {
        Self { id }
    }

    /// Get the raw numeric ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_main(&self) -> bool {
        self.id == 0
    }
}

impl From<u64> for Pid {
    fn from(id: u64) -> Self {
        Pid::from_raw(id)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.id)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<0.{}>", self.id)
    }
}

/// Lifecycle state of a process.
///
/// Transitions are `Runnable -> Running -> (Blocked -> Running)* -> Finished | Killed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Runnable = 0,
    Running = 1,
    Blocked = 2,
    Finished = 3,
    Killed = 4,
}

impl ProcessState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ProcessState::Runnable,
            1 => ProcessState::Running,
            2 => ProcessState::Blocked,
            3 => ProcessState::Finished,
            _ => ProcessState::Killed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Finished | ProcessState::Killed)
    }
}

/// The reason why a process exited.
#[derive(Clone, Debug, PartialEq)]
pub enum ExitReason {
    /// The body returned normally with this value.
    Normal(Value),

    /// The body raised an error (or panicked) that it did not handle.
    /// Only this process is affected.
    Error(String),

    /// The process observed a `kill` at one of its checkpoints.
    Kill,
}

impl ExitReason {
    pub fn is_normal(&self) -> bool {
        matches!(self, ExitReason::Normal(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExitReason::Error(_))
    }

    /// The returned value, for a normal exit.
    pub fn value(&self) -> Option<&Value> {
        match self {
            ExitReason::Normal(value) => Some(value),
            _ => None,
        }
    }

    /// Create an error exit reason from any error type.
    pub fn from_error<E: std::error::Error>(err: E) -> Self {
        ExitReason::Error(err.to_string())
    }

    pub(crate) fn terminal_state(&self) -> ProcessState {
        match self {
            ExitReason::Kill => ProcessState::Killed,
            _ => ProcessState::Finished,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal(value) => write!(f, "normal: {}", value),
            ExitReason::Error(msg) => write!(f, "error: {}", msg),
            ExitReason::Kill => write!(f, "killed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_pid_is_zero() {
        assert_eq!(Pid::MAIN.id(), 0);
        assert!(Pid::MAIN.is_main());
        assert!(!Pid::from(7).is_main());
    }

    #[test]
    fn pid_display() {
        let pid = Pid::from(12);
        assert_eq!(format!("{}", pid), "<0.12>");
        assert_eq!(format!("{:?}", pid), "Pid(12)");
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ProcessState::Runnable,
            ProcessState::Running,
            ProcessState::Blocked,
            ProcessState::Finished,
            ProcessState::Killed,
        ] {
            assert_eq!(ProcessState::from_u8(state as u8), state);
        }
        assert!(ProcessState::Killed.is_terminal());
        assert!(!ProcessState::Blocked.is_terminal());
    }

    #[test]
    fn exit_reason_kinds() {
        let normal = ExitReason::Normal(Value::from(42));
        assert!(normal.is_normal());
        assert_eq!(normal.value(), Some(&Value::from(42)));
        assert_eq!(normal.terminal_state(), ProcessState::Finished);

        let error = ExitReason::Error("boom".to_string());
        assert!(error.is_error());
        assert_eq!(error.value(), None);
        assert_eq!(error.terminal_state(), ProcessState::Finished);

        assert_eq!(ExitReason::Kill.terminal_state(), ProcessState::Killed);
    }

    #[test]
    fn exit_reason_display() {
        assert_eq!(format!("{}", ExitReason::Kill), "killed");
        assert_eq!(
            format!("{}", ExitReason::Error("connection lost".to_string())),
            "error: connection lost"
        );
        assert_eq!(format!("{}", ExitReason::Normal(Value::Nil)), "normal: nil");
    }
}
