use crate::pid::ExitReason;

/// Errors surfaced to the caller of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors a process body can end with.
///
/// None of these escape the process: the worker records them as the
/// process's [`ExitReason`] and moves on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    /// The process observed a `kill` at a checkpoint.
    #[error("process was killed")]
    Killed,
    /// The body raised an error it did not handle.
    #[error("{0}")]
    Raised(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("process panicked: {0}")]
    Panicked(String),
}

impl ProcessError {
    pub fn raised(msg: impl Into<String>) -> Self {
        ProcessError::Raised(msg.into())
    }
}

impl From<ProcessError> for ExitReason {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Killed => ExitReason::Kill,
            other => ExitReason::from_error(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn killed_maps_to_kill_exit() {
        assert_eq!(ExitReason::from(ProcessError::Killed), ExitReason::Kill);
    }

    #[test]
    fn raised_error_maps_to_error_exit() {
        assert_eq!(
            ExitReason::from(ProcessError::raised("undefined variable 'x'")),
            ExitReason::Error("undefined variable 'x'".to_string())
        );
    }

    #[test]
    fn runtime_errors_convert_transparently() {
        let err: ProcessError = RuntimeError::InvalidArgument("negative sleep".to_string()).into();
        assert_eq!(err.to_string(), "invalid argument: negative sleep");
    }
}
