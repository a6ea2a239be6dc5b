//! Error types for scheduler operations

use core::fmt;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur while driving the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// start() called on a scheduler that is already running
    AlreadyStarted,

    /// start() called after stop() completed
    Stopped,

    /// Failed to spawn a worker thread
    SpawnFailed,

    /// Configuration value rejected
    InvalidConfig(&'static str),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::Stopped => write!(f, "scheduler is stopped"),
            SchedError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            SchedError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for SchedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", SchedError::AlreadyStarted),
            "scheduler already started"
        );
        assert_eq!(
            format!("{}", SchedError::InvalidConfig("workers must be > 0")),
            "invalid config: workers must be > 0"
        );
    }
}
