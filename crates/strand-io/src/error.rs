//! Error types for the reactor

use crate::iomanager::Event;
use core::fmt;
use std::os::unix::io::RawFd;
use strand_core::SchedError;

/// Result type for reactor operations
pub type IoResult<T> = Result<T, IoError>;

/// Errors that can occur while registering or driving I/O interest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// epoll_create failed at construction (errno)
    EpollCreate(i32),

    /// Creating the wake pipe failed (errno)
    WakePipe(i32),

    /// epoll_ctl rejected an interest update (errno)
    EpollCtl { fd: RawFd, errno: i32 },

    /// The event bit is already bound to a handler for this fd
    EventAlreadyBound { fd: RawFd, event: Event },

    /// The fd cannot carry events
    InvalidFd(RawFd),

    /// Underlying scheduler error
    Sched(SchedError),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::EpollCreate(errno) => write!(f, "epoll_create failed: errno {}", errno),
            IoError::WakePipe(errno) => write!(f, "wake pipe creation failed: errno {}", errno),
            IoError::EpollCtl { fd, errno } => {
                write!(f, "epoll_ctl on fd {} failed: errno {}", fd, errno)
            }
            IoError::EventAlreadyBound { fd, event } => {
                write!(f, "{:?} event already bound on fd {}", event, fd)
            }
            IoError::InvalidFd(fd) => write!(f, "invalid fd {}", fd),
            IoError::Sched(e) => write!(f, "scheduler error: {}", e),
        }
    }
}

impl std::error::Error for IoError {}

impl From<SchedError> for IoError {
    fn from(e: SchedError) -> Self {
        IoError::Sched(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = IoError::EventAlreadyBound {
            fd: 7,
            event: Event::Read,
        };
        assert_eq!(format!("{}", e), "Read event already bound on fd 7");
        let e: IoError = SchedError::Stopped.into();
        assert_eq!(format!("{}", e), "scheduler error: scheduler is stopped");
    }
}
