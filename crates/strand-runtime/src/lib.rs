//! # strand-runtime
//!
//! The scheduling core of the strand workspace:
//!
//! - Context switching (architecture-specific assembly)
//! - `Fiber`: stackful cooperative tasks with explicit resume/yield
//! - `Scheduler`: an N-thread worker pool over a FIFO task queue
//! - `TimerManager`: absolute-deadline timers with rollover detection
//! - Typed, hot-reloadable configuration variables
//!
//! The reactor that turns blocking socket calls into fiber suspensions
//! lives in `strand-io`; it plugs into the scheduler through the
//! [`SchedulerHooks`] trait.

pub mod arch;
pub mod config;
pub mod fiber;
pub mod scheduler;
pub mod timer;
pub mod tls;

pub use config::ConfigVar;
pub use fiber::Fiber;
pub use scheduler::{Scheduler, SchedulerHooks, TaskPayload, ThreadId};
pub use timer::{Timer, TimerCallback, TimerManager};

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("strand targets Linux (epoll, pipe2, gettid)");
    }
}

/// Raw thread id of the calling thread.
#[inline]
pub fn current_thread_id() -> ThreadId {
    scheduler::current_thread_id()
}
