//! # strand
//!
//! A C10K-style server runtime: cooperative fibers multiplexed over a
//! worker pool, with an epoll reactor that turns blocking-style socket
//! calls into fiber suspensions.
//!
//! ```no_run
//! use strand::{IoManager, net};
//!
//! let iom = IoManager::new(4, false, "demo").unwrap();
//! iom.schedule(|| {
//!     let listener = net::TcpListener::bind("0.0.0.0:8080".parse().unwrap()).unwrap();
//!     loop {
//!         let stream = listener.accept().unwrap();
//!         strand::spawn(move || {
//!             let mut buf = [0u8; 4096];
//!             while let Ok(n) = stream.read(&mut buf) {
//!                 if n == 0 || stream.write_all(&buf[..n]).is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!     }
//! });
//! ```

pub use strand_core::{FiberId, FiberState, SchedError, SchedResult, Semaphore, SpinLock};

pub use strand_runtime::config;
pub use strand_runtime::tls;
pub use strand_runtime::{
    current_thread_id, ConfigVar, Fiber, Scheduler, SchedulerHooks, ThreadId, Timer, TimerManager,
};

pub use strand_io::{hook, net, Event, FdCtx, FdManager, IoError, IoManager, IoResult, TimeoutKind};

use std::sync::Arc;

/// Run a closure on the scheduler driving the current thread.
///
/// Panics off scheduler threads; construct an [`IoManager`] and schedule
/// onto it instead.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    tls::current_scheduler()
        .expect("spawn called outside a scheduler thread")
        .schedule(f);
}

/// Create a fiber for `f` and enqueue it on the current scheduler.
pub fn spawn_fiber<F>(f: F) -> Arc<Fiber>
where
    F: FnOnce() + Send + 'static,
{
    let sched = tls::current_scheduler().expect("spawn_fiber called outside a scheduler thread");
    let fiber = Fiber::new(f, 0, true);
    sched.schedule_fiber(fiber.clone());
    fiber
}

/// Give up the CPU; the current fiber re-runs when something schedules
/// it again.
pub fn yield_now() {
    Fiber::yield_now();
}

/// Cooperative millisecond sleep; blocks the OS thread when called off
/// reactor threads.
pub fn sleep_ms(ms: u64) {
    hook::sleep_ms(ms);
}
