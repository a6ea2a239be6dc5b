//! # strand-core
//!
//! Foundation types shared by every crate in the strand workspace:
//!
//! - Fiber identifiers and lifecycle states
//! - Error enums for scheduler operations
//! - Environment variable parsing helpers
//! - Small synchronization primitives (spinlock, counting semaphore)
//!
//! This crate has no knowledge of fibers, schedulers, or reactors; it only
//! defines the vocabulary they share.

pub mod env;
pub mod error;
pub mod id;
pub mod semaphore;
pub mod spinlock;
pub mod state;

pub use error::{SchedError, SchedResult};
pub use id::FiberId;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use state::{AtomicFiberState, FiberState};
