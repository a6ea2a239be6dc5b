//! # strand-io
//!
//! The I/O side of the strand runtime:
//!
//! - [`IoManager`]: a scheduler bound to an epoll instance, a wake pipe
//!   and a timer manager; parks fibers on fd readiness
//! - [`FdManager`]/[`FdCtx`]: per-fd bookkeeping (socket detection,
//!   forced kernel non-blocking, user-visible flags, timeouts)
//! - [`hook`]: blocking-style wrappers (`read`, `write`, `connect`,
//!   `accept`, `sleep`, ...) that turn would-block into fiber parking
//! - [`net`]: thin TCP listener/stream types over the hook layer

pub mod error;
pub mod fd_manager;
pub mod hook;
pub mod iomanager;
pub mod net;

pub use error::{IoError, IoResult};
pub use fd_manager::{FdCtx, FdManager, TimeoutKind};
pub use iomanager::{Event, IoManager};
