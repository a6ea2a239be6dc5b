//! Fiber lifecycle states

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// State of a fiber.
///
/// A fiber is constructed `Ready`, becomes `Running` while it owns a CPU,
/// returns to `Ready` on every yield, and ends as `Term` once its entry
/// closure returns. `Term` fibers may be revived through `reset`, which
/// reuses the stack and moves the state back to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Just created, reset, or yielded; eligible for resume.
    Ready = 0,

    /// Currently executing on some worker thread.
    Running = 1,

    /// Entry closure returned; stack may be reused via reset.
    Term = 2,
}

impl FiberState {
    /// Whether a resume of this fiber is legal.
    #[inline]
    pub const fn is_resumable(self) -> bool {
        matches!(self, FiberState::Ready)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Ready => write!(f, "READY"),
            FiberState::Running => write!(f, "RUNNING"),
            FiberState::Term => write!(f, "TERM"),
        }
    }
}

/// Atomic cell holding a [`FiberState`].
///
/// The dispatch loop inspects states of fibers owned by other workers, so
/// every transition goes through this cell.
pub struct AtomicFiberState(AtomicU8);

impl AtomicFiberState {
    #[inline]
    pub const fn new(state: FiberState) -> Self {
        AtomicFiberState(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn load(&self) -> FiberState {
        FiberState::from(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, state: FiberState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl fmt::Debug for AtomicFiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicFiberState({:?})", self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_resumable() {
        assert!(FiberState::Ready.is_resumable());
        assert!(!FiberState::Running.is_resumable());
        assert!(!FiberState::Term.is_resumable());
    }

    #[test]
    fn test_atomic_state_round_trip() {
        let cell = AtomicFiberState::new(FiberState::Ready);
        assert_eq!(cell.load(), FiberState::Ready);
        cell.store(FiberState::Running);
        assert_eq!(cell.load(), FiberState::Running);
        cell.store(FiberState::Term);
        assert_eq!(cell.load(), FiberState::Term);
    }
}
