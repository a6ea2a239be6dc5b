//! Thread-local registry for the runtime
//!
//! Every OS thread that touches the runtime carries:
//!
//! - the fiber currently executing on it
//! - its thread-main fiber (created lazily on first use)
//! - its scheduler-main fiber, set while the thread acts as a worker
//! - a weak reference to the scheduler driving it
//! - the per-thread switch that enables blocking-call interception
//!
//! Fibers flagged `run_in_scheduler` yield back to the scheduler-main
//! fiber; everything else yields back to the thread-main fiber.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

thread_local! {
    /// Fiber currently running on this thread.
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// First fiber this thread ever obtained; return context for fibers
    /// that do not participate in a scheduler.
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber running the dispatch loop, if this thread is a worker.
    static SCHEDULER_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler driving this thread, if any.
    static CURRENT_SCHEDULER: RefCell<Weak<Scheduler>> = const { RefCell::new(Weak::new()) };

    /// Whether blocking-call interception is active on this thread.
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_current_fiber(fiber: Option<Arc<Fiber>>) {
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = fiber);
}

#[inline]
pub fn thread_main_fiber() -> Option<Arc<Fiber>> {
    THREAD_MAIN.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_thread_main_fiber(fiber: Option<Arc<Fiber>>) {
    THREAD_MAIN.with(|cell| *cell.borrow_mut() = fiber);
}

#[inline]
pub fn scheduler_main_fiber() -> Option<Arc<Fiber>> {
    SCHEDULER_MAIN.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_scheduler_main_fiber(fiber: Option<Arc<Fiber>>) {
    SCHEDULER_MAIN.with(|cell| *cell.borrow_mut() = fiber);
}

/// Scheduler driving this thread, upgraded.
#[inline]
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().upgrade())
}

/// Weak handle to the scheduler driving this thread.
#[inline]
pub fn current_scheduler_weak() -> Weak<Scheduler> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_current_scheduler(sched: Weak<Scheduler>) {
    CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = sched);
}

#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}

#[inline]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|cell| cell.set(enabled));
}
