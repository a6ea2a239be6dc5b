//! Stackful cooperative fibers
//!
//! A fiber owns a heap-allocated stack and a saved register block. The
//! only control-flow primitives are [`Fiber::resume`] (switch into a
//! Ready fiber) and [`Fiber::yield_now`] (switch back out). Where a yield
//! lands depends on the `run_in_scheduler` flag: scheduler participants
//! return to the worker's scheduler-main fiber, everything else returns
//! to the thread-main fiber that is created lazily on first use.
//!
//! State transitions: constructed `Ready`; `Running` while on a CPU;
//! back to `Ready` on yield; `Term` once the entry closure returns.
//! `reset` revives a `Term` fiber on its existing stack.

use crate::arch;
use crate::config;
use crate::tls;
use log::trace;
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strand_core::{AtomicFiberState, FiberId, FiberState};

/// Live fiber count, thread-main fibers included.
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

pub(crate) type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// Heap stack for one fiber. Plain allocation, no guard page; stack
/// discipline is the caller's contract, as it is for OS threads sized
/// through their builder.
struct StackBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl StackBuf {
    fn alloc(size: usize) -> StackBuf {
        debug_assert!(size >= 4096, "fiber stack below one page");
        let layout = Layout::from_size_align(size, 16).expect("invalid fiber stack size");
        let raw = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        StackBuf { ptr, layout }
    }

    /// One-past-the-end address; stacks grow down.
    fn top(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(self.layout.size()) }
    }
}

impl Drop for StackBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// Safety: the buffer is only written through the execution protocol below.
unsafe impl Send for StackBuf {}
unsafe impl Sync for StackBuf {}

/// A stackful cooperative task.
///
/// Shared as `Arc<Fiber>`: the scheduler queue, event bindings, and timer
/// callbacks all hold references to parked fibers.
pub struct Fiber {
    id: FiberId,
    state: AtomicFiberState,
    run_in_scheduler: bool,
    /// None only for thread-main fibers, which run on the OS stack.
    stack: Option<StackBuf>,
    ctx: UnsafeCell<arch::Context>,
    entry: UnsafeCell<Option<EntryFn>>,
}

// Safety: `ctx` and `entry` are only touched by the thread currently
// executing (or resuming) the fiber. Handoff between workers goes through
// the scheduler queue lock and the state atomic, which order those
// accesses.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber running `f` on a fresh stack.
    ///
    /// `stack_size == 0` selects the `fiber.stack_size` config value.
    /// `run_in_scheduler` decides the yield-back target, see the module
    /// docs.
    pub fn new<F>(f: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new_boxed(Box::new(f), stack_size, run_in_scheduler)
    }

    pub(crate) fn new_boxed(f: EntryFn, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            config::fiber_stack_size().get() as usize
        } else {
            stack_size
        };

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicFiberState::new(FiberState::Ready),
            run_in_scheduler,
            stack: Some(StackBuf::alloc(size)),
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            entry: UnsafeCell::new(Some(f)),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);

        // The entry argument is the Fiber address inside the Arc
        // allocation, which is stable for the fiber's whole life.
        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_main as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        trace!("fiber {} created", fiber.id);
        fiber
    }

    /// The fiber currently executing on this thread.
    ///
    /// The first call on any thread creates that thread's main fiber: a
    /// stackless, always-Running fiber whose context is filled in by the
    /// first switch away from it.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        let main = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicFiberState::new(FiberState::Running),
            run_in_scheduler: false,
            stack: None,
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            entry: UnsafeCell::new(None),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        trace!("thread-main fiber {} created", main.id);
        tls::set_thread_main_fiber(Some(main.clone()));
        tls::set_current_fiber(Some(main.clone()));
        main
    }

    /// Id of the fiber running on this thread, or 0 when the thread has
    /// not touched the runtime yet.
    pub fn current_id() -> u64 {
        tls::current_fiber().map(|f| f.id.as_u64()).unwrap_or(0)
    }

    /// Number of live fibers in the process, thread-mains included.
    pub fn total() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.state.load()
    }

    #[inline]
    pub fn run_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    /// Switch into this fiber. Only legal while it is `Ready`.
    ///
    /// Returns when the fiber yields or finishes. The `Ready` state of a
    /// yielded fiber is published here, after the switch back, so no
    /// other worker can resume a context that is still being saved.
    pub fn resume(self: &Arc<Self>) {
        let state = self.state.load();
        assert!(
            state == FiberState::Ready,
            "resume on a {} fiber {}",
            state,
            self.id
        );
        assert!(self.stack.is_some(), "cannot resume a thread-main fiber");

        let back = if self.run_in_scheduler {
            tls::scheduler_main_fiber()
                .expect("resume of a scheduler fiber outside a worker thread")
        } else {
            let _ = Fiber::current();
            tls::thread_main_fiber().unwrap()
        };
        debug_assert!(!Arc::ptr_eq(&back, self), "fiber resuming itself");
        let back_ctx: *mut arch::Context = back.ctx.get();
        // `back` stays alive through the thread-local registry.
        drop(back);

        self.state.store(FiberState::Running);
        tls::set_current_fiber(Some(self.clone()));
        unsafe {
            arch::switch(back_ctx, self.ctx.get());
        }

        if self.state.load() == FiberState::Running {
            self.state.store(FiberState::Ready);
        }
    }

    /// Yield the current fiber back to its return context.
    ///
    /// Panics when called outside a fiber or from a thread-main fiber,
    /// which has nowhere to go.
    pub fn yield_now() {
        let cur = tls::current_fiber().expect("yield_now called outside a fiber");
        assert!(cur.stack.is_some(), "thread-main fiber cannot yield");
        cur.yield_inner();
    }

    fn yield_inner(&self) {
        let back = if self.run_in_scheduler {
            tls::scheduler_main_fiber().expect("no scheduler-main fiber to yield to")
        } else {
            tls::thread_main_fiber().expect("no thread-main fiber to yield to")
        };
        let back_ctx: *const arch::Context = back.ctx.get();
        // Move the handle straight into the registry: nothing may stay on
        // this stack when a terminating fiber switches away for good.
        tls::set_current_fiber(Some(back));
        unsafe {
            arch::switch(self.ctx.get(), back_ctx);
        }
    }

    /// Rebuild a finished fiber around a new entry, reusing its stack.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f))
    }

    pub(crate) fn reset_boxed(&self, f: EntryFn) {
        assert!(self.stack.is_some(), "reset requires an owned stack");
        assert!(
            self.state.load() == FiberState::Term,
            "reset requires a finished fiber"
        );
        unsafe {
            *self.entry.get() = Some(f);
            arch::init_context(
                self.ctx.get(),
                self.stack.as_ref().unwrap().top(),
                fiber_main as usize,
                self as *const Fiber as usize,
            );
        }
        self.state.store(FiberState::Ready);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        // Ready fibers may be dropped: tasks pinned to a thread that never
        // came up are discarded at shutdown. Dropping a Running fiber
        // would free a stack that is still executing.
        debug_assert!(
            self.state.load() != FiberState::Running || self.stack.is_none(),
            "dropping a running fiber"
        );
        trace!("fiber {} dropped", self.id);
    }
}

/// Entry point every fiber starts in, reached through the arch
/// trampoline. Runs the entry closure, marks the fiber Term, and
/// switches away for the last time.
extern "C" fn fiber_main(arg: usize) -> ! {
    let fiber = unsafe { &*(arg as *const Fiber) };
    let entry = unsafe { (*fiber.entry.get()).take() }.expect("fiber started without an entry");
    entry();
    fiber.state.store(FiberState::Term);
    trace!("fiber {} finished", fiber.id);
    // No Arc may be held on this stack past this point; it would leak
    // with the abandoned stack.
    fiber.yield_inner();
    unreachable!("terminated fiber resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_resume_runs_entry() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = hits.clone();
        let fiber = Fiber::new(move || h.lock().push("ran"), 0, false);

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*hits.lock(), vec!["ran"]);
    }

    #[test]
    fn test_yield_round_trip() {
        // An entry that yields k times needs k+1 resumes and shows
        // Ready between each pair.
        const K: usize = 3;
        let fiber = Fiber::new(
            || {
                for _ in 0..K {
                    Fiber::yield_now();
                }
            },
            0,
            false,
        );

        for _ in 0..K {
            fiber.resume();
            assert_eq!(fiber.state(), FiberState::Ready);
        }
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let counter = Arc::new(Mutex::new(0u32));

        let c = counter.clone();
        let fiber = Fiber::new(move || *c.lock() += 1, 0, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let c = counter.clone();
        fiber.reset(move || *c.lock() += 10);
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*counter.lock(), 11);
    }

    #[test]
    #[should_panic(expected = "resume on a TERM fiber")]
    fn test_resume_term_fiber_panics() {
        let fiber = Fiber::new(|| {}, 0, false);
        fiber.resume();
        fiber.resume();
    }

    #[test]
    fn test_live_counter_moves() {
        let before = Fiber::total();
        let fiber = Fiber::new(|| {}, 0, false);
        assert!(Fiber::total() > before);
        fiber.resume();
        drop(fiber);
        // Thread-main fibers of live test threads remain counted; the
        // spawned fiber itself must be gone.
        assert!(Fiber::total() >= before);
    }

    #[test]
    fn test_current_id_inside_fiber() {
        let seen = Arc::new(Mutex::new(0u64));
        let s = seen.clone();
        let fiber = Fiber::new(move || *s.lock() = Fiber::current_id(), 0, false);
        let expect = fiber.id().as_u64();
        fiber.resume();
        assert_eq!(*seen.lock(), expect);
    }
}
