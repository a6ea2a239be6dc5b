//! N-thread fiber scheduler
//!
//! A fixed worker pool pulling from one FIFO task queue. A task is either
//! a fiber or a plain closure; closures run inside a reusable carrier
//! fiber kept per worker. Tasks may be pinned to a worker's raw thread
//! id; pinned tasks never migrate, and a task pinned to a thread that
//! never comes up is dropped at shutdown.
//!
//! With `use_caller`, the constructing thread contributes one worker: its
//! dispatch loop lives in a root fiber that only runs while `stop` drains
//! the queue.
//!
//! Subsystems that need to park workers on external events (the reactor)
//! plug in through [`SchedulerHooks`], which replaces the wake, idle and
//! stop-predicate behavior.

use crate::fiber::Fiber;
use crate::tls;
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use strand_core::{FiberState, SchedError, SchedResult, Semaphore};

/// Raw OS thread id, as returned by gettid.
pub type ThreadId = libc::pid_t;

/// Raw thread id of the calling thread.
#[inline]
pub fn current_thread_id() -> ThreadId {
    unsafe { libc::syscall(libc::SYS_gettid) as ThreadId }
}

/// One schedulable unit: a fiber to resume or a closure to run.
pub enum TaskPayload {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

struct Task {
    payload: TaskPayload,
    /// None means any worker may run it.
    thread: Option<ThreadId>,
}

/// Customization points a reactor supplies to the dispatch loop.
pub trait SchedulerHooks: Send + Sync {
    /// Runs at the top of every worker's dispatch loop, and on the caller
    /// thread of a `use_caller` scheduler at construction.
    fn bind_worker(&self) {}

    /// Wake one parked worker.
    fn tickle(&self);

    /// Body of the idle fiber. Must keep yielding until `stopping()`
    /// holds, then return.
    fn idle(&self);

    /// Full stop predicate; AND in reactor conditions on top of
    /// [`Scheduler::default_stopping`].
    fn stopping(&self) -> bool;
}

/// Worker pool plus FIFO task queue.
pub struct Scheduler {
    name: String,
    /// Total worker count, the caller included when `use_caller`.
    worker_count: usize,
    root_thread: Option<ThreadId>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    tasks: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<ThreadId>>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
    startup_sem: Semaphore,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers in total.
    ///
    /// With `use_caller` the constructing thread is one of them; it only
    /// dispatches while `stop` drains, and `stop` must later run on this
    /// same thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one worker");

        let sched = Arc::new(Scheduler {
            name: name.to_string(),
            worker_count: threads,
            root_thread: use_caller.then(current_thread_id),
            root_fiber: Mutex::new(None),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            hooks: RwLock::new(None),
            startup_sem: Semaphore::new(0),
        });

        if use_caller {
            assert!(
                tls::current_scheduler().is_none(),
                "thread already drives a scheduler"
            );
            // materialize this thread's main fiber before any dispatch
            let _ = Fiber::current();
            tls::set_current_scheduler(Arc::downgrade(&sched));

            let weak = Arc::downgrade(&sched);
            let root = Fiber::new(
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.run();
                    }
                },
                0,
                false,
            );
            tls::set_scheduler_main_fiber(Some(root.clone()));
            *sched.root_fiber.lock() = Some(root);
            sched.thread_ids.lock().push(current_thread_id());
        }

        sched
    }

    /// Install the reactor hooks. Must happen before `start`.
    pub fn set_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        assert!(!self.started.load(Ordering::SeqCst), "hooks after start");
        *self.hooks.write() = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.read().as_ref().and_then(|w| w.upgrade())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Worker thread ids: the caller first when `use_caller`, then the
    /// spawned workers in start order. Complete once `start` returns.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.thread_ids.lock().clone()
    }

    pub fn idle_thread_count(&self) -> usize {
        self.idle_count.load(Ordering::SeqCst)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_thread_count() > 0
    }

    /// Enqueue a closure runnable on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(TaskPayload::Call(Box::new(f)), None);
    }

    /// Enqueue a closure pinned to the worker with the given thread id.
    pub fn schedule_to<F>(&self, f: F, thread: ThreadId)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(TaskPayload::Call(Box::new(f)), Some(thread));
    }

    /// Enqueue a fiber runnable on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(TaskPayload::Fiber(fiber), None);
    }

    /// Enqueue a fiber pinned to the worker with the given thread id.
    pub fn schedule_fiber_to(&self, fiber: Arc<Fiber>, thread: ThreadId) {
        self.schedule_task(TaskPayload::Fiber(fiber), Some(thread));
    }

    /// Enqueue a task and wake a worker.
    ///
    /// Wakes on every enqueue, not only when the queue was empty; a lost
    /// wake costs a reactor timeout, a spurious one costs a syscall.
    pub fn schedule_task(&self, payload: TaskPayload, thread: Option<ThreadId>) {
        if self.stop_requested.load(Ordering::SeqCst) && self.threads.lock().is_empty() {
            // late handlers during teardown still drain through the
            // caller; anything after the workers joined is lost
            trace!("{} task scheduled after shutdown", self.name);
        }
        self.tasks.lock().push_back(Task { payload, thread });
        self.tickle();
    }

    /// Wake one parked worker.
    pub fn tickle(&self) {
        match self.hooks() {
            Some(h) => h.tickle(),
            None => trace!("{} tickle", self.name),
        }
    }

    /// Spawn the worker threads. Returns once every worker has
    /// registered its thread id.
    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(SchedError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedError::AlreadyStarted);
        }

        let spawn_count = self.worker_count - usize::from(self.root_thread.is_some());
        for i in 0..spawn_count {
            let me = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || {
                    me.thread_ids.lock().push(current_thread_id());
                    me.startup_sem.post();
                    me.run();
                })
                .map_err(|_| SchedError::SpawnFailed)?;
            self.threads.lock().push(handle);
        }
        for _ in 0..spawn_count {
            self.startup_sem.wait();
        }
        debug!("{} started with {} workers", self.name, self.worker_count);
        Ok(())
    }

    /// Request shutdown, drain, and join every worker.
    ///
    /// On a `use_caller` scheduler this must run on the constructing
    /// thread, which dispatches until the queue is dry. Blocks until all
    /// workers exit; a handler stuck in user code blocks it forever.
    pub fn stop(&self) {
        debug!("{} stop", self.name);
        self.stop_requested.store(true, Ordering::SeqCst);
        for _ in 0..self.worker_count {
            self.tickle();
        }

        let root = self.root_fiber.lock().clone();
        if let Some(root) = root {
            self.tickle();
            if root.state() == FiberState::Ready {
                assert_eq!(
                    self.root_thread,
                    Some(current_thread_id()),
                    "stop of a use_caller scheduler must run on its constructing thread"
                );
                root.resume();
            }
        }

        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }

        // free the caller thread for a future scheduler
        if self.root_thread == Some(current_thread_id()) {
            tls::set_current_scheduler(Weak::new());
            tls::set_scheduler_main_fiber(None);
        }
        debug!("{} stopped", self.name);
    }

    /// True when a stop was requested and every worker may exit: the
    /// queue is empty and nothing is mid-run. Reactor hooks AND in their
    /// own conditions on top of this.
    pub fn default_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            && self.tasks.lock().is_empty()
            && self.active_count.load(Ordering::SeqCst) == 0
    }

    /// Effective stop predicate, hooks included.
    pub fn stopping(&self) -> bool {
        match self.hooks() {
            Some(h) => h.stopping(),
            None => self.default_stopping(),
        }
    }

    /// Dispatch loop, one per worker.
    pub(crate) fn run(self: &Arc<Self>) {
        debug!("{} dispatch loop start", self.name);
        tls::set_hook_enabled(true);
        tls::set_current_scheduler(Arc::downgrade(self));
        if let Some(h) = self.hooks() {
            h.bind_worker();
        }

        let tid = current_thread_id();
        if self.root_thread != Some(tid) {
            // on a plain worker the thread-main fiber runs the dispatch
            // loop and doubles as scheduler-main
            let main = Fiber::current();
            tls::set_scheduler_main_fiber(Some(main));
        }

        let weak = Arc::downgrade(self);
        let idle_fiber = Fiber::new(
            move || {
                if let Some(s) = weak.upgrade() {
                    s.idle_entry();
                }
            },
            0,
            true,
        );
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut payload: Option<TaskPayload> = None;
            let mut tickle_me = false;
            {
                let mut queue = self.tasks.lock();
                let mut idx = 0;
                while idx < queue.len() {
                    // pinned to a different worker: leave it, flag a wake
                    if let Some(want) = queue[idx].thread {
                        if want != tid {
                            // once stopping, a task pinned to a thread
                            // that never registered can never run; drop
                            // it so shutdown can drain
                            if self.stop_requested.load(Ordering::SeqCst)
                                && !self.thread_ids.lock().contains(&want)
                            {
                                warn!(
                                    "{} dropping task pinned to unknown thread {}",
                                    self.name, want
                                );
                                queue.remove(idx);
                                continue;
                            }
                            tickle_me = true;
                            idx += 1;
                            continue;
                        }
                    }
                    // a fiber some other worker is still switching out of
                    if let TaskPayload::Fiber(f) = &queue[idx].payload {
                        if f.state() == FiberState::Running {
                            idx += 1;
                            continue;
                        }
                    }
                    let task = queue.remove(idx).unwrap();
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    payload = Some(task.payload);
                    break;
                }
                if payload.is_some() && idx < queue.len() {
                    tickle_me = true;
                }
            }
            if tickle_me {
                self.tickle();
            }

            match payload {
                Some(TaskPayload::Fiber(fiber)) => {
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                }
                Some(TaskPayload::Call(cb)) => {
                    let carrier = match cb_fiber.take() {
                        Some(c) => {
                            c.reset_boxed(cb);
                            c
                        }
                        None => Fiber::new_boxed(cb, 0, true),
                    };
                    carrier.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                    // keep the carrier only when the closure finished; a
                    // parked one is owned by whatever wakes it
                    if carrier.state() == FiberState::Term {
                        cb_fiber = Some(carrier);
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        debug!("{} idle fiber term", self.name);
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_count.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        debug!("{} dispatch loop exit", self.name);
    }

    fn idle_entry(self: &Arc<Self>) {
        match self.hooks() {
            Some(h) => h.idle(),
            None => {
                while !self.stopping() {
                    Fiber::yield_now();
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.threads.lock().is_empty() {
            warn!("{} dropped without stop(), worker threads leaked", self.name);
        }
    }
}
