//! epoll-driven I/O manager
//!
//! An [`IoManager`] is a scheduler whose idle path parks in `epoll_wait`
//! instead of spinning: it owns one epoll instance, a self-wake pipe,
//! a growable per-fd event table and a timer manager. Fibers (or plain
//! callbacks) bind to READ/WRITE interest on an fd; readiness, explicit
//! cancellation or a timer turns the binding back into an ordinary
//! scheduler task.
//!
//! A binding is consumed by the first of readiness or cancel; at most
//! one handler per event bit per fd.

use crate::error::{IoError, IoResult};
use log::{debug, error, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use strand_runtime::scheduler::{Scheduler, SchedulerHooks, TaskPayload};
use strand_runtime::timer::{Timer, TimerCallback, TimerManager};
use strand_runtime::{tls, Fiber};

/// I/O interest bit. READ and WRITE are independent; each may carry its
/// own handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

const READ_MASK: u32 = libc::EPOLLIN as u32;
const WRITE_MASK: u32 = libc::EPOLLOUT as u32;
const ERROR_MASK: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

impl Event {
    #[inline]
    fn mask(self) -> u32 {
        match self {
            Event::Read => READ_MASK,
            Event::Write => WRITE_MASK,
        }
    }
}

enum BindingTask {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

/// Handler bound to one event bit, remembering the scheduler that was
/// current at registration time.
struct EventBinding {
    scheduler: Weak<Scheduler>,
    task: BindingTask,
}

#[derive(Default)]
struct FdEventInner {
    /// Union of bound event masks; mirrors the epoll interest for this fd.
    events: u32,
    read: Option<EventBinding>,
    write: Option<EventBinding>,
}

struct FdEventCtx {
    fd: RawFd,
    inner: Mutex<FdEventInner>,
}

thread_local! {
    static CURRENT_IOM: RefCell<Weak<IoManager>> = const { RefCell::new(Weak::new()) };
}

/// Scheduler + epoll reactor + timer manager.
pub struct IoManager {
    weak_self: Weak<IoManager>,
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// Self-wake pipe: [read end, write end]. The read end carries a
    /// permanent READ interest.
    tickle_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Option<Arc<FdEventCtx>>>>,
}

impl IoManager {
    /// Build the reactor and start its workers.
    ///
    /// `threads` is the total worker count; with `use_caller` the
    /// constructing thread is one of them and must later call `stop`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> IoResult<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(IoError::EpollCreate(errno()));
        }

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let e = errno();
            unsafe { libc::close(epfd) };
            return Err(IoError::WakePipe(e));
        }

        let scheduler = Scheduler::new(threads, use_caller, name);
        let timers = TimerManager::new();

        let iom = Arc::new_cyclic(|weak| IoManager {
            weak_self: weak.clone(),
            scheduler,
            timers,
            epfd,
            tickle_fds: pipe_fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
        });

        let hooks: Weak<dyn SchedulerHooks> = iom.weak_self.clone();
        iom.scheduler.set_hooks(hooks);

        // a timer landing at the head of the set must re-arm epoll_wait
        let weak = iom.weak_self.clone();
        iom.timers.set_front_notify(move || {
            if let Some(m) = weak.upgrade() {
                m.tickle();
            }
        });

        let mut ev = libc::epoll_event {
            events: READ_MASK,
            u64: pipe_fds[0] as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) };
        if rc != 0 {
            // Drop closes the fds
            return Err(IoError::EpollCtl {
                fd: pipe_fds[0],
                errno: errno(),
            });
        }

        if use_caller {
            iom.bind_worker();
        }
        iom.scheduler.start()?;
        debug!("{} io manager up (epfd {})", name, epfd);
        Ok(iom)
    }

    /// The manager driving the calling thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IOM.with(|c| c.borrow().upgrade())
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Outstanding event bindings across all fds.
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    // ── scheduler passthroughs ──

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(f);
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule_fiber(fiber);
    }

    pub fn thread_ids(&self) -> Vec<strand_runtime::ThreadId> {
        self.scheduler.thread_ids()
    }

    /// Stop the scheduler, drain, and release the reactor TLS binding of
    /// the calling thread.
    pub fn stop(&self) {
        self.scheduler.stop();
        CURRENT_IOM.with(|c| {
            let bound = c.borrow().as_ptr() == self as *const _;
            if bound {
                *c.borrow_mut() = Weak::new();
            }
        });
    }

    // ── timer passthroughs ──

    pub fn add_timer<F>(&self, period_ms: u64, recurring: bool, cb: F) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(period_ms, recurring, cb)
    }

    pub fn add_conditional_timer<F>(
        &self,
        period_ms: u64,
        recurring: bool,
        cb: F,
        cond: Weak<dyn Any + Send + Sync>,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_conditional_timer(period_ms, recurring, cb, cond)
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    // ── event registration ──

    /// Bind the current fiber to `(fd, event)`; it is rescheduled on
    /// readiness or cancellation.
    pub fn add_event(&self, fd: RawFd, event: Event) -> IoResult<()> {
        let fiber = Fiber::current();
        self.add_event_inner(fd, event, BindingTask::Fiber(fiber))
    }

    /// Bind a callback to `(fd, event)` instead of the current fiber.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, cb: F) -> IoResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_inner(fd, event, BindingTask::Call(Box::new(cb)))
    }

    fn add_event_inner(&self, fd: RawFd, event: Event, task: BindingTask) -> IoResult<()> {
        if fd < 0 {
            return Err(IoError::InvalidFd(fd));
        }
        let ctx = self.ensure_context(fd);
        let mut inner = ctx.inner.lock();

        let bit = event.mask();
        if inner.events & bit != 0 {
            error!("{:?} event already bound on fd {}", event, fd);
            return Err(IoError::EventAlreadyBound { fd, event });
        }

        let new_events = inner.events | bit;
        let op = if inner.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.epoll_update(op, fd, new_events)?;

        inner.events = new_events;
        self.pending_events.fetch_add(1, Ordering::SeqCst);
        let binding = EventBinding {
            scheduler: tls::current_scheduler_weak(),
            task,
        };
        match event {
            Event::Read => inner.read = Some(binding),
            Event::Write => inner.write = Some(binding),
        }
        trace!("fd {} bound {:?}", fd, event);
        Ok(())
    }

    /// Unbind `(fd, event)` without running its handler.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        let bit = event.mask();
        if inner.events & bit == 0 {
            return false;
        }

        let left = inner.events & !bit;
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if self.epoll_update(op, fd, left).is_err() {
            return false;
        }
        inner.events = left;
        let dropped = match event {
            Event::Read => inner.read.take(),
            Event::Write => inner.write.take(),
        };
        if dropped.is_some() {
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }

    /// Unbind `(fd, event)` and schedule its handler immediately: a
    /// forced wakeup for whatever is parked there.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        let bit = event.mask();
        if inner.events & bit == 0 {
            return false;
        }

        let left = inner.events & !bit;
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if self.epoll_update(op, fd, left).is_err() {
            return false;
        }
        self.trigger(&mut inner, event);
        true
    }

    /// Unbind both bits and schedule both handlers.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events == 0 {
            return false;
        }

        if self.epoll_update(libc::EPOLL_CTL_DEL, fd, 0).is_err() {
            return false;
        }
        if inner.events & READ_MASK != 0 {
            self.trigger(&mut inner, Event::Read);
        }
        if inner.events & WRITE_MASK != 0 {
            self.trigger(&mut inner, Event::Write);
        }
        debug_assert_eq!(inner.events, 0);
        true
    }

    /// Consume a binding: clear the bit, decrement the pending count and
    /// hand the handler to its scheduler. Caller already updated epoll.
    fn trigger(&self, inner: &mut FdEventInner, event: Event) {
        inner.events &= !event.mask();
        let binding = match event {
            Event::Read => inner.read.take(),
            Event::Write => inner.write.take(),
        };
        let Some(binding) = binding else {
            return;
        };
        self.pending_events.fetch_sub(1, Ordering::SeqCst);

        let sched = binding
            .scheduler
            .upgrade()
            .unwrap_or_else(|| self.scheduler.clone());
        match binding.task {
            BindingTask::Fiber(f) => sched.schedule_task(TaskPayload::Fiber(f), None),
            BindingTask::Call(cb) => sched.schedule_task(TaskPayload::Call(cb), None),
        }
    }

    fn epoll_update(&self, op: libc::c_int, fd: RawFd, events: u32) -> IoResult<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            let e = errno();
            error!("epoll_ctl(op={}, fd={}, events={:#x}) errno {}", op, fd, events, e);
            return Err(IoError::EpollCtl { fd, errno: e });
        }
        Ok(())
    }

    fn lookup_context(&self, fd: RawFd) -> Option<Arc<FdEventCtx>> {
        if fd < 0 {
            return None;
        }
        self.fd_contexts
            .read()
            .get(fd as usize)
            .and_then(|slot| slot.clone())
    }

    fn ensure_context(&self, fd: RawFd) -> Arc<FdEventCtx> {
        if let Some(ctx) = self.lookup_context(fd) {
            return ctx;
        }
        let mut table = self.fd_contexts.write();
        let idx = fd as usize;
        if idx >= table.len() {
            table.resize((idx + 1) * 3 / 2, None);
        }
        table[idx]
            .get_or_insert_with(|| {
                Arc::new(FdEventCtx {
                    fd,
                    inner: Mutex::new(FdEventInner::default()),
                })
            })
            .clone()
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.tickle_fds[0], buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Stop predicate plus the bounded wait the idle loop should use.
    fn stopping_with_timeout(&self) -> (bool, Option<u64>) {
        let next = self.timers.next_timeout();
        let stop = next.is_none()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.scheduler.default_stopping();
        (stop, next)
    }

    fn close_fds(&self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

impl SchedulerHooks for IoManager {
    fn bind_worker(&self) {
        CURRENT_IOM.with(|c| *c.borrow_mut() = self.weak_self.clone());
    }

    fn tickle(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }
        let byte = [b'T'];
        let rc = unsafe { libc::write(self.tickle_fds[1], byte.as_ptr().cast(), 1) };
        if rc < 0 && errno() != libc::EAGAIN {
            warn!("tickle write failed: errno {}", errno());
        }
    }

    /// One epoll turn per resume: wait (bounded by the next timer and a
    /// 3 s cap), hand out ready bindings, sweep expired timers, then
    /// yield so the dispatch loop can run what was scheduled.
    fn idle(&self) {
        debug!("idle fiber enter (epfd {})", self.epfd);
        const MAX_EVENTS: usize = 256;
        const MAX_TIMEOUT_MS: u64 = 3000;

        let mut events = vec![
            libc::epoll_event { events: 0, u64: 0 };
            MAX_EVENTS
        ];

        loop {
            let (stop, next_timeout) = self.stopping_with_timeout();
            if stop {
                break;
            }
            let timeout_ms = next_timeout.unwrap_or(MAX_TIMEOUT_MS).min(MAX_TIMEOUT_MS) as libc::c_int;

            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout_ms)
                };
                if rc >= 0 {
                    break rc as usize;
                }
                if errno() != libc::EINTR {
                    error!("epoll_wait failed: errno {}", errno());
                    break 0;
                }
            };

            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                if fd == self.tickle_fds[0] {
                    self.drain_tickle_pipe();
                    continue;
                }
                let Some(ctx) = self.lookup_context(fd) else {
                    continue;
                };
                let mut inner = ctx.inner.lock();

                // error/hangup wakes every bound side so it can observe
                // the failure through its own syscall
                let mut real = ev.events & (READ_MASK | WRITE_MASK);
                if ev.events & ERROR_MASK != 0 {
                    real |= (READ_MASK | WRITE_MASK) & inner.events;
                }
                if real & inner.events == 0 {
                    continue;
                }

                let left = inner.events & !real;
                let op = if left != 0 {
                    libc::EPOLL_CTL_MOD
                } else {
                    libc::EPOLL_CTL_DEL
                };
                let _ = self.epoll_update(op, ctx.fd, left);

                if real & READ_MASK != 0 {
                    self.trigger(&mut inner, Event::Read);
                }
                if real & WRITE_MASK != 0 {
                    self.trigger(&mut inner, Event::Write);
                }
            }

            let mut expired: Vec<TimerCallback> = Vec::new();
            self.timers.collect_expired(&mut expired);
            for cb in expired {
                self.scheduler.schedule(move || cb());
            }

            Fiber::yield_now();
        }
        debug!("idle fiber exit (epfd {})", self.epfd);
    }

    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.scheduler.default_stopping()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // workers hold only weak references back to the manager, so by
        // the time this runs the scheduler may still be live; stop joins
        // it before the epoll fd goes away
        self.scheduler.stop();
        self.close_fds();
        debug!("io manager dropped (epfd {})", self.epfd);
    }
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
