//! Absolute-deadline timers
//!
//! The manager keeps an ordered set keyed by `(deadline ms, timer id)`;
//! the id is allocation order, giving ties a stable total order. Expiry
//! never runs callbacks in place: `collect_expired` hands them out and
//! the caller decides where they execute (the reactor schedules them as
//! ordinary tasks).
//!
//! The clock is injectable so tests can steer it; the default reads
//! CLOCK_MONOTONIC. A backward jump of more than one hour is treated as
//! clock rollover and expires every live timer on the next sweep.

use log::warn;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback type shared between the manager and the collected batch.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

type ClockFn = Box<dyn Fn() -> u64 + Send + Sync>;
type FrontNotifyFn = Box<dyn Fn() + Send + Sync>;

/// Milliseconds from CLOCK_MONOTONIC.
pub fn current_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Backward jumps larger than this are treated as rollover.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

struct TimerSchedule {
    period_ms: u64,
    deadline_ms: u64,
}

/// Handle to one scheduled timer.
///
/// Dropping the handle does not cancel the timer; the manager keeps its
/// own reference until the timer fires or is cancelled.
pub struct Timer {
    id: u64,
    recurring: bool,
    sched: Mutex<TimerSchedule>,
    cb: Mutex<Option<TimerCallback>>,
    manager: Weak<TimerManager>,
}

impl Timer {
    /// Remove the timer. Returns false when it already fired or was
    /// cancelled, making repeated cancels harmless.
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = mgr.inner.write();
        let mut cb = self.cb.lock();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        let key = (self.sched.lock().deadline_ms, self.id);
        inner.timers.remove(&key);
        true
    }

    /// Push the deadline out to `now + period`.
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = mgr.inner.write();
        if self.cb.lock().is_none() {
            return false;
        }
        let mut sched = self.sched.lock();
        let old_key = (sched.deadline_ms, self.id);
        let Some(this) = inner.timers.remove(&old_key) else {
            return false;
        };
        sched.deadline_ms = mgr.now_ms() + sched.period_ms;
        inner.timers.insert((sched.deadline_ms, self.id), this);
        true
    }

    /// Change the period. The new deadline counts from `now` when
    /// `from_now` is set, otherwise from the previous scheduled base.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        {
            let sched = self.sched.lock();
            if sched.period_ms == period_ms && !from_now {
                return true;
            }
        }
        let mut inner = mgr.inner.write();
        if self.cb.lock().is_none() {
            return false;
        }
        let mut sched = self.sched.lock();
        let old_key = (sched.deadline_ms, self.id);
        let Some(this) = inner.timers.remove(&old_key) else {
            return false;
        };
        let start = if from_now {
            mgr.now_ms()
        } else {
            sched.deadline_ms.saturating_sub(sched.period_ms)
        };
        sched.period_ms = period_ms;
        sched.deadline_ms = start + period_ms;
        let key = (sched.deadline_ms, self.id);
        drop(sched);
        let at_front = mgr.insert_locked(&mut inner, key, this);
        drop(inner);
        if at_front {
            mgr.notify_front();
        }
        true
    }

}

struct TimerSetInner {
    timers: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Collapses a burst of head insertions into one notification;
    /// cleared whenever next_timeout is consulted.
    tickled: bool,
    previous_ms: u64,
}

/// Ordered timer set with conditional timers and rollover detection.
pub struct TimerManager {
    inner: RwLock<TimerSetInner>,
    clock: ClockFn,
    front_notify: Mutex<Option<FrontNotifyFn>>,
    next_id: AtomicU64,
}

impl TimerManager {
    /// Manager on the monotonic clock.
    pub fn new() -> Arc<TimerManager> {
        Self::with_clock(Box::new(current_ms))
    }

    /// Manager on a caller-supplied clock, for tests.
    pub fn with_clock(clock: ClockFn) -> Arc<TimerManager> {
        let now = clock();
        Arc::new(TimerManager {
            inner: RwLock::new(TimerSetInner {
                timers: BTreeMap::new(),
                tickled: false,
                previous_ms: now,
            }),
            clock,
            front_notify: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    /// Install the hook invoked when an insertion lands at the head of
    /// the set. The reactor uses this to re-arm its wait.
    pub fn set_front_notify<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.front_notify.lock() = Some(Box::new(f));
    }

    /// Schedule `cb` to run `period_ms` from now, reinserting with the
    /// same period when `recurring`.
    pub fn add_timer<F>(self: &Arc<Self>, period_ms: u64, recurring: bool, cb: F) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_arc(period_ms, recurring, Arc::new(cb))
    }

    fn add_timer_arc(
        self: &Arc<Self>,
        period_ms: u64,
        recurring: bool,
        cb: TimerCallback,
    ) -> Arc<Timer> {
        let deadline_ms = self.now_ms() + period_ms;
        let timer = Arc::new(Timer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            recurring,
            sched: Mutex::new(TimerSchedule {
                period_ms,
                deadline_ms,
            }),
            cb: Mutex::new(Some(cb)),
            manager: Arc::downgrade(self),
        });

        let key = (deadline_ms, timer.id);
        let at_front = {
            let mut inner = self.inner.write();
            self.insert_locked(&mut inner, key, timer.clone())
        };
        if at_front {
            self.notify_front();
        }
        timer
    }

    /// Like `add_timer`, but the callback only fires while `cond` still
    /// upgrades. Cancels completion-dependent work when its waiter goes
    /// away.
    pub fn add_conditional_timer<F>(
        self: &Arc<Self>,
        period_ms: u64,
        recurring: bool,
        cb: F,
        cond: Weak<dyn Any + Send + Sync>,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer(period_ms, recurring, move || {
            if cond.upgrade().is_some() {
                cb();
            }
        })
    }

    fn insert_locked(
        &self,
        inner: &mut TimerSetInner,
        key: (u64, u64),
        timer: Arc<Timer>,
    ) -> bool {
        inner.timers.insert(key, timer);
        let at_front = inner.timers.keys().next() == Some(&key) && !inner.tickled;
        if at_front {
            inner.tickled = true;
        }
        at_front
    }

    fn notify_front(&self) {
        if let Some(f) = self.front_notify.lock().as_ref() {
            f();
        }
    }

    /// Milliseconds until the head deadline; 0 when overdue, None when
    /// the set is empty.
    pub fn next_timeout(&self) -> Option<u64> {
        let mut inner = self.inner.write();
        inner.tickled = false;
        let (key, _) = inner.timers.iter().next()?;
        Some(key.0.saturating_sub(self.now_ms()))
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.read().timers.is_empty()
    }

    pub fn timer_count(&self) -> usize {
        self.inner.read().timers.len()
    }

    /// Append every due callback to `out`, reinserting recurring timers
    /// at `now + period` and clearing one-shot callbacks.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = self.now_ms();
        {
            if self.inner.read().timers.is_empty() {
                return;
            }
        }

        let mut inner = self.inner.write();
        if inner.timers.is_empty() {
            return;
        }

        let rollover = Self::detect_rollover(&mut inner, now);
        if rollover {
            warn!("clock rollover detected, expiring {} timers", inner.timers.len());
        }
        if !rollover && inner.timers.keys().next().map(|k| k.0 > now).unwrap_or(true) {
            return;
        }

        let expired = if rollover {
            std::mem::take(&mut inner.timers)
        } else {
            // Keys with deadline <= now sort strictly below (now+1, 0).
            let later = inner.timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut inner.timers, later)
        };

        for (_, timer) in expired {
            let cb = timer.cb.lock().clone();
            if timer.recurring {
                let key = {
                    let mut sched = timer.sched.lock();
                    sched.deadline_ms = now + sched.period_ms;
                    (sched.deadline_ms, timer.id)
                };
                inner.timers.insert(key, timer);
            } else {
                *timer.cb.lock() = None;
            }
            if let Some(cb) = cb {
                out.push(cb);
            }
        }
    }

    fn detect_rollover(inner: &mut TimerSetInner, now: u64) -> bool {
        let rollover =
            now < inner.previous_ms && now < inner.previous_ms.saturating_sub(ROLLOVER_WINDOW_MS);
        inner.previous_ms = now;
        rollover
    }

    fn now_ms(&self) -> u64 {
        (self.clock)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Test clock the cases can steer by hand.
    fn manual_clock(start: u64) -> (Arc<AtomicU64>, ClockFn) {
        let now = Arc::new(AtomicU64::new(start));
        let n = now.clone();
        (now, Box::new(move || n.load(Ordering::SeqCst)))
    }

    fn fired_recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> TimerCallback) {
        let hits: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let h = hits.clone();
        let make = move |tag: u32| -> TimerCallback {
            let h = h.clone();
            Arc::new(move || h.lock().push(tag))
        };
        (hits, make)
    }

    fn run_batch(out: Vec<TimerCallback>) {
        for cb in out {
            cb();
        }
    }

    #[test]
    fn test_collect_in_deadline_order() {
        let (now, clock) = manual_clock(1_000);
        let mgr = TimerManager::with_clock(clock);
        let (hits, make) = fired_recorder();

        // inserted out of order on purpose
        let c3 = make(3);
        let c1 = make(1);
        let c2 = make(2);
        mgr.add_timer(30, false, move || c3());
        mgr.add_timer(10, false, move || c1());
        mgr.add_timer(20, false, move || c2());

        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert!(out.is_empty(), "nothing is due yet");

        now.store(1_015, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert_eq!(out.len(), 1);
        run_batch(out);

        now.store(1_100, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert_eq!(out.len(), 2);
        run_batch(out);

        assert_eq!(*hits.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_same_deadline_fires_in_insertion_order() {
        let (now, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let (hits, make) = fired_recorder();

        for tag in 0..8u32 {
            let cb = make(tag);
            mgr.add_timer(100, false, move || cb());
        }

        now.store(100, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        run_batch(out);
        assert_eq!(*hits.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_next_timeout_sentinel_and_value() {
        let (now, clock) = manual_clock(5_000);
        let mgr = TimerManager::with_clock(clock);
        assert_eq!(mgr.next_timeout(), None);

        mgr.add_timer(400, false, || {});
        assert_eq!(mgr.next_timeout(), Some(400));

        now.store(5_300, Ordering::SeqCst);
        assert_eq!(mgr.next_timeout(), Some(100));

        now.store(6_000, Ordering::SeqCst);
        assert_eq!(mgr.next_timeout(), Some(0));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (_now, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = mgr.add_timer(50, false, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert_eq!(mgr.timer_count(), 0);
    }

    #[test]
    fn test_recurring_reinserts() {
        let (now, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        mgr.add_timer(100, true, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        for round in 1..=3u64 {
            now.store(round * 100, Ordering::SeqCst);
            let mut out = Vec::new();
            mgr.collect_expired(&mut out);
            assert_eq!(out.len(), 1, "round {}", round);
            run_batch(out);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(mgr.timer_count(), 1);
    }

    #[test]
    fn test_one_shot_clears_callback() {
        let (now, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let timer = mgr.add_timer(10, false, || {});

        now.store(50, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(mgr.timer_count(), 0);
        // fired timers cannot be cancelled or refreshed
        assert!(!timer.cancel());
        assert!(!timer.refresh());
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let (now, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = mgr.add_timer(100, false, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        now.store(90, Ordering::SeqCst);
        assert!(timer.refresh()); // deadline becomes 190

        now.store(150, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert!(out.is_empty());

        now.store(200, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_reset_from_now_and_from_base() {
        let (now, clock) = manual_clock(1_000);
        let mgr = TimerManager::with_clock(clock);
        let t = mgr.add_timer(100, false, || {}); // deadline 1100

        // keep the base: new deadline = (1100 - 100) + 300 = 1300
        assert!(t.reset(300, false));
        now.store(1_250, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert!(out.is_empty());

        // from now: deadline = 1250 + 50 = 1300 as well, then fire
        assert!(t.reset(50, true));
        now.store(1_300, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_rollover_expires_everything() {
        let start = 10 * ROLLOVER_WINDOW_MS;
        let (now, clock) = manual_clock(start);
        let mgr = TimerManager::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let f = fired.clone();
            mgr.add_timer(1_000_000, false, move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }

        // jump backward by far more than the rollover window
        now.store(1_000, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert_eq!(out.len(), 5);
        run_batch(out);
        assert_eq!(fired.load(Ordering::SeqCst), 5);
        assert_eq!(mgr.timer_count(), 0);
    }

    #[test]
    fn test_small_backward_step_is_not_rollover() {
        let (now, clock) = manual_clock(100_000);
        let mgr = TimerManager::with_clock(clock);
        mgr.add_timer(1_000_000, false, || {});

        now.store(99_000, Ordering::SeqCst); // 1s back, below the window
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        assert!(out.is_empty());
        assert_eq!(mgr.timer_count(), 1);
    }

    #[test]
    fn test_front_notify_collapses_bursts() {
        let (_now, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        mgr.set_front_notify(move || {
            n.fetch_add(1, Ordering::SeqCst);
        });

        mgr.add_timer(500, false, || {}); // head insert
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        mgr.add_timer(900, false, || {}); // not the head
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        mgr.add_timer(100, false, || {}); // head, but burst-collapsed
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        let _ = mgr.next_timeout(); // clears the collapse flag
        mgr.add_timer(50, false, || {});
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_conditional_timer_skips_dead_owner() {
        let (now, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));

        let owner: Arc<dyn Any + Send + Sync> = Arc::new(0u8);
        let f = fired.clone();
        mgr.add_conditional_timer(
            10,
            false,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&owner),
        );
        drop(owner);

        now.store(100, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        run_batch(out);
        assert_eq!(fired.load(Ordering::SeqCst), 0, "dead owner suppresses the callback");
    }

    #[test]
    fn test_conditional_timer_fires_for_live_owner() {
        let (now, clock) = manual_clock(0);
        let mgr = TimerManager::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));

        let owner: Arc<dyn Any + Send + Sync> = Arc::new(0u8);
        let f = fired.clone();
        mgr.add_conditional_timer(
            10,
            false,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&owner),
        );

        now.store(100, Ordering::SeqCst);
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        run_batch(out);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(owner);
    }
}
