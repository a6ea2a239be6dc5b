//! Counting semaphore
//!
//! Used for OS-thread handshakes, the main one being "start() does not
//! return until every worker has registered its thread id". Fibers must not
//! wait on this: it parks the whole worker thread.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore over a mutex and condvar.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with the given initial permit count.
    pub fn new(initial: u32) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block the calling thread until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Release one permit, waking a waiter if any.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_semaphore_initial_permits() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        sem.post();
        sem.wait();
    }

    #[test]
    fn test_semaphore_cross_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);

        let h = thread::spawn(move || {
            for _ in 0..8 {
                sem2.post();
            }
        });

        for _ in 0..8 {
            sem.wait();
        }
        h.join().unwrap();
    }
}
