/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::lock::Lock;
use super::semaphore::Semaphore;
use crate::kernel::Kernel;

/// Mesa-style condition variable. Each wait parks on a private semaphore so
/// a signal wakes exactly the longest waiter; a signal with no waiter is
/// lost. The associated lock must be held around every operation.
pub struct Condition {
    name: String,
    waiters: Mutex<VecDeque<Arc<Semaphore>>>,
}

impl Condition {
    pub fn new(name: &str) -> Self {
        Condition {
            name: name.to_owned(),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Atomically releases `lock`, suspends, and reacquires `lock` before
    /// returning. The caller must recheck its predicate: by the time the
    /// waiter runs again the state may have changed.
    pub fn wait(&self, kernel: &Arc<Kernel>, lock: &Lock) {
        assert!(
            lock.is_held_by_current_thread(),
            "condition '{}': wait without holding '{}'",
            self.name,
            lock.name()
        );
        let waiter = Arc::new(Semaphore::new(&self.name, 0));
        self.waiters.lock().unwrap().push_back(waiter.clone());
        lock.release(kernel);
        waiter.p(kernel);
        lock.acquire(kernel);
    }

    /// Wakes one waiter, if any.
    pub fn signal(&self, kernel: &Arc<Kernel>, lock: &Lock) {
        assert!(lock.is_held_by_current_thread());
        let waiter = self.waiters.lock().unwrap().pop_front();
        if let Some(w) = waiter {
            w.v(kernel);
        }
    }

    /// Wakes every waiter.
    pub fn broadcast(&self, kernel: &Arc<Kernel>, lock: &Lock) {
        assert!(lock.is_held_by_current_thread());
        let drained: Vec<_> = self.waiters.lock().unwrap().drain(..).collect();
        for w in drained {
            w.v(kernel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;
    use crate::threads::thread::{self, Thread};
    use crate::threads::Priority;

    #[test]
    fn test_signal_wakes_one() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let lock = Arc::new(Lock::new("l"));
            let cond = Arc::new(Condition::new("c"));
            let woken = Arc::new(Mutex::new(0u32));
            for i in 0..2 {
                let l = lock.clone();
                let c = cond.clone();
                let w = woken.clone();
                Thread::fork(k, &format!("w{}", i), Priority::Normal, false, move |k| {
                    l.acquire(k);
                    c.wait(k, &l);
                    *w.lock().unwrap() += 1;
                    l.release(k);
                });
            }
            // Let both waiters block.
            while k.scheduler.has_ready() {
                thread::yield_now(k);
            }
            lock.acquire(k);
            cond.signal(k, &lock);
            lock.release(k);
            while k.scheduler.has_ready() {
                thread::yield_now(k);
            }
            assert_eq!(*woken.lock().unwrap(), 1);

            lock.acquire(k);
            cond.broadcast(k, &lock);
            lock.release(k);
            while k.scheduler.has_ready() {
                thread::yield_now(k);
            }
            assert_eq!(*woken.lock().unwrap(), 2);
        });
    }

    #[test]
    fn test_signal_without_waiter_is_lost() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let lock = Lock::new("l");
            let cond = Condition::new("c");
            lock.acquire(k);
            cond.signal(k, &lock);
            cond.broadcast(k, &lock);
            lock.release(k);
        });
    }
}
