/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::{Arc, Mutex};

use super::semaphore::Semaphore;
use crate::kernel::Kernel;
use crate::threads::thread::{self, Thread};

/// Mutual exclusion built on a binary semaphore. Acquiring a lock already
/// held by the caller is an error. While held, the lock records its owner,
/// and acquisition performs single-hop priority inheritance: a caller with
/// higher priority than the current owner boosts the owner to its own
/// priority until the owner releases.
pub struct Lock {
    name: String,
    semaphore: Semaphore,
    holder: Mutex<Option<Arc<Thread>>>,
}

impl Lock {
    pub fn new(name: &str) -> Self {
        Lock {
            name: name.to_owned(),
            semaphore: Semaphore::new(name, 1),
            holder: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        match self.holder.lock().unwrap().as_ref() {
            Some(h) => Arc::ptr_eq(h, &thread::current()),
            None => false,
        }
    }

    pub fn acquire(&self, kernel: &Arc<Kernel>) {
        assert!(
            !self.is_held_by_current_thread(),
            "lock '{}' acquired recursively",
            self.name
        );
        let me = thread::current();
        let old = kernel.interrupt.disable(kernel);
        if let Some(owner) = self.holder.lock().unwrap().as_ref() {
            if owner.priority() < me.priority() {
                kernel.scheduler.prioritize(kernel, owner, me.priority());
            }
        }
        kernel.interrupt.set_level(kernel, old);
        self.semaphore.p(kernel);
        *self.holder.lock().unwrap() = Some(me);
    }

    pub fn release(&self, kernel: &Arc<Kernel>) {
        assert!(
            self.is_held_by_current_thread(),
            "lock '{}' released by a thread that does not hold it",
            self.name
        );
        let me = thread::current();
        *self.holder.lock().unwrap() = None;
        let old = kernel.interrupt.disable(kernel);
        kernel.scheduler.restore_original_priority(kernel, &me);
        kernel.interrupt.set_level(kernel, old);
        self.semaphore.v(kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;
    use crate::threads::Priority;

    #[test]
    fn test_mutual_exclusion() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let lock = Arc::new(Lock::new("t"));
            let hits = Arc::new(Mutex::new(0u32));
            for i in 0..4 {
                let l = lock.clone();
                let h = hits.clone();
                Thread::fork(k, &format!("w{}", i), Priority::Normal, false, move |k| {
                    l.acquire(k);
                    let before = *h.lock().unwrap();
                    thread::yield_now(k);
                    *h.lock().unwrap() = before + 1;
                    l.release(k);
                });
            }
            lock.acquire(k);
            lock.release(k);
            while k.scheduler.has_ready() {
                thread::yield_now(k);
            }
            assert_eq!(*hits.lock().unwrap(), 4);
        });
    }

    #[test]
    fn test_held_by_current_thread() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let lock = Lock::new("t");
            assert!(!lock.is_held_by_current_thread());
            lock.acquire(k);
            assert!(lock.is_held_by_current_thread());
            lock.release(k);
            assert!(!lock.is_held_by_current_thread());
        });
    }

    #[test]
    fn test_priority_inheritance() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let lock = Arc::new(Lock::new("t"));
            let observed = Arc::new(Mutex::new(Vec::new()));
            let l = lock.clone();
            let o = observed.clone();
            let low = Thread::fork(k, "low", Priority::Low, false, move |k| {
                l.acquire(k);
                thread::yield_now(k);
                // A high-priority contender has lent us its priority by now.
                o.lock().unwrap().push(thread::current().priority());
                l.release(k);
                o.lock().unwrap().push(thread::current().priority());
            });
            // Let the low-priority thread take the lock.
            thread::yield_now(k);
            assert_eq!(low.priority(), Priority::Low);

            let l = lock.clone();
            let low2 = low.clone();
            Thread::fork(k, "high", Priority::High, false, move |k| {
                l.acquire(k);
                // By the time we hold the lock, the boost has been undone.
                assert_eq!(low2.priority(), Priority::Low);
                l.release(k);
            });
            while k.scheduler.has_ready() {
                thread::yield_now(k);
            }
            assert_eq!(
                *observed.lock().unwrap(),
                vec![Priority::High, Priority::Low]
            );
        });
    }
}
