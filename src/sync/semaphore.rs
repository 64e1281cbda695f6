/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::kernel::Kernel;
use crate::threads::thread::{self, Thread};

struct SemaphoreInner {
    count: u32,
    queue: VecDeque<Arc<Thread>>,
}

/// Counting semaphore, never negative. Atomicity comes from disabling the
/// simulated interrupts around the counter and queue updates; this is the
/// only primitive that touches the interrupt level directly. Waiters wake in
/// FIFO order.
pub struct Semaphore {
    name: String,
    inner: Mutex<SemaphoreInner>,
}

impl Semaphore {
    pub fn new(name: &str, count: u32) -> Self {
        Semaphore {
            name: name.to_owned(),
            inner: Mutex::new(SemaphoreInner {
                count,
                queue: VecDeque::new(),
            }),
        }
    }

    /// Decrements the count, blocking while it is zero.
    pub fn p(&self, kernel: &Arc<Kernel>) {
        let old = kernel.interrupt.disable(kernel);
        loop {
            let mut inner = self.inner.lock().unwrap();
            if inner.count == 0 {
                trace!(target: "threads", "'{}' blocks on '{}'", thread::current().name(), self.name);
                inner.queue.push_back(thread::current());
                drop(inner);
                thread::sleep(kernel);
            } else {
                inner.count -= 1;
                break;
            }
        }
        kernel.interrupt.set_level(kernel, old);
    }

    /// Increments the count and readies the longest-waiting thread, if any.
    pub fn v(&self, kernel: &Arc<Kernel>) {
        let old = kernel.interrupt.disable(kernel);
        let woken = {
            let mut inner = self.inner.lock().unwrap();
            inner.count += 1;
            inner.queue.pop_front()
        };
        if let Some(t) = woken {
            kernel.scheduler.ready_to_run(kernel, t);
        }
        kernel.interrupt.set_level(kernel, old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;
    use crate::threads::thread::Thread;
    use crate::threads::Priority;

    #[test]
    fn test_p_then_v_no_block() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let sem = Semaphore::new("t", 2);
            sem.p(k);
            sem.p(k);
            sem.v(k);
            sem.p(k);
        });
    }

    #[test]
    fn test_v_wakes_waiter() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let sem = Arc::new(Semaphore::new("t", 0));
            let done = Arc::new(Semaphore::new("done", 0));
            let s = sem.clone();
            let d = done.clone();
            Thread::fork(k, "waiter", Priority::Normal, false, move |k| {
                s.p(k);
                d.v(k);
            });
            sem.v(k);
            done.p(k);
        });
    }

    #[test]
    fn test_fifo_wakeups() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let sem = Arc::new(Semaphore::new("t", 0));
            let order = Arc::new(Mutex::new(Vec::new()));
            for i in 0..3 {
                let s = sem.clone();
                let o = order.clone();
                Thread::fork(k, &format!("w{}", i), Priority::Normal, false, move |k| {
                    s.p(k);
                    o.lock().unwrap().push(i);
                });
            }
            // Let all three workers block on the semaphore in fork order.
            thread::yield_now(k);
            for _ in 0..3 {
                sem.v(k);
                thread::yield_now(k);
            }
            assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        });
    }
}
