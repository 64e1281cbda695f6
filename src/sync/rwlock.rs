/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::{Arc, Mutex};

use super::condition::Condition;
use super::lock::Lock;
use crate::kernel::Kernel;
use crate::threads::thread;

struct RwState {
    active_readers: u32,
    waiting_writers: u32,
    active_writer: Option<u64>,
}

/// Multiple-reader, single-writer lock with writer priority: a reader yields
/// whenever a writer is waiting or writing. A writer that takes the read
/// side while holding the write side gets a no-op, so a writer may call
/// read paths freely.
pub struct ReadWriteLock {
    lock: Lock,
    changed: Condition,
    state: Mutex<RwState>,
}

impl ReadWriteLock {
    pub fn new(name: &str) -> Self {
        ReadWriteLock {
            lock: Lock::new(name),
            changed: Condition::new(name),
            state: Mutex::new(RwState {
                active_readers: 0,
                waiting_writers: 0,
                active_writer: None,
            }),
        }
    }

    fn holds_write(&self) -> bool {
        self.state.lock().unwrap().active_writer == Some(thread::current().id())
    }

    pub fn acquire_read(&self, kernel: &Arc<Kernel>) {
        if self.holds_write() {
            return;
        }
        self.lock.acquire(kernel);
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.waiting_writers == 0 && state.active_writer.is_none() {
                    state.active_readers += 1;
                    break;
                }
            }
            self.changed.wait(kernel, &self.lock);
        }
        self.lock.release(kernel);
    }

    pub fn release_read(&self, kernel: &Arc<Kernel>) {
        if self.holds_write() {
            return;
        }
        self.lock.acquire(kernel);
        {
            let mut state = self.state.lock().unwrap();
            assert!(state.active_readers > 0, "release_read with no reader");
            state.active_readers -= 1;
        }
        self.changed.broadcast(kernel, &self.lock);
        self.lock.release(kernel);
    }

    pub fn acquire_write(&self, kernel: &Arc<Kernel>) {
        assert!(!self.holds_write(), "write lock acquired recursively");
        self.lock.acquire(kernel);
        self.state.lock().unwrap().waiting_writers += 1;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.active_readers == 0 && state.active_writer.is_none() {
                    state.waiting_writers -= 1;
                    state.active_writer = Some(thread::current().id());
                    break;
                }
            }
            self.changed.wait(kernel, &self.lock);
        }
        self.lock.release(kernel);
    }

    pub fn release_write(&self, kernel: &Arc<Kernel>) {
        self.lock.acquire(kernel);
        {
            let mut state = self.state.lock().unwrap();
            assert_eq!(
                state.active_writer,
                Some(thread::current().id()),
                "release_write by a thread that does not hold the write lock"
            );
            state.active_writer = None;
        }
        self.changed.broadcast(kernel, &self.lock);
        self.lock.release(kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;
    use crate::threads::thread::Thread;
    use crate::threads::Priority;

    #[test]
    fn test_readers_share() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let rw = Arc::new(ReadWriteLock::new("rw"));
            rw.acquire_read(k);
            let r = rw.clone();
            let entered = Arc::new(Mutex::new(false));
            let e = entered.clone();
            Thread::fork(k, "reader", Priority::Normal, false, move |k| {
                r.acquire_read(k);
                *e.lock().unwrap() = true;
                r.release_read(k);
            });
            while k.scheduler.has_ready() {
                thread::yield_now(k);
            }
            // The second reader got in while we still hold the read side.
            assert!(*entered.lock().unwrap());
            rw.release_read(k);
        });
    }

    #[test]
    fn test_writer_reentrant_read_is_noop() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let rw = ReadWriteLock::new("rw");
            rw.acquire_write(k);
            rw.acquire_read(k);
            rw.release_read(k);
            rw.release_write(k);
        });
    }

    /// Writer exclusion and writer priority: readers arriving while a write
    /// is held (or queued) block until the writer is done, and no reader
    /// observes a partially applied write.
    #[test]
    fn test_writer_excludes_readers() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let rw = Arc::new(ReadWriteLock::new("rw"));
            let data = Arc::new(Mutex::new((0u32, 0u32)));

            rw.acquire_write(k);
            for i in 0..2 {
                let r = rw.clone();
                let d = data.clone();
                Thread::fork(k, &format!("r{}", i), Priority::Normal, false, move |k| {
                    r.acquire_read(k);
                    let pair = *d.lock().unwrap();
                    // Both halves move together or not at all.
                    assert_eq!(pair.0, pair.1);
                    r.release_read(k);
                });
            }
            // Readers block; mutate both halves with a yield in between to
            // tempt any reader that slipped through.
            while k.scheduler.has_ready() {
                thread::yield_now(k);
            }
            data.lock().unwrap().0 = 7;
            thread::yield_now(k);
            data.lock().unwrap().1 = 7;
            rw.release_write(k);
            while k.scheduler.has_ready() {
                thread::yield_now(k);
            }
        });
    }
}
