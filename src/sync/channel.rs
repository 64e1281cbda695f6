/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::{Arc, Mutex};

use super::lock::Lock;
use super::semaphore::Semaphore;
use crate::kernel::Kernel;

/// Unbuffered rendezvous channel carrying one machine word. Exactly one
/// sender meets exactly one receiver per transaction; either side blocks
/// until the other arrives, and the channel holds no state in between.
/// Senders serialize among themselves, as do receivers, so the receiver
/// always observes the value written by its paired sender.
pub struct Channel {
    send_lock: Lock,
    receive_lock: Lock,
    slot: Mutex<i32>,
    full: Semaphore,
    empty: Semaphore,
}

impl Channel {
    pub fn new() -> Self {
        Channel {
            send_lock: Lock::new("channel-send"),
            receive_lock: Lock::new("channel-receive"),
            slot: Mutex::new(0),
            full: Semaphore::new("channel-full", 0),
            empty: Semaphore::new("channel-empty", 0),
        }
    }

    /// Blocks until a receiver has taken `value`.
    pub fn send(&self, kernel: &Arc<Kernel>, value: i32) {
        self.send_lock.acquire(kernel);
        *self.slot.lock().unwrap() = value;
        self.full.v(kernel);
        self.empty.p(kernel);
        self.send_lock.release(kernel);
    }

    /// Blocks until a sender provides a value, then returns it.
    pub fn receive(&self, kernel: &Arc<Kernel>) -> i32 {
        self.receive_lock.acquire(kernel);
        self.full.p(kernel);
        let value = *self.slot.lock().unwrap();
        self.empty.v(kernel);
        self.receive_lock.release(kernel);
        value
    }
}

impl Default for Channel {
    fn default() -> Self {
        Channel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;
    use crate::threads::thread::{self, Thread};
    use crate::threads::Priority;

    #[test]
    fn test_send_meets_receive() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let ch = Arc::new(Channel::new());
            let c = ch.clone();
            Thread::fork(k, "sender", Priority::Normal, false, move |k| {
                c.send(k, 42);
            });
            assert_eq!(ch.receive(k), 42);
        });
    }

    #[test]
    fn test_receive_blocks_until_send() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let ch = Arc::new(Channel::new());
            let got = Arc::new(Mutex::new(None));
            let c = ch.clone();
            let g = got.clone();
            Thread::fork(k, "receiver", Priority::Normal, false, move |k| {
                *g.lock().unwrap() = Some(c.receive(k));
            });
            thread::yield_now(k);
            assert_eq!(*got.lock().unwrap(), None);
            ch.send(k, 7);
            while k.scheduler.has_ready() {
                thread::yield_now(k);
            }
            assert_eq!(*got.lock().unwrap(), Some(7));
        });
    }

    /// Many senders and receivers: every send pairs with exactly one
    /// receive and nothing is lost or duplicated.
    #[test]
    fn test_many_to_many() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let ch = Arc::new(Channel::new());
            let received = Arc::new(Mutex::new(Vec::new()));
            for s in 0..6 {
                let c = ch.clone();
                Thread::fork(k, &format!("s{}", s), Priority::Normal, false, move |k| {
                    for v in 0..4 {
                        c.send(k, s * 4 + v);
                    }
                });
            }
            for r in 0..4 {
                let c = ch.clone();
                let out = received.clone();
                Thread::fork(k, &format!("r{}", r), Priority::Normal, false, move |k| {
                    for _ in 0..6 {
                        let v = c.receive(k);
                        out.lock().unwrap().push(v);
                    }
                });
            }
            while k.scheduler.has_ready() {
                thread::yield_now(k);
            }
            let mut got = received.lock().unwrap().clone();
            got.sort_unstable();
            let want: Vec<i32> = (0..24).collect();
            assert_eq!(got, want);
        });
    }
}
