/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::kernel::Kernel;
use crate::stats::Statistics;

/// Whether the simulated CPU accepts interrupts. All synchronization
/// primitives achieve atomicity by running with interrupts off; nothing else
/// touches this flag directly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IntLevel {
    Off,
    On,
}

type Handler = Box<dyn FnOnce(&Arc<Kernel>) + Send>;

struct Pending {
    when: u64,
    seq: u64,
    what: &'static str,
    handler: Handler,
}

// BinaryHeap is a max-heap; order pending interrupts so the earliest
// (when, seq) is the greatest element.
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.when, other.seq).cmp(&(self.when, self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Pending {}

struct InterruptInner {
    level: IntLevel,
    ticks: u64,
    seq: u64,
    pending: BinaryHeap<Pending>,
    yield_on_return: bool,
}

/// The simulated interrupt machinery: the interrupt-enable level, the tick
/// clock, and the queue of scheduled device interrupts.
///
/// Simulated time advances by one tick every time interrupts go from off to
/// on, and jumps forward when the machine idles with requests in flight.
/// Device handlers always run with interrupts off; a handler that wants the
/// interrupted thread to give up the CPU sets the yield-on-return flag
/// instead of switching inline.
pub struct Interrupt {
    inner: Mutex<InterruptInner>,
}

impl Interrupt {
    pub fn new() -> Self {
        Interrupt {
            inner: Mutex::new(InterruptInner {
                level: IntLevel::On,
                ticks: 0,
                seq: 0,
                pending: BinaryHeap::new(),
                yield_on_return: false,
            }),
        }
    }

    pub fn level(&self) -> IntLevel {
        self.inner.lock().unwrap().level
    }

    pub fn ticks(&self) -> u64 {
        self.inner.lock().unwrap().ticks
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().unwrap().pending.is_empty()
    }

    /// Whether anything other than the self-rescheduling timer is in
    /// flight. The run loop drains until only the timer remains; waiting on
    /// the timer alone would spin forever.
    pub fn has_device_pending(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .pending
            .iter()
            .any(|p| p.what != "timer")
    }

    /// Changes the interrupt level and returns the previous one. Re-enabling
    /// advances the clock one tick, delivers any interrupts that came due and
    /// honors a pending yield-on-return request.
    pub fn set_level(&self, kernel: &Arc<Kernel>, new: IntLevel) -> IntLevel {
        let old = self.inner.lock().unwrap().level;
        if old == IntLevel::Off && new == IntLevel::On {
            self.one_tick(kernel);
        }
        self.inner.lock().unwrap().level = new;
        if new == IntLevel::On {
            self.maybe_yield(kernel);
        }
        old
    }

    pub fn disable(&self, kernel: &Arc<Kernel>) -> IntLevel {
        self.set_level(kernel, IntLevel::Off)
    }

    /// Schedules `handler` to fire `delay` ticks from now. May be called at
    /// any interrupt level.
    pub fn schedule(
        &self,
        delay: u64,
        what: &'static str,
        handler: impl FnOnce(&Arc<Kernel>) + Send + 'static,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let when = inner.ticks + delay.max(1);
        let seq = inner.seq;
        inner.seq += 1;
        trace!(target: "interrupt", "schedule '{}' at tick {}", what, when);
        inner.pending.push(Pending {
            when,
            seq,
            what,
            handler: Box::new(handler),
        });
    }

    /// Called when no thread is ready: jump the clock to the next pending
    /// interrupt and deliver it, so a device completion can ready a sleeper.
    /// An idle machine with nothing in flight is a deadlocked simulation.
    pub fn idle(&self, kernel: &Arc<Kernel>) {
        {
            let mut inner = self.inner.lock().unwrap();
            let due = inner
                .pending
                .peek()
                .expect("machine idle with no pending interrupts: all threads are blocked")
                .when;
            if due > inner.ticks {
                Statistics::add(&kernel.stats.idle_ticks, due - inner.ticks);
                Statistics::add(&kernel.stats.total_ticks, due - inner.ticks);
                inner.ticks = due;
            }
        }
        self.deliver_due(kernel);
    }

    /// Request a yield once the current handler returns and interrupts are
    /// back on. Called from device handlers (the timer).
    pub fn yield_on_return(&self) {
        self.inner.lock().unwrap().yield_on_return = true;
    }

    fn one_tick(&self, kernel: &Arc<Kernel>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.ticks += 1;
        }
        Statistics::bump(&kernel.stats.total_ticks);
        self.deliver_due(kernel);
    }

    fn deliver_due(&self, kernel: &Arc<Kernel>) {
        loop {
            let due = {
                let mut inner = self.inner.lock().unwrap();
                match inner.pending.peek() {
                    Some(p) if p.when <= inner.ticks => inner.pending.pop(),
                    _ => None,
                }
            };
            let Some(p) = due else { break };
            trace!(target: "interrupt", "deliver '{}' at tick {}", p.what, self.ticks());
            (p.handler)(kernel);
        }
    }

    fn maybe_yield(&self, kernel: &Arc<Kernel>) {
        let wants_yield = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.yield_on_return)
        };
        if wants_yield {
            crate::threads::thread::yield_now(kernel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;

    #[test]
    fn test_reenable_advances_clock() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let before = k.interrupt.ticks();
            let old = k.interrupt.disable(k);
            assert_eq!(old, IntLevel::On);
            assert_eq!(k.interrupt.set_level(k, IntLevel::On), IntLevel::Off);
            assert_eq!(k.interrupt.ticks(), before + 1);
        });
    }

    #[test]
    fn test_scheduled_handler_fires_when_due() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let fired = Arc::new(Mutex::new(false));
            let flag = fired.clone();
            k.interrupt.schedule(3, "test", move |_| {
                *flag.lock().unwrap() = true;
            });
            assert!(k.interrupt.has_pending());
            // Not due yet after one tick.
            k.interrupt.disable(k);
            k.interrupt.set_level(k, IntLevel::On);
            assert!(!*fired.lock().unwrap());
            for _ in 0..3 {
                k.interrupt.disable(k);
                k.interrupt.set_level(k, IntLevel::On);
            }
            assert!(*fired.lock().unwrap());
            assert!(!k.interrupt.has_pending());
        });
    }

    #[test]
    fn test_idle_jumps_to_next_interrupt() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let fired = Arc::new(Mutex::new(false));
            let flag = fired.clone();
            k.interrupt.schedule(500, "test", move |_| {
                *flag.lock().unwrap() = true;
            });
            let old = k.interrupt.disable(k);
            k.interrupt.idle(k);
            k.interrupt.set_level(k, old);
            assert!(*fired.lock().unwrap());
            assert!(k.interrupt.ticks() >= 500);
        });
    }
}
