/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use super::thread::{self, Thread, ThreadState};
use super::{Priority, NUM_PRIORITIES};
use crate::kernel::Kernel;
use crate::machine::interrupt::IntLevel;
use crate::stats::Statistics;

struct SchedulerInner {
    queues: [VecDeque<Arc<Thread>>; NUM_PRIORITIES],
    current: Option<Arc<Thread>>,
    to_destroy: Option<Arc<Thread>>,
}

/// Multi-level priority ready queue, FIFO within each priority. All entry
/// points require interrupts to be off; the ready queues are shared with
/// device handlers, which run with interrupts off as well.
pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
    thread_ids: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Mutex::new(SchedulerInner {
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                current: None,
                to_destroy: None,
            }),
            thread_ids: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_thread_id(&self) -> u64 {
        self.thread_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn set_current(&self, thread: Arc<Thread>) {
        self.inner.lock().unwrap().current = Some(thread);
    }

    /// Puts a thread on the ready queue for its current priority.
    pub fn ready_to_run(&self, kernel: &Arc<Kernel>, thread: Arc<Thread>) {
        debug_assert_eq!(kernel.interrupt.level(), IntLevel::Off);
        trace!(target: "threads", "ready '{}' ({:?})", thread.name(), thread.priority());
        thread.set_state(ThreadState::Ready);
        let index = thread.priority().queue_index();
        self.inner.lock().unwrap().queues[index].push_back(thread);
    }

    /// Picks the next thread to dispatch: the front of the highest-priority
    /// non-empty queue.
    pub fn find_next_to_run(&self) -> Option<Arc<Thread>> {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.iter_mut().find_map(|q| q.pop_front())
    }

    pub fn has_ready(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.queues.iter().any(|q| !q.is_empty())
    }

    /// Boosts a thread to `priority` (priority inheritance). A thread already
    /// on a ready queue moves to the queue of its new priority.
    pub fn prioritize(&self, kernel: &Arc<Kernel>, thread: &Arc<Thread>, priority: Priority) {
        debug_assert_eq!(kernel.interrupt.level(), IntLevel::Off);
        if thread.priority() == priority {
            return;
        }
        trace!(
            target: "threads",
            "boost '{}' {:?} -> {:?}",
            thread.name(),
            thread.priority(),
            priority
        );
        self.requeue(thread, priority);
    }

    /// Undoes a priority-inheritance boost.
    pub fn restore_original_priority(&self, kernel: &Arc<Kernel>, thread: &Arc<Thread>) {
        debug_assert_eq!(kernel.interrupt.level(), IntLevel::Off);
        let original = thread.original_priority();
        if thread.priority() != original {
            self.requeue(thread, original);
        }
    }

    fn requeue(&self, thread: &Arc<Thread>, priority: Priority) {
        let mut inner = self.inner.lock().unwrap();
        let old_index = thread.priority().queue_index();
        let queued = inner.queues[old_index]
            .iter()
            .position(|t| Arc::ptr_eq(t, thread));
        if let Some(at) = queued {
            inner.queues[old_index].remove(at);
        }
        thread.set_priority(priority);
        if queued.is_some() {
            inner.queues[priority.queue_index()].push_back(thread.clone());
        }
    }

    /// Switches from the calling thread to `next`. The caller must already
    /// have left the ready queue in whatever state it wants (requeued for a
    /// yield, absent for a sleep). Returns when the caller is dispatched
    /// again. `next` may be the caller itself: a sleeper with no company is
    /// readied by a device handler out of its own idle loop, and granting
    /// the baton to itself before parking makes that switch a no-op.
    pub fn run(&self, kernel: &Arc<Kernel>, next: Arc<Thread>) {
        let prev = thread::current();
        self.dispatch(kernel, next);
        prev.park();
        self.reap();
    }

    /// Terminal switch: record the caller for destruction and dispatch the
    /// next thread without arranging to ever come back.
    pub(crate) fn finish_current(&self, kernel: &Arc<Kernel>) {
        let me = thread::current();
        me.set_state(ThreadState::Terminated);
        self.inner.lock().unwrap().to_destroy = Some(me);
        let next = loop {
            if let Some(next) = self.find_next_to_run() {
                break next;
            }
            kernel.interrupt.idle(kernel);
        };
        self.dispatch(kernel, next);
    }

    /// Detaches the host thread of the previously finished thread, if any.
    /// Called by each thread as it comes back from a switch.
    pub(crate) fn reap(&self) {
        let dead = self.inner.lock().unwrap().to_destroy.take();
        if let Some(t) = dead {
            drop(t.take_host());
        }
    }

    fn dispatch(&self, kernel: &Arc<Kernel>, next: Arc<Thread>) {
        debug_assert_eq!(kernel.interrupt.level(), IntLevel::Off);
        trace!(target: "threads", "dispatch '{}'", next.name());
        Statistics::bump(&kernel.stats.context_switches);
        next.set_state(ThreadState::Running);
        let prev = self.inner.lock().unwrap().current.replace(next.clone());
        crate::vm::address_space::switch_space(kernel, prev.as_ref(), &next);
        next.wake();
    }
}
