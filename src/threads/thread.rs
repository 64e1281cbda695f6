/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::cell::RefCell;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, trace};

use super::Priority;
use crate::fs::open_file::OpenFile;
use crate::kernel::Kernel;
use crate::machine::interrupt::IntLevel;
use crate::machine::machine::NUM_TOTAL_REGS;
use crate::sync::channel::Channel;
use crate::vm::address_space::AddressSpace;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    JustCreated,
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// One simulated thread is one host thread, gated by a private run baton so
/// that exactly one simulated thread executes at any instant. Parking on the
/// baton is what "not having the CPU" means; every switch grants exactly one
/// other baton before the switching thread parks (or exits).
struct Baton {
    go: Mutex<bool>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Baton {
            go: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut go = self.go.lock().unwrap();
        while !*go {
            go = self.cv.wait(go).unwrap();
        }
        *go = false;
    }

    fn wake(&self) {
        *self.go.lock().unwrap() = true;
        self.cv.notify_one();
    }
}

struct ThreadInner {
    state: ThreadState,
    priority: Priority,
    original_priority: Priority,
}

/// Thread control block.
pub struct Thread {
    name: String,
    id: u64,
    joinable: bool,
    /// Rendezvous carrying the exit status to the (at most one) joiner.
    pub join_channel: Channel,
    baton: Baton,
    inner: Mutex<ThreadInner>,
    host: Mutex<Option<JoinHandle<()>>>,

    /// Per-thread open-file table; descriptors 0 and 1 are the console and
    /// are not stored here. Mutated only by the owning thread.
    pub files: Mutex<Vec<Option<OpenFile>>>,
    /// Current working directory, an open handle on a directory.
    pub cwd: Mutex<Option<OpenFile>>,
    /// Address space, present for exec'd process threads.
    pub space: Mutex<Option<Arc<AddressSpace>>>,
    /// Saved user registers while some other thread has the processor.
    pub user_registers: Mutex<[i32; NUM_TOTAL_REGS]>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

/// The simulated thread bound to the calling host thread.
pub fn current() -> Arc<Thread> {
    CURRENT
        .with(|c| c.borrow().clone())
        .expect("no simulated thread is bound to this host thread")
}

fn bind_current(thread: Arc<Thread>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(thread));
}

impl Thread {
    fn new(kernel: &Arc<Kernel>, name: &str, priority: Priority, joinable: bool) -> Self {
        Thread {
            name: name.to_owned(),
            id: kernel.scheduler.next_thread_id(),
            joinable,
            join_channel: Channel::new(),
            baton: Baton::new(),
            inner: Mutex::new(ThreadInner {
                state: ThreadState::JustCreated,
                priority,
                original_priority: priority,
            }),
            host: Mutex::new(None),
            files: Mutex::new(Vec::new()),
            cwd: Mutex::new(None),
            space: Mutex::new(None),
            user_registers: Mutex::new([0; NUM_TOTAL_REGS]),
        }
    }

    /// Wraps the calling host thread as the initial simulated thread.
    pub(crate) fn adopt_main(kernel: &Arc<Kernel>) -> Arc<Thread> {
        let main = Arc::new(Thread::new(kernel, "main", Priority::Normal, false));
        main.set_state(ThreadState::Running);
        bind_current(main.clone());
        kernel.scheduler.set_current(main.clone());
        main
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn joinable(&self) -> bool {
        self.joinable
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().unwrap().state
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.inner.lock().unwrap().state = state;
    }

    pub fn priority(&self) -> Priority {
        self.inner.lock().unwrap().priority
    }

    pub fn original_priority(&self) -> Priority {
        self.inner.lock().unwrap().original_priority
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.inner.lock().unwrap().priority = priority;
    }

    pub(crate) fn wake(&self) {
        self.baton.wake();
    }

    pub(crate) fn park(&self) {
        self.baton.wait();
    }

    pub(crate) fn take_host(&self) -> Option<JoinHandle<()>> {
        self.host.lock().unwrap().take()
    }

    /// Spawns a new simulated thread running `f` and puts it on the ready
    /// queue. On first dispatch the thread enables interrupts, runs `f`, and
    /// finishes with status 0 if `f` did not already finish it.
    pub fn fork<F>(
        kernel: &Arc<Kernel>,
        name: &str,
        priority: Priority,
        joinable: bool,
        f: F,
    ) -> Arc<Thread>
    where
        F: FnOnce(&Arc<Kernel>) + Send + 'static,
    {
        let thread = Arc::new(Thread::new(kernel, name, priority, joinable));
        debug!(target: "threads", "fork '{}' (id {}, {:?})", name, thread.id, priority);

        let hosted = thread.clone();
        let k = kernel.clone();
        let handle = std::thread::Builder::new()
            .name(format!("simos-{}", name))
            .spawn(move || {
                hosted.park();
                bind_current(hosted);
                k.scheduler.reap();
                k.interrupt.set_level(&k, IntLevel::On);
                // A panicking thread can never hand the CPU on; treat it as
                // a fatal kernel assert and take the machine down.
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&k))).is_err() {
                    eprintln!("simulated thread panicked; aborting");
                    std::process::abort();
                }
                finish(&k, 0);
            })
            .expect("failed to spawn host thread");
        *thread.host.lock().unwrap() = Some(handle);

        let old = kernel.interrupt.disable(kernel);
        kernel.scheduler.ready_to_run(kernel, thread.clone());
        kernel.interrupt.set_level(kernel, old);
        thread
    }

    /// Receives the exit status of a joinable thread. Defined only for
    /// joinable threads; a thread must not join itself.
    pub fn join(self: &Arc<Self>, kernel: &Arc<Kernel>) -> i32 {
        assert!(self.joinable(), "join on a non-joinable thread");
        assert!(
            !Arc::ptr_eq(self, &current()),
            "thread '{}' tried to join itself",
            self.name
        );
        self.join_channel.receive(kernel)
    }
}

/// Gives up the CPU to the next ready thread, if any, and requeues the
/// caller behind threads of its own priority.
pub fn yield_now(kernel: &Arc<Kernel>) {
    let old = kernel.interrupt.disable(kernel);
    if let Some(next) = kernel.scheduler.find_next_to_run() {
        let me = current();
        trace!(target: "threads", "'{}' yields to '{}'", me.name(), next.name());
        kernel.scheduler.ready_to_run(kernel, me);
        kernel.scheduler.run(kernel, next);
    }
    kernel.interrupt.set_level(kernel, old);
}

/// Blocks the caller. Interrupts must be off, and some other thread (or a
/// device handler) must have arranged to ready the caller again; sleep does
/// not requeue it. If nothing is ready the machine idles until a pending
/// device interrupt readies someone.
pub fn sleep(kernel: &Arc<Kernel>) {
    debug_assert_eq!(kernel.interrupt.level(), IntLevel::Off);
    let me = current();
    trace!(target: "threads", "'{}' sleeps", me.name());
    me.set_state(ThreadState::Blocked);
    let next = loop {
        if let Some(next) = kernel.scheduler.find_next_to_run() {
            break next;
        }
        kernel.interrupt.idle(kernel);
    };
    kernel.scheduler.run(kernel, next);
}

/// Terminates the calling thread: tears down its process attachments,
/// performs the join rendezvous if it is joinable, then hands the CPU on.
/// Never returns; the terminated thread's host thread parks for good and the
/// successor detaches it.
pub fn finish(kernel: &Arc<Kernel>, status: i32) -> ! {
    let me = current();
    debug!(target: "threads", "'{}' finishing with status {}", me.name(), status);
    crate::userprog::process::teardown(kernel, &me);
    if me.joinable {
        me.join_channel.send(kernel, status);
    }
    kernel.interrupt.disable(kernel);
    kernel.scheduler.finish_current(kernel);
    loop {
        // Terminated threads are never dispatched again.
        me.park();
    }
}
