/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

use crate::config::Config;
use crate::devices::synch_console::SynchConsole;
use crate::devices::synch_disk::SynchDisk;
use crate::fs::filesystem::FileSystem;
use crate::machine::console::{ConsoleSink, ConsoleSource};
use crate::machine::interrupt::Interrupt;
use crate::machine::machine::{Cpu, Machine};
use crate::machine::timer::Timer;
use crate::stats::Statistics;
use crate::sync::lock::Lock;
use crate::threads::scheduler::Scheduler;
use crate::threads::thread::{self, Thread};
use crate::userprog::process::ProcessTable;
use crate::vm::core_map::CoreMap;
use crate::vm::replacement::Replacement;

/// Everything the kernel is made of, bundled into one context value and
/// threaded through construction; nothing reaches these parts through
/// globals. One `Kernel` is one simulated machine.
pub struct Kernel {
    pub config: Config,
    pub stats: Statistics,
    pub interrupt: Interrupt,
    pub scheduler: Scheduler,
    pub timer: Option<Timer>,
    pub machine: Machine,
    pub synch_disk: SynchDisk,
    pub synch_console: SynchConsole,
    pub file_system: FileSystem,
    pub core_map: CoreMap,
    pub replacement: Replacement,
    /// Serializes page loads and evictions across address spaces.
    pub vm_lock: Lock,
    pub processes: ProcessTable,
    pub cpu: Arc<dyn Cpu>,
    halted: AtomicBool,
}

impl Kernel {
    /// Builds a machine around an existing disk image. No simulated code
    /// runs yet; that starts with `run`.
    pub fn create(
        config: Config,
        disk_image: &Path,
        console_source: ConsoleSource,
        console_sink: ConsoleSink,
        cpu: Arc<dyn Cpu>,
    ) -> anyhow::Result<Arc<Kernel>> {
        let synch_disk = SynchDisk::new(disk_image)?;
        let synch_console = SynchConsole::new(console_source, console_sink);
        let machine = Machine::new(config.vm.tlb);
        let timer = config
            .timer
            .preemptive
            .then(|| Timer::new(config.timer.quantum, config.timer.disable_periodic_yield));
        let replacement = Replacement::new(config.vm.replacement, config.vm.random_seed);
        Ok(Arc::new(Kernel {
            config,
            stats: Statistics::new(),
            interrupt: Interrupt::new(),
            scheduler: Scheduler::new(),
            timer,
            machine,
            synch_disk,
            synch_console,
            file_system: FileSystem::new(),
            core_map: CoreMap::new(),
            replacement,
            vm_lock: Lock::new("paging"),
            processes: ProcessTable::new(),
            cpu,
            halted: AtomicBool::new(false),
        }))
    }

    /// Adopts the calling host thread as the initial simulated thread, runs
    /// `f`, then keeps dispatching until no thread is ready and no device
    /// interrupt is in flight.
    pub fn run<R>(self: &Arc<Self>, f: impl FnOnce(&Arc<Kernel>) -> R) -> R {
        let _main = Thread::adopt_main(self);
        Timer::start(self);
        let result = f(self);
        self.drain();
        result
    }

    /// Stops the machine: records the halt and reports statistics. Threads
    /// already running are drained by `run`.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Relaxed);
        info!("machine halting; {}", self.stats.report());
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    /// Lets every runnable thread finish: dispatches ready threads, and
    /// when none are ready, advances simulated time to the next device
    /// completion. Returns once the machine is quiescent.
    fn drain(self: &Arc<Self>) {
        let old = self.interrupt.disable(self);
        loop {
            if let Some(next) = self.scheduler.find_next_to_run() {
                self.scheduler.ready_to_run(self, thread::current());
                self.scheduler.run(self, next);
            } else if self.interrupt.has_device_pending() {
                self.interrupt.idle(self);
            } else {
                break;
            }
        }
        self.interrupt.set_level(self, old);
    }
}

#[cfg(test)]
pub mod testing {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::Kernel;
    use crate::config::Config;
    use crate::machine::console::{ConsoleSink, ConsoleSource};
    use crate::machine::disk::Disk;
    use crate::machine::machine::NoCpu;

    static NEXT_IMAGE: AtomicUsize = AtomicUsize::new(0);

    /// Fresh zeroed disk image under the system temp directory.
    pub fn temp_disk_image() -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "simos-test-{}-{}.img",
            std::process::id(),
            NEXT_IMAGE.fetch_add(1, Ordering::Relaxed)
        ));
        Disk::create_image(&path).expect("failed to create test disk image");
        path
    }

    pub fn test_kernel() -> Arc<Kernel> {
        test_kernel_with(Config::default())
    }

    pub fn test_kernel_with(config: Config) -> Arc<Kernel> {
        test_kernel_custom(config, Arc::new(NoCpu))
    }

    pub fn test_kernel_custom(
        config: Config,
        cpu: Arc<dyn crate::machine::machine::Cpu>,
    ) -> Arc<Kernel> {
        let image = temp_disk_image();
        Kernel::create(
            config,
            &image,
            ConsoleSource::Buffer(Vec::new(), 0),
            ConsoleSink::Buffer(Vec::new()),
            cpu,
        )
        .expect("failed to create test kernel")
    }

    /// Boots a freshly formatted file system and hands the kernel to `f`.
    pub fn run_with_fs<R>(f: impl FnOnce(&Arc<Kernel>) -> R) -> R {
        let kernel = test_kernel();
        kernel.run(|k| {
            k.file_system.initialize(k, true).expect("format failed");
            f(k)
        })
    }
}
