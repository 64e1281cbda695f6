/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use thiserror::Error;

use super::exception::write_argv;
use crate::fs::FsError;
use crate::kernel::Kernel;
use crate::machine::machine::{ARG1_REG, ARG2_REG, NEXT_PC_REG, PC_REG, STACK_REG};
use crate::machine::PAGE_SIZE;
use crate::threads::thread::{self, Thread, ThreadState};
use crate::threads::Priority;
use crate::vm::address_space::{self, AddressSpace};
use crate::vm::VmError;

pub const MAX_PROCESSES: usize = 16;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process table is full")]
    TooManyProcesses,
    #[error("no process with pid {0}")]
    NoSuchProcess(u32),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Vm(#[from] VmError),
}

struct ProcessEntry {
    name: String,
    thread: Option<Arc<Thread>>,
}

/// Bounded map from process id to the thread running it. Ids are handed out
/// at exec and recycled when the process is joined.
pub struct ProcessTable {
    slots: Mutex<Vec<Option<ProcessEntry>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            slots: Mutex::new((0..MAX_PROCESSES).map(|_| None).collect()),
        }
    }

    fn reserve(&self, name: &str) -> Option<u32> {
        let mut slots = self.slots.lock().unwrap();
        let pid = slots.iter().position(|s| s.is_none())?;
        slots[pid] = Some(ProcessEntry {
            name: name.to_owned(),
            thread: None,
        });
        Some(pid as u32)
    }

    fn install(&self, pid: u32, thread: Arc<Thread>) {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots[pid as usize]
            .as_mut()
            .expect("installing a thread into an unreserved pid");
        entry.thread = Some(thread);
    }

    fn release(&self, pid: u32) {
        self.slots.lock().unwrap()[pid as usize] = None;
    }

    fn get(&self, pid: u32) -> Option<Arc<Thread>> {
        self.slots
            .lock()
            .unwrap()
            .get(pid as usize)?
            .as_ref()?
            .thread
            .clone()
    }

    /// (pid, name, state) rows for the PS syscall.
    pub fn listing(&self) -> Vec<(u32, String, ThreadState)> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .enumerate()
            .filter_map(|(pid, entry)| {
                let entry = entry.as_ref()?;
                let state = entry
                    .thread
                    .as_ref()
                    .map(|t| t.state())
                    .unwrap_or(ThreadState::JustCreated);
                Some((pid as u32, entry.name.clone(), state))
            })
            .collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        ProcessTable::new()
    }
}

/// Starts a user program: opens the executable, allocates a pid, and forks
/// a joinable thread that builds the address space, marshals the arguments
/// onto the new user stack, and enters the interpreter. With
/// `parallel=false` the caller waits for the process and its pid is already
/// reaped when this returns; with `parallel=true` reaping is left to an
/// explicit join.
pub fn exec(
    kernel: &Arc<Kernel>,
    path: &str,
    args: Vec<String>,
    parallel: bool,
) -> Result<u32, ProcessError> {
    let executable = kernel.file_system.open(kernel, path)?;
    let Some(pid) = kernel.processes.reserve(path) else {
        kernel.file_system.close(kernel, executable)?;
        return Err(ProcessError::TooManyProcesses);
    };
    debug!(target: "syscall", "exec '{}' as pid {}", path, pid);

    let name = format!("pid{}-{}", pid, path.trim_start_matches('/'));
    let thread = Thread::fork(kernel, &name, Priority::Normal, true, move |k| {
        let space = match AddressSpace::new(k, pid, executable) {
            Ok(space) => space,
            Err(err) => {
                error!(target: "syscall", "pid {}: loading failed: {}", pid, err);
                thread::finish(k, -1);
            }
        };
        *thread::current().space.lock().unwrap() = Some(space.clone());
        kernel_install(k, &space);
        let status = match start_user(k, &space, &args) {
            Ok(()) => k.cpu.run(k),
            Err(err) => {
                error!(target: "syscall", "pid {}: argument setup failed: {}", pid, err);
                -1
            }
        };
        thread::finish(k, status);
    });
    kernel.processes.install(pid, thread);

    if !parallel {
        join(kernel, pid)?;
    }
    Ok(pid)
}

fn kernel_install(kernel: &Arc<Kernel>, space: &Arc<AddressSpace>) {
    kernel.machine.set_page_table(Some(space.page_table.clone()));
    kernel.machine.tlb_flush(|_| {});
}

/// Sets up the initial registers and the argv block at the top of the user
/// stack. The exec arguments were captured kernel-side; here they move into
/// simulated memory through the faulting transfer path.
fn start_user(kernel: &Arc<Kernel>, space: &Arc<AddressSpace>, args: &[String]) -> Result<(), VmError> {
    let stack_top = space.num_pages * PAGE_SIZE;
    let (sp, argv_addr) = write_argv(kernel, stack_top, args)?;
    kernel.machine.write_register(PC_REG, 0);
    kernel.machine.write_register(NEXT_PC_REG, 4);
    kernel.machine.write_register(STACK_REG, sp as i32);
    kernel.machine.write_register(ARG1_REG, args.len() as i32);
    kernel.machine.write_register(ARG2_REG, argv_addr as i32);
    Ok(())
}

/// Waits for a process to exit and returns its status; the pid is released.
pub fn join(kernel: &Arc<Kernel>, pid: u32) -> Result<i32, ProcessError> {
    let thread = kernel
        .processes
        .get(pid)
        .ok_or(ProcessError::NoSuchProcess(pid))?;
    let status = thread.join(kernel);
    kernel.processes.release(pid);
    debug!(target: "syscall", "pid {} joined with status {}", pid, status);
    Ok(status)
}

/// Process listing for the PS syscall.
pub fn ps_listing(kernel: &Arc<Kernel>) -> String {
    let mut out = String::from("PID  STATE       NAME\n");
    for (pid, name, state) in kernel.processes.listing() {
        out.push_str(&format!("{:<4} {:<11} {}\n", pid, format!("{:?}", state), name));
    }
    out
}

/// Releases everything a thread holds as it finishes: its open files, its
/// working directory handle, and its address space (which closes the
/// executable and deletes the swap file). Runs on the finishing thread.
pub fn teardown(kernel: &Arc<Kernel>, thread: &Arc<Thread>) {
    let files: Vec<_> = thread.files.lock().unwrap().drain(..).collect();
    for file in files.into_iter().flatten() {
        if let Err(err) = kernel.file_system.close(kernel, file) {
            warn!(target: "fs", "closing leftover descriptor failed: {}", err);
        }
    }
    let cwd = thread.cwd.lock().unwrap().take();
    if let Some(cwd) = cwd {
        if let Err(err) = kernel.file_system.close(kernel, cwd) {
            warn!(target: "fs", "closing working directory failed: {}", err);
        }
    }
    let space = thread.space.lock().unwrap().take();
    if let Some(space) = space {
        address_space::teardown_space(kernel, space);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kernel::testing::test_kernel_custom;
    use crate::machine::machine::{Cpu, STACK_REG};
    use crate::userprog::binary::BinaryImage;
    use crate::userprog::exception::{
        read_buffer_from_user, read_string_from_user, syscall, write_buffer_to_user,
        write_string_to_user, CONSOLE_OUTPUT, SC_CLOSE, SC_CREATE, SC_OPEN, SC_READ, SC_WRITE,
    };

    fn make_binary(kernel: &Arc<Kernel>, path: &str, code_len: usize) {
        let bytes = BinaryImage {
            code: vec![0x11; code_len],
            init_data: Vec::new(),
        }
        .to_bytes();
        kernel.file_system.create_file(kernel, path, bytes.len()).unwrap();
        let file = kernel.file_system.open(kernel, path).unwrap();
        assert_eq!(file.write_at(kernel, &bytes, 0).unwrap(), bytes.len());
        kernel.file_system.close(kernel, file).unwrap();
    }

    /// Checks the argv block exec marshals onto the fresh user stack.
    struct ArgvCpu;

    impl Cpu for ArgvCpu {
        fn run(&self, k: &Arc<Kernel>) -> i32 {
            let argc = k.machine.read_register(ARG1_REG);
            if argc != 2 {
                return -10;
            }
            let argv = k.machine.read_register(ARG2_REG) as usize;
            let Some(raw) = read_buffer_from_user(k, argv, 4) else {
                return -11;
            };
            let ptr = u32::from_le_bytes(raw.try_into().unwrap()) as usize;
            match read_string_from_user(k, ptr, 64) {
                Some((s, true)) if s == "hello" => 7,
                _ => -12,
            }
        }
    }

    #[test]
    fn test_exec_passes_arguments_and_join_reaps() {
        let kernel = test_kernel_custom(Config::default(), Arc::new(ArgvCpu));
        kernel.run(|k| {
            k.file_system.initialize(k, true).unwrap();
            make_binary(k, "/prog", 40);
            let pid = exec(k, "/prog", vec!["hello".into(), "world".into()], true).unwrap();
            assert_eq!(join(k, pid).unwrap(), 7);
            // The pid was released on join.
            assert!(join(k, pid).is_err());
            assert!(k.file_system.check(k).unwrap());
        });
    }

    #[test]
    fn test_exec_missing_program_fails() {
        let kernel = test_kernel_custom(Config::default(), Arc::new(ArgvCpu));
        kernel.run(|k| {
            k.file_system.initialize(k, true).unwrap();
            assert!(exec(k, "/nope", Vec::new(), true).is_err());
        });
    }

    /// Drives the whole file-syscall surface from simulated user memory.
    struct FileScriptCpu;

    impl Cpu for FileScriptCpu {
        fn run(&self, k: &Arc<Kernel>) -> i32 {
            let sp = k.machine.read_register(STACK_REG) as usize;
            let path = sp - 96;
            let data = sp - 64;
            let scratch = sp - 32;
            if !write_string_to_user(k, path, "/t.txt") {
                return -1;
            }
            if syscall(k, SC_CREATE, [path as i32, 0, 0, 0]) != 0 {
                return -2;
            }
            let fd = syscall(k, SC_OPEN, [path as i32, 0, 0, 0]);
            if fd < 2 {
                return -3;
            }
            if !write_buffer_to_user(k, data, b"hi there") {
                return -4;
            }
            if syscall(k, SC_WRITE, [data as i32, 8, fd, 0]) != 8 {
                return -5;
            }
            if syscall(k, SC_CLOSE, [fd, 0, 0, 0]) != 0 {
                return -6;
            }
            let fd = syscall(k, SC_OPEN, [path as i32, 0, 0, 0]);
            if syscall(k, SC_READ, [scratch as i32, 8, fd, 0]) != 8 {
                return -7;
            }
            let Some(back) = read_buffer_from_user(k, scratch, 8) else {
                return -8;
            };
            if back != b"hi there" {
                return -9;
            }
            if syscall(k, SC_CLOSE, [fd, 0, 0, 0]) != 0 {
                return -10;
            }
            if syscall(k, SC_WRITE, [data as i32, 8, CONSOLE_OUTPUT, 0]) != 8 {
                return -11;
            }
            0
        }
    }

    #[test]
    fn test_process_drives_file_syscalls() {
        let kernel = test_kernel_custom(Config::default(), Arc::new(FileScriptCpu));
        kernel.run(|k| {
            k.file_system.initialize(k, true).unwrap();
            make_binary(k, "/script", 16);
            let pid = exec(k, "/script", Vec::new(), true).unwrap();
            assert_eq!(join(k, pid).unwrap(), 0);
            assert!(k.file_system.check(k).unwrap());
        });
        assert_eq!(kernel.synch_console.take_output(), b"hi there".to_vec());
    }

    #[test]
    fn test_ps_listing_names_running_processes() {
        let kernel = test_kernel_custom(Config::default(), Arc::new(ArgvCpu));
        kernel.run(|k| {
            k.file_system.initialize(k, true).unwrap();
            make_binary(k, "/prog", 16);
            let pid = exec(k, "/prog", vec!["hello".into(), "x".into()], true).unwrap();
            let listing = ps_listing(k);
            assert!(listing.contains("/prog"));
            join(k, pid).unwrap();
            let listing = ps_listing(k);
            assert!(!listing.contains("/prog"));
        });
    }
}
