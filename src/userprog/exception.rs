/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use log::{debug, error, trace};

use super::process;
use crate::kernel::Kernel;
use crate::machine::machine::{
    ExceptionType, TranslateError, ARG1_REG, ARG2_REG, ARG3_REG, BAD_VADDR_REG, RESULT_REG,
    SYSCALL_CODE_REG,
};
use crate::machine::PAGE_SIZE;
use crate::stats::Statistics;
use crate::threads::thread;
use crate::vm::address_space::{load_page, sync_entry};
use crate::vm::VmError;

// Syscall identifiers, read from the conventional register on trap entry.
pub const SC_HALT: i32 = 0;
pub const SC_EXIT: i32 = 1;
pub const SC_EXEC: i32 = 2;
pub const SC_JOIN: i32 = 3;
pub const SC_CREATE: i32 = 4;
pub const SC_REMOVE: i32 = 5;
pub const SC_OPEN: i32 = 6;
pub const SC_CLOSE: i32 = 7;
pub const SC_READ: i32 = 8;
pub const SC_WRITE: i32 = 9;
pub const SC_PS: i32 = 10;
pub const SC_CHANGE_DIRECTORY: i32 = 11;
pub const SC_CREATE_DIRECTORY: i32 = 12;
pub const SC_LIST_DIRECTORY: i32 = 13;
pub const SC_REMOVE_DIRECTORY: i32 = 14;

/// Reserved descriptors.
pub const CONSOLE_INPUT: i32 = 0;
pub const CONSOLE_OUTPUT: i32 = 1;
const FIRST_USER_FD: i32 = 2;

/// Longest string a syscall will pull out of user memory.
const MAX_STRING_LEN: usize = 256;
/// Longest argv a program can be exec'd with.
const MAX_ARGS: usize = 16;

/// Trap entry point. Syscalls decode their arguments from the register
/// file; faults consult the MMU's bad-address register.
pub fn handle_exception(kernel: &Arc<Kernel>, which: ExceptionType) {
    match which {
        ExceptionType::Syscall => handle_syscall(kernel),
        ExceptionType::PageFault => {
            let bad = kernel.machine.read_register(BAD_VADDR_REG) as usize;
            if let Err(err) = handle_page_fault(kernel, bad) {
                error!(target: "syscall", "unrecoverable fault at {:#x}: {}", bad, err);
                thread::finish(kernel, -1);
            }
        }
        ExceptionType::ReadOnly => {
            let bad = kernel.machine.read_register(BAD_VADDR_REG) as usize;
            error!(target: "syscall", "write to read-only page at {:#x}", bad);
            thread::finish(kernel, -1);
        }
        ExceptionType::AddressError => {
            let bad = kernel.machine.read_register(BAD_VADDR_REG) as usize;
            error!(target: "syscall", "invalid address {:#x}", bad);
            thread::finish(kernel, -1);
        }
    }
}

/// Brings in the missing page, and with a TLB, refills a slot with the
/// fresh translation (writing the displaced entry's use/dirty bits back
/// first). Expected control flow under demand loading, not an error.
pub fn handle_page_fault(kernel: &Arc<Kernel>, bad_vaddr: usize) -> Result<(), VmError> {
    Statistics::bump(&kernel.stats.page_faults);
    let vpn = bad_vaddr / PAGE_SIZE;
    let space = thread::current()
        .space
        .lock()
        .unwrap()
        .clone()
        .ok_or(VmError::BadAddress(bad_vaddr))?;
    if vpn >= space.num_pages {
        return Err(VmError::BadAddress(bad_vaddr));
    }
    trace!(target: "vm", "page fault at {:#x} (vpn {})", bad_vaddr, vpn);

    let valid = space.page_table.lock().unwrap()[vpn].valid;
    if !valid {
        load_page(kernel, &space, vpn)?;
    }
    if kernel.machine.has_tlb() {
        let entry = space.page_table.lock().unwrap()[vpn];
        let slot = kernel.machine.tlb_victim().expect("tlb is configured");
        if let Some(displaced) = kernel.machine.tlb_replace(slot, entry) {
            sync_entry(&space.page_table, displaced);
        }
    }
    Ok(())
}

// User-memory transfer. Every access goes through the MMU one byte at a
// time; a page fault is handled and the access retried until it lands.

fn user_read_byte(kernel: &Arc<Kernel>, addr: usize) -> Result<u8, VmError> {
    loop {
        match kernel.machine.read_mem(addr) {
            Ok(b) => return Ok(b),
            Err(fault @ TranslateError::PageFault(va)) => {
                kernel.machine.raise(fault);
                handle_page_fault(kernel, va)?;
            }
            Err(fault) => {
                kernel.machine.raise(fault);
                return Err(VmError::BadAddress(addr));
            }
        }
    }
}

fn user_write_byte(kernel: &Arc<Kernel>, addr: usize, value: u8) -> Result<(), VmError> {
    loop {
        match kernel.machine.write_mem(addr, value) {
            Ok(()) => return Ok(()),
            Err(fault @ TranslateError::PageFault(va)) => {
                kernel.machine.raise(fault);
                handle_page_fault(kernel, va)?;
            }
            Err(fault) => {
                kernel.machine.raise(fault);
                return Err(VmError::BadAddress(addr));
            }
        }
    }
}

pub fn read_buffer_from_user(kernel: &Arc<Kernel>, addr: usize, len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    for i in 0..len {
        buf.push(user_read_byte(kernel, addr + i).ok()?);
    }
    Some(buf)
}

/// Bounded string read; the second component tells whether a terminator was
/// found within the bound.
pub fn read_string_from_user(
    kernel: &Arc<Kernel>,
    addr: usize,
    max: usize,
) -> Option<(String, bool)> {
    let mut bytes = Vec::new();
    for i in 0..max {
        let b = user_read_byte(kernel, addr + i).ok()?;
        if b == 0 {
            return Some((String::from_utf8_lossy(&bytes).into_owned(), true));
        }
        bytes.push(b);
    }
    Some((String::from_utf8_lossy(&bytes).into_owned(), false))
}

pub fn write_buffer_to_user(kernel: &Arc<Kernel>, addr: usize, data: &[u8]) -> bool {
    for (i, b) in data.iter().enumerate() {
        if user_write_byte(kernel, addr + i, *b).is_err() {
            return false;
        }
    }
    true
}

pub fn write_string_to_user(kernel: &Arc<Kernel>, addr: usize, s: &str) -> bool {
    write_buffer_to_user(kernel, addr, s.as_bytes())
        && user_write_byte(kernel, addr + s.len(), 0).is_ok()
}

/// Lays out the argv block at the top of a fresh user stack: the argument
/// strings, then the null-terminated pointer array. Returns the initial
/// stack pointer and the argv address.
pub fn write_argv(
    kernel: &Arc<Kernel>,
    stack_top: usize,
    args: &[String],
) -> Result<(usize, usize), VmError> {
    let mut sp = stack_top;
    let mut pointers = Vec::with_capacity(args.len());
    for arg in args {
        sp -= arg.len() + 1;
        for (i, b) in arg.as_bytes().iter().enumerate() {
            user_write_byte(kernel, sp + i, *b)?;
        }
        user_write_byte(kernel, sp + arg.len(), 0)?;
        pointers.push(sp as u32);
    }
    sp &= !3;
    sp -= 4 * (pointers.len() + 1);
    let argv_addr = sp;
    for (i, p) in pointers.iter().enumerate() {
        write_user_word(kernel, argv_addr + 4 * i, *p)?;
    }
    write_user_word(kernel, argv_addr + 4 * pointers.len(), 0)?;
    // Headroom for the callee's frame.
    Ok((argv_addr - 16, argv_addr))
}

fn write_user_word(kernel: &Arc<Kernel>, addr: usize, value: u32) -> Result<(), VmError> {
    for (i, b) in value.to_le_bytes().iter().enumerate() {
        user_write_byte(kernel, addr + i, *b)?;
    }
    Ok(())
}

fn read_user_word(kernel: &Arc<Kernel>, addr: usize) -> Result<u32, VmError> {
    let mut bytes = [0u8; 4];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = user_read_byte(kernel, addr + i)?;
    }
    Ok(u32::from_le_bytes(bytes))
}

/// Convenience used by interpreters and tests: stuffs the syscall registers,
/// takes the trap, and returns the result register.
pub fn syscall(kernel: &Arc<Kernel>, code: i32, args: [i32; 4]) -> i32 {
    kernel.machine.write_register(SYSCALL_CODE_REG, code);
    kernel.machine.write_register(ARG1_REG, args[0]);
    kernel.machine.write_register(ARG2_REG, args[1]);
    kernel.machine.write_register(ARG3_REG, args[2]);
    kernel
        .machine
        .write_register(crate::machine::machine::ARG4_REG, args[3]);
    handle_exception(kernel, ExceptionType::Syscall);
    kernel.machine.read_register(RESULT_REG)
}

fn handle_syscall(kernel: &Arc<Kernel>) {
    Statistics::bump(&kernel.stats.syscalls);
    let code = kernel.machine.read_register(SYSCALL_CODE_REG);
    let a1 = kernel.machine.read_register(ARG1_REG);
    let a2 = kernel.machine.read_register(ARG2_REG);
    let a3 = kernel.machine.read_register(ARG3_REG);
    let a4 = kernel.machine.read_register(crate::machine::machine::ARG4_REG);
    trace!(target: "syscall", "syscall {} ({}, {}, {}, {})", code, a1, a2, a3, a4);

    let result = match code {
        SC_HALT => {
            kernel.halt();
            0
        }
        SC_EXIT => thread::finish(kernel, a1),
        SC_EXEC => sys_exec(kernel, a1, a2, a3),
        SC_JOIN => sys_join(kernel, a1),
        SC_CREATE => sys_path_op(kernel, a1, |k, p| k.file_system.create_file(k, p, 0)),
        SC_REMOVE => sys_path_op(kernel, a1, |k, p| k.file_system.remove_file(k, p)),
        SC_OPEN => sys_open(kernel, a1),
        SC_CLOSE => sys_close(kernel, a1),
        SC_READ => sys_read(kernel, a1, a2, a3),
        SC_WRITE => sys_write(kernel, a1, a2, a3),
        SC_PS => sys_ps(kernel),
        SC_CHANGE_DIRECTORY => sys_path_op(kernel, a1, |k, p| k.file_system.change_directory(k, p)),
        SC_CREATE_DIRECTORY => sys_path_op(kernel, a1, |k, p| k.file_system.create_directory(k, p)),
        SC_LIST_DIRECTORY => sys_list_directory(kernel, a1),
        SC_REMOVE_DIRECTORY => sys_path_op(kernel, a1, |k, p| k.file_system.remove_directory(k, p)),
        _ => {
            error!(target: "syscall", "unknown syscall {}", code);
            -1
        }
    };
    kernel.machine.write_register(RESULT_REG, result);
    kernel.machine.advance_pc();
}

fn user_path(kernel: &Arc<Kernel>, addr: i32) -> Option<String> {
    if addr <= 0 {
        return None;
    }
    let (path, terminated) = read_string_from_user(kernel, addr as usize, MAX_STRING_LEN)?;
    terminated.then_some(path)
}

fn sys_path_op(
    kernel: &Arc<Kernel>,
    path_addr: i32,
    op: impl FnOnce(&Arc<Kernel>, &str) -> crate::fs::Result<()>,
) -> i32 {
    let Some(path) = user_path(kernel, path_addr) else {
        return -1;
    };
    match op(kernel, &path) {
        Ok(()) => 0,
        Err(err) => {
            debug!(target: "syscall", "'{}': {}", path, err);
            -1
        }
    }
}

fn sys_exec(kernel: &Arc<Kernel>, path_addr: i32, argv_addr: i32, parallel: i32) -> i32 {
    let Some(path) = user_path(kernel, path_addr) else {
        return -1;
    };
    let mut args = Vec::new();
    if argv_addr > 0 {
        for i in 0..MAX_ARGS {
            let Ok(ptr) = read_user_word(kernel, argv_addr as usize + 4 * i) else {
                return -1;
            };
            if ptr == 0 {
                break;
            }
            let Some((arg, true)) = read_string_from_user(kernel, ptr as usize, MAX_STRING_LEN)
            else {
                return -1;
            };
            args.push(arg);
        }
    }
    match process::exec(kernel, &path, args, parallel != 0) {
        Ok(pid) => pid as i32,
        Err(err) => {
            debug!(target: "syscall", "exec '{}': {}", path, err);
            -1
        }
    }
}

fn sys_join(kernel: &Arc<Kernel>, pid: i32) -> i32 {
    if pid < 0 {
        return -1;
    }
    match process::join(kernel, pid as u32) {
        Ok(status) => status,
        Err(err) => {
            debug!(target: "syscall", "join {}: {}", pid, err);
            -1
        }
    }
}

fn sys_open(kernel: &Arc<Kernel>, path_addr: i32) -> i32 {
    let Some(path) = user_path(kernel, path_addr) else {
        return -1;
    };
    match kernel.file_system.open(kernel, &path) {
        Ok(file) => {
            let current = thread::current();
            let mut files = current.files.lock().unwrap();
            let index = match files.iter().position(|f| f.is_none()) {
                Some(i) => {
                    files[i] = Some(file);
                    i
                }
                None => {
                    files.push(Some(file));
                    files.len() - 1
                }
            };
            index as i32 + FIRST_USER_FD
        }
        Err(err) => {
            debug!(target: "syscall", "open '{}': {}", path, err);
            -1
        }
    }
}

fn sys_close(kernel: &Arc<Kernel>, fd: i32) -> i32 {
    if fd < FIRST_USER_FD {
        // The console descriptors cannot be closed.
        return -1;
    }
    let file = {
        let current = thread::current();
        let mut files = current.files.lock().unwrap();
        match files.get_mut((fd - FIRST_USER_FD) as usize) {
            Some(slot) => slot.take(),
            None => None,
        }
    };
    match file {
        Some(file) => match kernel.file_system.close(kernel, file) {
            Ok(()) => 0,
            Err(_) => -1,
        },
        None => -1,
    }
}

fn sys_read(kernel: &Arc<Kernel>, buf_addr: i32, size: i32, fd: i32) -> i32 {
    if buf_addr <= 0 || size <= 0 || fd == CONSOLE_OUTPUT {
        return -1;
    }
    let size = size as usize;
    if fd == CONSOLE_INPUT {
        let mut data = Vec::with_capacity(size);
        for _ in 0..size {
            match kernel.synch_console.read_char(kernel) {
                Some(b) => data.push(b),
                // End of input terminates the bulk read.
                None => break,
            }
        }
        if write_buffer_to_user(kernel, buf_addr as usize, &data) {
            return data.len() as i32;
        }
        return -1;
    }
    if fd < FIRST_USER_FD {
        return -1;
    }
    let data = {
        let current = thread::current();
        let mut files = current.files.lock().unwrap();
        let Some(Some(file)) = files.get_mut((fd - FIRST_USER_FD) as usize) else {
            return -1;
        };
        let mut data = vec![0u8; size];
        match file.read(kernel, &mut data) {
            Ok(n) => {
                data.truncate(n);
                data
            }
            Err(_) => return -1,
        }
    };
    if write_buffer_to_user(kernel, buf_addr as usize, &data) {
        data.len() as i32
    } else {
        -1
    }
}

fn sys_write(kernel: &Arc<Kernel>, buf_addr: i32, size: i32, fd: i32) -> i32 {
    if buf_addr <= 0 || size <= 0 || fd == CONSOLE_INPUT {
        return -1;
    }
    let Some(data) = read_buffer_from_user(kernel, buf_addr as usize, size as usize) else {
        return -1;
    };
    if fd == CONSOLE_OUTPUT {
        for b in &data {
            if kernel.synch_console.write_char(kernel, *b).is_err() {
                return -1;
            }
        }
        return data.len() as i32;
    }
    if fd < FIRST_USER_FD {
        return -1;
    }
    let current = thread::current();
    let mut files = current.files.lock().unwrap();
    let Some(Some(file)) = files.get_mut((fd - FIRST_USER_FD) as usize) else {
        return -1;
    };
    match kernel.file_system.write_extending(kernel, file, &data) {
        Ok(n) => n as i32,
        Err(err) => {
            debug!(target: "syscall", "write fd {}: {}", fd, err);
            -1
        }
    }
}

fn sys_ps(kernel: &Arc<Kernel>) -> i32 {
    let listing = process::ps_listing(kernel);
    match kernel.synch_console.write_str(kernel, &listing) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_list_directory(kernel: &Arc<Kernel>, path_addr: i32) -> i32 {
    let Some(path) = user_path(kernel, path_addr) else {
        return -1;
    };
    match kernel.file_system.list_directory_contents(kernel, &path) {
        Ok(names) => {
            for name in names {
                if kernel.synch_console.write_str(kernel, &name).is_err()
                    || kernel.synch_console.write_char(kernel, b'\n').is_err()
                {
                    return -1;
                }
            }
            0
        }
        Err(err) => {
            debug!(target: "syscall", "list '{}': {}", path, err);
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LoadingMode, ReplacementPolicy};
    use crate::kernel::testing::test_kernel_with;
    use crate::machine::{NUM_PHYS_PAGES, PAGE_SIZE};
    use crate::userprog::binary::BinaryImage;
    use crate::vm::address_space::{teardown_space, AddressSpace};

    fn demand_config(swap: bool) -> Config {
        let mut config = Config::default();
        config.vm.loading = LoadingMode::Demand;
        config.vm.swap = swap;
        config.vm.replacement = ReplacementPolicy::Fifo;
        config
    }

    /// Writes a flat binary into the file system and attaches a fresh
    /// address space for it to the calling thread.
    fn install_program(kernel: &Arc<Kernel>, path: &str, code: &[u8]) -> Arc<AddressSpace> {
        let bytes = BinaryImage {
            code: code.to_vec(),
            init_data: Vec::new(),
        }
        .to_bytes();
        kernel.file_system.create_file(kernel, path, bytes.len()).unwrap();
        let file = kernel.file_system.open(kernel, path).unwrap();
        assert_eq!(file.write_at(kernel, &bytes, 0).unwrap(), bytes.len());
        kernel.file_system.close(kernel, file).unwrap();

        let executable = kernel.file_system.open(kernel, path).unwrap();
        let space = AddressSpace::new(kernel, 1, executable).unwrap();
        *thread::current().space.lock().unwrap() = Some(space.clone());
        kernel.machine.set_page_table(Some(space.page_table.clone()));
        space
    }

    fn drop_program(kernel: &Arc<Kernel>, space: Arc<AddressSpace>) {
        *thread::current().space.lock().unwrap() = None;
        teardown_space(kernel, space);
    }

    /// Demand loading: the second code page faults on first use, lands in a
    /// frame whose core-map back-reference names this space and page, and
    /// every code byte reads back from the executable image.
    #[test]
    fn test_demand_load_faults_and_core_map_agree() {
        let kernel = test_kernel_with(demand_config(false));
        kernel.run(|k| {
            k.file_system.initialize(k, true).unwrap();
            let code: Vec<u8> = (0..2 * PAGE_SIZE + 40).map(|i| (i % 13 + 1) as u8).collect();
            let space = install_program(k, "/prog", &code);
            assert!(!space.page_table.lock().unwrap()[1].valid);

            let faults_before = Statistics::get(&k.stats.page_faults);
            let got = read_buffer_from_user(k, PAGE_SIZE + 3, 1).unwrap();
            assert_eq!(got[0], code[PAGE_SIZE + 3]);
            assert!(Statistics::get(&k.stats.page_faults) > faults_before);

            let pte = space.page_table.lock().unwrap()[1];
            assert!(pte.valid);
            assert_eq!(k.core_map.vpn_of(pte.physical_page), Some(1));
            let owner = k.core_map.space_of(pte.physical_page).unwrap();
            assert!(Arc::ptr_eq(&owner.upgrade().unwrap(), &space));
            assert_eq!(k.core_map.find(1, 1), Some(pte.physical_page));

            let all = read_buffer_from_user(k, 0, code.len()).unwrap();
            assert_eq!(all, code);
            drop_program(k, space);
        });
    }

    /// A space larger than physical memory: pages get evicted to the swap
    /// file and read back intact, dirty pages included.
    #[test]
    fn test_swap_round_trip() {
        let kernel = test_kernel_with(demand_config(true));
        kernel.run(|k| {
            k.file_system.initialize(k, true).unwrap();
            let pages = NUM_PHYS_PAGES + 8;
            let code: Vec<u8> = (0..pages * PAGE_SIZE)
                .map(|i| (i / PAGE_SIZE + 1) as u8)
                .collect();
            let space = install_program(k, "/big", &code);

            // Scribble on the last stack page so a dirty page must round-trip.
            let stack_addr = (space.num_pages - 1) * PAGE_SIZE;
            assert!(write_buffer_to_user(k, stack_addr, b"dirty page"));

            // Touch every code page; that overcommits memory and forces
            // evictions of the earliest residents.
            for vpn in 0..pages {
                let b = read_buffer_from_user(k, vpn * PAGE_SIZE, 1).unwrap();
                assert_eq!(b[0], (vpn + 1) as u8);
            }
            assert!(Statistics::get(&k.stats.page_outs) > 0);

            assert!(space.in_swap(0));
            let b = read_buffer_from_user(k, 0, 1).unwrap();
            assert_eq!(b[0], 1);
            let back = read_buffer_from_user(k, stack_addr, 10).unwrap();
            assert_eq!(&back, b"dirty page");

            drop_program(k, space);
            assert!(k.file_system.check(k).unwrap());
        });
    }

    /// The TLB path: a miss refills from the page table, and the refilled
    /// translation serves subsequent accesses.
    #[test]
    fn test_tlb_refill() {
        let mut config = demand_config(false);
        config.vm.tlb = true;
        let kernel = test_kernel_with(config);
        kernel.run(|k| {
            k.file_system.initialize(k, true).unwrap();
            let code: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 9 + 1) as u8).collect();
            let space = install_program(k, "/prog", &code);

            let faults_before = Statistics::get(&k.stats.page_faults);
            let one = read_buffer_from_user(k, 5, 1).unwrap();
            assert_eq!(one[0], code[5]);
            let fault_count = Statistics::get(&k.stats.page_faults) - faults_before;
            assert!(fault_count >= 1);

            // Same page again: the TLB entry is hot now.
            let again = read_buffer_from_user(k, 6, 1).unwrap();
            assert_eq!(again[0], code[6]);
            assert_eq!(
                Statistics::get(&k.stats.page_faults) - faults_before,
                fault_count
            );
            drop_program(k, space);
        });
    }

    /// Read and Write surface -1 for descriptors that are negative or were
    /// never handed out, including values that would overflow the
    /// descriptor-to-slot arithmetic.
    #[test]
    fn test_read_write_reject_bad_descriptors() {
        let kernel = test_kernel_with(demand_config(false));
        kernel.run(|k| {
            k.file_system.initialize(k, true).unwrap();
            let code: Vec<u8> = vec![0x2a; PAGE_SIZE];
            let space = install_program(k, "/prog", &code);
            let scratch = (space.num_pages * PAGE_SIZE - 32) as i32;
            assert!(write_buffer_to_user(k, scratch as usize, b"abcd"));
            for fd in [i32::MIN, -1, 99] {
                assert_eq!(syscall(k, SC_READ, [scratch, 4, fd, 0]), -1);
                assert_eq!(syscall(k, SC_WRITE, [scratch, 4, fd, 0]), -1);
            }
            drop_program(k, space);
        });
    }

    #[test]
    fn test_halt_syscall_stops_the_machine() {
        let kernel = test_kernel_with(Config::default());
        kernel.run(|k| {
            k.file_system.initialize(k, true).unwrap();
            assert!(!k.halted());
            assert_eq!(syscall(k, SC_HALT, [0, 0, 0, 0]), 0);
            assert!(k.halted());
        });
    }

    /// A write through a translation marked read-only raises the read-only
    /// trap, never a silent write.
    #[test]
    fn test_read_only_page_rejects_writes() {
        let kernel = test_kernel_with(demand_config(false));
        kernel.run(|k| {
            k.file_system.initialize(k, true).unwrap();
            let code: Vec<u8> = vec![0x42; 2 * PAGE_SIZE];
            let space = install_program(k, "/prog", &code);
            // Fault the page in first.
            let _ = read_buffer_from_user(k, 0, 1).unwrap();
            assert!(space.page_table.lock().unwrap()[0].read_only);
            assert_eq!(
                k.machine.write_mem(0, 1),
                Err(crate::machine::machine::TranslateError::ReadOnly(0))
            );
            drop_program(k, space);
        });
    }
}
