/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::{Arc, Mutex};

use log::trace;

use super::{MEMORY_SIZE, PAGE_SIZE, TLB_SIZE};
use crate::kernel::Kernel;

pub const NUM_GP_REGS: usize = 32;
/// MIPS-like register conventions: syscall code and result in r2, up to four
/// arguments in r4..r7.
pub const SYSCALL_CODE_REG: usize = 2;
pub const RESULT_REG: usize = 2;
pub const ARG1_REG: usize = 4;
pub const ARG2_REG: usize = 5;
pub const ARG3_REG: usize = 6;
pub const ARG4_REG: usize = 7;
pub const STACK_REG: usize = 29;
pub const RET_ADDR_REG: usize = 31;
pub const PC_REG: usize = 34;
pub const NEXT_PC_REG: usize = 35;
pub const PREV_PC_REG: usize = 36;
pub const BAD_VADDR_REG: usize = 39;
pub const NUM_TOTAL_REGS: usize = 40;

/// Traps delivered to the exception dispatcher.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExceptionType {
    Syscall,
    PageFault,
    ReadOnly,
    AddressError,
}

/// Faults raised by a single user-memory access.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TranslateError {
    PageFault(usize),
    ReadOnly(usize),
    AddressError(usize),
}

/// One translation record. While an entry is resident in the TLB, the TLB
/// copy of the use and dirty bits is authoritative.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TranslationEntry {
    pub virtual_page: usize,
    pub physical_page: usize,
    pub valid: bool,
    pub used: bool,
    pub dirty: bool,
    pub read_only: bool,
}

impl TranslationEntry {
    pub fn invalid() -> Self {
        TranslationEntry {
            virtual_page: 0,
            physical_page: 0,
            valid: false,
            used: false,
            dirty: false,
            read_only: false,
        }
    }
}

pub type PageTableRef = Arc<Mutex<Vec<TranslationEntry>>>;

/// Interface to the instruction interpreter, an external collaborator. The
/// kernel invokes `run` as the body of every exec'd process after installing
/// its address space and initial registers; `run` returns the exit status to
/// use if the program did not exit through the Exit syscall. Tests install
/// scripted programs; a build without an interpreter cannot exec.
pub trait Cpu: Send + Sync {
    fn run(&self, kernel: &Arc<Kernel>) -> i32;
}

/// Placeholder interpreter for builds without one linked in.
pub struct NoCpu;

impl Cpu for NoCpu {
    fn run(&self, _kernel: &Arc<Kernel>) -> i32 {
        log::error!("no instruction interpreter is linked into this build");
        -1
    }
}

struct MachineInner {
    registers: [i32; NUM_TOTAL_REGS],
    memory: Vec<u8>,
    tlb: Option<[TranslationEntry; TLB_SIZE]>,
    tlb_hand: usize,
    page_table: Option<PageTableRef>,
}

/// The simulated processor state visible to the kernel: the register file,
/// physical memory, and the MMU (a page table, optionally fronted by a small
/// software-managed TLB).
pub struct Machine {
    inner: Mutex<MachineInner>,
}

impl Machine {
    pub fn new(use_tlb: bool) -> Self {
        Machine {
            inner: Mutex::new(MachineInner {
                registers: [0; NUM_TOTAL_REGS],
                memory: vec![0; MEMORY_SIZE],
                tlb: use_tlb.then(|| [TranslationEntry::invalid(); TLB_SIZE]),
                tlb_hand: 0,
                page_table: None,
            }),
        }
    }

    pub fn has_tlb(&self) -> bool {
        self.inner.lock().unwrap().tlb.is_some()
    }

    pub fn read_register(&self, reg: usize) -> i32 {
        self.inner.lock().unwrap().registers[reg]
    }

    pub fn write_register(&self, reg: usize, value: i32) {
        self.inner.lock().unwrap().registers[reg] = value;
    }

    /// Moves past the trapping instruction: PrevPC <- PC <- NextPC <- +4.
    pub fn advance_pc(&self) {
        let mut inner = self.inner.lock().unwrap();
        let pc = inner.registers[PC_REG];
        let next = inner.registers[NEXT_PC_REG];
        inner.registers[PREV_PC_REG] = pc;
        inner.registers[PC_REG] = next;
        inner.registers[NEXT_PC_REG] = next + 4;
    }

    pub fn set_page_table(&self, table: Option<PageTableRef>) {
        self.inner.lock().unwrap().page_table = table;
    }

    pub fn page_table(&self) -> Option<PageTableRef> {
        self.inner.lock().unwrap().page_table.clone()
    }

    /// Reads one byte of user memory through the MMU.
    pub fn read_mem(&self, vaddr: usize) -> Result<u8, TranslateError> {
        let mut inner = self.inner.lock().unwrap();
        let paddr = inner.translate(vaddr, false)?;
        Ok(inner.memory[paddr])
    }

    /// Writes one byte of user memory through the MMU.
    pub fn write_mem(&self, vaddr: usize, value: u8) -> Result<(), TranslateError> {
        let mut inner = self.inner.lock().unwrap();
        let paddr = inner.translate(vaddr, true)?;
        inner.memory[paddr] = value;
        Ok(())
    }

    /// Little-endian word access, built on byte translation.
    pub fn read_mem_word(&self, vaddr: usize) -> Result<u32, TranslateError> {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_mem(vaddr + i)?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_mem_word(&self, vaddr: usize, value: u32) -> Result<(), TranslateError> {
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.write_mem(vaddr + i, *b)?;
        }
        Ok(())
    }

    /// Snapshot of the register file, for context switches between user
    /// threads.
    pub fn save_registers(&self) -> [i32; NUM_TOTAL_REGS] {
        self.inner.lock().unwrap().registers
    }

    pub fn restore_registers(&self, registers: &[i32; NUM_TOTAL_REGS]) {
        self.inner.lock().unwrap().registers = *registers;
    }

    /// Records the faulting address where the handler expects to find it.
    pub fn raise(&self, error: TranslateError) -> ExceptionType {
        let (which, vaddr) = match error {
            TranslateError::PageFault(va) => (ExceptionType::PageFault, va),
            TranslateError::ReadOnly(va) => (ExceptionType::ReadOnly, va),
            TranslateError::AddressError(va) => (ExceptionType::AddressError, va),
        };
        self.write_register(BAD_VADDR_REG, vaddr as i32);
        which
    }

    // Physical-frame access for the paging machinery.

    pub fn zero_frame(&self, frame: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.memory[frame * PAGE_SIZE..(frame + 1) * PAGE_SIZE].fill(0);
    }

    pub fn read_frame(&self, frame: usize) -> [u8; PAGE_SIZE] {
        let inner = self.inner.lock().unwrap();
        let mut page = [0u8; PAGE_SIZE];
        page.copy_from_slice(&inner.memory[frame * PAGE_SIZE..(frame + 1) * PAGE_SIZE]);
        page
    }

    pub fn write_frame(&self, frame: usize, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= PAGE_SIZE);
        let mut inner = self.inner.lock().unwrap();
        let at = frame * PAGE_SIZE + offset;
        inner.memory[at..at + data.len()].copy_from_slice(data);
    }

    // TLB maintenance. The TLB caches entries of the current address space
    // only; its use/dirty bits flow back into the page table when an entry
    // is evicted, replaced, or the space is switched out.

    /// Picks the refill slot: an invalid entry if one exists, otherwise the
    /// next slot round-robin.
    pub fn tlb_victim(&self) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        let tlb = inner.tlb.as_ref()?;
        if let Some(free) = tlb.iter().position(|e| !e.valid) {
            return Some(free);
        }
        let victim = inner.tlb_hand;
        inner.tlb_hand = (victim + 1) % TLB_SIZE;
        Some(victim)
    }

    /// Replaces a TLB slot, returning the displaced entry so its use/dirty
    /// bits can be written back.
    pub fn tlb_replace(&self, slot: usize, entry: TranslationEntry) -> Option<TranslationEntry> {
        let mut inner = self.inner.lock().unwrap();
        let tlb = inner.tlb.as_mut()?;
        let old = tlb[slot];
        tlb[slot] = entry;
        trace!(target: "vm", "tlb slot {} <- vpn {}", slot, entry.virtual_page);
        old.valid.then_some(old)
    }

    /// Invalidates the whole TLB, handing every valid entry to `sync` first.
    pub fn tlb_flush(&self, mut sync: impl FnMut(TranslationEntry)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tlb) = inner.tlb.as_mut() {
            for entry in tlb.iter_mut() {
                if entry.valid {
                    sync(*entry);
                    entry.valid = false;
                }
            }
        }
    }

    /// Invalidates any TLB entry mapping the given physical frame.
    pub fn tlb_drop_frame(&self, frame: usize, mut sync: impl FnMut(TranslationEntry)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tlb) = inner.tlb.as_mut() {
            for entry in tlb.iter_mut() {
                if entry.valid && entry.physical_page == frame {
                    sync(*entry);
                    entry.valid = false;
                }
            }
        }
    }

    /// Clears the use bit of the TLB entry for `vpn`, mirroring a clock-hand
    /// sweep over the page table.
    pub fn tlb_clear_used(&self, vpn: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tlb) = inner.tlb.as_mut() {
            for entry in tlb.iter_mut() {
                if entry.valid && entry.virtual_page == vpn {
                    entry.used = false;
                }
            }
        }
    }
}

impl MachineInner {
    fn translate(&mut self, vaddr: usize, writing: bool) -> Result<usize, TranslateError> {
        let vpn = vaddr / PAGE_SIZE;
        let offset = vaddr % PAGE_SIZE;

        if let Some(tlb) = self.tlb.as_mut() {
            let entry = tlb
                .iter_mut()
                .find(|e| e.valid && e.virtual_page == vpn)
                .ok_or(TranslateError::PageFault(vaddr))?;
            if entry.read_only && writing {
                return Err(TranslateError::ReadOnly(vaddr));
            }
            entry.used = true;
            if writing {
                entry.dirty = true;
            }
            return Ok(entry.physical_page * PAGE_SIZE + offset);
        }

        let table = self
            .page_table
            .as_ref()
            .ok_or(TranslateError::AddressError(vaddr))?;
        let mut table = table.lock().unwrap();
        let entry = table
            .get_mut(vpn)
            .ok_or(TranslateError::AddressError(vaddr))?;
        if !entry.valid {
            return Err(TranslateError::PageFault(vaddr));
        }
        if entry.read_only && writing {
            return Err(TranslateError::ReadOnly(vaddr));
        }
        entry.used = true;
        if writing {
            entry.dirty = true;
        }
        Ok(entry.physical_page * PAGE_SIZE + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_table(pages: usize) -> PageTableRef {
        let table = (0..pages)
            .map(|vpn| TranslationEntry {
                virtual_page: vpn,
                physical_page: vpn,
                valid: true,
                used: false,
                dirty: false,
                read_only: false,
            })
            .collect();
        Arc::new(Mutex::new(table))
    }

    #[test]
    fn test_advance_pc() {
        let machine = Machine::new(false);
        machine.write_register(PC_REG, 100);
        machine.write_register(NEXT_PC_REG, 104);
        machine.write_register(RET_ADDR_REG, 96);
        machine.advance_pc();
        assert_eq!(machine.read_register(PREV_PC_REG), 100);
        assert_eq!(machine.read_register(PC_REG), 104);
        assert_eq!(machine.read_register(NEXT_PC_REG), 108);
        assert_eq!(machine.read_register(RET_ADDR_REG), 96);
    }

    #[test]
    fn test_word_round_trip_through_page_table() {
        let machine = Machine::new(false);
        machine.set_page_table(Some(mapped_table(2)));
        machine.write_mem_word(PAGE_SIZE - 2, 0xdead_beef).unwrap();
        assert_eq!(machine.read_mem_word(PAGE_SIZE - 2).unwrap(), 0xdead_beef);
        // The write straddled into page 1 and dirtied both pages.
        let table = machine.page_table().unwrap();
        assert!(table.lock().unwrap()[0].dirty);
        assert!(table.lock().unwrap()[1].dirty);
    }

    #[test]
    fn test_unmapped_page_faults() {
        let machine = Machine::new(false);
        let table = mapped_table(2);
        table.lock().unwrap()[1].valid = false;
        machine.set_page_table(Some(table));
        assert_eq!(
            machine.read_mem(PAGE_SIZE + 4),
            Err(TranslateError::PageFault(PAGE_SIZE + 4))
        );
        assert_eq!(
            machine.read_mem(5 * PAGE_SIZE),
            Err(TranslateError::AddressError(5 * PAGE_SIZE))
        );
    }

    #[test]
    fn test_read_only_page() {
        let machine = Machine::new(false);
        let table = mapped_table(1);
        table.lock().unwrap()[0].read_only = true;
        machine.set_page_table(Some(table));
        assert_eq!(machine.read_mem(0), Ok(0));
        assert_eq!(machine.write_mem(0, 1), Err(TranslateError::ReadOnly(0)));
    }

    #[test]
    fn test_tlb_miss_refill_and_flush() {
        let machine = Machine::new(true);
        assert!(machine.has_tlb());
        assert_eq!(machine.read_mem(0), Err(TranslateError::PageFault(0)));

        let entry = TranslationEntry {
            virtual_page: 0,
            physical_page: 3,
            valid: true,
            used: false,
            dirty: false,
            read_only: false,
        };
        let slot = machine.tlb_victim().unwrap();
        assert_eq!(machine.tlb_replace(slot, entry), None);
        machine.write_frame(3, 0, &[7]);
        assert_eq!(machine.read_mem(0), Ok(7));
        machine.write_mem(1, 9).unwrap();

        let mut synced = Vec::new();
        machine.tlb_flush(|e| synced.push(e));
        assert_eq!(synced.len(), 1);
        assert!(synced[0].used);
        assert!(synced[0].dirty);
        // Flushed entries no longer translate.
        assert_eq!(machine.read_mem(0), Err(TranslateError::PageFault(0)));
    }
}
