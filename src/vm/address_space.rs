/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use super::core_map::FrameOwner;
use super::VmError;
use crate::config::LoadingMode;
use crate::fs::bitmap::Bitmap;
use crate::fs::open_file::OpenFile;
use crate::fs::FsError;
use crate::kernel::Kernel;
use crate::machine::machine::{PageTableRef, TranslationEntry};
use crate::machine::{PAGE_SIZE, USER_STACK_SIZE};
use crate::stats::Statistics;
use crate::threads::thread::Thread;
use crate::userprog::binary::{BinaryHeader, Segment};

struct SwapArea {
    file: OpenFile,
    /// Pages that have been written to the swap file at least once.
    present: Mutex<Bitmap>,
}

/// The virtual memory of one process: a page table over the executable's
/// code and initialized-data segments plus a user-stack suffix. Pages come
/// in either eagerly at construction (direct loading) or on first fault
/// (demand loading); with swap enabled, evicted pages round-trip through a
/// per-process swap file kept in the file system.
pub struct AddressSpace {
    pub pid: u32,
    pub num_pages: usize,
    pub page_table: PageTableRef,
    executable: OpenFile,
    code: Segment,
    init_data: Segment,
    swap: Option<SwapArea>,
}

fn swap_path(pid: u32) -> String {
    format!("/swap.{}", pid)
}

impl AddressSpace {
    /// Builds the space from an open executable image. With direct loading
    /// every page is brought in before this returns.
    pub fn new(
        kernel: &Arc<Kernel>,
        pid: u32,
        executable: OpenFile,
    ) -> Result<Arc<AddressSpace>, VmError> {
        let header = match BinaryHeader::read(kernel, &executable) {
            Ok(header) => header,
            Err(err) => {
                // Give the handle back before reporting a bad image.
                let _ = kernel.file_system.close(kernel, executable);
                return Err(err.into());
            }
        };
        let size = header.code.size + header.init_data.size + USER_STACK_SIZE;
        let num_pages = size.div_ceil(PAGE_SIZE);
        debug!(
            target: "vm",
            "pid {}: {} pages (code {} bytes, data {} bytes)",
            pid, num_pages, header.code.size, header.init_data.size
        );

        let table: Vec<TranslationEntry> = (0..num_pages)
            .map(|vpn| {
                let mut entry = TranslationEntry::invalid();
                entry.virtual_page = vpn;
                // Pages wholly inside the code segment never take writes.
                entry.read_only = header.code.size > 0 && (vpn + 1) * PAGE_SIZE <= header.code.size;
                entry
            })
            .collect();

        let swap = if kernel.config.vm.swap {
            Some(Self::create_swap(kernel, pid, num_pages)?)
        } else {
            None
        };

        let space = Arc::new(AddressSpace {
            pid,
            num_pages,
            page_table: Arc::new(Mutex::new(table)),
            executable,
            code: header.code,
            init_data: header.init_data,
            swap,
        });

        if kernel.config.vm.loading == LoadingMode::Direct {
            for vpn in 0..num_pages {
                if let Err(err) = load_page(kernel, &space, vpn) {
                    // Hand back whatever was already claimed.
                    teardown_space(kernel, space);
                    return Err(err);
                }
            }
        }
        Ok(space)
    }

    fn create_swap(kernel: &Arc<Kernel>, pid: u32, num_pages: usize) -> Result<SwapArea, VmError> {
        let path = swap_path(pid);
        match kernel.file_system.create_file(kernel, &path, num_pages * PAGE_SIZE) {
            Ok(()) => {}
            Err(FsError::AlreadyExists(_)) => {
                // Leftover from an earlier run; replace it.
                kernel.file_system.remove_file(kernel, &path)?;
                kernel
                    .file_system
                    .create_file(kernel, &path, num_pages * PAGE_SIZE)?;
            }
            Err(err) => return Err(err.into()),
        }
        let file = kernel.file_system.open(kernel, &path)?;
        Ok(SwapArea {
            file,
            present: Mutex::new(Bitmap::new(num_pages)),
        })
    }

    /// Whether the given page has ever been evicted to swap.
    pub fn in_swap(&self, vpn: usize) -> bool {
        self.swap
            .as_ref()
            .map(|s| s.present.lock().unwrap().test(vpn))
            .unwrap_or(false)
    }
}

/// User-context bookkeeping on a switch: the outgoing thread's registers
/// are snapshotted and its TLB bits folded back into its page table, then
/// the incoming thread's registers and page table go in.
pub fn switch_space(kernel: &Arc<Kernel>, prev: Option<&Arc<Thread>>, next: &Arc<Thread>) {
    if let Some(prev) = prev {
        let space = prev.space.lock().unwrap().clone();
        if let Some(space) = space {
            let table = space.page_table.clone();
            kernel.machine.tlb_flush(|e| sync_entry(&table, e));
            *prev.user_registers.lock().unwrap() = kernel.machine.save_registers();
        }
    }
    let space = next.space.lock().unwrap().clone();
    match space {
        Some(space) => {
            kernel.machine.restore_registers(&next.user_registers.lock().unwrap());
            kernel.machine.set_page_table(Some(space.page_table.clone()));
        }
        None => kernel.machine.set_page_table(None),
    }
}

/// Copies a TLB entry's use/dirty bits back into the page-table row it
/// shadows.
pub fn sync_entry(table: &PageTableRef, entry: TranslationEntry) {
    let mut table = table.lock().unwrap();
    if let Some(row) = table.get_mut(entry.virtual_page) {
        row.used |= entry.used;
        row.dirty |= entry.dirty;
    }
}

/// Brings `vpn` into a physical frame: from the swap file if the page was
/// evicted earlier, otherwise zero-filled with the intersecting pieces of
/// the code and initialized-data segments read from the executable. Runs
/// under the paging lock; evicts a victim when memory is full.
pub fn load_page(kernel: &Arc<Kernel>, space: &Arc<AddressSpace>, vpn: usize) -> Result<(), VmError> {
    kernel.vm_lock.acquire(kernel);
    let result = load_page_locked(kernel, space, vpn);
    kernel.vm_lock.release(kernel);
    result
}

fn load_page_locked(
    kernel: &Arc<Kernel>,
    space: &Arc<AddressSpace>,
    vpn: usize,
) -> Result<(), VmError> {
    if vpn >= space.num_pages {
        return Err(VmError::BadAddress(vpn * PAGE_SIZE));
    }
    if space.page_table.lock().unwrap()[vpn].valid {
        // Resolved while we waited for the paging lock.
        return Ok(());
    }

    let frame = match kernel.core_map.find_free() {
        Some(frame) => frame,
        None => evict_one(kernel)?,
    };
    trace!(target: "vm", "pid {}: vpn {} -> frame {}", space.pid, vpn, frame);

    if space.in_swap(vpn) {
        let swap = space.swap.as_ref().expect("swap bit set without swap area");
        let mut page = [0u8; PAGE_SIZE];
        swap.file
            .read_at(kernel, &mut page, (vpn * PAGE_SIZE) as u32)?;
        kernel.machine.write_frame(frame, 0, &page);
    } else {
        kernel.machine.zero_frame(frame);
        for segment in [&space.code, &space.init_data] {
            copy_segment_window(kernel, space, segment, vpn, frame)?;
        }
    }
    Statistics::bump(&kernel.stats.page_ins);

    kernel.core_map.mark(
        frame,
        FrameOwner {
            space: Arc::downgrade(space),
            pid: space.pid,
            vpn,
        },
    );
    kernel.replacement.frame_loaded(frame);

    let mut table = space.page_table.lock().unwrap();
    let entry = &mut table[vpn];
    entry.physical_page = frame;
    entry.valid = true;
    entry.used = false;
    entry.dirty = false;
    Ok(())
}

/// Reads the part of `segment` that falls inside page `vpn` out of the
/// executable and into the frame.
fn copy_segment_window(
    kernel: &Arc<Kernel>,
    space: &Arc<AddressSpace>,
    segment: &Segment,
    vpn: usize,
    frame: usize,
) -> Result<(), VmError> {
    if segment.size == 0 {
        return Ok(());
    }
    let page_start = vpn * PAGE_SIZE;
    let page_end = page_start + PAGE_SIZE;
    let seg_start = segment.virtual_addr;
    let seg_end = seg_start + segment.size;
    let start = page_start.max(seg_start);
    let end = page_end.min(seg_end);
    if start >= end {
        return Ok(());
    }
    let mut buf = vec![0u8; end - start];
    space.executable.read_at(
        kernel,
        &mut buf,
        (segment.file_offset + (start - seg_start)) as u32,
    )?;
    kernel.machine.write_frame(frame, start - page_start, &buf);
    Ok(())
}

/// Frees one frame by paging its owner out. The victim goes to its owner's
/// swap file when dirty or never yet evicted; without swap, full memory is
/// fatal for the faulting process.
fn evict_one(kernel: &Arc<Kernel>) -> Result<usize, VmError> {
    // Make page-table bits current before the policy inspects them.
    if let Some(table) = kernel.machine.page_table() {
        kernel.machine.tlb_flush(|e| sync_entry(&table, e));
    }
    let frame = kernel.replacement.pick_victim(kernel);
    let owner = kernel
        .core_map
        .owner(frame)
        .expect("replacement chose an unowned frame");
    let victim = owner
        .space
        .upgrade()
        .expect("victim space outlives its resident pages");
    let Some(swap) = victim.swap.as_ref() else {
        return Err(VmError::OutOfMemory);
    };

    let dirty = {
        let table = victim.page_table.lock().unwrap();
        table[owner.vpn].dirty
    };
    let ever_evicted = victim.in_swap(owner.vpn);
    if dirty || !ever_evicted {
        let page = kernel.machine.read_frame(frame);
        swap.file
            .write_at(kernel, &page, (owner.vpn * PAGE_SIZE) as u32)?;
        swap.present.lock().unwrap().mark(owner.vpn);
        Statistics::bump(&kernel.stats.page_outs);
        trace!(target: "vm", "paged out pid {} vpn {}", owner.pid, owner.vpn);
    }

    victim.page_table.lock().unwrap()[owner.vpn].valid = false;
    kernel.machine.tlb_drop_frame(frame, |e| sync_entry(&victim.page_table, e));
    kernel.core_map.clear(frame);
    kernel.replacement.frame_cleared(frame);
    Ok(frame)
}

/// Releases everything the space holds: resident frames, the installed page
/// table, the executable handle, and the swap file.
pub fn teardown_space(kernel: &Arc<Kernel>, space: Arc<AddressSpace>) {
    kernel.vm_lock.acquire(kernel);
    for frame in kernel.core_map.frames_of(space.pid) {
        kernel.machine.tlb_drop_frame(frame, |_| {});
        kernel.core_map.clear(frame);
        kernel.replacement.frame_cleared(frame);
    }
    kernel.machine.set_page_table(None);
    kernel.vm_lock.release(kernel);

    let pid = space.pid;
    match Arc::try_unwrap(space) {
        Ok(space) => {
            if let Err(err) = kernel.file_system.close(kernel, space.executable) {
                warn!(target: "vm", "pid {}: closing executable failed: {}", pid, err);
            }
            if let Some(swap) = space.swap {
                if let Err(err) = kernel.file_system.close(kernel, swap.file) {
                    warn!(target: "vm", "pid {}: closing swap failed: {}", pid, err);
                }
                if let Err(err) = kernel.file_system.remove_file(kernel, &swap_path(pid)) {
                    warn!(target: "vm", "pid {}: removing swap failed: {}", pid, err);
                }
            }
        }
        Err(_) => warn!(target: "vm", "pid {}: address space still referenced at teardown", pid),
    }
}
