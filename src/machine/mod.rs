/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub mod console;
pub mod disk;
pub mod interrupt;
#[allow(clippy::module_inception)]
pub mod machine;
pub mod timer;

/// Granularity of disk I/O, in bytes. File headers occupy exactly one sector.
pub const SECTOR_SIZE: usize = 128;
/// Number of sectors on the simulated disk.
pub const NUM_SECTORS: usize = 1024;
/// User pages are sector-sized so a page swaps 1:1 into a file sector.
pub const PAGE_SIZE: usize = SECTOR_SIZE;
/// Physical frames of simulated memory.
pub const NUM_PHYS_PAGES: usize = 32;
pub const MEMORY_SIZE: usize = NUM_PHYS_PAGES * PAGE_SIZE;
/// Entries in the software-managed TLB, when one is configured.
pub const TLB_SIZE: usize = 4;
/// Bytes of user stack appended after the executable's segments.
pub const USER_STACK_SIZE: usize = 1024;

/// Simulated ticks a disk request takes to complete.
pub const DISK_TICKS: u64 = 100;
/// Simulated ticks between console character events.
pub const CONSOLE_TICKS: u64 = 10;
