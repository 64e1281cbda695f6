/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use super::file_header::FileHeader;
use super::file_manager::OpenFileInfo;
use super::Result;
use crate::kernel::Kernel;
use crate::machine::SECTOR_SIZE;

/// How a handle reaches its file header. Internal handles (the free map,
/// directories during resolution, swap files) own a private header and rely
/// on the caller's mutual exclusion; handles returned by Open share the
/// cached header of the open-file table and serialize data access through
/// its read/write lock.
enum Backing {
    Private(FileHeader),
    Shared(Arc<OpenFileInfo>),
}

/// One holder's view of an open file: the header sector, the backing, and a
/// read/write position for the streaming interface.
pub struct OpenFile {
    sector: u32,
    pos: u32,
    backing: Backing,
}

impl OpenFile {
    pub(crate) fn new_private(sector: u32, header: FileHeader) -> Self {
        OpenFile {
            sector,
            pos: 0,
            backing: Backing::Private(header),
        }
    }

    pub(crate) fn new_shared(sector: u32, info: Arc<OpenFileInfo>) -> Self {
        OpenFile {
            sector,
            pos: 0,
            backing: Backing::Shared(info),
        }
    }

    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn length(&self) -> u32 {
        match &self.backing {
            Backing::Private(h) => h.num_bytes(),
            Backing::Shared(info) => info.header.lock().unwrap().num_bytes(),
        }
    }

    pub(crate) fn info(&self) -> Option<&Arc<OpenFileInfo>> {
        match &self.backing {
            Backing::Private(_) => None,
            Backing::Shared(info) => Some(info),
        }
    }

    pub(crate) fn header_mut(&mut self) -> &mut FileHeader {
        match &mut self.backing {
            Backing::Private(h) => h,
            Backing::Shared(_) => panic!("direct header access on a shared handle"),
        }
    }

    pub(crate) fn header(&self) -> &FileHeader {
        match &self.backing {
            Backing::Private(h) => h,
            Backing::Shared(_) => panic!("direct header access on a shared handle"),
        }
    }

    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u32 {
        self.pos
    }

    /// Reads at the current position and advances it.
    pub fn read(&mut self, kernel: &Arc<Kernel>, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(kernel, buf, self.pos)?;
        self.pos += n as u32;
        Ok(n)
    }

    /// Writes at the current position and advances it.
    pub fn write(&mut self, kernel: &Arc<Kernel>, data: &[u8]) -> Result<usize> {
        let n = self.write_at(kernel, data, self.pos)?;
        self.pos += n as u32;
        Ok(n)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, clipped to the
    /// file length. Shared handles hold the file's read lock for the whole
    /// transfer.
    pub fn read_at(&self, kernel: &Arc<Kernel>, buf: &mut [u8], offset: u32) -> Result<usize> {
        match &self.backing {
            Backing::Private(h) => raw_read(kernel, h, buf, offset),
            Backing::Shared(info) => {
                info.rw_lock.acquire_read(kernel);
                // Snapshot the header: its mutex must not be held across the
                // blocking sector transfers.
                let header = info.header.lock().unwrap().clone();
                let result = raw_read(kernel, &header, buf, offset);
                info.rw_lock.release_read(kernel);
                result
            }
        }
    }

    /// Writes `data` starting at `offset`, clipped to the file length (the
    /// façade's extend operation grows files; writing never does). Shared
    /// handles hold the file's write lock for the whole transfer.
    pub fn write_at(&self, kernel: &Arc<Kernel>, data: &[u8], offset: u32) -> Result<usize> {
        match &self.backing {
            Backing::Private(h) => raw_write(kernel, h, data, offset),
            Backing::Shared(info) => {
                info.rw_lock.acquire_write(kernel);
                let header = info.header.lock().unwrap().clone();
                let result = raw_write(kernel, &header, data, offset);
                info.rw_lock.release_write(kernel);
                result
            }
        }
    }
}

fn raw_read(kernel: &Arc<Kernel>, header: &FileHeader, buf: &mut [u8], offset: u32) -> Result<usize> {
    let length = header.num_bytes() as usize;
    let offset = offset as usize;
    if offset >= length || buf.is_empty() {
        return Ok(0);
    }
    let n = buf.len().min(length - offset);
    let first = offset / SECTOR_SIZE;
    let last = (offset + n - 1) / SECTOR_SIZE;
    let mut copied = 0;
    for i in first..=last {
        let sector = header.byte_to_sector(i * SECTOR_SIZE);
        let data = kernel.synch_disk.read_sector(kernel, sector as usize)?;
        let begin = if i == first { offset % SECTOR_SIZE } else { 0 };
        let end = if i == last { (offset + n - 1) % SECTOR_SIZE + 1 } else { SECTOR_SIZE };
        buf[copied..copied + end - begin].copy_from_slice(&data[begin..end]);
        copied += end - begin;
    }
    debug_assert_eq!(copied, n);
    Ok(n)
}

fn raw_write(kernel: &Arc<Kernel>, header: &FileHeader, data: &[u8], offset: u32) -> Result<usize> {
    let length = header.num_bytes() as usize;
    let offset = offset as usize;
    if offset >= length || data.is_empty() {
        return Ok(0);
    }
    let n = data.len().min(length - offset);
    let first = offset / SECTOR_SIZE;
    let last = (offset + n - 1) / SECTOR_SIZE;
    let mut copied = 0;
    for i in first..=last {
        let sector = header.byte_to_sector(i * SECTOR_SIZE) as usize;
        let begin = if i == first { offset % SECTOR_SIZE } else { 0 };
        let end = if i == last { (offset + n - 1) % SECTOR_SIZE + 1 } else { SECTOR_SIZE };
        let mut block = if begin == 0 && end == SECTOR_SIZE {
            [0u8; SECTOR_SIZE]
        } else {
            // Partial sector: read-modify-write.
            kernel.synch_disk.read_sector(kernel, sector)?
        };
        block[begin..end].copy_from_slice(&data[copied..copied + end - begin]);
        kernel.synch_disk.write_sector(kernel, sector, &block)?;
        copied += end - begin;
    }
    debug_assert_eq!(copied, n);
    Ok(n)
}
