/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::trace;

use super::file_header::FileHeader;
use super::open_file::OpenFile;
use super::Result;
use crate::kernel::Kernel;
use crate::sync::rwlock::ReadWriteLock;

/// Shared state of one currently-open file, keyed by its header sector.
/// Every handle returned by Open points at the same cached header and
/// read/write lock; the reference count is at least one for as long as the
/// entry exists, and only the last close drops it.
pub struct OpenFileInfo {
    pub sector: u32,
    /// Sector of the directory holding this file's entry, for the deferred
    /// deletion sweep on last close.
    pub directory_sector: u32,
    pub ref_count: Mutex<u32>,
    pub rw_lock: ReadWriteLock,
    pub header: Mutex<FileHeader>,
}

/// The open-file cache. All calls happen under the file-system lock.
pub struct FileManager {
    table: HashMap<u32, Arc<OpenFileInfo>>,
}

impl FileManager {
    pub fn new() -> Self {
        FileManager {
            table: HashMap::new(),
        }
    }

    pub fn is_managed(&self, sector: u32) -> bool {
        self.table.contains_key(&sector)
    }

    pub fn open_count(&self) -> usize {
        self.table.len()
    }

    /// Opens the file whose header lives at `sector`, creating the shared
    /// state on first open, and returns a new synchronized handle.
    pub fn open_at(
        &mut self,
        kernel: &Arc<Kernel>,
        sector: u32,
        directory_sector: u32,
    ) -> Result<OpenFile> {
        let info = match self.table.get(&sector) {
            Some(info) => info.clone(),
            None => {
                let header = FileHeader::fetch_from(kernel, sector)?;
                let info = Arc::new(OpenFileInfo {
                    sector,
                    directory_sector,
                    ref_count: Mutex::new(0),
                    rw_lock: ReadWriteLock::new("open-file"),
                    header: Mutex::new(header),
                });
                self.table.insert(sector, info.clone());
                info
            }
        };
        let mut refs = info.ref_count.lock().unwrap();
        *refs += 1;
        trace!(target: "fs", "open sector {} (refs {})", sector, *refs);
        drop(refs);
        Ok(OpenFile::new_shared(sector, info))
    }

    /// Drops one reference. Returns the shared state if that was the last
    /// reference, so the caller can run the deferred-deletion sweep; the
    /// entry is already out of the cache by then.
    pub fn release(&mut self, info: &Arc<OpenFileInfo>) -> Option<Arc<OpenFileInfo>> {
        let mut refs = info.ref_count.lock().unwrap();
        assert!(*refs > 0, "open-file reference count underflow");
        *refs -= 1;
        trace!(target: "fs", "close sector {} (refs {})", info.sector, *refs);
        if *refs == 0 {
            drop(refs);
            self.table.remove(&info.sector)
        } else {
            None
        }
    }
}

impl Default for FileManager {
    fn default() -> Self {
        FileManager::new()
    }
}
