/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use super::open_file::OpenFile;
use super::{Result, FILE_NAME_MAX_LEN};
use crate::kernel::Kernel;

/// Bytes per on-disk entry: three flag bytes, one pad byte, the null-padded
/// name, and the header sector.
pub const DIR_ENTRY_SIZE: usize = 4 + FILE_NAME_MAX_LEN + 1 + 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub in_use: bool,
    pub is_directory: bool,
    pub marked_for_deletion: bool,
    pub name: String,
    pub sector: u32,
}

impl DirectoryEntry {
    fn empty() -> Self {
        DirectoryEntry {
            in_use: false,
            is_directory: false,
            marked_for_deletion: false,
            name: String::new(),
            sector: 0,
        }
    }
}

/// In-memory copy of a directory's entry table, persisted as the body of a
/// regular file. The caller provides mutual exclusion and flushes mutations
/// with `write_back`. An entry marked for deletion stays in its row (the
/// target's sectors are still live) but is invisible to name lookups.
pub struct Directory {
    entries: Vec<DirectoryEntry>,
}

impl Directory {
    pub fn new(size: usize) -> Self {
        Directory {
            entries: vec![DirectoryEntry::empty(); size],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.in_use)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.iter().filter(|e| e.in_use)
    }

    /// Looks up a live (in-use and not deletion-marked) entry by name.
    pub fn find(&self, name: &str) -> Option<&DirectoryEntry> {
        self.entries
            .iter()
            .find(|e| e.in_use && !e.marked_for_deletion && e.name == name)
    }

    /// Index of a free row, if any; growth is the caller's business.
    pub fn vacant_slot(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.in_use)
    }

    /// Adds `additional` empty rows (after the backing file was extended).
    pub fn grow(&mut self, additional: usize) {
        self.entries
            .extend(std::iter::repeat_with(DirectoryEntry::empty).take(additional));
    }

    pub fn set(&mut self, slot: usize, name: &str, sector: u32, is_directory: bool) {
        debug_assert!(!self.entries[slot].in_use);
        debug_assert!(name.len() <= FILE_NAME_MAX_LEN);
        self.entries[slot] = DirectoryEntry {
            in_use: true,
            is_directory,
            marked_for_deletion: false,
            name: name.to_owned(),
            sector,
        };
    }

    /// Frees the row holding `sector`.
    pub fn remove(&mut self, sector: u32) {
        if let Some(e) = self.row_mut(sector) {
            *e = DirectoryEntry::empty();
        }
    }

    pub fn mark_for_deletion(&mut self, sector: u32) {
        if let Some(e) = self.row_mut(sector) {
            e.marked_for_deletion = true;
        }
    }

    pub fn is_marked_for_deletion(&self, sector: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.in_use && e.sector == sector && e.marked_for_deletion)
    }

    /// Names of live entries, for directory listings.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.in_use && !e.marked_for_deletion)
            .map(|e| e.name.clone())
            .collect()
    }

    fn row_mut(&mut self, sector: u32) -> Option<&mut DirectoryEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.in_use && e.sector == sector)
    }

    /// Loads the table from the directory's backing file; the row count is
    /// whatever the file length holds.
    pub fn fetch_from(kernel: &Arc<Kernel>, file: &OpenFile) -> Result<Directory> {
        let count = file.length() as usize / DIR_ENTRY_SIZE;
        let mut bytes = vec![0u8; count * DIR_ENTRY_SIZE];
        file.read_at(kernel, &mut bytes, 0)?;
        let entries = bytes
            .chunks_exact(DIR_ENTRY_SIZE)
            .map(decode_entry)
            .collect();
        Ok(Directory { entries })
    }

    /// Flushes the table. The backing file must already be large enough.
    pub fn write_back(&self, kernel: &Arc<Kernel>, file: &OpenFile) -> Result<()> {
        let mut bytes = Vec::with_capacity(self.entries.len() * DIR_ENTRY_SIZE);
        for e in &self.entries {
            encode_entry(e, &mut bytes);
        }
        file.write_at(kernel, &bytes, 0)?;
        Ok(())
    }
}

fn decode_entry(raw: &[u8]) -> DirectoryEntry {
    let name_bytes = &raw[4..4 + FILE_NAME_MAX_LEN + 1];
    let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    DirectoryEntry {
        in_use: raw[0] != 0,
        is_directory: raw[1] != 0,
        marked_for_deletion: raw[2] != 0,
        name: String::from_utf8_lossy(&name_bytes[..name_len]).into_owned(),
        sector: u32::from_le_bytes(raw[DIR_ENTRY_SIZE - 4..].try_into().unwrap()),
    }
}

fn encode_entry(e: &DirectoryEntry, out: &mut Vec<u8>) {
    out.push(e.in_use as u8);
    out.push(e.is_directory as u8);
    out.push(e.marked_for_deletion as u8);
    out.push(0);
    let mut name = [0u8; FILE_NAME_MAX_LEN + 1];
    let bytes = e.name.as_bytes();
    name[..bytes.len()].copy_from_slice(bytes);
    out.extend_from_slice(&name);
    out.extend_from_slice(&e.sector.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_skips_marked_entries() {
        let mut dir = Directory::new(10);
        dir.set(0, "a", 5, false);
        dir.set(1, "b", 6, true);
        assert_eq!(dir.find("a").map(|e| e.sector), Some(5));
        dir.mark_for_deletion(5);
        assert!(dir.find("a").is_none());
        assert!(dir.is_marked_for_deletion(5));
        // The row is still occupied until the deferred deletion fires.
        assert!(!dir.is_empty());
        assert_eq!(dir.vacant_slot(), Some(2));
    }

    #[test]
    fn test_remove_frees_row() {
        let mut dir = Directory::new(2);
        dir.set(0, "a", 5, false);
        dir.set(1, "b", 6, false);
        assert_eq!(dir.vacant_slot(), None);
        dir.remove(5);
        assert_eq!(dir.vacant_slot(), Some(0));
        assert!(dir.find("a").is_none());
        assert_eq!(dir.names(), vec!["b".to_owned()]);
    }

    #[test]
    fn test_entry_round_trip() {
        let mut dir = Directory::new(3);
        dir.set(0, "hello", 42, false);
        dir.set(2, "world", 7, true);
        dir.mark_for_deletion(7);
        let mut bytes = Vec::new();
        for e in &dir.entries {
            encode_entry(e, &mut bytes);
        }
        let decoded: Vec<_> = bytes.chunks_exact(DIR_ENTRY_SIZE).map(decode_entry).collect();
        assert_eq!(decoded, dir.entries);
    }
}
