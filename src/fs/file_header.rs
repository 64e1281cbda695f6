/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use super::bitmap::Bitmap;
use super::{FsError, Result, MAX_FILE_SIZE, NUM_DIRECT, NUM_INDIRECT};
use crate::kernel::Kernel;
use crate::machine::SECTOR_SIZE;

/// In-memory inflation of the on-disk file header (i-node). The raw header
/// occupies exactly one sector: byte count, data-sector count, the direct
/// references, and the single- and double-indirection sector references.
/// The indirection tables are read only when the file is large enough to
/// need them.
#[derive(Clone)]
pub struct FileHeader {
    num_bytes: u32,
    num_sectors: u32,
    direct: [u32; NUM_DIRECT],
    indirect_sector: u32,
    double_sector: u32,
    indirect: Vec<u32>,
    double_index: Vec<u32>,
    double_rows: Vec<Vec<u32>>,
}

fn data_sector_count(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_SIZE)
}

impl FileHeader {
    pub fn new() -> Self {
        FileHeader {
            num_bytes: 0,
            num_sectors: 0,
            direct: [0; NUM_DIRECT],
            indirect_sector: 0,
            double_sector: 0,
            indirect: Vec::new(),
            double_index: Vec::new(),
            double_rows: Vec::new(),
        }
    }

    pub fn num_bytes(&self) -> u32 {
        self.num_bytes
    }

    pub fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    /// Sectors a file body of `bytes` bytes occupies, indirection sectors
    /// included. Allocation, extension, and the consistency check all agree
    /// on this formula.
    pub fn required_sectors(bytes: usize) -> usize {
        Self::required_for(data_sector_count(bytes))
    }

    fn required_for(data: usize) -> usize {
        let mut total = data;
        if data > NUM_DIRECT {
            total += 1;
        }
        if data > NUM_DIRECT + NUM_INDIRECT {
            let in_double = data - NUM_DIRECT - NUM_INDIRECT;
            total += 1 + in_double.div_ceil(NUM_INDIRECT);
        }
        total
    }

    /// Physical sector holding the data at `offset`.
    pub fn byte_to_sector(&self, offset: usize) -> u32 {
        self.data_sector(offset / SECTOR_SIZE)
    }

    fn data_sector(&self, i: usize) -> u32 {
        debug_assert!(i < self.num_sectors as usize);
        if i < NUM_DIRECT {
            self.direct[i]
        } else if i < NUM_DIRECT + NUM_INDIRECT {
            self.indirect[i - NUM_DIRECT]
        } else {
            let di = i - NUM_DIRECT - NUM_INDIRECT;
            self.double_rows[di / NUM_INDIRECT][di % NUM_INDIRECT]
        }
    }

    /// First-time allocation of a fresh header.
    pub fn allocate(&mut self, free_map: &mut Bitmap, bytes: usize) -> Result<()> {
        debug_assert_eq!(self.num_sectors, 0);
        debug_assert_eq!(self.num_bytes, 0);
        self.extend(free_map, bytes)
    }

    /// Grows the file by `extra` bytes, allocating the delta in data and
    /// indirection sectors. All-or-nothing with respect to the bitmap: on
    /// failure no bit has been touched.
    pub fn extend(&mut self, free_map: &mut Bitmap, extra: usize) -> Result<()> {
        let new_bytes = self.num_bytes as usize + extra;
        if new_bytes > MAX_FILE_SIZE {
            return Err(FsError::OutOfSpace);
        }
        let old_data = self.num_sectors as usize;
        let new_data = data_sector_count(new_bytes);
        let delta = Self::required_for(new_data) - Self::required_for(old_data);
        if delta > free_map.count_clear() {
            return Err(FsError::OutOfSpace);
        }
        for i in old_data..new_data {
            if i < NUM_DIRECT {
                self.direct[i] = grab(free_map);
            } else if i < NUM_DIRECT + NUM_INDIRECT {
                if i == NUM_DIRECT {
                    self.indirect_sector = grab(free_map);
                    self.indirect = vec![0; NUM_INDIRECT];
                }
                self.indirect[i - NUM_DIRECT] = grab(free_map);
            } else {
                let di = i - NUM_DIRECT - NUM_INDIRECT;
                if di == 0 {
                    self.double_sector = grab(free_map);
                    self.double_index = vec![0; NUM_INDIRECT];
                }
                if di % NUM_INDIRECT == 0 {
                    self.double_index[di / NUM_INDIRECT] = grab(free_map);
                    self.double_rows.push(vec![0; NUM_INDIRECT]);
                }
                self.double_rows[di / NUM_INDIRECT][di % NUM_INDIRECT] = grab(free_map);
            }
        }
        self.num_bytes = new_bytes as u32;
        self.num_sectors = new_data as u32;
        Ok(())
    }

    /// Returns every sector of the file body to the free map. Each must
    /// currently be marked.
    pub fn deallocate(&mut self, free_map: &mut Bitmap) {
        for sector in self.body_sectors() {
            debug_assert!(free_map.test(sector as usize), "freeing an unmarked sector");
            free_map.clear(sector as usize);
        }
        *self = FileHeader::new();
    }

    /// Data plus indirection sectors, in layout order. Does not include the
    /// header's own sector.
    pub fn body_sectors(&self) -> Vec<u32> {
        let data = self.num_sectors as usize;
        let mut sectors = Vec::with_capacity(Self::required_for(data));
        for i in 0..data {
            sectors.push(self.data_sector(i));
        }
        if data > NUM_DIRECT {
            sectors.push(self.indirect_sector);
        }
        if data > NUM_DIRECT + NUM_INDIRECT {
            sectors.push(self.double_sector);
            let rows = (data - NUM_DIRECT - NUM_INDIRECT).div_ceil(NUM_INDIRECT);
            sectors.extend_from_slice(&self.double_index[..rows]);
        }
        sectors
    }

    /// Reads the raw header at `sector` and whatever indirection tables its
    /// size implies.
    pub fn fetch_from(kernel: &Arc<Kernel>, sector: u32) -> Result<FileHeader> {
        let raw = kernel.synch_disk.read_sector(kernel, sector as usize)?;
        let word = |i: usize| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        let mut header = FileHeader::new();
        header.num_bytes = word(0);
        header.num_sectors = word(1);
        for (i, d) in header.direct.iter_mut().enumerate() {
            *d = word(2 + i);
        }
        header.indirect_sector = word(2 + NUM_DIRECT);
        header.double_sector = word(3 + NUM_DIRECT);

        let data = header.num_sectors as usize;
        if data > NUM_DIRECT {
            header.indirect = read_table(kernel, header.indirect_sector)?;
        }
        if data > NUM_DIRECT + NUM_INDIRECT {
            header.double_index = read_table(kernel, header.double_sector)?;
            let rows = (data - NUM_DIRECT - NUM_INDIRECT).div_ceil(NUM_INDIRECT);
            for r in 0..rows {
                header
                    .double_rows
                    .push(read_table(kernel, header.double_index[r])?);
            }
        }
        Ok(header)
    }

    /// Writes the raw header and any live indirection tables back to disk.
    pub fn write_back(&self, kernel: &Arc<Kernel>, sector: u32) -> Result<()> {
        let mut raw = [0u8; SECTOR_SIZE];
        let mut put = |i: usize, v: u32| raw[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        put(0, self.num_bytes);
        put(1, self.num_sectors);
        for (i, d) in self.direct.iter().enumerate() {
            put(2 + i, *d);
        }
        put(2 + NUM_DIRECT, self.indirect_sector);
        put(3 + NUM_DIRECT, self.double_sector);
        kernel.synch_disk.write_sector(kernel, sector as usize, &raw)?;

        let data = self.num_sectors as usize;
        if data > NUM_DIRECT {
            write_table(kernel, self.indirect_sector, &self.indirect)?;
        }
        if data > NUM_DIRECT + NUM_INDIRECT {
            write_table(kernel, self.double_sector, &self.double_index)?;
            for (r, row) in self.double_rows.iter().enumerate() {
                write_table(kernel, self.double_index[r], row)?;
            }
        }
        Ok(())
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        FileHeader::new()
    }
}

fn grab(free_map: &mut Bitmap) -> u32 {
    free_map
        .find()
        .expect("free map exhausted after space was reserved") as u32
}

fn read_table(kernel: &Arc<Kernel>, sector: u32) -> Result<Vec<u32>> {
    let raw = kernel.synch_disk.read_sector(kernel, sector as usize)?;
    Ok((0..NUM_INDIRECT)
        .map(|i| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap()))
        .collect())
}

fn write_table(kernel: &Arc<Kernel>, sector: u32, table: &[u32]) -> Result<()> {
    let mut raw = [0u8; SECTOR_SIZE];
    for (i, v) in table.iter().enumerate() {
        raw[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    kernel.synch_disk.write_sector(kernel, sector as usize, &raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::NUM_SECTORS;

    #[test]
    fn test_required_sectors() {
        assert_eq!(FileHeader::required_sectors(0), 0);
        assert_eq!(FileHeader::required_sectors(1), 1);
        assert_eq!(FileHeader::required_sectors(NUM_DIRECT * SECTOR_SIZE), NUM_DIRECT);
        // One more data sector brings in the indirection sector too.
        assert_eq!(
            FileHeader::required_sectors(NUM_DIRECT * SECTOR_SIZE + 1),
            NUM_DIRECT + 2
        );
        // First double-indirect data sector: its pool index and first row.
        let single_full = (NUM_DIRECT + NUM_INDIRECT) * SECTOR_SIZE;
        assert_eq!(
            FileHeader::required_sectors(single_full + 1),
            NUM_DIRECT + NUM_INDIRECT + 1 + 1 + 1 + 1
        );
    }

    #[test]
    fn test_allocate_direct_only() {
        let mut map = Bitmap::new(NUM_SECTORS);
        let mut header = FileHeader::new();
        header.allocate(&mut map, 3 * SECTOR_SIZE).unwrap();
        assert_eq!(header.num_sectors(), 3);
        assert_eq!(map.count_clear(), NUM_SECTORS - 3);
        assert_eq!(header.byte_to_sector(0), 0);
        assert_eq!(header.byte_to_sector(2 * SECTOR_SIZE + 5), 2);
    }

    #[test]
    fn test_allocate_through_double_indirect() {
        let mut map = Bitmap::new(NUM_SECTORS);
        let mut header = FileHeader::new();
        let data = NUM_DIRECT + NUM_INDIRECT + 5;
        header.allocate(&mut map, data * SECTOR_SIZE).unwrap();
        assert_eq!(header.num_sectors() as usize, data);
        assert_eq!(
            map.count_clear(),
            NUM_SECTORS - FileHeader::required_sectors(data * SECTOR_SIZE)
        );
        // Every mapped sector is distinct and marked.
        let mut seen = Bitmap::new(NUM_SECTORS);
        for i in 0..data {
            let s = header.byte_to_sector(i * SECTOR_SIZE) as usize;
            assert!(map.test(s));
            assert!(!seen.test(s), "sector {} mapped twice", s);
            seen.mark(s);
        }
    }

    #[test]
    fn test_extend_failure_touches_nothing() {
        let mut map = Bitmap::new(8);
        let mut header = FileHeader::new();
        header.allocate(&mut map, 2 * SECTOR_SIZE).unwrap();
        let clear_before = map.count_clear();
        let err = header.extend(&mut map, 100 * SECTOR_SIZE).unwrap_err();
        assert_eq!(err, FsError::OutOfSpace);
        assert_eq!(map.count_clear(), clear_before);
        assert_eq!(header.num_sectors(), 2);
        assert_eq!(header.num_bytes(), 2 * SECTOR_SIZE as u32);
    }

    #[test]
    fn test_extend_rejects_over_max_size() {
        let mut map = Bitmap::new(NUM_SECTORS);
        let mut header = FileHeader::new();
        header.allocate(&mut map, 10).unwrap();
        assert_eq!(
            header.extend(&mut map, MAX_FILE_SIZE),
            Err(FsError::OutOfSpace)
        );
    }

    #[test]
    fn test_deallocate_returns_all_sectors() {
        let mut map = Bitmap::new(NUM_SECTORS);
        let mut header = FileHeader::new();
        header
            .allocate(&mut map, (NUM_DIRECT + 3) * SECTOR_SIZE)
            .unwrap();
        assert_ne!(map.count_clear(), NUM_SECTORS);
        header.deallocate(&mut map);
        assert_eq!(map.count_clear(), NUM_SECTORS);
        assert_eq!(header.num_bytes(), 0);
    }

    #[test]
    fn test_extend_within_slack_allocates_nothing() {
        let mut map = Bitmap::new(NUM_SECTORS);
        let mut header = FileHeader::new();
        header.allocate(&mut map, SECTOR_SIZE / 2).unwrap();
        let clear = map.count_clear();
        header.extend(&mut map, SECTOR_SIZE / 4).unwrap();
        assert_eq!(map.count_clear(), clear);
        assert_eq!(header.num_bytes() as usize, SECTOR_SIZE / 2 + SECTOR_SIZE / 4);
    }
}
