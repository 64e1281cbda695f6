/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::kernel::Kernel;
use crate::machine::disk::Disk;
use crate::machine::SECTOR_SIZE;
use crate::sync::lock::Lock;
use crate::sync::semaphore::Semaphore;

/// Blocking wrapper around the asynchronous disk. The device handles one
/// outstanding request, so a single lock serializes callers; the completion
/// interrupt posts the semaphore the requester sleeps on.
pub struct SynchDisk {
    disk: Disk,
    lock: Lock,
    completion: Arc<Semaphore>,
}

impl SynchDisk {
    pub fn new(image_path: &Path) -> anyhow::Result<Self> {
        let completion = Arc::new(Semaphore::new("synch-disk", 0));
        let posted = completion.clone();
        let disk = Disk::attach(image_path, move |k| posted.v(k))?;
        Ok(SynchDisk {
            disk,
            lock: Lock::new("synch-disk"),
            completion,
        })
    }

    pub(crate) fn raw(&self) -> &Disk {
        &self.disk
    }

    /// Reads one sector, sleeping until the request completes.
    pub fn read_sector(&self, kernel: &Arc<Kernel>, sector: usize) -> io::Result<[u8; SECTOR_SIZE]> {
        let mut data = [0u8; SECTOR_SIZE];
        self.lock.acquire(kernel);
        let result = self.disk.read_request(kernel, sector, &mut data);
        if result.is_ok() {
            self.completion.p(kernel);
        }
        self.lock.release(kernel);
        result.map(|_| data)
    }

    /// Writes one sector, sleeping until the request completes.
    pub fn write_sector(
        &self,
        kernel: &Arc<Kernel>,
        sector: usize,
        data: &[u8; SECTOR_SIZE],
    ) -> io::Result<()> {
        self.lock.acquire(kernel);
        let result = self.disk.write_request(kernel, sector, data);
        if result.is_ok() {
            self.completion.p(kernel);
        }
        self.lock.release(kernel);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;
    use crate::stats::Statistics;

    #[test]
    fn test_sector_round_trip() {
        let kernel = test_kernel();
        kernel.run(|k| {
            let mut data = [0u8; SECTOR_SIZE];
            for (i, b) in data.iter_mut().enumerate() {
                *b = (i % 256) as u8;
            }
            k.synch_disk.write_sector(k, 17, &data).unwrap();
            assert_eq!(k.synch_disk.read_sector(k, 17).unwrap(), data);
            // A fresh sector reads back zeroed.
            assert_eq!(k.synch_disk.read_sector(k, 18).unwrap(), [0u8; SECTOR_SIZE]);
            assert_eq!(Statistics::get(&k.stats.disk_writes), 1);
            assert_eq!(Statistics::get(&k.stats.disk_reads), 2);
        });
    }
}
