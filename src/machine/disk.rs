/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use log::{debug, trace};

use super::{DISK_TICKS, NUM_SECTORS, SECTOR_SIZE};
use crate::kernel::Kernel;
use crate::stats::Statistics;

/// Simulated sector disk backed by a host image file. The device is
/// asynchronous: a request transfers the data immediately but its effect is
/// only defined once the completion interrupt fires, `DISK_TICKS` later.
/// The device handles one outstanding request at a time; serializing
/// requests is the synchronous wrapper's job.
pub struct Disk {
    image: Mutex<File>,
    completion: Box<dyn Fn(&Arc<Kernel>) + Send + Sync>,
}

impl Disk {
    /// Creates a zero-filled disk image of the fixed geometry.
    pub fn create_image(path: &Path) -> anyhow::Result<()> {
        let mut file = File::create(path)
            .with_context(|| format!("failed to create disk image '{}'", path.display()))?;
        let zeros = vec![0u8; SECTOR_SIZE];
        for _ in 0..NUM_SECTORS {
            file.write_all(&zeros)
                .with_context(|| "failed to zero-fill disk image")?;
        }
        debug!(target: "disk", "created image '{}' ({} sectors)", path.display(), NUM_SECTORS);
        Ok(())
    }

    /// Attaches an existing image. `completion` is invoked from the
    /// completion interrupt of every request.
    pub fn attach(
        path: &Path,
        completion: impl Fn(&Arc<Kernel>) + Send + Sync + 'static,
    ) -> anyhow::Result<Self> {
        let image = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open disk image '{}'", path.display()))?;
        let len = image
            .metadata()
            .with_context(|| "failed to stat disk image")?
            .len();
        anyhow::ensure!(
            len == (NUM_SECTORS * SECTOR_SIZE) as u64,
            "disk image '{}' has {} bytes, expected {}",
            path.display(),
            len,
            NUM_SECTORS * SECTOR_SIZE
        );
        Ok(Disk {
            image: Mutex::new(image),
            completion: Box::new(completion),
        })
    }

    pub fn read_request(
        &self,
        kernel: &Arc<Kernel>,
        sector: usize,
        data: &mut [u8; SECTOR_SIZE],
    ) -> io::Result<()> {
        assert!(sector < NUM_SECTORS, "read of sector {} out of range", sector);
        trace!(target: "disk", "read request for sector {}", sector);
        {
            let mut image = self.image.lock().unwrap();
            image.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))?;
            image.read_exact(data)?;
        }
        Statistics::bump(&kernel.stats.disk_reads);
        self.schedule_completion(kernel);
        Ok(())
    }

    pub fn write_request(
        &self,
        kernel: &Arc<Kernel>,
        sector: usize,
        data: &[u8; SECTOR_SIZE],
    ) -> io::Result<()> {
        assert!(sector < NUM_SECTORS, "write of sector {} out of range", sector);
        trace!(target: "disk", "write request for sector {}", sector);
        {
            let mut image = self.image.lock().unwrap();
            image.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))?;
            image.write_all(data)?;
            image.flush()?;
        }
        Statistics::bump(&kernel.stats.disk_writes);
        self.schedule_completion(kernel);
        Ok(())
    }

    fn schedule_completion(&self, kernel: &Arc<Kernel>) {
        kernel.interrupt.schedule(DISK_TICKS, "disk", |k| {
            (k.synch_disk.raw().completion)(k);
        });
    }
}
