/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::{Arc, Mutex};

use log::{debug, error, info};

use super::bitmap::Bitmap;
use super::directory::{Directory, DIR_ENTRY_SIZE};
use super::file_header::FileHeader;
use super::file_manager::FileManager;
use super::open_file::OpenFile;
use super::{
    FsError, Result, DIRECTORY_GROWTH, DIRECTORY_SECTOR, FILE_NAME_MAX_LEN, FREE_MAP_SECTOR,
};
use crate::kernel::Kernel;
use crate::machine::NUM_SECTORS;
use crate::sync::lock::Lock;
use crate::threads::thread;

struct FsState {
    free_map: Bitmap,
    free_map_file: OpenFile,
    manager: FileManager,
}

/// The file-system façade. One process-wide lock makes every mutating
/// operation linearizable; the free map, the open-file cache, and all
/// directory tables are touched only while it is held. A mutating operation
/// that fails midway reloads the free map from disk, discarding any partial
/// allocation; a successful one flushes header, directory, and free map
/// before the lock is released.
pub struct FileSystem {
    lock: Lock,
    state: Mutex<Option<FsState>>,
}

impl FileSystem {
    pub fn new() -> Self {
        FileSystem {
            lock: Lock::new("filesystem"),
            state: Mutex::new(None),
        }
    }

    /// Brings the file system up from the attached disk, formatting it
    /// first when asked. Runs on the boot thread before anything else uses
    /// the disk.
    pub fn initialize(&self, kernel: &Arc<Kernel>, format: bool) -> Result<()> {
        let state = if format {
            info!(target: "fs", "formatting disk ({} sectors)", NUM_SECTORS);
            let mut free_map = Bitmap::new(NUM_SECTORS);
            free_map.mark(FREE_MAP_SECTOR as usize);
            free_map.mark(DIRECTORY_SECTOR as usize);

            let mut map_header = FileHeader::new();
            let free_map_byte_len = free_map.byte_len();
            map_header.allocate(&mut free_map, free_map_byte_len)?;
            let mut root_header = FileHeader::new();
            root_header.allocate(&mut free_map, DIRECTORY_GROWTH * DIR_ENTRY_SIZE)?;

            map_header.write_back(kernel, FREE_MAP_SECTOR)?;
            root_header.write_back(kernel, DIRECTORY_SECTOR)?;

            let root_file = OpenFile::new_private(DIRECTORY_SECTOR, root_header);
            Directory::new(DIRECTORY_GROWTH).write_back(kernel, &root_file)?;

            let mut free_map_file = OpenFile::new_private(FREE_MAP_SECTOR, map_header);
            free_map.write_back(kernel, &mut free_map_file)?;
            FsState {
                free_map,
                free_map_file,
                manager: FileManager::new(),
            }
        } else {
            let map_header = FileHeader::fetch_from(kernel, FREE_MAP_SECTOR)?;
            let mut free_map_file = OpenFile::new_private(FREE_MAP_SECTOR, map_header);
            let mut free_map = Bitmap::new(NUM_SECTORS);
            free_map.fetch_from(kernel, &mut free_map_file)?;
            FsState {
                free_map,
                free_map_file,
                manager: FileManager::new(),
            }
        };
        *self.state.lock().unwrap() = Some(state);
        Ok(())
    }

    /// Creates a regular file of `size` bytes.
    pub fn create_file(&self, kernel: &Arc<Kernel>, path: &str, size: usize) -> Result<()> {
        debug!(target: "fs", "create file '{}' ({} bytes)", path, size);
        self.with_lock(kernel, |state| {
            state.create_entry(kernel, path, size, false)
        })
    }

    /// Creates an empty sub-directory.
    pub fn create_directory(&self, kernel: &Arc<Kernel>, path: &str) -> Result<()> {
        debug!(target: "fs", "create directory '{}'", path);
        self.with_lock(kernel, |state| {
            state.create_entry(kernel, path, DIRECTORY_GROWTH * DIR_ENTRY_SIZE, true)
        })
    }

    /// Opens a regular file and returns a synchronized handle.
    pub fn open(&self, kernel: &Arc<Kernel>, path: &str) -> Result<OpenFile> {
        self.with_lock(kernel, |state| {
            let (parent, name) = state.resolve_parent(kernel, path)?;
            let dir = Directory::fetch_from(kernel, &parent)?;
            let entry = dir.find(&name).ok_or_else(|| FsError::NotFound(path.to_owned()))?;
            if entry.is_directory {
                return Err(FsError::IsADirectory(path.to_owned()));
            }
            state.manager.open_at(kernel, entry.sector, parent.sector())
        })
    }

    /// Closes a handle. The last close of a file whose directory entry is
    /// marked for deletion frees the file for real.
    pub fn close(&self, kernel: &Arc<Kernel>, file: OpenFile) -> Result<()> {
        self.with_lock(kernel, |state| state.close_handle(kernel, file))
    }

    /// Removes a regular file by name. An open file stays readable through
    /// existing handles: its entry is only marked, and the sectors are freed
    /// on last close.
    pub fn remove_file(&self, kernel: &Arc<Kernel>, path: &str) -> Result<()> {
        debug!(target: "fs", "remove file '{}'", path);
        self.with_lock(kernel, |state| {
            let (parent, name) = state.resolve_parent(kernel, path)?;
            let mut dir = Directory::fetch_from(kernel, &parent)?;
            let entry = dir
                .find(&name)
                .ok_or_else(|| FsError::NotFound(path.to_owned()))?
                .clone();
            if entry.is_directory {
                return Err(FsError::IsADirectory(path.to_owned()));
            }
            if state.manager.is_managed(entry.sector) {
                dir.mark_for_deletion(entry.sector);
                dir.write_back(kernel, &parent)?;
            } else {
                let mut header = FileHeader::fetch_from(kernel, entry.sector)?;
                header.deallocate(&mut state.free_map);
                state.free_map.clear(entry.sector as usize);
                dir.remove(entry.sector);
                dir.write_back(kernel, &parent)?;
                state.flush_free_map(kernel)?;
            }
            Ok(())
        })
    }

    /// Removes an empty directory. A directory held open as some thread's
    /// working directory is marked and freed on last close, like a file.
    pub fn remove_directory(&self, kernel: &Arc<Kernel>, path: &str) -> Result<()> {
        debug!(target: "fs", "remove directory '{}'", path);
        self.with_lock(kernel, |state| {
            let (parent, name) = state.resolve_parent(kernel, path)?;
            let mut dir = Directory::fetch_from(kernel, &parent)?;
            let entry = dir
                .find(&name)
                .ok_or_else(|| FsError::NotFound(path.to_owned()))?
                .clone();
            if !entry.is_directory {
                return Err(FsError::NotADirectory(path.to_owned()));
            }
            let target_file = state.open_private(kernel, entry.sector)?;
            let target = Directory::fetch_from(kernel, &target_file)?;
            if !target.is_empty() {
                return Err(FsError::NotEmpty(path.to_owned()));
            }
            if state.manager.is_managed(entry.sector) {
                dir.mark_for_deletion(entry.sector);
                dir.write_back(kernel, &parent)?;
            } else {
                let mut header = FileHeader::fetch_from(kernel, entry.sector)?;
                header.deallocate(&mut state.free_map);
                state.free_map.clear(entry.sector as usize);
                dir.remove(entry.sector);
                dir.write_back(kernel, &parent)?;
                state.flush_free_map(kernel)?;
            }
            Ok(())
        })
    }

    /// Grows an open file by `extra` bytes. Reentrant with respect to the
    /// façade lock so internal callers already holding it can extend too.
    pub fn extend_file(&self, kernel: &Arc<Kernel>, file: &OpenFile, extra: usize) -> Result<()> {
        self.with_lock(kernel, |state| {
            let info = file
                .info()
                .ok_or(FsError::BadArgument("extend of an internal handle"))?;
            let extended = {
                let mut header = info.header.lock().unwrap();
                header.extend(&mut state.free_map, extra).map(|_| header.clone())
            };
            match extended {
                Ok(snapshot) => {
                    snapshot.write_back(kernel, file.sector())?;
                    state.flush_free_map(kernel)?;
                    Ok(())
                }
                Err(err) => {
                    state.reload_free_map(kernel)?;
                    Err(err)
                }
            }
        })
    }

    /// Writes at the handle's position, extending the file first when the
    /// write runs past the current end.
    pub fn write_extending(
        &self,
        kernel: &Arc<Kernel>,
        file: &mut OpenFile,
        data: &[u8],
    ) -> Result<usize> {
        let end = file.tell() as usize + data.len();
        let length = file.length() as usize;
        if end > length {
            self.extend_file(kernel, file, end - length)?;
        }
        file.write(kernel, data)
    }

    /// Re-points the calling thread's working directory.
    pub fn change_directory(&self, kernel: &Arc<Kernel>, path: &str) -> Result<()> {
        self.with_lock(kernel, |state| {
            let old = if path_components(path).is_empty() && path.starts_with('/') {
                // Back to the root, which needs no handle.
                thread::current().cwd.lock().unwrap().take()
            } else {
                let (parent, name) = state.resolve_parent(kernel, path)?;
                let dir = Directory::fetch_from(kernel, &parent)?;
                let entry = dir
                    .find(&name)
                    .ok_or_else(|| FsError::NotFound(path.to_owned()))?;
                if !entry.is_directory {
                    return Err(FsError::NotADirectory(path.to_owned()));
                }
                let handle = state.manager.open_at(kernel, entry.sector, parent.sector())?;
                thread::current().cwd.lock().unwrap().replace(handle)
            };
            if let Some(old) = old {
                state.close_handle(kernel, old)?;
            }
            Ok(())
        })
    }

    /// Names in the directory at `path` (the cwd for a relative path).
    pub fn list_directory_contents(&self, kernel: &Arc<Kernel>, path: &str) -> Result<Vec<String>> {
        self.with_lock(kernel, |state| {
            let sector = state.resolve_dir(kernel, path)?;
            let file = state.open_private(kernel, sector)?;
            let dir = Directory::fetch_from(kernel, &file)?;
            Ok(dir.names())
        })
    }

    /// Free sectors left on the disk.
    pub fn count_clear(&self, kernel: &Arc<Kernel>) -> usize {
        self.with_lock(kernel, |state| state.free_map.count_clear())
    }

    /// Files currently held in the open-file cache.
    pub fn open_file_count(&self, kernel: &Arc<Kernel>) -> usize {
        self.with_lock(kernel, |state| state.manager.open_count())
    }

    /// Consistency pass: walks the directory tree shadow-marking every
    /// referenced sector, reports aliased sectors and duplicate names, and
    /// compares the shadow map against the persisted free map. Returns
    /// whether everything agreed; details go to the log.
    pub fn check(&self, kernel: &Arc<Kernel>) -> Result<bool> {
        self.with_lock(kernel, |state| {
            let mut shadow = Bitmap::new(NUM_SECTORS);
            let mut ok = true;

            let map_header = FileHeader::fetch_from(kernel, FREE_MAP_SECTOR)?;
            shadow_mark(&mut shadow, &mut ok, FREE_MAP_SECTOR);
            for s in map_header.body_sectors() {
                shadow_mark(&mut shadow, &mut ok, s);
            }

            let mut stack = vec![DIRECTORY_SECTOR];
            while let Some(dir_sector) = stack.pop() {
                let header = FileHeader::fetch_from(kernel, dir_sector)?;
                shadow_mark(&mut shadow, &mut ok, dir_sector);
                for s in header.body_sectors() {
                    shadow_mark(&mut shadow, &mut ok, s);
                }
                let file = OpenFile::new_private(dir_sector, header);
                let dir = Directory::fetch_from(kernel, &file)?;

                let mut names: Vec<_> = dir.names();
                names.sort();
                for pair in names.windows(2) {
                    if pair[0] == pair[1] {
                        error!(target: "fs", "duplicate name '{}' in directory at sector {}", pair[0], dir_sector);
                        ok = false;
                    }
                }

                // Deletion-marked entries still own their sectors.
                for entry in dir.entries() {
                    if entry.is_directory {
                        stack.push(entry.sector);
                    } else {
                        let h = FileHeader::fetch_from(kernel, entry.sector)?;
                        shadow_mark(&mut shadow, &mut ok, entry.sector);
                        for s in h.body_sectors() {
                            shadow_mark(&mut shadow, &mut ok, s);
                        }
                    }
                }
            }

            let mut persisted = Bitmap::new(NUM_SECTORS);
            persisted.fetch_from(kernel, &mut state.free_map_file)?;
            for s in 0..NUM_SECTORS {
                if shadow.test(s) != persisted.test(s) {
                    error!(
                        target: "fs",
                        "sector {}: shadow {} but free map {}",
                        s,
                        shadow.test(s),
                        persisted.test(s)
                    );
                    ok = false;
                }
            }
            Ok(ok)
        })
    }

    /// Runs `f` on the file-system state with the façade lock held. Already
    /// holding the lock is fine; the lock is then left as it was.
    fn with_lock<R>(&self, kernel: &Arc<Kernel>, f: impl FnOnce(&mut FsState) -> R) -> R {
        let held = self.lock.is_held_by_current_thread();
        if !held {
            self.lock.acquire(kernel);
        }
        let result = {
            let mut guard = self.state.lock().unwrap();
            let state = guard.as_mut().expect("file system not initialized");
            f(state)
        };
        if !held {
            self.lock.release(kernel);
        }
        result
    }
}

impl Default for FileSystem {
    fn default() -> Self {
        FileSystem::new()
    }
}

fn shadow_mark(shadow: &mut Bitmap, ok: &mut bool, sector: u32) {
    if shadow.test(sector as usize) {
        error!(target: "fs", "sector {} is referenced twice", sector);
        *ok = false;
    } else {
        shadow.mark(sector as usize);
    }
}

fn path_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

impl FsState {
    fn open_private(&self, kernel: &Arc<Kernel>, sector: u32) -> Result<OpenFile> {
        Ok(OpenFile::new_private(
            sector,
            FileHeader::fetch_from(kernel, sector)?,
        ))
    }

    /// Where resolution starts: the root for an absolute path, the calling
    /// thread's working directory otherwise.
    fn start_sector(path: &str) -> u32 {
        if path.starts_with('/') {
            DIRECTORY_SECTOR
        } else {
            thread::current()
                .cwd
                .lock()
                .unwrap()
                .as_ref()
                .map(|f| f.sector())
                .unwrap_or(DIRECTORY_SECTOR)
        }
    }

    fn lookup_subdir(&self, kernel: &Arc<Kernel>, dir_sector: u32, name: &str) -> Result<u32> {
        let file = self.open_private(kernel, dir_sector)?;
        let dir = Directory::fetch_from(kernel, &file)?;
        let entry = dir.find(name).ok_or_else(|| FsError::NotFound(name.to_owned()))?;
        if !entry.is_directory {
            return Err(FsError::NotADirectory(name.to_owned()));
        }
        Ok(entry.sector)
    }

    /// Resolves everything up to the final component; returns the enclosing
    /// directory (as a private handle) and the final name.
    fn resolve_parent(&self, kernel: &Arc<Kernel>, path: &str) -> Result<(OpenFile, String)> {
        let mut components = path_components(path);
        let name = components
            .pop()
            .ok_or(FsError::BadArgument("path has no final component"))?;
        if name.len() > FILE_NAME_MAX_LEN {
            return Err(FsError::NameTooLong(name.to_owned()));
        }
        let mut sector = Self::start_sector(path);
        for c in components {
            sector = self.lookup_subdir(kernel, sector, c)?;
        }
        Ok((self.open_private(kernel, sector)?, name.to_owned()))
    }

    /// Resolves a whole path as a directory.
    fn resolve_dir(&self, kernel: &Arc<Kernel>, path: &str) -> Result<u32> {
        let mut sector = Self::start_sector(path);
        for c in path_components(path) {
            sector = self.lookup_subdir(kernel, sector, c)?;
        }
        Ok(sector)
    }

    fn create_entry(
        &mut self,
        kernel: &Arc<Kernel>,
        path: &str,
        size: usize,
        is_directory: bool,
    ) -> Result<()> {
        let (mut parent, name) = self.resolve_parent(kernel, path)?;
        let mut dir = Directory::fetch_from(kernel, &parent)?;
        if dir.find(&name).is_some() {
            return Err(FsError::AlreadyExists(path.to_owned()));
        }
        let result = self.try_create(kernel, &mut parent, &mut dir, &name, size, is_directory);
        if result.is_err() {
            // Discard whatever was provisionally allocated.
            self.reload_free_map(kernel)?;
        }
        result
    }

    fn try_create(
        &mut self,
        kernel: &Arc<Kernel>,
        parent: &mut OpenFile,
        dir: &mut Directory,
        name: &str,
        size: usize,
        is_directory: bool,
    ) -> Result<()> {
        let header_sector = self.free_map.find().ok_or(FsError::OutOfSpace)? as u32;
        let mut header = FileHeader::new();
        header.allocate(&mut self.free_map, size)?;
        let slot = match dir.vacant_slot() {
            Some(slot) => slot,
            None => {
                let slot = dir.len();
                parent
                    .header_mut()
                    .extend(&mut self.free_map, DIRECTORY_GROWTH * DIR_ENTRY_SIZE)?;
                dir.grow(DIRECTORY_GROWTH);
                slot
            }
        };
        dir.set(slot, name, header_sector, is_directory);

        header.write_back(kernel, header_sector)?;
        if is_directory {
            let child = OpenFile::new_private(header_sector, header);
            Directory::new(DIRECTORY_GROWTH).write_back(kernel, &child)?;
        }
        dir.write_back(kernel, parent)?;
        parent.header().write_back(kernel, parent.sector())?;
        self.flush_free_map(kernel)
    }

    fn close_handle(&mut self, kernel: &Arc<Kernel>, file: OpenFile) -> Result<()> {
        let Some(info) = file.info().cloned() else {
            // Private handles carry no shared state.
            return Ok(());
        };
        drop(file);
        if let Some(last) = self.manager.release(&info) {
            let parent = self.open_private(kernel, last.directory_sector)?;
            let mut dir = Directory::fetch_from(kernel, &parent)?;
            if dir.is_marked_for_deletion(last.sector) {
                debug!(target: "fs", "deferred deletion of sector {}", last.sector);
                {
                    let mut header = last.header.lock().unwrap();
                    header.deallocate(&mut self.free_map);
                }
                self.free_map.clear(last.sector as usize);
                dir.remove(last.sector);
                dir.write_back(kernel, &parent)?;
                self.flush_free_map(kernel)?;
            }
        }
        Ok(())
    }

    fn flush_free_map(&mut self, kernel: &Arc<Kernel>) -> Result<()> {
        let FsState {
            free_map,
            free_map_file,
            ..
        } = self;
        free_map.write_back(kernel, free_map_file)
    }

    fn reload_free_map(&mut self, kernel: &Arc<Kernel>) -> Result<()> {
        let FsState {
            free_map,
            free_map_file,
            ..
        } = self;
        free_map.fetch_from(kernel, free_map_file)
    }
}
