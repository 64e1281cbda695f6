/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub mod bitmap;
pub mod directory;
pub mod file_header;
pub mod file_manager;
pub mod filesystem;
pub mod open_file;

use thiserror::Error;

use crate::machine::SECTOR_SIZE;

/// Sector holding the free map's file header.
pub const FREE_MAP_SECTOR: u32 = 0;
/// Sector holding the root directory's file header.
pub const DIRECTORY_SECTOR: u32 = 1;

pub const FILE_NAME_MAX_LEN: usize = 27;
/// Entries added each time a directory runs out of free rows.
pub const DIRECTORY_GROWTH: usize = 10;

/// Direct sector references that fit in a one-sector header next to the
/// size fields and the two indirection references.
pub const NUM_DIRECT: usize = SECTOR_SIZE / 4 - 4;
/// Sector references per indirection sector.
pub const NUM_INDIRECT: usize = SECTOR_SIZE / 4;

pub const MAX_FILE_SECTORS: usize = NUM_DIRECT + NUM_INDIRECT + NUM_INDIRECT * NUM_INDIRECT;
pub const MAX_FILE_SIZE: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FsError {
    #[error("out of disk space")]
    OutOfSpace,
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("'{0}' already exists")]
    AlreadyExists(String),
    #[error("'{0}' is not a directory")]
    NotADirectory(String),
    #[error("'{0}' is a directory")]
    IsADirectory(String),
    #[error("directory '{0}' is not empty")]
    NotEmpty(String),
    #[error("file name '{0}' is too long")]
    NameTooLong(String),
    #[error("bad argument: {0}")]
    BadArgument(&'static str),
    #[error("disk i/o failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(err.to_string())
    }
}
