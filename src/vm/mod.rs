/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub mod address_space;
pub mod core_map;
pub mod replacement;

use thiserror::Error;

use crate::fs::FsError;
use crate::userprog::binary::BinaryError;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("bad virtual address {0:#x}")]
    BadAddress(usize),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Binary(#[from] BinaryError),
}
