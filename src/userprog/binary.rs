/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use thiserror::Error;

use crate::fs::open_file::OpenFile;
use crate::fs::FsError;
use crate::kernel::Kernel;

/// Flat executable image: a fixed header followed by the raw segment bytes.
/// The header is seven little-endian words: magic, then (virtual address,
/// size, file offset) for the code segment and again for the initialized
/// data segment. Uninitialized data and the user stack get zeroed pages.
pub const BINARY_MAGIC: u32 = 0x736f_7331;

pub const HEADER_SIZE: usize = 28;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BinaryError {
    #[error("bad executable magic {0:#010x}")]
    BadMagic(u32),
    #[error("truncated executable header")]
    Truncated,
    #[error(transparent)]
    Fs(#[from] FsError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub virtual_addr: usize,
    pub size: usize,
    pub file_offset: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinaryHeader {
    pub code: Segment,
    pub init_data: Segment,
}

impl BinaryHeader {
    pub fn read(kernel: &Arc<Kernel>, file: &OpenFile) -> Result<BinaryHeader, BinaryError> {
        let mut raw = [0u8; HEADER_SIZE];
        let n = file.read_at(kernel, &mut raw, 0)?;
        if n < HEADER_SIZE {
            return Err(BinaryError::Truncated);
        }
        let word = |i: usize| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap()) as usize;
        let magic = word(0) as u32;
        if magic != BINARY_MAGIC {
            return Err(BinaryError::BadMagic(magic));
        }
        Ok(BinaryHeader {
            code: Segment {
                virtual_addr: word(1),
                size: word(2),
                file_offset: word(3),
            },
            init_data: Segment {
                virtual_addr: word(4),
                size: word(5),
                file_offset: word(6),
            },
        })
    }
}

/// Builder for executable images, used by tests and image tooling. Code is
/// linked at virtual address zero with the initialized data right after it.
pub struct BinaryImage {
    pub code: Vec<u8>,
    pub init_data: Vec<u8>,
}

impl BinaryImage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.code.len() + self.init_data.len());
        let words = [
            BINARY_MAGIC,
            0,
            self.code.len() as u32,
            HEADER_SIZE as u32,
            self.code.len() as u32,
            self.init_data.len() as u32,
            (HEADER_SIZE + self.code.len()) as u32,
        ];
        for w in words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.init_data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_layout() {
        let image = BinaryImage {
            code: vec![1, 2, 3],
            init_data: vec![9, 8],
        };
        let bytes = image.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 3], &[1, 2, 3]);
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(magic, BINARY_MAGIC);
        // Data segment sits right after code, both on disk and in memory.
        let data_va = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        assert_eq!(data_va, 3);
        let data_off = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        assert_eq!(data_off as usize, HEADER_SIZE + 3);
    }
}
