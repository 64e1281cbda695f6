/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use super::open_file::OpenFile;
use super::Result;
use crate::kernel::Kernel;

const BITS_PER_WORD: usize = 32;

/// Fixed-size bit set. The free map persists one as the body of the
/// well-known file at sector 0; address spaces use transient ones to track
/// swapped pages.
pub struct Bitmap {
    num_bits: usize,
    words: Vec<u32>,
}

impl Bitmap {
    pub fn new(num_bits: usize) -> Self {
        Bitmap {
            num_bits,
            words: vec![0; num_bits.div_ceil(BITS_PER_WORD)],
        }
    }

    pub fn test(&self, which: usize) -> bool {
        debug_assert!(which < self.num_bits);
        self.words[which / BITS_PER_WORD] & (1 << (which % BITS_PER_WORD)) != 0
    }

    pub fn mark(&mut self, which: usize) {
        debug_assert!(which < self.num_bits);
        self.words[which / BITS_PER_WORD] |= 1 << (which % BITS_PER_WORD);
    }

    pub fn clear(&mut self, which: usize) {
        debug_assert!(which < self.num_bits);
        self.words[which / BITS_PER_WORD] &= !(1 << (which % BITS_PER_WORD));
    }

    /// Finds the lowest clear bit, marks it, and returns its index.
    pub fn find(&mut self) -> Option<usize> {
        for which in 0..self.num_bits {
            if !self.test(which) {
                self.mark(which);
                return Some(which);
            }
        }
        None
    }

    pub fn count_clear(&self) -> usize {
        (0..self.num_bits).filter(|&b| !self.test(b)).count()
    }

    /// Bytes of the persisted representation.
    pub fn byte_len(&self) -> usize {
        self.words.len() * 4
    }

    /// Reloads the bits from the backing file.
    pub fn fetch_from(&mut self, kernel: &Arc<Kernel>, file: &mut OpenFile) -> Result<()> {
        let mut bytes = vec![0u8; self.byte_len()];
        file.read_at(kernel, &mut bytes, 0)?;
        for (i, word) in self.words.iter_mut().enumerate() {
            *word = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Ok(())
    }

    /// Flushes the bits to the backing file.
    pub fn write_back(&self, kernel: &Arc<Kernel>, file: &mut OpenFile) -> Result<()> {
        let mut bytes = Vec::with_capacity(self.byte_len());
        for word in &self.words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        file.write_at(kernel, &bytes, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_clear() {
        let mut map = Bitmap::new(100);
        assert!(!map.test(40));
        map.mark(40);
        assert!(map.test(40));
        map.clear(40);
        assert!(!map.test(40));
    }

    #[test]
    fn test_find_is_first_free() {
        let mut map = Bitmap::new(8);
        map.mark(0);
        map.mark(1);
        assert_eq!(map.find(), Some(2));
        assert!(map.test(2));
        assert_eq!(map.count_clear(), 5);
    }

    #[test]
    fn test_find_exhausted() {
        let mut map = Bitmap::new(3);
        assert_eq!(map.find(), Some(0));
        assert_eq!(map.find(), Some(1));
        assert_eq!(map.find(), Some(2));
        assert_eq!(map.find(), None);
        assert_eq!(map.count_clear(), 0);
    }
}
