/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::{Mutex, Weak};

use super::address_space::AddressSpace;
use crate::fs::bitmap::Bitmap;
use crate::machine::NUM_PHYS_PAGES;

/// Back-reference from a physical frame to the page occupying it.
#[derive(Clone)]
pub struct FrameOwner {
    pub space: Weak<AddressSpace>,
    pub pid: u32,
    pub vpn: usize,
}

struct CoreMapInner {
    occupied: Bitmap,
    owners: Vec<Option<FrameOwner>>,
}

/// Physical-frame occupancy: a bitmap plus, per frame, the owning address
/// space and the virtual page resident there. Mutated only on kernel paths
/// serialized by the paging lock.
pub struct CoreMap {
    inner: Mutex<CoreMapInner>,
}

impl CoreMap {
    pub fn new() -> Self {
        CoreMap {
            inner: Mutex::new(CoreMapInner {
                occupied: Bitmap::new(NUM_PHYS_PAGES),
                owners: (0..NUM_PHYS_PAGES).map(|_| None).collect(),
            }),
        }
    }

    /// Claims a free frame, if one exists. The owner is recorded separately
    /// once the page is resident.
    pub fn find_free(&self) -> Option<usize> {
        self.inner.lock().unwrap().occupied.find()
    }

    pub fn mark(&self, frame: usize, owner: FrameOwner) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.occupied.test(frame));
        inner.owners[frame] = Some(owner);
    }

    pub fn clear(&self, frame: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.occupied.clear(frame);
        inner.owners[frame] = None;
    }

    pub fn owner(&self, frame: usize) -> Option<FrameOwner> {
        self.inner.lock().unwrap().owners[frame].clone()
    }

    pub fn space_of(&self, frame: usize) -> Option<Weak<AddressSpace>> {
        self.owner(frame).map(|o| o.space)
    }

    pub fn vpn_of(&self, frame: usize) -> Option<usize> {
        self.owner(frame).map(|o| o.vpn)
    }

    /// Frame holding (pid, vpn), if resident.
    pub fn find(&self, pid: u32, vpn: usize) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner.owners.iter().position(|o| {
            o.as_ref()
                .map(|o| o.pid == pid && o.vpn == vpn)
                .unwrap_or(false)
        })
    }

    /// Frames owned by one address space, for teardown.
    pub fn frames_of(&self, pid: u32) -> Vec<usize> {
        let inner = self.inner.lock().unwrap();
        inner
            .owners
            .iter()
            .enumerate()
            .filter(|(_, o)| o.as_ref().map(|o| o.pid == pid).unwrap_or(false))
            .map(|(f, _)| f)
            .collect()
    }

    pub fn count_free(&self) -> usize {
        self.inner.lock().unwrap().occupied.count_clear()
    }
}

impl Default for CoreMap {
    fn default() -> Self {
        CoreMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_and_clear() {
        let map = CoreMap::new();
        assert_eq!(map.count_free(), NUM_PHYS_PAGES);
        let f = map.find_free().unwrap();
        map.mark(
            f,
            FrameOwner {
                space: Weak::new(),
                pid: 3,
                vpn: 7,
            },
        );
        assert_eq!(map.find(3, 7), Some(f));
        assert_eq!(map.vpn_of(f), Some(7));
        assert_eq!(map.frames_of(3), vec![f]);
        map.clear(f);
        assert_eq!(map.find(3, 7), None);
        assert_eq!(map.count_free(), NUM_PHYS_PAGES);
    }
}
