/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ReplacementPolicy;
use crate::kernel::Kernel;
use crate::machine::NUM_PHYS_PAGES;

enum PolicyState {
    Fifo(VecDeque<usize>),
    Clock { hand: usize },
    Random(StdRng),
}

/// Victim selection for page replacement. The policy only ever runs when
/// every frame is occupied, under the paging lock.
pub struct Replacement {
    state: Mutex<PolicyState>,
}

impl Replacement {
    pub fn new(policy: ReplacementPolicy, seed: u64) -> Self {
        let state = match policy {
            ReplacementPolicy::Fifo => PolicyState::Fifo(VecDeque::new()),
            ReplacementPolicy::Clock => PolicyState::Clock { hand: 0 },
            ReplacementPolicy::Random => PolicyState::Random(StdRng::seed_from_u64(seed)),
        };
        Replacement {
            state: Mutex::new(state),
        }
    }

    /// Notes that a page was just placed in `frame`.
    pub fn frame_loaded(&self, frame: usize) {
        if let PolicyState::Fifo(order) = &mut *self.state.lock().unwrap() {
            order.push_back(frame);
        }
    }

    /// Notes that `frame` was vacated outside of replacement (teardown).
    pub fn frame_cleared(&self, frame: usize) {
        if let PolicyState::Fifo(order) = &mut *self.state.lock().unwrap() {
            order.retain(|&f| f != frame);
        }
    }

    /// Picks the frame to evict.
    pub fn pick_victim(&self, kernel: &Arc<Kernel>) -> usize {
        let victim = match &mut *self.state.lock().unwrap() {
            PolicyState::Fifo(order) => order.pop_front().expect("fifo queue empty with full memory"),
            PolicyState::Clock { hand } => Self::clock_sweep(kernel, hand),
            PolicyState::Random(rng) => rng.gen_range(0..NUM_PHYS_PAGES),
        };
        trace!(target: "vm", "victim frame {}", victim);
        victim
    }

    /// Enhanced clock: four passes over the frames from the hand. First a
    /// (use=0, dirty=0) frame; then (use=0, dirty=1), clearing use bits as
    /// the hand sweeps (mirrored into the TLB); then (use=1, dirty=0); then
    /// whatever the hand rests on.
    fn clock_sweep(kernel: &Arc<Kernel>, hand: &mut usize) -> usize {
        let bits = |frame: usize| -> (bool, bool) {
            frame_bits(kernel, frame).unwrap_or((false, false))
        };
        for pass in 0..4 {
            for step in 0..NUM_PHYS_PAGES {
                let frame = (*hand + step) % NUM_PHYS_PAGES;
                let (used, dirty) = bits(frame);
                let take = match pass {
                    0 => !used && !dirty,
                    1 => {
                        if used {
                            clear_used(kernel, frame);
                        }
                        !used && dirty
                    }
                    2 => used && !dirty,
                    _ => true,
                };
                if take {
                    *hand = (frame + 1) % NUM_PHYS_PAGES;
                    return frame;
                }
            }
        }
        unreachable!("pass 4 takes unconditionally")
    }
}

/// Use/dirty bits of the page resident in `frame`, read from its owner's
/// page table (the TLB bits were synced before the sweep started).
fn frame_bits(kernel: &Arc<Kernel>, frame: usize) -> Option<(bool, bool)> {
    let owner = kernel.core_map.owner(frame)?;
    let space = owner.space.upgrade()?;
    let table = space.page_table.lock().unwrap();
    let entry = table.get(owner.vpn)?;
    Some((entry.used, entry.dirty))
}

fn clear_used(kernel: &Arc<Kernel>, frame: usize) {
    if let Some(owner) = kernel.core_map.owner(frame) {
        if let Some(space) = owner.space.upgrade() {
            let mut table = space.page_table.lock().unwrap();
            if let Some(entry) = table.get_mut(owner.vpn) {
                entry.used = false;
            }
            drop(table);
            kernel.machine.tlb_clear_used(owner.vpn);
        }
    }
}
