/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::atomic::{AtomicU64, Ordering};

/// Performance counters for one simulation run, reported at halt.
#[derive(Default)]
pub struct Statistics {
    pub total_ticks: AtomicU64,
    pub idle_ticks: AtomicU64,
    pub context_switches: AtomicU64,
    pub disk_reads: AtomicU64,
    pub disk_writes: AtomicU64,
    pub console_chars_in: AtomicU64,
    pub console_chars_out: AtomicU64,
    pub page_faults: AtomicU64,
    pub page_ins: AtomicU64,
    pub page_outs: AtomicU64,
    pub syscalls: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> String {
        format!(
            "ticks: {} (idle {}), context switches: {}, \
             disk I/O: {}R/{}W, console: {}R/{}W, \
             paging: {} faults ({} in, {} out), syscalls: {}",
            Self::get(&self.total_ticks),
            Self::get(&self.idle_ticks),
            Self::get(&self.context_switches),
            Self::get(&self.disk_reads),
            Self::get(&self.disk_writes),
            Self::get(&self.console_chars_in),
            Self::get(&self.console_chars_out),
            Self::get(&self.page_faults),
            Self::get(&self.page_ins),
            Self::get(&self.page_outs),
            Self::get(&self.syscalls),
        )
    }
}
