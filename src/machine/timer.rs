/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use log::trace;

use crate::kernel::Kernel;

/// Periodic timer. Each expiry requests a yield-on-return, which preempts
/// the running thread at the next interrupt-enable boundary. The
/// suppression flag keeps the quantum ticking without forcing yields, for
/// deterministic runs.
pub struct Timer {
    quantum: u64,
    disable_periodic_yield: bool,
}

impl Timer {
    pub fn new(quantum: u64, disable_periodic_yield: bool) -> Self {
        Timer {
            quantum: quantum.max(1),
            disable_periodic_yield,
        }
    }

    /// Schedules the first expiry; each expiry reschedules the next.
    pub fn start(kernel: &Arc<Kernel>) {
        if let Some(timer) = &kernel.timer {
            let quantum = timer.quantum;
            kernel
                .interrupt
                .schedule(quantum, "timer", Self::expired);
        }
    }

    fn expired(kernel: &Arc<Kernel>) {
        let Some(timer) = &kernel.timer else { return };
        trace!(target: "interrupt", "timer expired at tick {}", kernel.interrupt.ticks());
        if !timer.disable_periodic_yield {
            kernel.interrupt.yield_on_return();
        }
        kernel
            .interrupt
            .schedule(timer.quantum, "timer", Self::expired);
    }
}
