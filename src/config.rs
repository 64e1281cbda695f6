/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    pub vm: VmConfig,
    pub timer: TimerConfig,
    pub console: ConsoleConfig,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct VmConfig {
    /// Whether pages come in at construction or on first fault.
    pub loading: LoadingMode,
    /// Evict to a per-process swap file when physical memory fills up.
    pub swap: bool,
    pub replacement: ReplacementPolicy,
    /// Front the page table with a small software-managed TLB.
    pub tlb: bool,
    /// Seed for the random replacement policy.
    pub random_seed: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum LoadingMode {
    Direct,
    Demand,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementPolicy {
    Fifo,
    Clock,
    Random,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct TimerConfig {
    /// Deliver a yield at every quantum boundary.
    pub preemptive: bool,
    /// Ticks per quantum.
    pub quantum: u64,
    /// Keep the quantum ticking without forcing yields, for deterministic
    /// runs.
    pub disable_periodic_yield: bool,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ConsoleConfig {
    /// Console input file; host stdin when absent.
    pub input: Option<String>,
    /// Console output file; host stdout when absent.
    pub output: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            vm: VmConfig {
                loading: LoadingMode::Demand,
                swap: false,
                replacement: ReplacementPolicy::Clock,
                tlb: false,
                random_seed: 0,
            },
            timer: TimerConfig {
                preemptive: false,
                quantum: 100,
                disable_periodic_yield: false,
            },
            console: ConsoleConfig {
                input: None,
                output: None,
            },
        }
    }
}
