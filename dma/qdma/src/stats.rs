// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Channel statistics
//!
//! Counters are plain integers: a channel has a single writer, so no
//! atomics are needed. Resetting records a baseline instead of clearing the
//! live counters, which the in-flight accounting depends on.

use core::fmt;

/// Per-channel operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VchanStats {
    /// Operations accepted by `copy` / `copy_sg`
    pub submitted: u64,
    /// Descriptors accepted by hardware
    pub enqueued: u64,
    /// Completions handed back to the caller
    pub completed: u64,
    /// Malformed completions seen on the receive path
    pub errors: u64,
}

impl VchanStats {
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.completed)
    }

    /// Counters accumulated since `baseline`
    pub fn since(&self, baseline: &VchanStats) -> VchanStats {
        VchanStats {
            submitted: self.submitted.saturating_sub(baseline.submitted),
            enqueued: self.enqueued.saturating_sub(baseline.enqueued),
            completed: self.completed.saturating_sub(baseline.completed),
            errors: self.errors.saturating_sub(baseline.errors),
        }
    }

    pub fn accumulate(&mut self, other: &VchanStats) {
        self.submitted += other.submitted;
        self.enqueued += other.enqueued;
        self.completed += other.completed;
        self.errors += other.errors;
    }
}

impl fmt::Display for VchanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "submitted={} enqueued={} completed={} errors={} in_flight={}",
            self.submitted,
            self.enqueued,
            self.completed,
            self.errors,
            self.in_flight()
        )
    }
}

/// Live counters of one channel plus the baseline of the last reset
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub live: VchanStats,
    baseline: VchanStats,
}

impl Counters {
    pub fn report(&self) -> VchanStats {
        self.live.since(&self.baseline)
    }

    pub fn reset(&mut self) {
        self.baseline = self.live;
    }
}
