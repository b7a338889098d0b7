// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Progress policy and throttling.
//!
//! Consumers advertise how often they want partial-frame progress in their
//! hellos; the registry min-reduces those into one [`ProgressPolicy`] and
//! the producer throttles emission through [`ProgressThrottle`].

use crate::types::{NULL_U32, PROGRESS_BYTES_DELTA_DEFAULT, PROGRESS_INTERVAL_DEFAULT_US};

/// Aggregated progress policy across registered consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPolicy {
    pub interval_us: u32,
    pub bytes_delta: u32,
    /// Expressed in tensor-major units; the number is preserved verbatim.
    pub major_delta_units: u32,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            interval_us: PROGRESS_INTERVAL_DEFAULT_US,
            bytes_delta: PROGRESS_BYTES_DELTA_DEFAULT,
            major_delta_units: 0,
        }
    }
}

/// Per-frame emission state advanced atomically on each positive decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressThrottle {
    last_timestamp_ns: u64,
    last_bytes: u64,
    last_major_units: u64,
}

impl ProgressThrottle {
    /// Reset for a new frame starting now.
    pub fn start(&mut self, now_ns: u64) {
        self.last_timestamp_ns = now_ns;
        self.last_bytes = 0;
        self.last_major_units = 0;
    }

    /// Decide whether a progress record should go out. Fires when the
    /// interval elapsed, the byte delta grew enough, or the major-unit
    /// delta grew enough; advances the state on a positive decision.
    pub fn should_publish(
        &mut self,
        policy: &ProgressPolicy,
        now_ns: u64,
        bytes_filled: u64,
        major_units: u64,
    ) -> bool {
        let interval_ns = u64::from(policy.interval_us) * 1_000;
        let interval_hit = interval_ns > 0 && now_ns.saturating_sub(self.last_timestamp_ns) >= interval_ns;
        let bytes_hit = policy.bytes_delta != 0
            && policy.bytes_delta != NULL_U32
            && bytes_filled.saturating_sub(self.last_bytes) >= u64::from(policy.bytes_delta);
        let major_hit = policy.major_delta_units != 0
            && policy.major_delta_units != NULL_U32
            && major_units.saturating_sub(self.last_major_units) >= u64::from(policy.major_delta_units);

        if interval_hit || bytes_hit || major_hit {
            self.last_timestamp_ns = now_ns;
            self.last_bytes = bytes_filled;
            self.last_major_units = major_units;
            return true;
        }
        false
    }
}
