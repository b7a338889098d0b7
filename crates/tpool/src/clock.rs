// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Clock helpers.
//!
//! All internal deadlines use the monotonic clock; wall-clock time only
//! appears in announce timestamps and trace-id generation.

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds on the monotonic clock, anchored at an arbitrary process
/// epoch. Comparable only within one process.
#[must_use]
pub fn now_monotonic_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Nanoseconds since the Unix epoch on the realtime clock.
#[must_use]
pub fn now_realtime_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Milliseconds since the Unix epoch on the realtime clock.
#[must_use]
pub fn now_realtime_ms() -> u64 {
    now_realtime_ns() / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_regresses() {
        let a = now_monotonic_ns();
        let b = now_monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_realtime_is_plausible() {
        // After 2020-01-01 in both units.
        assert!(now_realtime_ns() > 1_577_836_800_000_000_000);
        assert!(now_realtime_ms() > 1_577_836_800_000);
    }
}
