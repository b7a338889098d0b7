// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Trace ids and the producer-side tracelink validator.
//!
//! A trace id is a 64-bit composite
//! `(timestamp_ms << (node_bits + seq_bits)) | (node << seq_bits) | seq`.
//!
//! # Generator Contract
//!
//! - Never returns 0.
//! - Strictly monotonic across concurrent calls: the generator CASes a
//!   combined `(timestamp, seq)` word, bumping the sequence while the
//!   millisecond is unchanged, resetting it when the clock advances, and
//!   spinning through clock regressions until the published timestamp is
//!   reached again.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock;
use crate::error::TpError;
use crate::wire::merge::TraceLinkSet;
use crate::Result;

/// Default bit split: 10 node bits, 12 sequence bits, 42 timestamp bits.
pub const NODE_ID_BITS_DEFAULT: u8 = 10;
pub const SEQUENCE_BITS_DEFAULT: u8 = 12;

/// Upper bound on `node_bits + seq_bits` (leaves >= 42 timestamp bits).
pub const MAX_NODE_AND_SEQUENCE_BITS: u8 = 22;

/// Clock source returning milliseconds. Injectable for tests.
pub type ClockMsFn = fn() -> u64;

/// Monotonic composite id generator.
pub struct TraceIdGenerator {
    node_id_and_sequence_bits: u8,
    sequence_bits: u8,
    max_node_id: u64,
    max_sequence: u64,
    node_bits: u64,
    timestamp_offset_ms: u64,
    clock: ClockMsFn,
    timestamp_sequence: AtomicU64,
}

impl TraceIdGenerator {
    /// Build a generator with an explicit bit split and clock.
    pub fn new(
        node_id_bits: u8,
        sequence_bits: u8,
        node_id: u64,
        timestamp_offset_ms: u64,
        clock: ClockMsFn,
    ) -> Result<Self> {
        let combined = node_id_bits
            .checked_add(sequence_bits)
            .filter(|bits| *bits <= MAX_NODE_AND_SEQUENCE_BITS)
            .ok_or_else(|| TpError::Config("too many node/sequence bits".into()))?;

        let max_node_id = (1u64 << node_id_bits) - 1;
        if node_id > max_node_id {
            return Err(TpError::Config(format!(
                "node id {node_id} out of range (max {max_node_id})"
            )));
        }

        let now_ms = clock();
        if timestamp_offset_ms > now_ms {
            return Err(TpError::Config(format!(
                "timestamp offset {timestamp_offset_ms} is in the future (now {now_ms})"
            )));
        }

        Ok(Self {
            node_id_and_sequence_bits: combined,
            sequence_bits,
            max_node_id,
            max_sequence: (1u64 << sequence_bits) - 1,
            node_bits: node_id << sequence_bits,
            timestamp_offset_ms,
            clock,
            timestamp_sequence: AtomicU64::new(0),
        })
    }

    /// Default bit split, realtime clock, zero offset.
    pub fn with_defaults(node_id: u64) -> Result<Self> {
        Self::new(
            NODE_ID_BITS_DEFAULT,
            SEQUENCE_BITS_DEFAULT,
            node_id,
            0,
            clock::now_realtime_ms,
        )
    }

    /// Produce the next id. Spins through sequence exhaustion and clock
    /// regression; never returns 0.
    pub fn next(&self) -> u64 {
        loop {
            let old = self.timestamp_sequence.load(Ordering::Relaxed);
            let timestamp_ms = (self.clock)().saturating_sub(self.timestamp_offset_ms);
            let old_timestamp_ms = old >> self.node_id_and_sequence_bits;

            let candidate = if timestamp_ms > old_timestamp_ms {
                Some(timestamp_ms << self.node_id_and_sequence_bits)
            } else if old & self.max_sequence < self.max_sequence {
                Some(old + 1)
            } else {
                None
            };

            if let Some(new) = candidate {
                if self
                    .timestamp_sequence
                    .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    let id = new | self.node_bits;
                    if id != 0 {
                        return id;
                    }
                    // id 0 only occurs for node 0 at the epoch millisecond
                    // with sequence 0; fall through and take the next one.
                    continue;
                }
            }

            std::hint::spin_loop();
        }
    }

    #[must_use]
    pub fn extract_timestamp_ms(&self, trace_id: u64) -> u64 {
        trace_id >> self.node_id_and_sequence_bits
    }

    #[must_use]
    pub fn extract_node_id(&self, trace_id: u64) -> u64 {
        (trace_id >> self.sequence_bits) & self.max_node_id
    }

    #[must_use]
    pub fn extract_sequence(&self, trace_id: u64) -> u64 {
        trace_id & self.max_sequence
    }
}

/// Ring of `(seq, trace_id)` pairs recorded per successful descriptor
/// offer, indexed by `seq % capacity`. Capacity mirrors `header_nslots`,
/// so an entry lives exactly as long as its slot.
pub struct TraceHistoryRing {
    entries: Vec<(u64, u64)>,
    mask: u64,
}

impl TraceHistoryRing {
    /// `capacity` must be a power of two (same constraint as the ring).
    pub fn new(capacity: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(TpError::Config(format!(
                "trace history capacity {capacity} must be a nonzero power of two"
            )));
        }
        Ok(Self {
            entries: vec![(u64::MAX, 0); capacity as usize],
            mask: u64::from(capacity) - 1,
        })
    }

    pub fn record(&mut self, seq: u64, trace_id: u64) {
        self.entries[(seq & self.mask) as usize] = (seq, trace_id);
    }

    #[must_use]
    pub fn lookup(&self, seq: u64) -> Option<u64> {
        let (stored_seq, trace_id) = self.entries[(seq & self.mask) as usize];
        (stored_seq == seq).then_some(trace_id)
    }

    /// Default tracelink validation: the set must name exactly the
    /// `(seq, trace_id)` pair most recently published for that slot.
    pub fn validate_link_set(&self, set: &TraceLinkSet) -> Result<()> {
        match self.lookup(set.seq) {
            Some(trace_id) if trace_id == set.trace_id => Ok(()),
            Some(trace_id) => Err(TpError::InvalidWire(format!(
                "trace id {:#x} does not match descriptor history {trace_id:#x} for seq {}",
                set.trace_id, set.seq
            ))),
            None => Err(TpError::InvalidWire(format!(
                "no descriptor history for seq {}",
                set.seq
            ))),
        }
    }
}
