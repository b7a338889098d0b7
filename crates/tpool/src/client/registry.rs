// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Consumer registry owned by the producer.
//!
//! One entry per consumer that has said hello, refreshed on every hello
//! and swept when hellos stop arriving inside the stale window. Entries
//! own any per-consumer fabric publications and close them on eviction.

use crate::client::progress::ProgressPolicy;
use crate::error::TpError;
use crate::fabric::Publication;
use crate::types::{Mode, NULL_U32, URI_MAX_LENGTH};
use crate::wire::control::ConsumerHello;
use crate::Result;

/// Per-consumer record.
pub struct ConsumerEntry {
    pub consumer_id: u32,
    pub last_seen_ns: u64,
    pub mode: Mode,
    pub max_rate_hz: u32,
    pub supports_progress: bool,
    pub progress_interval_us: u32,
    pub progress_bytes_delta: u32,
    pub progress_major_delta_units: u32,
    pub descriptor_stream_id: u32,
    pub control_stream_id: u32,
    pub descriptor_channel: String,
    pub control_channel: String,
    pub descriptor_publication: Option<Publication>,
    pub control_publication: Option<Publication>,
    pub last_descriptor_ns: u64,
}

impl ConsumerEntry {
    fn from_hello(consumer_id: u32) -> Self {
        Self {
            consumer_id,
            last_seen_ns: 0,
            mode: Mode::Stream,
            max_rate_hz: 0,
            supports_progress: false,
            progress_interval_us: NULL_U32,
            progress_bytes_delta: NULL_U32,
            progress_major_delta_units: NULL_U32,
            descriptor_stream_id: 0,
            control_stream_id: 0,
            descriptor_channel: String::new(),
            control_channel: String::new(),
            descriptor_publication: None,
            control_publication: None,
            last_descriptor_ns: 0,
        }
    }

    /// True when the consumer asked for a dedicated descriptor stream.
    #[must_use]
    pub fn wants_descriptor_publication(&self) -> bool {
        !self.descriptor_channel.is_empty() && self.descriptor_stream_id != 0
    }

    /// True when the consumer asked for a dedicated control stream.
    #[must_use]
    pub fn wants_control_publication(&self) -> bool {
        !self.control_channel.is_empty() && self.control_stream_id != 0
    }

    fn close_publications(&mut self) {
        if let Some(publication) = self.descriptor_publication.take() {
            publication.close();
        }
        if let Some(publication) = self.control_publication.take() {
            publication.close();
        }
    }
}

/// Fixed-capacity registry.
pub struct ConsumerRegistry {
    entries: Vec<ConsumerEntry>,
    capacity: usize,
}

impl ConsumerRegistry {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TpError::Config("registry capacity must be nonzero".into()));
        }
        Ok(Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsumerEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConsumerEntry> {
        self.entries.iter_mut()
    }

    #[must_use]
    pub fn find(&self, consumer_id: u32) -> Option<&ConsumerEntry> {
        self.entries.iter().find(|e| e.consumer_id == consumer_id)
    }

    #[must_use]
    pub fn find_mut(&mut self, consumer_id: u32) -> Option<&mut ConsumerEntry> {
        self.entries.iter_mut().find(|e| e.consumer_id == consumer_id)
    }

    /// Apply a hello: find-or-allocate the entry and refresh its fields.
    ///
    /// A channel/stream pair where only one side is set is a hard reject.
    /// An over-long channel is silently cleared instead (the entry then
    /// falls back to the shared publications).
    pub fn update(&mut self, hello: &ConsumerHello, now_ns: u64) -> Result<&mut ConsumerEntry> {
        validate_channel_pair(&hello.descriptor_channel, hello.descriptor_stream_id, "descriptor")?;
        validate_channel_pair(&hello.control_channel, hello.control_stream_id, "control")?;

        let index = match self
            .entries
            .iter()
            .position(|e| e.consumer_id == hello.consumer_id)
        {
            Some(index) => index,
            None => {
                if self.entries.len() >= self.capacity {
                    return Err(TpError::Config(format!(
                        "consumer registry full (capacity {})",
                        self.capacity
                    )));
                }
                self.entries.push(ConsumerEntry::from_hello(hello.consumer_id));
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        entry.last_seen_ns = now_ns;
        entry.mode = hello.mode;
        entry.max_rate_hz = hello.max_rate_hz;
        entry.supports_progress = hello.supports_progress != 0;
        entry.progress_interval_us = hello.progress_interval_us;
        entry.progress_bytes_delta = hello.progress_bytes_delta;
        entry.progress_major_delta_units = hello.progress_major_delta_units;

        let (descriptor_channel, descriptor_stream_id) =
            clamp_channel(&hello.descriptor_channel, hello.descriptor_stream_id);
        let (control_channel, control_stream_id) =
            clamp_channel(&hello.control_channel, hello.control_stream_id);

        // A changed endpoint invalidates any publication built for the
        // old one.
        if entry.descriptor_channel != descriptor_channel
            || entry.descriptor_stream_id != descriptor_stream_id
        {
            if let Some(publication) = entry.descriptor_publication.take() {
                publication.close();
            }
        }
        if entry.control_channel != control_channel || entry.control_stream_id != control_stream_id
        {
            if let Some(publication) = entry.control_publication.take() {
                publication.close();
            }
        }

        entry.descriptor_channel = descriptor_channel;
        entry.descriptor_stream_id = descriptor_stream_id;
        entry.control_channel = control_channel;
        entry.control_stream_id = control_stream_id;

        Ok(entry)
    }

    /// Remove the consumer and close its publications.
    pub fn remove(&mut self, consumer_id: u32) -> bool {
        if let Some(index) = self.entries.iter().position(|e| e.consumer_id == consumer_id) {
            self.entries[index].close_publications();
            self.entries.swap_remove(index);
            return true;
        }
        false
    }

    /// Evict entries with no hello inside `stale_ns`. Returns evictions.
    pub fn sweep(&mut self, now_ns: u64, stale_ns: u64) -> usize {
        let before = self.entries.len();
        let mut kept = Vec::with_capacity(before);
        for mut entry in self.entries.drain(..) {
            if now_ns.saturating_sub(entry.last_seen_ns) > stale_ns {
                log::debug!(
                    "[REGISTRY] evicting stale consumer {} (last seen {} ns ago)",
                    entry.consumer_id,
                    now_ns.saturating_sub(entry.last_seen_ns)
                );
                entry.close_publications();
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        before - self.entries.len()
    }

    /// Min-reduce progress fields over progress-capable consumers;
    /// documented defaults when nothing is set.
    #[must_use]
    pub fn aggregate_progress_policy(&self) -> ProgressPolicy {
        let mut policy = ProgressPolicy::default();
        let mut have_interval = false;
        let mut have_bytes = false;
        let mut have_major = false;

        for entry in self.entries.iter().filter(|e| e.supports_progress) {
            if entry.progress_interval_us != NULL_U32 {
                policy.interval_us = if have_interval {
                    policy.interval_us.min(entry.progress_interval_us)
                } else {
                    entry.progress_interval_us
                };
                have_interval = true;
            }
            if entry.progress_bytes_delta != NULL_U32 {
                policy.bytes_delta = if have_bytes {
                    policy.bytes_delta.min(entry.progress_bytes_delta)
                } else {
                    entry.progress_bytes_delta
                };
                have_bytes = true;
            }
            if entry.progress_major_delta_units != NULL_U32 {
                policy.major_delta_units = if have_major {
                    policy.major_delta_units.min(entry.progress_major_delta_units)
                } else {
                    entry.progress_major_delta_units
                };
                have_major = true;
            }
        }

        policy
    }
}

fn validate_channel_pair(channel: &str, stream_id: u32, what: &str) -> Result<()> {
    let has_channel = !channel.is_empty();
    let has_stream = stream_id != 0;
    if has_channel != has_stream {
        return Err(TpError::Config(format!(
            "{what} channel and stream id must be both set or both unset"
        )));
    }
    Ok(())
}

fn clamp_channel(channel: &str, stream_id: u32) -> (String, u32) {
    if channel.len() > URI_MAX_LENGTH {
        log::warn!("[REGISTRY] clearing over-long channel ({} bytes)", channel.len());
        return (String::new(), 0);
    }
    (channel.to_string(), stream_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(consumer_id: u32) -> ConsumerHello {
        ConsumerHello {
            stream_id: 10_000,
            consumer_id,
            supports_shm: 1,
            expected_layout_version: 1,
            progress_interval_us: NULL_U32,
            progress_bytes_delta: NULL_U32,
            progress_major_delta_units: NULL_U32,
            ..ConsumerHello::default()
        }
    }

    #[test]
    fn test_update_allocates_then_refreshes() {
        let mut registry = ConsumerRegistry::new(4).unwrap();
        registry.update(&hello(1), 100).unwrap();
        assert_eq!(registry.len(), 1);

        registry.update(&hello(1), 200).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(1).unwrap().last_seen_ns, 200);
    }

    #[test]
    fn test_capacity_enforced() {
        let mut registry = ConsumerRegistry::new(1).unwrap();
        registry.update(&hello(1), 0).unwrap();
        assert!(registry.update(&hello(2), 0).is_err());
    }

    #[test]
    fn test_mismatched_channel_pair_rejected() {
        let mut registry = ConsumerRegistry::new(4).unwrap();
        let mut bad = hello(1);
        bad.descriptor_channel = "fabric:mem?endpoint=x".into();
        bad.descriptor_stream_id = 0;
        assert!(registry.update(&bad, 0).is_err());

        let mut bad = hello(1);
        bad.control_stream_id = 7;
        assert!(registry.update(&bad, 0).is_err());
    }

    #[test]
    fn test_oversized_channel_silently_cleared() {
        let mut registry = ConsumerRegistry::new(4).unwrap();
        let mut big = hello(1);
        big.descriptor_channel = format!("fabric:mem?endpoint={}", "x".repeat(URI_MAX_LENGTH));
        big.descriptor_stream_id = 7;
        let entry = registry.update(&big, 0).unwrap();
        assert!(entry.descriptor_channel.is_empty());
        assert_eq!(entry.descriptor_stream_id, 0);
        assert!(!entry.wants_descriptor_publication());
    }

    #[test]
    fn test_sweep_evicts_exactly_stale() {
        let mut registry = ConsumerRegistry::new(4).unwrap();
        registry.update(&hello(1), 100).unwrap();
        registry.update(&hello(2), 200).unwrap();

        // stale window 100: entry 1 is exactly at the boundary at t=200,
        // eviction requires strictly older.
        assert_eq!(registry.sweep(200, 100), 0);
        assert_eq!(registry.sweep(201, 100), 1);
        assert!(registry.find(1).is_none());
        assert!(registry.find(2).is_some());
    }

    #[test]
    fn test_aggregate_defaults_when_empty() {
        let registry = ConsumerRegistry::new(4).unwrap();
        let policy = registry.aggregate_progress_policy();
        assert_eq!(policy.interval_us, 250);
        assert_eq!(policy.bytes_delta, 64 * 1024);
    }

    #[test]
    fn test_aggregate_min_reduction() {
        let mut registry = ConsumerRegistry::new(4).unwrap();

        let mut a = hello(1);
        a.supports_progress = 1;
        a.progress_interval_us = 500;
        a.progress_bytes_delta = 8192;
        registry.update(&a, 0).unwrap();

        let mut b = hello(2);
        b.supports_progress = 1;
        b.progress_interval_us = 100;
        b.progress_major_delta_units = 16;
        registry.update(&b, 0).unwrap();

        // Non-progress consumers are ignored entirely.
        let mut c = hello(3);
        c.progress_interval_us = 1;
        registry.update(&c, 0).unwrap();

        let policy = registry.aggregate_progress_policy();
        assert_eq!(policy.interval_us, 100);
        assert_eq!(policy.bytes_delta, 8192);
        assert_eq!(policy.major_delta_units, 16);
    }
}
