// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Consumer manager: hello handling, per-consumer publications, and
//! descriptor fan-out with rate limiting.
//!
//! The manager owns the registry; registry entries own their per-consumer
//! publications; the shared publications stay with the producer. Failure
//! to install a per-consumer publication is non-fatal, the entry keeps
//! working through the shared streams.

use std::sync::Arc;

use crate::client::progress::ProgressPolicy;
use crate::client::registry::ConsumerRegistry;
use crate::fabric::{MemFabric, Publication, StreamAddr};
use crate::types::{Mode, CONSUMER_STALE_MULTIPLIER};
use crate::wire::control::{ConsumerConfig, ConsumerHello};
use crate::Result;

pub struct ConsumerManager {
    fabric: Arc<MemFabric>,
    registry: ConsumerRegistry,
    policy: ProgressPolicy,
    stale_ns: u64,
    last_sweep_ns: u64,
}

impl ConsumerManager {
    pub fn new(fabric: Arc<MemFabric>, capacity: usize, announce_period_ns: u64) -> Result<Self> {
        Ok(Self {
            fabric,
            registry: ConsumerRegistry::new(capacity)?,
            policy: ProgressPolicy::default(),
            stale_ns: announce_period_ns * CONSUMER_STALE_MULTIPLIER,
            last_sweep_ns: 0,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    #[must_use]
    pub fn policy(&self) -> ProgressPolicy {
        self.policy
    }

    #[must_use]
    pub fn stale_ns(&self) -> u64 {
        self.stale_ns
    }

    /// Apply a hello and reply with the consumer's effective config.
    ///
    /// The reply goes to the consumer's dedicated control stream when it
    /// asked for one, otherwise to the shared control publication.
    pub fn handle_hello(
        &mut self,
        hello: &ConsumerHello,
        shared_control: &Publication,
        shared_descriptor_addr: &StreamAddr,
        shared_control_addr: &StreamAddr,
        payload_fallback_uri: &str,
        now_ns: u64,
    ) -> Result<()> {
        let fabric = Arc::clone(&self.fabric);
        let entry = self.registry.update(hello, now_ns)?;

        if entry.wants_descriptor_publication() && entry.descriptor_publication.is_none() {
            let addr = StreamAddr::new(entry.descriptor_channel.clone(), entry.descriptor_stream_id);
            entry.descriptor_publication = Some(fabric.add_publication(addr));
        }
        if entry.wants_control_publication() && entry.control_publication.is_none() {
            let addr = StreamAddr::new(entry.control_channel.clone(), entry.control_stream_id);
            entry.control_publication = Some(fabric.add_publication(addr));
        }

        let config = ConsumerConfig {
            stream_id: hello.stream_id,
            consumer_id: hello.consumer_id,
            use_shm: hello.supports_shm,
            mode: entry.mode,
            descriptor_stream_id: if entry.wants_descriptor_publication() {
                entry.descriptor_stream_id
            } else {
                shared_descriptor_addr.stream_id
            },
            control_stream_id: if entry.wants_control_publication() {
                entry.control_stream_id
            } else {
                shared_control_addr.stream_id
            },
            payload_fallback_uri: payload_fallback_uri.to_string(),
            descriptor_channel: if entry.wants_descriptor_publication() {
                entry.descriptor_channel.clone()
            } else {
                shared_descriptor_addr.channel.clone()
            },
            control_channel: if entry.wants_control_publication() {
                entry.control_channel.clone()
            } else {
                shared_control_addr.channel.clone()
            },
        };

        let mut buf = vec![
            0u8;
            512 + config.payload_fallback_uri.len()
                + config.descriptor_channel.len()
                + config.control_channel.len()
        ];
        let len = config.encode(&mut buf)?;
        let reply_target = entry.control_publication.as_ref().unwrap_or(shared_control);
        if !reply_target.offer(&buf[..len]).is_ok() {
            // Config replies are retried implicitly by the consumer's next
            // hello; a transient offer failure is only worth a log line.
            log::warn!(
                "[MANAGER] consumer {} config reply not delivered",
                hello.consumer_id
            );
        }

        self.refresh_progress_policy();
        Ok(())
    }

    /// Recompute the aggregated progress policy.
    pub fn refresh_progress_policy(&mut self) {
        self.policy = self.registry.aggregate_progress_policy();
    }

    /// Offer an encoded descriptor on every per-consumer descriptor
    /// publication, honoring per-consumer rate limits. Returns how many
    /// publications accepted it.
    pub fn publish_descriptor(&mut self, encoded: &[u8], now_ns: u64) -> usize {
        let mut published = 0;
        for entry in self.registry.iter_mut() {
            let Some(publication) = entry.descriptor_publication.as_ref() else {
                continue;
            };

            if entry.mode == Mode::RateLimited && entry.max_rate_hz > 0 {
                let min_gap_ns = 1_000_000_000 / u64::from(entry.max_rate_hz);
                if now_ns.saturating_sub(entry.last_descriptor_ns) < min_gap_ns {
                    continue;
                }
            }

            if publication.offer(encoded).is_ok() {
                entry.last_descriptor_ns = now_ns;
                published += 1;
            }
        }
        published
    }

    /// Offer an encoded progress record on every per-consumer control
    /// publication. Returns how many accepted it.
    pub fn publish_progress(&mut self, encoded: &[u8]) -> usize {
        let mut published = 0;
        for entry in self.registry.iter_mut() {
            if let Some(publication) = entry.control_publication.as_ref() {
                if publication.offer(encoded).is_ok() {
                    published += 1;
                }
            }
        }
        published
    }

    /// Refresh a consumer's liveness without a full hello.
    pub fn touch(&mut self, consumer_id: u32, now_ns: u64) -> bool {
        if let Some(entry) = self.registry.find_mut(consumer_id) {
            entry.last_seen_ns = now_ns;
            return true;
        }
        false
    }

    /// Periodic sweep at the stale cadence; cheap to call every pass.
    pub fn sweep_if_due(&mut self, now_ns: u64) -> usize {
        if now_ns.saturating_sub(self.last_sweep_ns) < self.stale_ns {
            return 0;
        }
        self.last_sweep_ns = now_ns;
        let evicted = self.registry.sweep(now_ns, self.stale_ns);
        if evicted > 0 {
            self.refresh_progress_policy();
        }
        evicted
    }

    /// Immediate sweep with an explicit window (tests and shutdown).
    pub fn sweep(&mut self, now_ns: u64, stale_ns: u64) -> usize {
        let evicted = self.registry.sweep(now_ns, stale_ns);
        if evicted > 0 {
            self.refresh_progress_policy();
        }
        evicted
    }
}
