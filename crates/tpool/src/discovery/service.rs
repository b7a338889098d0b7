// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Directory service.
//!
//! Indexes SHM-pool and data-source announcements by stream id, expires
//! entries that stop announcing, and answers filtered queries over the
//! fabric. Malformed announcements are logged and dropped without
//! retaining state; stale-epoch announcements are ignored.

use std::collections::HashMap;

use crate::client::client::Agent;
use crate::error::TpError;
use crate::fabric::{FragmentAssembler, MemFabric, Publication, StreamAddr, Subscription};
use crate::types::{
    ANNOUNCE_FRESHNESS_MULTIPLIER, ANNOUNCE_PERIOD_DEFAULT_NS, HEADER_SLOT_BYTES, MAX_DIMS,
    NULL_U32, STREAM_ID_ANNOUNCE, STREAM_ID_DISCOVERY_REQUEST, STREAM_ID_METADATA,
};
use crate::wire::control::{DataSourceAnnounce, ShmPoolAnnounce};
use crate::wire::discovery::{
    DiscoveryPool, DiscoveryRequest, DiscoveryResponse, DiscoveryResult, DiscoveryStatus,
};
use crate::wire::{peek_template_id, template, Decoded};
use crate::Result;

use std::sync::Arc;

/// Directory daemon configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub channel: String,
    pub announce_stream_id: u32,
    pub metadata_stream_id: u32,
    pub request_stream_id: u32,
    pub announce_period_ns: u64,
    pub max_entries: usize,
    pub max_results: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            channel: "fabric:mem?endpoint=local".to_string(),
            announce_stream_id: STREAM_ID_ANNOUNCE,
            metadata_stream_id: STREAM_ID_METADATA,
            request_stream_id: STREAM_ID_DISCOVERY_REQUEST,
            announce_period_ns: ANNOUNCE_PERIOD_DEFAULT_NS,
            max_entries: 1024,
            max_results: 64,
        }
    }
}

/// One indexed stream.
#[derive(Debug, Clone)]
struct DirectoryEntry {
    stream_id: u32,
    producer_id: u32,
    epoch: u64,
    layout_version: u32,
    header_nslots: u32,
    header_slot_bytes: u16,
    header_region_uri: String,
    pools: Vec<DiscoveryPool>,
    data_source_id: u32,
    data_source_name: String,
    data_source_summary: String,
    tags: Vec<String>,
    last_announce_ns: u64,
    has_shm_announce: bool,
}

impl DirectoryEntry {
    fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            producer_id: 0,
            epoch: 0,
            layout_version: 0,
            header_nslots: 0,
            header_slot_bytes: 0,
            header_region_uri: String::new(),
            pools: Vec::new(),
            data_source_id: NULL_U32,
            data_source_name: String::new(),
            data_source_summary: String::new(),
            tags: Vec::new(),
            last_announce_ns: 0,
            has_shm_announce: false,
        }
    }

    fn to_result(&self) -> DiscoveryResult {
        DiscoveryResult {
            stream_id: self.stream_id,
            producer_id: self.producer_id,
            data_source_id: self.data_source_id,
            epoch: self.epoch,
            layout_version: self.layout_version,
            header_nslots: self.header_nslots,
            header_slot_bytes: self.header_slot_bytes,
            max_dims: MAX_DIMS as u8,
            last_announce_ns: self.last_announce_ns,
            data_source_name: self.data_source_name.clone(),
            header_region_uri: self.header_region_uri.clone(),
            pools: self.pools.clone(),
            tags: self.tags.clone(),
        }
    }

    fn matches(&self, request: &DiscoveryRequest) -> bool {
        if request.stream_id != NULL_U32 && self.stream_id != request.stream_id {
            return false;
        }
        if request.producer_id != NULL_U32 && self.producer_id != request.producer_id {
            return false;
        }
        if request.data_source_id != NULL_U32 && self.data_source_id != request.data_source_id {
            return false;
        }
        if !request.data_source_name.is_empty()
            && self.data_source_name != request.data_source_name
        {
            return false;
        }
        request
            .tags
            .iter()
            .all(|wanted| self.tags.iter().any(|t| t == wanted))
    }
}

/// The directory core plus its fabric wiring.
pub struct DiscoveryService {
    fabric: Arc<MemFabric>,
    config: DiscoveryConfig,
    entries: HashMap<u32, DirectoryEntry>,
    announce_subscription: Subscription,
    metadata_subscription: Subscription,
    request_subscription: Subscription,
    announce_assembler: FragmentAssembler,
    metadata_assembler: FragmentAssembler,
    request_assembler: FragmentAssembler,
    response_publications: HashMap<StreamAddr, Publication>,
    started: bool,
}

impl DiscoveryService {
    pub fn new(fabric: Arc<MemFabric>, config: DiscoveryConfig) -> Self {
        let announce_subscription = fabric
            .add_subscription(StreamAddr::new(config.channel.clone(), config.announce_stream_id));
        let metadata_subscription = fabric
            .add_subscription(StreamAddr::new(config.channel.clone(), config.metadata_stream_id));
        let request_subscription = fabric
            .add_subscription(StreamAddr::new(config.channel.clone(), config.request_stream_id));
        Self {
            fabric,
            config,
            entries: HashMap::new(),
            announce_subscription,
            metadata_subscription,
            request_subscription,
            announce_assembler: FragmentAssembler::new(),
            metadata_assembler: FragmentAssembler::new(),
            request_assembler: FragmentAssembler::new(),
            response_publications: HashMap::new(),
            started: false,
        }
    }

    pub fn start(&mut self) {
        self.started = true;
        log::info!(
            "[DISCOVERY] serving on {} (announce #{}, requests #{})",
            self.config.channel,
            self.config.announce_stream_id,
            self.config.request_stream_id
        );
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn freshness_window_ns(&self) -> u64 {
        self.config.announce_period_ns * ANNOUNCE_FRESHNESS_MULTIPLIER
    }

    /// Index an SHM-pool announcement. Structurally invalid announcements
    /// are dropped with a warning; stale epochs are ignored.
    pub fn apply_announce(&mut self, announce: &ShmPoolAnnounce, now_ns: u64) {
        if announce.header_slot_bytes != HEADER_SLOT_BYTES as u16 {
            log::warn!(
                "[DISCOVERY] dropping announce for stream {}: slot bytes {}",
                announce.stream_id,
                announce.header_slot_bytes
            );
            return;
        }
        if announce.pools.is_empty() || announce.header_nslots == 0 {
            log::warn!(
                "[DISCOVERY] dropping announce for stream {}: empty layout",
                announce.stream_id
            );
            return;
        }
        if announce
            .pools
            .iter()
            .any(|p| p.pool_nslots != announce.header_nslots)
        {
            log::warn!(
                "[DISCOVERY] dropping announce for stream {}: pool nslots mismatch",
                announce.stream_id
            );
            return;
        }

        if let Some(existing) = self.entries.get(&announce.stream_id) {
            if existing.has_shm_announce && announce.epoch < existing.epoch {
                return;
            }
        } else if self.entries.len() >= self.config.max_entries {
            log::warn!(
                "[DISCOVERY] entry table full ({}); dropping stream {}",
                self.config.max_entries,
                announce.stream_id
            );
            return;
        }

        let entry = self
            .entries
            .entry(announce.stream_id)
            .or_insert_with(|| DirectoryEntry::new(announce.stream_id));
        entry.producer_id = announce.producer_id;
        entry.epoch = announce.epoch;
        entry.layout_version = announce.layout_version;
        entry.header_nslots = announce.header_nslots;
        entry.header_slot_bytes = announce.header_slot_bytes;
        entry.header_region_uri = announce.header_region_uri.clone();
        entry.pools = announce
            .pools
            .iter()
            .map(|p| DiscoveryPool {
                pool_id: p.pool_id,
                nslots: p.pool_nslots,
                stride_bytes: p.stride_bytes,
                region_uri: p.region_uri.clone(),
            })
            .collect();
        entry.last_announce_ns = now_ns;
        entry.has_shm_announce = true;
    }

    /// Index a data-source announcement (name/summary refresh).
    pub fn apply_data_source(&mut self, announce: &DataSourceAnnounce, now_ns: u64) {
        if self.entries.len() >= self.config.max_entries
            && !self.entries.contains_key(&announce.stream_id)
        {
            return;
        }
        let entry = self
            .entries
            .entry(announce.stream_id)
            .or_insert_with(|| DirectoryEntry::new(announce.stream_id));
        entry.producer_id = announce.producer_id;
        if entry.epoch <= announce.epoch {
            entry.epoch = announce.epoch;
        }
        entry.data_source_id = announce.data_source_id;
        entry.data_source_name = announce.name.clone();
        entry.data_source_summary = announce.summary.clone();
        entry.last_announce_ns = now_ns;
    }

    /// Attach tags to a stream (admin/API surface).
    pub fn set_tags(&mut self, stream_id: u32, tags: Vec<String>) {
        let entry = self
            .entries
            .entry(stream_id)
            .or_insert_with(|| DirectoryEntry::new(stream_id));
        entry.tags = tags;
    }

    /// Drop entries not announced within the freshness window.
    pub fn prune(&mut self, now_ns: u64) -> usize {
        let window = self.freshness_window_ns();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now_ns.saturating_sub(entry.last_announce_ns) <= window);
        before - self.entries.len()
    }

    /// Answer a query against the current index.
    pub fn query(&mut self, request: &DiscoveryRequest, now_ns: u64) -> DiscoveryResponse {
        self.prune(now_ns);

        let mut results: Vec<DiscoveryResult> = self
            .entries
            .values()
            .filter(|entry| entry.matches(request))
            .map(DirectoryEntry::to_result)
            .collect();
        results.sort_by_key(|r| r.stream_id);

        let max_results = if request.max_results == 0 || request.max_results == NULL_U32 {
            self.config.max_results
        } else {
            request.max_results.min(self.config.max_results)
        };

        if results.len() > max_results as usize {
            return DiscoveryResponse {
                correlation_id: request.correlation_id,
                status: DiscoveryStatus::Error,
                error_message: "result limit exceeded".to_string(),
                results: Vec::new(),
            };
        }

        DiscoveryResponse {
            correlation_id: request.correlation_id,
            status: DiscoveryStatus::Ok,
            error_message: String::new(),
            results,
        }
    }

    fn respond(&mut self, request: &DiscoveryRequest, now_ns: u64) -> Result<()> {
        // A request without a response endpoint is silently dropped.
        if request.response_channel.is_empty() || request.response_stream_id == 0 {
            return Ok(());
        }
        let response = self.query(request, now_ns);

        let addr = StreamAddr::new(request.response_channel.clone(), request.response_stream_id);
        let fabric = Arc::clone(&self.fabric);
        let publication = self
            .response_publications
            .entry(addr.clone())
            .or_insert_with(|| fabric.add_publication(addr));

        let approx = 256
            + response
                .results
                .iter()
                .map(|r| {
                    256 + r.data_source_name.len()
                        + r.header_region_uri.len()
                        + r.pools.iter().map(|p| 32 + p.region_uri.len()).sum::<usize>()
                        + r.tags.iter().map(|t| 8 + t.len()).sum::<usize>()
                })
                .sum::<usize>();
        let mut buf = vec![0u8; approx];
        let len = response.encode(&mut buf)?;
        if !publication.offer(&buf[..len]).is_ok() {
            log::warn!(
                "[DISCOVERY] response to correlation {} not delivered",
                request.correlation_id
            );
        }
        Ok(())
    }

    fn dispatch_metadata(&mut self, message: &[u8], now_ns: u64) -> Result<()> {
        if peek_template_id(message)? == template::DATA_SOURCE_ANNOUNCE {
            if let Decoded::Msg(announce) = DataSourceAnnounce::decode(message)? {
                self.apply_data_source(&announce, now_ns);
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.announce_subscription.close();
        self.metadata_subscription.close();
        self.request_subscription.close();
        for publication in self.response_publications.values() {
            publication.close();
        }
        self.response_publications.clear();
        self.started = false;
    }
}

impl Agent for DiscoveryService {
    fn do_work(&mut self, now_ns: u64) -> Result<usize> {
        if !self.started {
            return Err(TpError::Closed);
        }
        let mut work = 0;

        for fragment in self.announce_subscription.poll(32) {
            if let Some(message) = self.announce_assembler.push(fragment)? {
                if let Decoded::Msg(announce) = ShmPoolAnnounce::decode(&message)? {
                    self.apply_announce(&announce, now_ns);
                    work += 1;
                }
            }
        }

        for fragment in self.metadata_subscription.poll(32) {
            if let Some(message) = self.metadata_assembler.push(fragment)? {
                self.dispatch_metadata(&message, now_ns)?;
                work += 1;
            }
        }

        for fragment in self.request_subscription.poll(32) {
            if let Some(message) = self.request_assembler.push(fragment)? {
                if let Decoded::Msg(request) = DiscoveryRequest::decode(&message)? {
                    self.respond(&request, now_ns)?;
                    work += 1;
                }
            }
        }

        self.prune(now_ns);
        Ok(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::control::ShmPoolAnnouncePool;

    fn announce(stream_id: u32, epoch: u64) -> ShmPoolAnnounce {
        ShmPoolAnnounce {
            stream_id,
            producer_id: 1,
            epoch,
            announce_timestamp_ns: 0,
            announce_clock_domain: 0,
            layout_version: 1,
            header_nslots: 4,
            header_slot_bytes: 256,
            header_region_uri: "shm:file?path=/dev/shm/tp_hdr".into(),
            pools: vec![ShmPoolAnnouncePool {
                pool_id: 1,
                pool_nslots: 4,
                stride_bytes: 64,
                region_uri: "shm:file?path=/dev/shm/tp_p1".into(),
            }],
        }
    }

    fn service() -> DiscoveryService {
        DiscoveryService::new(MemFabric::new(), DiscoveryConfig::default())
    }

    #[test]
    fn test_apply_announce_indexes() {
        let mut svc = service();
        svc.apply_announce(&announce(10_000, 1), 100);
        assert_eq!(svc.entry_count(), 1);
    }

    #[test]
    fn test_malformed_announces_dropped() {
        let mut svc = service();

        let mut bad = announce(1, 1);
        bad.header_slot_bytes = 128;
        svc.apply_announce(&bad, 0);

        let mut bad = announce(2, 1);
        bad.pools.clear();
        svc.apply_announce(&bad, 0);

        let mut bad = announce(3, 1);
        bad.header_nslots = 0;
        svc.apply_announce(&bad, 0);

        let mut bad = announce(4, 1);
        bad.pools[0].pool_nslots = 8;
        svc.apply_announce(&bad, 0);

        assert_eq!(svc.entry_count(), 0);
    }

    #[test]
    fn test_stale_epoch_ignored() {
        let mut svc = service();
        svc.apply_announce(&announce(10_000, 5), 100);
        svc.apply_announce(&announce(10_000, 3), 200);
        assert_eq!(svc.entries[&10_000].epoch, 5);
        // Newer epoch replaces.
        svc.apply_announce(&announce(10_000, 6), 300);
        assert_eq!(svc.entries[&10_000].epoch, 6);
    }

    #[test]
    fn test_freshness_expiry() {
        let mut svc = service();
        let period = svc.config.announce_period_ns;
        svc.apply_announce(&announce(10_000, 1), 0);

        let request = DiscoveryRequest {
            stream_id: 10_000,
            ..DiscoveryRequest::default()
        };
        let at_limit = svc.query(&request, 3 * period);
        assert_eq!(at_limit.results.len(), 1);

        let past_limit = svc.query(&request, 3 * period + 1);
        assert!(past_limit.results.is_empty());
    }

    #[test]
    fn test_query_filters_and_tags() {
        let mut svc = service();
        svc.apply_announce(&announce(10_000, 1), 0);
        svc.apply_data_source(
            &DataSourceAnnounce {
                stream_id: 10_000,
                producer_id: 1,
                data_source_id: 9,
                epoch: 1,
                meta_version: 1,
                name: "camera-1".into(),
                summary: "front camera".into(),
            },
            0,
        );
        svc.set_tags(10_000, vec!["vision".into(), "fp32".into()]);

        let hit = svc.query(
            &DiscoveryRequest {
                stream_id: 10_000,
                data_source_name: "camera-1".into(),
                tags: vec!["vision".into()],
                ..DiscoveryRequest::default()
            },
            1,
        );
        assert_eq!(hit.status, DiscoveryStatus::Ok);
        assert_eq!(hit.results.len(), 1);
        assert_eq!(hit.results[0].data_source_name, "camera-1");

        let miss = svc.query(
            &DiscoveryRequest {
                stream_id: 10_000,
                tags: vec!["missing".into()],
                ..DiscoveryRequest::default()
            },
            1,
        );
        assert!(miss.results.is_empty());
        assert_eq!(miss.status, DiscoveryStatus::Ok);
    }

    #[test]
    fn test_result_limit_exceeded() {
        let mut svc = service();
        for stream_id in 1..=5 {
            svc.apply_announce(&announce(stream_id, 1), 0);
        }
        let response = svc.query(
            &DiscoveryRequest {
                max_results: 3,
                ..DiscoveryRequest::default()
            },
            1,
        );
        assert_eq!(response.status, DiscoveryStatus::Error);
        assert_eq!(response.error_message, "result limit exceeded");
        assert!(response.results.is_empty());
    }
}
