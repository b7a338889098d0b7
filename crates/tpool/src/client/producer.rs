// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Producer core.
//!
//! Owns the writable header ring and payload pools for one stream, runs
//! the seqlock publish protocol, and fans descriptors out to the shared
//! descriptor stream plus any per-consumer publications installed by the
//! consumer manager.
//!
//! # Publish Protocol (per frame)
//!
//! 1. Probe the shared descriptor publication so flow-control failures
//!    happen before any sequence state is consumed.
//! 2. `in_progress(seq)` store (release) on the slot word.
//! 3. Payload copy into the pool slot, slot header + tensor header encode
//!    in place, optional payload flush hook.
//! 4. Release fence, `committed(seq)` store.
//! 5. Descriptor offer(s); the trace history records `(seq, trace_id)`
//!    once at least one publication accepted it.

use std::ptr;

use crate::client::client::Agent;
use crate::client::context::ClientContext;
use crate::client::manager::ConsumerManager;
use crate::client::progress::ProgressThrottle;
use crate::clock;
use crate::driver::{DriverClient, DriverEvent};
use crate::error::TpError;
use crate::fabric::{FragmentAssembler, OfferOutcome, Publication, Subscription};
use crate::shm::{slot, ExpectedSuperblock, SeqlockWord, ShmRegion, SlotHeader};
use crate::trace::{TraceHistoryRing, TraceIdGenerator};
use crate::types::{
    ClockDomain, ProgressState, PublishMode, RegionType, ResponseCode, Role, TensorHeader,
    HEADER_SLOT_BYTES, LAYOUT_VERSION, NULL_U32, NULL_U64,
};
use crate::wire::control::{
    ConsumerHello, DataSourceAnnounce, DataSourceMeta, FrameDescriptor, FrameProgress, ProducerQos,
    ShmPoolAnnounce, ShmPoolAnnouncePool,
};
use crate::wire::driver::ShmAttachRequest;
use crate::wire::merge::TraceLinkSet;
use crate::wire::{peek_template_id, template, Decoded};
use crate::Result;

/// Per-pool attach parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_id: u16,
    pub nslots: u32,
    pub stride_bytes: u32,
    pub uri: String,
}

/// Direct (driverless) attach parameters.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub stream_id: u32,
    pub producer_id: u32,
    pub epoch: u64,
    pub layout_version: u32,
    pub header_nslots: u32,
    pub header_uri: String,
    pub pools: Vec<PoolConfig>,
}

/// Producer-level options.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub stream_id: u32,
    pub producer_id: u32,
    /// Restrict claims to `queue_claim`'s fixed-pool pattern.
    pub fixed_pool_mode: bool,
    /// Swallow `NotConnected` on the shared descriptor publication.
    pub drop_unconnected_descriptors: bool,
    /// Stamp descriptors with the commit-time clock instead of the null
    /// sentinel.
    pub publish_descriptor_timestamp: bool,
    /// Advertised to consumers that cannot map SHM.
    pub payload_fallback_uri: String,
}

impl ProducerOptions {
    #[must_use]
    pub fn new(stream_id: u32, producer_id: u32) -> Self {
        Self {
            stream_id,
            producer_id,
            fixed_pool_mode: false,
            drop_unconnected_descriptors: false,
            publish_descriptor_timestamp: false,
            payload_fallback_uri: String::new(),
        }
    }
}

/// One frame handed to [`Producer::offer_frame`].
pub struct Frame<'a> {
    pub tensor: &'a TensorHeader,
    pub payload: &'a [u8],
    /// 0 asks the producer's generator for a fresh id.
    pub trace_id: u64,
}

/// Caller-supplied frame metadata; null sentinels mean "producer decides".
#[derive(Debug, Clone, Copy)]
pub struct FrameMetadata {
    pub timestamp_ns: u64,
    pub meta_version: u32,
}

impl Default for FrameMetadata {
    fn default() -> Self {
        Self {
            timestamp_ns: NULL_U64,
            meta_version: NULL_U32,
        }
    }
}

/// A reserved slot produced by [`Producer::try_claim`].
///
/// Fill the payload through [`Producer::claim_payload_mut`], set `tensor`,
/// then commit. Aborting is a plain drop; the skipped sequence is
/// overwritten on wrap and readers only ever see committed values.
#[derive(Debug, Clone)]
pub struct BufferClaim {
    pub seq: u64,
    pub header_index: u32,
    pub pool_id: u16,
    pub payload_len: u32,
    pub tensor: TensorHeader,
    /// 0 asks the generator for a fresh id at commit.
    pub trace_id: u64,
}

struct PayloadPool {
    pool_id: u16,
    stride_bytes: u32,
    region: ShmRegion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerState {
    Initializing,
    Attached,
    Reattaching { deadline_ns: u64 },
    Closed,
}

/// Payload flush hook (cache flush / persistence barrier).
pub type PayloadFlushFn = Box<dyn Fn(&[u8]) + Send>;

/// Tracelink validator override.
pub type TracelinkValidateFn = Box<dyn Fn(&TraceLinkSet) -> Result<()> + Send>;

pub struct Producer {
    context: ClientContext,
    options: ProducerOptions,

    descriptor_publication: Publication,
    control_publication: Publication,
    announce_publication: Publication,
    qos_publication: Publication,
    metadata_publication: Publication,
    control_subscription: Subscription,
    control_assembler: FragmentAssembler,

    header_region: Option<ShmRegion>,
    pools: Vec<PayloadPool>,
    header_uri: String,

    epoch: u64,
    layout_version: u32,
    header_nslots: u32,
    next_seq: u64,
    state: ProducerState,
    attach_failures: u32,

    driver: Option<DriverClient>,
    consumer_manager: Option<ConsumerManager>,

    trace_generator: TraceIdGenerator,
    trace_history: Option<TraceHistoryRing>,
    tracelink_validator: Option<TracelinkValidateFn>,
    payload_flush: Option<PayloadFlushFn>,

    progress_throttle: ProgressThrottle,
    cached_announce: Option<DataSourceAnnounce>,
    cached_meta: Option<DataSourceMeta>,

    last_announce_ns: u64,
    last_qos_ns: u64,
    frames_published: u64,
    bytes_published: u64,
}

impl Producer {
    pub fn new(context: &ClientContext, options: ProducerOptions) -> Result<Self> {
        if options.stream_id == 0 {
            return Err(TpError::Config("stream id must be nonzero".into()));
        }
        let fabric = context.fabric();
        let trace_generator =
            TraceIdGenerator::with_defaults(u64::from(options.producer_id) & 0x3ff)?;

        Ok(Self {
            descriptor_publication: fabric.add_publication(context.descriptor_addr()),
            control_publication: fabric.add_publication(context.control_addr()),
            announce_publication: fabric.add_publication(context.announce_addr()),
            qos_publication: fabric.add_publication(context.qos_addr()),
            metadata_publication: fabric.add_publication(context.metadata_addr()),
            control_subscription: fabric.add_subscription(context.control_addr()),
            control_assembler: FragmentAssembler::new(),
            context: context.clone(),
            options,
            header_region: None,
            pools: Vec::new(),
            header_uri: String::new(),
            epoch: 0,
            layout_version: LAYOUT_VERSION,
            header_nslots: 0,
            next_seq: 0,
            state: ProducerState::Initializing,
            attach_failures: 0,
            driver: None,
            consumer_manager: None,
            trace_generator,
            trace_history: None,
            tracelink_validator: None,
            payload_flush: None,
            progress_throttle: ProgressThrottle::default(),
            cached_announce: None,
            cached_meta: None,
            last_announce_ns: 0,
            last_qos_ns: 0,
            frames_published: 0,
            bytes_published: 0,
        })
    }

    /// Map and validate the regions described by `config`.
    pub fn attach(&mut self, config: &ProducerConfig) -> Result<()> {
        if self.state == ProducerState::Closed {
            return Err(TpError::Closed);
        }
        if config.pools.is_empty() {
            return Err(TpError::Config("producer needs at least one pool".into()));
        }

        let header_region = ShmRegion::map(&config.header_uri, true, &self.context.allowed_paths)?;
        header_region.validate_superblock(Some(&ExpectedSuperblock {
            stream_id: config.stream_id,
            layout_version: config.layout_version,
            epoch: config.epoch,
            region_type: RegionType::HeaderRing as i16,
            pool_id: 0,
            nslots: config.header_nslots,
            slot_bytes: HEADER_SLOT_BYTES as u32,
            stride_bytes: NULL_U32,
        }))?;

        let mut pools = Vec::with_capacity(config.pools.len());
        for pool in &config.pools {
            let region = ShmRegion::map(&pool.uri, true, &self.context.allowed_paths)?;
            region.validate_superblock(Some(&ExpectedSuperblock {
                stream_id: config.stream_id,
                layout_version: config.layout_version,
                epoch: config.epoch,
                region_type: RegionType::PayloadPool as i16,
                pool_id: pool.pool_id,
                nslots: config.header_nslots,
                slot_bytes: NULL_U32,
                stride_bytes: pool.stride_bytes,
            }))?;
            pools.push(PayloadPool {
                pool_id: pool.pool_id,
                stride_bytes: pool.stride_bytes,
                region,
            });
        }

        self.header_region = Some(header_region);
        self.header_uri = config.header_uri.clone();
        self.pools = pools;
        self.epoch = config.epoch;
        self.layout_version = config.layout_version;
        self.header_nslots = config.header_nslots;
        self.next_seq = 0;
        self.trace_history = Some(TraceHistoryRing::new(config.header_nslots)?);
        self.state = ProducerState::Attached;
        self.attach_failures = 0;

        log::debug!(
            "[PRODUCER] attached stream={} epoch={} nslots={} pools={}",
            config.stream_id,
            config.epoch,
            config.header_nslots,
            self.pools.len()
        );
        Ok(())
    }

    /// Attach through the driver (blocking; the driver must be live on
    /// another thread or process).
    pub fn attach_via_driver(&mut self, publish_mode: PublishMode) -> Result<()> {
        let request = ShmAttachRequest {
            stream_id: self.options.stream_id,
            role: Role::Producer,
            publish_mode,
            ..ShmAttachRequest::default()
        };
        let mut driver = DriverClient::new(&self.context);
        let response = driver.attach(request, Role::Producer)?;
        self.driver = Some(driver);
        self.finish_driver_attach(response)
    }

    /// Complete an attach whose response was obtained asynchronously.
    pub fn finish_driver_attach(
        &mut self,
        response: crate::wire::driver::ShmAttachResponse,
    ) -> Result<()> {
        if response.code != ResponseCode::Ok {
            self.on_attach_failure();
            return Err(TpError::Rejected(response.error_message));
        }
        let config = ProducerConfig {
            stream_id: response.stream_id,
            producer_id: self.options.producer_id,
            epoch: response.epoch,
            layout_version: response.layout_version,
            header_nslots: response.header_nslots,
            header_uri: response.header_region_uri.clone(),
            pools: response
                .pools
                .iter()
                .map(|p| PoolConfig {
                    pool_id: p.pool_id,
                    nslots: p.nslots,
                    stride_bytes: p.stride_bytes,
                    uri: p.region_uri.clone(),
                })
                .collect(),
        };
        match self.attach(&config) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.on_attach_failure();
                Err(e)
            }
        }
    }

    /// Install the driver client used by async attach flows.
    pub fn set_driver(&mut self, driver: DriverClient) {
        self.driver = Some(driver);
    }

    #[must_use]
    pub fn driver_mut(&mut self) -> Option<&mut DriverClient> {
        self.driver.as_mut()
    }

    pub fn enable_consumer_manager(&mut self, capacity: usize) -> Result<()> {
        self.consumer_manager = Some(ConsumerManager::new(
            std::sync::Arc::clone(self.context.fabric()),
            capacity,
            self.context.announce_period_ns,
        )?);
        Ok(())
    }

    #[must_use]
    pub fn consumer_manager(&self) -> Option<&ConsumerManager> {
        self.consumer_manager.as_ref()
    }

    /// Evict consumers whose hellos stopped inside the stale window as of
    /// `now_ns`. The periodic loop does this on its own cadence; exposed
    /// for callers driving the lifecycle manually.
    pub fn sweep_consumers(&mut self, now_ns: u64) -> usize {
        match self.consumer_manager.as_mut() {
            Some(manager) => {
                let stale_ns = manager.stale_ns();
                manager.sweep(now_ns, stale_ns)
            }
            None => 0,
        }
    }

    pub fn set_payload_flush(&mut self, flush: PayloadFlushFn) {
        self.payload_flush = Some(flush);
    }

    pub fn set_tracelink_validator(&mut self, validator: TracelinkValidateFn) {
        self.tracelink_validator = Some(validator);
    }

    pub fn set_data_source_announce(&mut self, mut announce: DataSourceAnnounce) -> Result<()> {
        announce.stream_id = self.options.stream_id;
        announce.producer_id = self.options.producer_id;
        announce.epoch = self.epoch;
        self.offer_metadata_announce(&announce)?;
        self.cached_announce = Some(announce);
        Ok(())
    }

    pub fn clear_data_source_announce(&mut self) {
        self.cached_announce = None;
    }

    pub fn set_data_source_meta(&mut self, mut meta: DataSourceMeta) -> Result<()> {
        meta.stream_id = self.options.stream_id;
        self.offer_metadata_meta(&meta)?;
        self.cached_meta = Some(meta);
        Ok(())
    }

    pub fn clear_data_source_meta(&mut self) {
        self.cached_meta = None;
    }

    /// Ship a metadata blob as announce + chunks + complete on the
    /// metadata stream.
    pub fn offer_meta_blob(
        &mut self,
        meta_version: u32,
        blob_type: u32,
        bytes: &[u8],
    ) -> Result<()> {
        let (announce, chunks, complete) =
            crate::client::metadata::encode_blob(self.options.stream_id, meta_version, blob_type, bytes);

        let mut buf = vec![0u8; crate::client::metadata::META_BLOB_CHUNK_BYTES + 256];
        let len = announce.encode(&mut buf)?;
        self.metadata_publication.offer(&buf[..len]).into_result()?;
        for chunk in &chunks {
            let len = chunk.encode(&mut buf)?;
            self.metadata_publication.offer(&buf[..len]).into_result()?;
        }
        let len = complete.encode(&mut buf)?;
        self.metadata_publication.offer(&buf[..len]).into_result()?;
        Ok(())
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state == ProducerState::Attached
    }

    #[must_use]
    pub fn descriptor_publication(&self) -> &Publication {
        &self.descriptor_publication
    }

    #[must_use]
    pub fn control_publication(&self) -> &Publication {
        &self.control_publication
    }

    #[must_use]
    pub fn qos_publication(&self) -> &Publication {
        &self.qos_publication
    }

    #[must_use]
    pub fn metadata_publication(&self) -> &Publication {
        &self.metadata_publication
    }

    fn require_attached(&self) -> Result<()> {
        if self.state != ProducerState::Attached || self.header_region.is_none() {
            return Err(TpError::Closed);
        }
        Ok(())
    }

    fn find_pool(&self, pool_id: u16) -> Option<&PayloadPool> {
        self.pools.iter().find(|p| p.pool_id == pool_id)
    }

    /// Smallest pool whose stride fits `length`.
    fn find_pool_for_length(&self, length: usize) -> Result<&PayloadPool> {
        self.pools
            .iter()
            .filter(|p| p.stride_bytes as usize >= length)
            .min_by_key(|p| p.stride_bytes)
            .ok_or(TpError::NoPool { length })
    }

    fn resolve_trace_id(&self, requested: u64) -> u64 {
        if requested != 0 {
            requested
        } else {
            self.trace_generator.next()
        }
    }

    /// Publish a frame with an automatically chosen pool and sequence.
    /// Returns the committed sequence number.
    pub fn offer_frame(&mut self, frame: &Frame<'_>, meta: &FrameMetadata) -> Result<u64> {
        self.require_attached()?;
        let pool_id = self.find_pool_for_length(frame.payload.len())?.pool_id;

        // Probe flow control before consuming a sequence: transient
        // failures leave producer and slot state untouched.
        self.probe_descriptor_offer()?;

        let trace_id = self.resolve_trace_id(frame.trace_id);
        let seq = self.next_seq;
        self.publish_frame(
            seq,
            frame.tensor,
            frame.payload,
            pool_id,
            meta.timestamp_ns,
            meta.meta_version,
            trace_id,
        )?;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Reserve the next slot for in-place filling.
    pub fn try_claim(&mut self, length: usize) -> Result<BufferClaim> {
        self.require_attached()?;
        let pool = self.find_pool_for_length(length)?;
        let pool_id = pool.pool_id;

        let seq = self.next_seq;
        self.next_seq += 1;
        let header_index = (seq & u64::from(self.header_nslots - 1)) as u32;

        self.slot_word(header_index)?.mark_in_progress(seq);

        Ok(BufferClaim {
            seq,
            header_index,
            pool_id,
            payload_len: length as u32,
            tensor: TensorHeader::default(),
            trace_id: 0,
        })
    }

    /// Borrow the payload area reserved by a claim.
    pub fn claim_payload_mut(&mut self, claim: &BufferClaim) -> Result<&mut [u8]> {
        self.require_attached()?;
        let pool = self
            .find_pool(claim.pool_id)
            .ok_or_else(|| TpError::Config(format!("unknown pool {}", claim.pool_id)))?;
        let offset = slot::payload_offset(claim.header_index, pool.stride_bytes);
        let ptr = pool.region.ptr_at(offset, claim.payload_len as usize)?;
        // SAFETY: ptr_at bounds-checked the span inside the writable pool
        // mapping; the claim's slot is marked in-progress, so no reader
        // trusts these bytes until commit.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, claim.payload_len as usize) })
    }

    /// Commit a claim: runs the same in-place encode and descriptor
    /// fan-out as `offer_frame` for the claimed slot.
    pub fn commit_claim(&mut self, claim: &BufferClaim, meta: &FrameMetadata) -> Result<()> {
        self.require_attached()?;
        let trace_id = self.resolve_trace_id(claim.trace_id);
        let tensor = claim.tensor;
        self.publish_frame_in_place(
            claim.seq,
            &tensor,
            claim.payload_len,
            claim.pool_id,
            meta.timestamp_ns,
            meta.meta_version,
            trace_id,
        )
    }

    /// Abandon a claim. Nothing touches the seqlock: the sequence is
    /// skipped and the slot is overwritten on wrap.
    pub fn abort_claim(&mut self, _claim: BufferClaim) {}

    /// Assign a fresh sequence to a claim reusing its slot. Only legal in
    /// fixed-pool mode.
    pub fn queue_claim(&mut self, claim: &mut BufferClaim) -> Result<u64> {
        self.require_attached()?;
        if !self.options.fixed_pool_mode {
            return Err(TpError::AdminAction);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        claim.seq = seq;
        claim.trace_id = 0;
        self.slot_word(claim.header_index)?.mark_in_progress(seq);
        Ok(seq)
    }

    fn slot_word(&self, header_index: u32) -> Result<SeqlockWord> {
        let region = self.header_region.as_ref().ok_or(TpError::Closed)?;
        let ptr = region.ptr_at(slot::slot_offset(header_index), HEADER_SLOT_BYTES)?;
        // SAFETY: slot offsets are 256-byte aligned past the 64-byte
        // superblock, so the word is 8-byte aligned inside the mapping.
        Ok(unsafe { SeqlockWord::from_ptr(ptr) })
    }

    fn probe_descriptor_offer(&self) -> Result<()> {
        match self
            .descriptor_publication
            .try_reserve(crate::wire::MESSAGE_HEADER_LEN + 40)
        {
            OfferOutcome::NotConnected if self.options.drop_unconnected_descriptors => Ok(()),
            OfferOutcome::NotConnected if self.has_per_consumer_descriptor() => Ok(()),
            outcome => outcome.into_result().map(|_| ()),
        }
    }

    fn has_per_consumer_descriptor(&self) -> bool {
        self.consumer_manager
            .as_ref()
            .is_some_and(|m| m.registry().iter().any(|e| e.descriptor_publication.is_some()))
    }

    /// Copy `payload` into the pool slot and run the publish protocol.
    #[allow(clippy::too_many_arguments)]
    fn publish_frame(
        &mut self,
        seq: u64,
        tensor: &TensorHeader,
        payload: &[u8],
        pool_id: u16,
        timestamp_ns: u64,
        meta_version: u32,
        trace_id: u64,
    ) -> Result<()> {
        let header_index = (seq & u64::from(self.header_nslots - 1)) as u32;
        let pool = self
            .find_pool(pool_id)
            .ok_or_else(|| TpError::Config(format!("unknown pool {pool_id}")))?;
        if payload.len() > pool.stride_bytes as usize {
            return Err(TpError::NoPool { length: payload.len() });
        }

        let payload_offset = slot::payload_offset(header_index, pool.stride_bytes);
        let payload_ptr = pool.region.ptr_at(payload_offset, payload.len().max(1))?;

        self.slot_word(header_index)?.mark_in_progress(seq);

        if !payload.is_empty() {
            // SAFETY: destination spans payload.len() bytes inside the
            // writable pool mapping (ptr_at); source is the caller's
            // buffer; the regions cannot overlap.
            unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), payload_ptr, payload.len()) };
        }

        self.encode_and_commit(
            seq,
            header_index,
            tensor,
            payload.len() as u32,
            pool_id,
            timestamp_ns,
            meta_version,
        )?;
        self.fan_out_descriptor(seq, meta_version, trace_id)?;
        self.frames_published += 1;
        self.bytes_published += payload.len() as u64;
        Ok(())
    }

    /// Publish a claim whose payload is already in place.
    #[allow(clippy::too_many_arguments)]
    fn publish_frame_in_place(
        &mut self,
        seq: u64,
        tensor: &TensorHeader,
        payload_len: u32,
        pool_id: u16,
        timestamp_ns: u64,
        meta_version: u32,
        trace_id: u64,
    ) -> Result<()> {
        let header_index = (seq & u64::from(self.header_nslots - 1)) as u32;
        self.encode_and_commit(
            seq,
            header_index,
            tensor,
            payload_len,
            pool_id,
            timestamp_ns,
            meta_version,
        )?;
        self.fan_out_descriptor(seq, meta_version, trace_id)?;
        self.frames_published += 1;
        self.bytes_published += u64::from(payload_len);
        Ok(())
    }

    /// Steps 5-8 of the publish protocol: slot header, tensor header,
    /// flush hook, release fence + commit store.
    #[allow(clippy::too_many_arguments)]
    fn encode_and_commit(
        &mut self,
        seq: u64,
        header_index: u32,
        tensor: &TensorHeader,
        payload_len: u32,
        pool_id: u16,
        timestamp_ns: u64,
        meta_version: u32,
    ) -> Result<()> {
        let mut prepared = *tensor;
        prepared.normalize();
        prepared.validate()?;

        let slot_timestamp_ns = if timestamp_ns == 0 || timestamp_ns == NULL_U64 {
            clock::now_realtime_ns()
        } else {
            timestamp_ns
        };

        let region = self.header_region.as_ref().ok_or(TpError::Closed)?;
        let slot_ptr = region.ptr_at(slot::slot_offset(header_index), HEADER_SLOT_BYTES)?;
        // SAFETY: slot_ptr spans one whole 256-byte slot inside the
        // writable header mapping; this producer is the only writer and
        // the slot word is in-progress, so readers retry instead of
        // trusting these bytes.
        let slot_buf = unsafe { std::slice::from_raw_parts_mut(slot_ptr, HEADER_SLOT_BYTES) };

        SlotHeader {
            values_len_bytes: payload_len,
            payload_slot: header_index,
            pool_id,
            payload_offset: 0,
            timestamp_ns: slot_timestamp_ns,
            meta_version,
        }
        .encode(slot_buf)?;
        slot::write_tensor(slot_buf, &prepared)?;

        if let Some(flush) = &self.payload_flush {
            if payload_len > 0 {
                let pool = self
                    .find_pool(pool_id)
                    .ok_or_else(|| TpError::Config(format!("unknown pool {pool_id}")))?;
                let offset = slot::payload_offset(header_index, pool.stride_bytes);
                let ptr = pool.region.ptr_at(offset, payload_len as usize)?;
                // SAFETY: span checked by ptr_at; the hook observes bytes
                // this producer just wrote.
                flush(unsafe { std::slice::from_raw_parts(ptr, payload_len as usize) });
            }
        }

        self.slot_word(header_index)?.commit(seq);
        Ok(())
    }

    /// Step 9: descriptor fan-out and trace-history update.
    fn fan_out_descriptor(&mut self, seq: u64, meta_version: u32, trace_id: u64) -> Result<()> {
        let descriptor_timestamp_ns = if self.options.publish_descriptor_timestamp {
            clock::now_realtime_ns()
        } else {
            NULL_U64
        };
        let descriptor = FrameDescriptor {
            stream_id: self.options.stream_id,
            meta_version,
            epoch: self.epoch,
            seq,
            timestamp_ns: descriptor_timestamp_ns,
            trace_id,
        };
        let mut buf = [0u8; 64];
        let len = descriptor.encode(&mut buf)?;
        let encoded = &buf[..len];

        let mut delivered = false;
        match self.descriptor_publication.offer(encoded) {
            OfferOutcome::Ok(_) => delivered = true,
            OfferOutcome::NotConnected if self.options.drop_unconnected_descriptors => {}
            OfferOutcome::NotConnected if self.has_per_consumer_descriptor() => {}
            outcome => outcome.into_result().map(|_| ())?,
        }

        let now_ns = clock::now_monotonic_ns();
        if let Some(manager) = self.consumer_manager.as_mut() {
            if manager.publish_descriptor(encoded, now_ns) > 0 {
                delivered = true;
            }
        }

        if delivered {
            if let Some(history) = self.trace_history.as_mut() {
                history.record(seq, trace_id);
            }
        }
        Ok(())
    }

    /// Emit a frame-progress record, throttled by the aggregated policy.
    /// `Started` resets the throttle and, like `Complete`, always goes
    /// out. Returns whether a record was published.
    pub fn offer_progress(
        &mut self,
        seq: u64,
        payload_bytes_filled: u64,
        state: ProgressState,
        major_units: u64,
    ) -> Result<bool> {
        self.require_attached()?;
        let now_ns = clock::now_monotonic_ns();

        let publish = match state {
            ProgressState::Started => {
                self.progress_throttle.start(now_ns);
                true
            }
            ProgressState::Complete => true,
            _ => {
                let policy = self
                    .consumer_manager
                    .as_ref()
                    .map_or_else(Default::default, |m| m.policy());
                self.progress_throttle
                    .should_publish(&policy, now_ns, payload_bytes_filled, major_units)
            }
        };
        if !publish {
            return Ok(false);
        }

        let progress = FrameProgress {
            stream_id: self.options.stream_id,
            state,
            epoch: self.epoch,
            seq,
            payload_bytes_filled,
        };
        let mut buf = [0u8; 64];
        let len = progress.encode(&mut buf)?;
        let encoded = &buf[..len];

        let mut published = false;
        if self.control_publication.offer(encoded).is_ok() {
            published = true;
        }
        if let Some(manager) = self.consumer_manager.as_mut() {
            if manager.publish_progress(encoded) > 0 {
                published = true;
            }
        }
        Ok(published)
    }

    /// Drain the control stream: hellos and tracelink sets.
    pub fn poll_control(&mut self, limit: usize) -> Result<usize> {
        let mut handled = 0;
        let fragments = self.control_subscription.poll(limit);
        for fragment in fragments {
            let Some(message) = self.control_assembler.push(fragment)? else {
                continue;
            };
            self.dispatch_control(&message)?;
            handled += 1;
        }
        Ok(handled)
    }

    fn dispatch_control(&mut self, message: &[u8]) -> Result<()> {
        match peek_template_id(message)? {
            template::CONSUMER_HELLO => {
                if let Decoded::Msg(hello) = ConsumerHello::decode(message)? {
                    self.on_hello(&hello)?;
                }
            }
            template::TRACE_LINK_SET => {
                if let Decoded::Msg(set) = TraceLinkSet::decode(message)? {
                    let verdict = match (&self.tracelink_validator, &self.trace_history) {
                        (Some(validator), _) => validator(&set),
                        (None, Some(history)) => history.validate_link_set(&set),
                        (None, None) => Err(TpError::Closed),
                    };
                    if let Err(e) = verdict {
                        log::warn!(
                            "[PRODUCER] rejected trace link set for seq {}: {e}",
                            set.seq
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_hello(&mut self, hello: &ConsumerHello) -> Result<()> {
        if hello.stream_id != self.options.stream_id {
            return Ok(());
        }
        if hello.expected_layout_version != self.layout_version {
            log::warn!(
                "[PRODUCER] consumer {} expects layout {}, have {}",
                hello.consumer_id,
                hello.expected_layout_version,
                self.layout_version
            );
            return Ok(());
        }
        let Some(manager) = self.consumer_manager.as_mut() else {
            return Ok(());
        };
        let now_ns = clock::now_monotonic_ns();
        manager.handle_hello(
            hello,
            &self.control_publication,
            self.descriptor_publication.addr(),
            self.control_publication.addr(),
            &self.options.payload_fallback_uri,
            now_ns,
        )
    }

    fn offer_metadata_announce(&self, announce: &DataSourceAnnounce) -> Result<()> {
        let mut buf = vec![0u8; 512 + announce.name.len() + announce.summary.len()];
        let len = announce.encode(&mut buf)?;
        match self.metadata_publication.offer(&buf[..len]) {
            OfferOutcome::Ok(_) | OfferOutcome::NotConnected => Ok(()),
            outcome => outcome.into_result().map(|_| ()),
        }
    }

    fn offer_metadata_meta(&self, meta: &DataSourceMeta) -> Result<()> {
        let approx: usize = 512
            + meta
                .attributes
                .iter()
                .map(|a| a.key.len() + a.format.len() + a.value.len() + 16)
                .sum::<usize>();
        let mut buf = vec![0u8; approx];
        let len = meta.encode(&mut buf)?;
        match self.metadata_publication.offer(&buf[..len]) {
            OfferOutcome::Ok(_) | OfferOutcome::NotConnected => Ok(()),
            outcome => outcome.into_result().map(|_| ()),
        }
    }

    fn publish_shm_pool_announce(&mut self, now_ns: u64) -> Result<()> {
        let announce = ShmPoolAnnounce {
            stream_id: self.options.stream_id,
            producer_id: self.options.producer_id,
            epoch: self.epoch,
            announce_timestamp_ns: now_ns,
            announce_clock_domain: ClockDomain::Monotonic as u8,
            layout_version: self.layout_version,
            header_nslots: self.header_nslots,
            header_slot_bytes: HEADER_SLOT_BYTES as u16,
            header_region_uri: self.header_uri.clone(),
            pools: self
                .pools
                .iter()
                .map(|p| ShmPoolAnnouncePool {
                    pool_id: p.pool_id,
                    pool_nslots: self.header_nslots,
                    stride_bytes: p.stride_bytes,
                    region_uri: p.region.uri().to_uri(),
                })
                .collect(),
        };
        let mut buf = vec![0u8; 1024 + self.pools.len() * 256];
        let len = announce.encode(&mut buf)?;
        match self.announce_publication.offer(&buf[..len]) {
            OfferOutcome::Ok(_) | OfferOutcome::NotConnected => Ok(()),
            outcome => outcome.into_result().map(|_| ()),
        }
    }

    fn publish_qos(&mut self, now_ns: u64) -> Result<()> {
        let qos = ProducerQos {
            stream_id: self.options.stream_id,
            epoch: self.epoch,
            seq: self.next_seq.saturating_sub(1),
            frames_published: self.frames_published,
            bytes_published: self.bytes_published,
            timestamp_ns: now_ns,
        };
        let mut buf = [0u8; 64];
        let len = qos.encode(&mut buf)?;
        match self.qos_publication.offer(&buf[..len]) {
            OfferOutcome::Ok(_) | OfferOutcome::NotConnected => Ok(()),
            outcome => outcome.into_result().map(|_| ()),
        }
    }

    /// Periodic duties: announce, QoS, cached metadata republish,
    /// superblock activity refresh, registry sweep.
    fn run_periodic(&mut self, now_ns: u64) -> Result<usize> {
        let mut work = 0;
        if self.state == ProducerState::Attached
            && now_ns.saturating_sub(self.last_announce_ns) >= self.context.announce_period_ns
        {
            self.last_announce_ns = now_ns;
            self.publish_shm_pool_announce(now_ns)?;
            if let Some(announce) = self.cached_announce.clone() {
                self.offer_metadata_announce(&announce)?;
            }
            if let Some(meta) = self.cached_meta.clone() {
                self.offer_metadata_meta(&meta)?;
            }

            // Activity refresh failures must not fail frame traffic.
            if let Some(region) = &self.header_region {
                if let Err(e) = region.touch_activity(now_ns) {
                    log::warn!("[PRODUCER] activity refresh failed: {e}");
                }
            }
            for pool in &self.pools {
                if let Err(e) = pool.region.touch_activity(now_ns) {
                    log::warn!("[PRODUCER] pool activity refresh failed: {e}");
                }
            }
            work += 1;
        }

        if self.state == ProducerState::Attached
            && now_ns.saturating_sub(self.last_qos_ns) >= self.context.announce_period_ns
        {
            self.last_qos_ns = now_ns;
            self.publish_qos(now_ns)?;
            work += 1;
        }

        if let Some(manager) = self.consumer_manager.as_mut() {
            work += manager.sweep_if_due(now_ns);
        }

        if let Some(driver) = self.driver.as_mut() {
            let allowance = self.context.keepalive_interval_ns / 4;
            if driver.keepalive_due(now_ns, allowance) {
                driver.keepalive(now_ns)?;
                work += 1;
            }
            for event in driver.poll_events()? {
                self.on_driver_event(event, now_ns);
                work += 1;
            }
        }

        Ok(work)
    }

    fn on_driver_event(&mut self, event: DriverEvent, now_ns: u64) {
        match event {
            DriverEvent::LeaseRevoked(revoked) => {
                self.context.surface_error(
                    &TpError::LeaseExpired,
                    &format!("lease revoked ({:?})", revoked.reason),
                );
                self.unmap_regions();
                self.cached_announce = None;
                self.cached_meta = None;
                self.schedule_reattach(now_ns);
            }
            DriverEvent::Shutdown(_) => {
                self.context
                    .surface_error(&TpError::Closed, "driver shutdown");
                self.unmap_regions();
                self.schedule_reattach(now_ns);
            }
        }
    }

    fn unmap_regions(&mut self) {
        if let Some(mut region) = self.header_region.take() {
            region.unmap();
        }
        for mut pool in self.pools.drain(..) {
            pool.region.unmap();
        }
        self.trace_history = None;
    }

    fn on_attach_failure(&mut self) {
        self.schedule_reattach(clock::now_monotonic_ns());
    }

    /// Arm the reattach backoff: `100 ms * 2^min(failures, 5)`.
    pub fn schedule_reattach(&mut self, now_ns: u64) {
        let exponent = self.attach_failures.min(5);
        let backoff_ns = 100_000_000u64 << exponent;
        self.attach_failures = self.attach_failures.saturating_add(1);
        self.state = ProducerState::Reattaching {
            deadline_ns: now_ns + backoff_ns,
        };
        log::debug!(
            "[PRODUCER] reattach scheduled in {} ms (failure {})",
            backoff_ns / 1_000_000,
            self.attach_failures
        );
    }

    #[must_use]
    pub fn reattach_due(&self, now_ns: u64) -> bool {
        matches!(self.state, ProducerState::Reattaching { deadline_ns } if now_ns >= deadline_ns)
    }

    pub fn clear_reattach(&mut self) {
        if matches!(self.state, ProducerState::Reattaching { .. }) {
            self.state = ProducerState::Initializing;
            self.attach_failures = 0;
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state == ProducerState::Closed {
            return Ok(());
        }
        if let Some(driver) = self.driver.as_mut() {
            if driver.lease().is_some() {
                // Best effort: the lease expires on its own if this races
                // a dead driver.
                if let Err(e) = driver.detach() {
                    log::warn!("[PRODUCER] detach failed on close: {e}");
                }
            }
            driver.close();
        }
        self.unmap_regions();
        self.descriptor_publication.close();
        self.control_publication.close();
        self.announce_publication.close();
        self.qos_publication.close();
        self.metadata_publication.close();
        self.control_subscription.close();
        self.state = ProducerState::Closed;
        Ok(())
    }
}

impl Agent for Producer {
    fn do_work(&mut self, now_ns: u64) -> Result<usize> {
        if self.state == ProducerState::Closed {
            return Ok(0);
        }
        let mut work = self.poll_control(16)?;
        work += self.run_periodic(now_ns)?;
        Ok(work)
    }
}
