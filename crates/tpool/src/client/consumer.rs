// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Consumer core.
//!
//! Says hello on the control stream, maps the announced regions read-only,
//! and turns descriptor arrivals into in-place frame reads with the
//! seqlock retry protocol. Tracks gap/late drops, schedules reattach with
//! exponential backoff on revocation, and falls back to a payload URI
//! when SHM cannot be mapped.

use crate::client::client::Agent;
use crate::client::context::ClientContext;
use crate::clock;
use crate::driver::{DriverClient, DriverEvent};
use crate::error::TpError;
use crate::fabric::{FragmentAssembler, OfferOutcome, Publication, StreamAddr, Subscription};
use crate::shm::{seqlock, slot, ExpectedSuperblock, ShmRegion, SlotHeader};
use crate::types::{
    Mode, ProgressState, PublishMode, RegionType, ResponseCode, Role, TensorHeader,
    HEADER_SLOT_BYTES, LAYOUT_VERSION, NULL_U32, NULL_U64,
};
use crate::wire::control::{
    ConsumerConfig, ConsumerHello, ConsumerQos, FrameDescriptor, FrameProgress, ShmPoolAnnounce,
};
use crate::wire::driver::ShmAttachRequest;
use crate::wire::{peek_template_id, template, Decoded};
use crate::Result;

/// Per-pool attach parameters (consumer side, read-only).
#[derive(Debug, Clone)]
pub struct ConsumerPoolConfig {
    pub pool_id: u16,
    pub nslots: u32,
    pub stride_bytes: u32,
    pub uri: String,
}

/// Direct attach parameters.
#[derive(Debug, Clone)]
pub struct ConsumerAttachConfig {
    pub stream_id: u32,
    pub epoch: u64,
    pub layout_version: u32,
    pub header_nslots: u32,
    pub header_uri: String,
    pub pools: Vec<ConsumerPoolConfig>,
}

/// Consumer identity and hello parameters.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub stream_id: u32,
    pub consumer_id: u32,
    pub mode: Mode,
    pub max_rate_hz: u32,
    pub supports_progress: bool,
    pub progress_interval_us: u32,
    pub progress_bytes_delta: u32,
    pub progress_major_delta_units: u32,
    /// Dedicated endpoints; empty channel + zero stream uses the shared
    /// streams.
    pub descriptor_channel: String,
    pub descriptor_stream_id: u32,
    pub control_channel: String,
    pub control_stream_id: u32,
}

impl ConsumerOptions {
    #[must_use]
    pub fn new(stream_id: u32, consumer_id: u32) -> Self {
        Self {
            stream_id,
            consumer_id,
            mode: Mode::Stream,
            max_rate_hz: 0,
            supports_progress: false,
            progress_interval_us: NULL_U32,
            progress_bytes_delta: NULL_U32,
            progress_major_delta_units: NULL_U32,
            descriptor_channel: String::new(),
            descriptor_stream_id: 0,
            control_channel: String::new(),
            control_stream_id: 0,
        }
    }
}

/// Attachment states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unmapped,
    Mapped,
    Fallback,
}

/// Zero-copy view of one committed frame.
///
/// The payload borrows the mapped pool; the seqlock was re-checked after
/// the header copy, but a writer lapping the ring can still overwrite the
/// bytes while they are in use. Callers needing durability copy out.
pub struct FrameView<'a> {
    pub tensor: TensorHeader,
    pub payload: &'a [u8],
    pub pool_id: u16,
    pub payload_slot: u32,
    pub timestamp_ns: u64,
    pub meta_version: u32,
}

/// Frame metadata returned by [`Consumer::read_frame_copy`].
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub tensor: TensorHeader,
    pub pool_id: u16,
    pub payload_slot: u32,
    pub timestamp_ns: u64,
    pub meta_version: u32,
}

pub type DescriptorHandler = Box<dyn FnMut(&FrameDescriptor) + Send>;
pub type ProgressHandler = Box<dyn FnMut(&FrameProgress) + Send>;

struct ConsumerPool {
    pool_id: u16,
    stride_bytes: u32,
    region: ShmRegion,
}

pub struct Consumer {
    context: ClientContext,
    options: ConsumerOptions,

    descriptor_subscription: Subscription,
    control_subscription: Subscription,
    announce_subscription: Subscription,
    control_publication: Publication,
    qos_publication: Publication,
    descriptor_assembler: FragmentAssembler,
    control_assembler: FragmentAssembler,
    announce_assembler: FragmentAssembler,

    descriptor_handler: Option<DescriptorHandler>,
    progress_handler: Option<ProgressHandler>,

    header_region: Option<ShmRegion>,
    pools: Vec<ConsumerPool>,
    state: ConsumerState,
    epoch: u64,
    layout_version: u32,
    header_nslots: u32,

    payload_fallback_uri: String,
    lease_expired: bool,
    closed: bool,

    last_seq_seen: u64,
    drops_gap: u64,
    drops_late: u64,

    driver: Option<DriverClient>,
    attach_failures: u32,
    reattach_deadline_ns: Option<u64>,

    announce_join_time_ns: u64,
    last_announce_rx_ns: u64,
    last_announce_timestamp_ns: u64,
    last_announce_clock_domain: u8,
    last_announce_epoch: u64,
    last_qos_ns: u64,
}

impl Consumer {
    pub fn new(context: &ClientContext, options: ConsumerOptions) -> Result<Self> {
        if options.stream_id == 0 {
            return Err(TpError::Config("stream id must be nonzero".into()));
        }

        let fabric = context.fabric();
        let descriptor_subscription = if !options.descriptor_channel.is_empty()
            && options.descriptor_stream_id != 0
        {
            fabric.add_subscription(StreamAddr::new(
                options.descriptor_channel.clone(),
                options.descriptor_stream_id,
            ))
        } else {
            fabric.add_subscription(context.descriptor_addr())
        };
        let control_subscription =
            if !options.control_channel.is_empty() && options.control_stream_id != 0 {
                fabric.add_subscription(StreamAddr::new(
                    options.control_channel.clone(),
                    options.control_stream_id,
                ))
            } else {
                fabric.add_subscription(context.control_addr())
            };

        Ok(Self {
            descriptor_subscription,
            control_subscription,
            announce_subscription: fabric.add_subscription(context.announce_addr()),
            control_publication: fabric.add_publication(context.control_addr()),
            qos_publication: fabric.add_publication(context.qos_addr()),
            descriptor_assembler: FragmentAssembler::new(),
            control_assembler: FragmentAssembler::new(),
            announce_assembler: FragmentAssembler::new(),
            descriptor_handler: None,
            progress_handler: None,
            header_region: None,
            pools: Vec::new(),
            state: ConsumerState::Unmapped,
            epoch: 0,
            layout_version: LAYOUT_VERSION,
            header_nslots: 0,
            payload_fallback_uri: String::new(),
            lease_expired: false,
            closed: false,
            last_seq_seen: NULL_U64,
            drops_gap: 0,
            drops_late: 0,
            driver: None,
            attach_failures: 0,
            reattach_deadline_ns: None,
            announce_join_time_ns: clock::now_monotonic_ns(),
            last_announce_rx_ns: 0,
            last_announce_timestamp_ns: 0,
            last_announce_clock_domain: 0,
            last_announce_epoch: 0,
            last_qos_ns: 0,
            context: context.clone(),
            options,
        })
    }

    /// Announce this consumer to the producer.
    pub fn send_hello(&self) -> Result<()> {
        let hello = ConsumerHello {
            stream_id: self.options.stream_id,
            consumer_id: self.options.consumer_id,
            supports_shm: 1,
            supports_progress: u8::from(self.options.supports_progress),
            mode: self.options.mode,
            max_rate_hz: self.options.max_rate_hz,
            expected_layout_version: self.layout_version,
            progress_interval_us: self.options.progress_interval_us,
            progress_bytes_delta: self.options.progress_bytes_delta,
            progress_major_delta_units: self.options.progress_major_delta_units,
            descriptor_stream_id: self.options.descriptor_stream_id,
            control_stream_id: self.options.control_stream_id,
            descriptor_channel: self.options.descriptor_channel.clone(),
            control_channel: self.options.control_channel.clone(),
        };
        let mut buf =
            vec![0u8; 512 + hello.descriptor_channel.len() + hello.control_channel.len()];
        let len = hello.encode(&mut buf)?;
        match self.control_publication.offer(&buf[..len]) {
            OfferOutcome::Ok(_) => Ok(()),
            outcome => outcome.into_result().map(|_| ()),
        }
    }

    /// Map the stream's regions read-only and validate every superblock.
    /// Falls back to the payload URI on mapping failure when one is known.
    pub fn attach(&mut self, config: &ConsumerAttachConfig) -> Result<()> {
        match self.try_map(config) {
            Ok(()) => {
                self.state = ConsumerState::Mapped;
                self.epoch = config.epoch;
                self.layout_version = config.layout_version;
                self.header_nslots = config.header_nslots;
                self.attach_failures = 0;
                self.reattach_deadline_ns = None;
                log::debug!(
                    "[CONSUMER] mapped stream={} epoch={} nslots={}",
                    config.stream_id,
                    config.epoch,
                    config.header_nslots
                );
                Ok(())
            }
            Err(e) if !self.payload_fallback_uri.is_empty() => {
                log::warn!("[CONSUMER] SHM attach failed ({e}); using payload fallback");
                self.state = ConsumerState::Fallback;
                self.epoch = config.epoch;
                self.layout_version = config.layout_version;
                self.header_nslots = config.header_nslots;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn try_map(&mut self, config: &ConsumerAttachConfig) -> Result<()> {
        let header_region = ShmRegion::map(&config.header_uri, false, &self.context.allowed_paths)?;
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
            let region = ShmRegion::map(&pool.uri, false, &self.context.allowed_paths)?;
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
            pools.push(ConsumerPool {
                pool_id: pool.pool_id,
                stride_bytes: pool.stride_bytes,
                region,
            });
        }

        self.header_region = Some(header_region);
        self.pools = pools;
        Ok(())
    }

    /// Attach through the driver (blocking; needs a live driver).
    pub fn attach_via_driver(&mut self) -> Result<()> {
        let request = ShmAttachRequest {
            stream_id: self.options.stream_id,
            role: Role::Consumer,
            publish_mode: PublishMode::RequireExisting,
            ..ShmAttachRequest::default()
        };
        let mut driver = DriverClient::new(&self.context);
        let response = driver.attach(request, Role::Consumer)?;
        self.driver = Some(driver);
        self.finish_driver_attach(response)
    }

    /// Complete an attach whose response was obtained asynchronously.
    pub fn finish_driver_attach(
        &mut self,
        response: crate::wire::driver::ShmAttachResponse,
    ) -> Result<()> {
        if response.code != ResponseCode::Ok {
            self.schedule_reattach(clock::now_monotonic_ns());
            return Err(TpError::Rejected(response.error_message));
        }
        let config = ConsumerAttachConfig {
            stream_id: response.stream_id,
            epoch: response.epoch,
            layout_version: response.layout_version,
            header_nslots: response.header_nslots,
            header_uri: response.header_region_uri.clone(),
            pools: response
                .pools
                .iter()
                .map(|p| ConsumerPoolConfig {
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
                self.schedule_reattach(clock::now_monotonic_ns());
                Err(e)
            }
        }
    }

    pub fn set_driver(&mut self, driver: DriverClient) {
        self.driver = Some(driver);
    }

    #[must_use]
    pub fn driver_mut(&mut self) -> Option<&mut DriverClient> {
        self.driver.as_mut()
    }

    pub fn set_descriptor_handler(&mut self, handler: DescriptorHandler) {
        self.descriptor_handler = Some(handler);
    }

    pub fn set_progress_handler(&mut self, handler: ProgressHandler) {
        self.progress_handler = Some(handler);
    }

    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    #[must_use]
    pub fn uses_shm(&self) -> bool {
        self.state == ConsumerState::Mapped
    }

    #[must_use]
    pub fn payload_fallback_uri(&self) -> &str {
        &self.payload_fallback_uri
    }

    #[must_use]
    pub fn lease_expired(&self) -> bool {
        self.lease_expired
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// `(drops_gap, drops_late, last_seq_seen)`.
    #[must_use]
    pub fn drop_counts(&self) -> (u64, u64, u64) {
        (self.drops_gap, self.drops_late, self.last_seq_seen)
    }

    /// Announce-stream tracking: `(join_time_ns, last_rx_ns,
    /// last_announce_timestamp_ns, clock_domain, last_epoch)`. QoS
    /// observers use this to judge producer liveness and clock domain.
    #[must_use]
    pub fn announce_tracking(&self) -> (u64, u64, u64, u8, u64) {
        (
            self.announce_join_time_ns,
            self.last_announce_rx_ns,
            self.last_announce_timestamp_ns,
            self.last_announce_clock_domain,
            self.last_announce_epoch,
        )
    }

    /// Drain descriptors: drop accounting plus handler dispatch. Returns
    /// descriptors handled.
    pub fn poll_descriptors(&mut self, limit: usize) -> Result<usize> {
        let mut handled = 0;
        for fragment in self.descriptor_subscription.poll(limit) {
            let Some(message) = self.descriptor_assembler.push(fragment)? else {
                continue;
            };
            if let Decoded::Msg(descriptor) = FrameDescriptor::decode(&message)? {
                if descriptor.stream_id != self.options.stream_id {
                    continue;
                }
                if descriptor.epoch != self.epoch {
                    if descriptor.epoch > self.epoch && self.state == ConsumerState::Mapped {
                        log::warn!(
                            "[CONSUMER] descriptor epoch {} ahead of mapped {}; reattaching",
                            descriptor.epoch,
                            self.epoch
                        );
                        self.schedule_reattach(clock::now_monotonic_ns());
                    }
                    continue;
                }

                self.account_descriptor(descriptor.seq);
                if let Some(handler) = self.descriptor_handler.as_mut() {
                    handler(&descriptor);
                }
                handled += 1;
            }
        }
        Ok(handled)
    }

    fn account_descriptor(&mut self, seq: u64) {
        if self.last_seq_seen == NULL_U64 {
            self.last_seq_seen = seq;
            return;
        }
        if seq <= self.last_seq_seen {
            self.drops_late += 1;
            return;
        }
        if seq > self.last_seq_seen + 1 {
            self.drops_gap += seq - self.last_seq_seen - 1;
        }
        self.last_seq_seen = seq;
    }

    /// Drain the control stream: config replies and progress records.
    pub fn poll_control(&mut self, limit: usize) -> Result<usize> {
        let mut handled = 0;
        for fragment in self.control_subscription.poll(limit) {
            let Some(message) = self.control_assembler.push(fragment)? else {
                continue;
            };
            match peek_template_id(&message)? {
                template::CONSUMER_CONFIG => {
                    if let Decoded::Msg(config) = ConsumerConfig::decode(&message)? {
                        if config.stream_id == self.options.stream_id
                            && config.consumer_id == self.options.consumer_id
                        {
                            self.payload_fallback_uri = config.payload_fallback_uri;
                            handled += 1;
                        }
                    }
                }
                template::FRAME_PROGRESS => {
                    if let Decoded::Msg(progress) = FrameProgress::decode(&message)? {
                        if self.validate_progress(&progress).is_ok() {
                            if let Some(handler) = self.progress_handler.as_mut() {
                                handler(&progress);
                            }
                            handled += 1;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(handled)
    }

    /// Progress records arrive on the control stream; this drains it with
    /// the same dispatch as [`Self::poll_control`].
    pub fn poll_progress(&mut self, limit: usize) -> Result<usize> {
        self.poll_control(limit)
    }

    /// Drain SHM-pool announces: epoch advances trigger reattach.
    pub fn poll_announce(&mut self, limit: usize) -> Result<usize> {
        let mut handled = 0;
        let now_ns = clock::now_monotonic_ns();
        for fragment in self.announce_subscription.poll(limit) {
            let Some(message) = self.announce_assembler.push(fragment)? else {
                continue;
            };
            if let Decoded::Msg(announce) = ShmPoolAnnounce::decode(&message)? {
                if announce.stream_id != self.options.stream_id {
                    continue;
                }
                self.last_announce_rx_ns = now_ns;
                self.last_announce_timestamp_ns = announce.announce_timestamp_ns;
                self.last_announce_clock_domain = announce.announce_clock_domain;
                self.last_announce_epoch = announce.epoch;
                if self.state == ConsumerState::Mapped && announce.epoch > self.epoch {
                    log::warn!(
                        "[CONSUMER] stream re-created (epoch {} > {}); reattaching",
                        announce.epoch,
                        self.epoch
                    );
                    self.schedule_reattach(now_ns);
                }
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Reject progress records that cannot belong to the mapped stream.
    pub fn validate_progress(&self, progress: &FrameProgress) -> Result<()> {
        if progress.stream_id != self.options.stream_id {
            return Err(TpError::InvalidWire("progress for foreign stream".into()));
        }
        if progress.epoch != self.epoch {
            return Err(TpError::InvalidWire("progress for foreign epoch".into()));
        }
        if progress.state == ProgressState::Unknown {
            return Err(TpError::InvalidWire("progress state unknown".into()));
        }
        if let Some(max_stride) = self.pools.iter().map(|p| p.stride_bytes).max() {
            if progress.payload_bytes_filled > u64::from(max_stride) {
                return Err(TpError::InvalidWire(format!(
                    "progress bytes {} exceed largest pool stride {max_stride}",
                    progress.payload_bytes_filled
                )));
            }
        }
        Ok(())
    }

    /// Read the frame for `seq` in place.
    ///
    /// `NotReady` while the slot is in progress for this sequence (or a
    /// torn read was detected); `GapOrLate` when the slot carries some
    /// other committed sequence. Callers retry `NotReady` against their
    /// own deadline, typically 100 ms.
    pub fn read_frame(&self, seq: u64) -> Result<FrameView<'_>> {
        if self.state != ConsumerState::Mapped {
            return Err(TpError::Closed);
        }
        let region = self.header_region.as_ref().ok_or(TpError::Closed)?;
        let header_index = (seq & u64::from(self.header_nslots - 1)) as u32;
        let slot_ptr = region.ptr_at(slot::slot_offset(header_index), HEADER_SLOT_BYTES)?;
        // SAFETY: slot offsets are 256-byte aligned past the superblock.
        let word = unsafe { crate::shm::SeqlockWord::from_ptr(slot_ptr) };

        let first = word.load();
        if !seqlock::is_committed(first) {
            return if seqlock::seq_value(first) == seq {
                Err(TpError::NotReady)
            } else {
                Err(TpError::GapOrLate)
            };
        }
        if seqlock::seq_value(first) != seq {
            return Err(TpError::GapOrLate);
        }

        // SAFETY: the span is one whole slot inside the mapping; the
        // writer may race, which the reload below detects.
        let slot_buf =
            unsafe { std::slice::from_raw_parts(slot_ptr as *const u8, HEADER_SLOT_BYTES) };
        let slot_header = SlotHeader::decode(slot_buf)?;
        let tensor = slot::read_tensor(slot_buf)?;

        let pool = self
            .pools
            .iter()
            .find(|p| p.pool_id == slot_header.pool_id)
            .ok_or_else(|| {
                TpError::InvalidWire(format!("descriptor names unknown pool {}", slot_header.pool_id))
            })?;
        if slot_header.values_len_bytes > pool.stride_bytes {
            return Err(TpError::InvalidWire("slot payload exceeds pool stride".into()));
        }
        let payload_ptr = pool.region.ptr_at(
            slot::payload_offset(slot_header.payload_slot, pool.stride_bytes)
                + slot_header.payload_offset as usize,
            slot_header.values_len_bytes.max(1) as usize,
        )?;
        // SAFETY: span bounds-checked by ptr_at; torn content is excluded
        // by the seqlock reload below.
        let payload = unsafe {
            std::slice::from_raw_parts(
                payload_ptr as *const u8,
                slot_header.values_len_bytes as usize,
            )
        };

        // Reload: a wrap onto this slot during the reads above shows up
        // as a changed word.
        if word.load() != first {
            return Err(TpError::NotReady);
        }

        Ok(FrameView {
            tensor,
            payload,
            pool_id: slot_header.pool_id,
            payload_slot: slot_header.payload_slot,
            timestamp_ns: slot_header.timestamp_ns,
            meta_version: slot_header.meta_version,
        })
    }

    /// Read the frame for `seq`, copying the payload into `out`.
    ///
    /// Unlike [`Self::read_frame`], the seqlock is validated again after
    /// the copy, so the bytes in `out` are guaranteed torn-free even
    /// against a writer lapping the ring mid-copy.
    pub fn read_frame_copy(&self, seq: u64, out: &mut Vec<u8>) -> Result<FrameInfo> {
        let view = self.read_frame(seq)?;
        out.clear();
        out.extend_from_slice(view.payload);
        let info = FrameInfo {
            tensor: view.tensor,
            pool_id: view.pool_id,
            payload_slot: view.payload_slot,
            timestamp_ns: view.timestamp_ns,
            meta_version: view.meta_version,
        };
        // Re-validate: an overwrite during the copy surfaces as NotReady
        // or GapOrLate here and the copied bytes must be discarded.
        self.read_frame(seq)?;
        Ok(info)
    }

    /// Read with a bounded retry loop over `NotReady`.
    pub fn read_frame_timeout(&self, seq: u64, deadline_ns: u64) -> Result<FrameView<'_>> {
        loop {
            match self.read_frame(seq) {
                Err(TpError::NotReady) if clock::now_monotonic_ns() < deadline_ns => {
                    std::hint::spin_loop();
                }
                other => return other,
            }
        }
    }

    /// Arm the reattach backoff: `100 ms * 2^min(failures, 5)`.
    pub fn schedule_reattach(&mut self, now_ns: u64) {
        let exponent = self.attach_failures.min(5);
        let backoff_ns = 100_000_000u64 << exponent;
        self.attach_failures = self.attach_failures.saturating_add(1);
        self.reattach_deadline_ns = Some(now_ns + backoff_ns);
        self.unmap_regions();
        log::debug!(
            "[CONSUMER] reattach scheduled in {} ms (failure {})",
            backoff_ns / 1_000_000,
            self.attach_failures
        );
    }

    #[must_use]
    pub fn reattach_due(&self, now_ns: u64) -> bool {
        self.reattach_deadline_ns.is_some_and(|deadline| now_ns >= deadline)
    }

    pub fn clear_reattach(&mut self) {
        self.reattach_deadline_ns = None;
        self.attach_failures = 0;
    }

    fn unmap_regions(&mut self) {
        if let Some(mut region) = self.header_region.take() {
            region.unmap();
        }
        for mut pool in self.pools.drain(..) {
            pool.region.unmap();
        }
        if self.state == ConsumerState::Mapped {
            self.state = ConsumerState::Unmapped;
        }
    }

    fn publish_qos(&mut self, now_ns: u64) -> Result<()> {
        let qos = ConsumerQos {
            stream_id: self.options.stream_id,
            consumer_id: self.options.consumer_id,
            last_seq_seen: self.last_seq_seen,
            drops_gap: self.drops_gap,
            drops_late: self.drops_late,
            timestamp_ns: now_ns,
        };
        let mut buf = [0u8; 64];
        let len = qos.encode(&mut buf)?;
        match self.qos_publication.offer(&buf[..len]) {
            OfferOutcome::Ok(_) | OfferOutcome::NotConnected => Ok(()),
            outcome => outcome.into_result().map(|_| ()),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(driver) = self.driver.as_mut() {
            if driver.lease().is_some() {
                if let Err(e) = driver.detach() {
                    log::warn!("[CONSUMER] detach failed on close: {e}");
                }
            }
            driver.close();
        }
        self.unmap_regions();
        self.descriptor_subscription.close();
        self.control_subscription.close();
        self.announce_subscription.close();
        self.control_publication.close();
        self.qos_publication.close();
        self.closed = true;
        Ok(())
    }
}

impl Agent for Consumer {
    fn do_work(&mut self, now_ns: u64) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let mut work = self.poll_descriptors(16)?;
        work += self.poll_control(16)?;
        work += self.poll_announce(8)?;

        if now_ns.saturating_sub(self.last_qos_ns) >= self.context.announce_period_ns {
            self.last_qos_ns = now_ns;
            self.publish_qos(now_ns)?;
            work += 1;
        }

        if let Some(driver) = self.driver.as_mut() {
            let allowance = self.context.keepalive_interval_ns / 4;
            if driver.lease().is_some() && driver.keepalive_due(now_ns, allowance) {
                driver.keepalive(now_ns)?;
                work += 1;
            }
            let events = driver.poll_events()?;
            for event in events {
                match event {
                    DriverEvent::LeaseRevoked(revoked) => {
                        self.lease_expired = true;
                        self.context.surface_error(
                            &TpError::LeaseExpired,
                            &format!("lease revoked ({:?})", revoked.reason),
                        );
                        self.unmap_regions();
                        self.schedule_reattach(now_ns);
                    }
                    DriverEvent::Shutdown(_) => {
                        self.lease_expired = true;
                        self.context.surface_error(&TpError::Closed, "driver shutdown");
                        self.unmap_regions();
                    }
                }
                work += 1;
            }
        }

        Ok(work)
    }
}
