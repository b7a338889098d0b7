// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Control-plane message codecs: hello/config, announces, metadata blobs,
//! descriptors, progress, and QoS reports.
//!
//! Field order inside each fixed block is part of the wire contract;
//! trailing variable ASCII fields and repeating groups follow the framing
//! rules documented in [`crate::wire`].

use crate::types::{ClockDomain, Mode, ProgressState, ResponseCode};
use crate::wire::{template, Cursor, CursorMut, Decoded, MessageHeader};
use crate::Result;

fn decode_header<'a>(
    buf: &'a [u8],
    template_id: u16,
    block_len: u16,
) -> Result<Option<Cursor<'a>>> {
    let mut cur = Cursor::new(buf);
    let header = MessageHeader::decode(&mut cur)?;
    if !header.gate(template_id, block_len)? {
        return Ok(None);
    }
    Ok(Some(cur))
}

// ---------------------------------------------------------------------
// consumerHello
// ---------------------------------------------------------------------

pub const CONSUMER_HELLO_BLOCK_LEN: u16 = 36;

/// First contact from a consumer on the control stream.
///
/// `descriptor_channel`/`descriptor_stream_id` (and the control pair) must
/// be both set or both unset; the registry enforces that invariant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsumerHello {
    pub stream_id: u32,
    pub consumer_id: u32,
    pub supports_shm: u8,
    pub supports_progress: u8,
    pub mode: Mode,
    pub max_rate_hz: u32,
    pub expected_layout_version: u32,
    pub progress_interval_us: u32,
    pub progress_bytes_delta: u32,
    pub progress_major_delta_units: u32,
    pub descriptor_stream_id: u32,
    pub control_stream_id: u32,
    pub descriptor_channel: String,
    pub control_channel: String,
}

impl ConsumerHello {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(CONSUMER_HELLO_BLOCK_LEN, template::CONSUMER_HELLO).encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.consumer_id)?;
        cur.write_u8(self.supports_shm)?;
        cur.write_u8(self.supports_progress)?;
        cur.write_u8(self.mode as u8)?;
        cur.write_u8(0)?;
        cur.write_u32(self.max_rate_hz)?;
        cur.write_u32(self.expected_layout_version)?;
        cur.write_u32(self.progress_interval_us)?;
        cur.write_u32(self.progress_bytes_delta)?;
        cur.write_u32(self.progress_major_delta_units)?;
        cur.write_u32(self.descriptor_stream_id)?;
        cur.write_u32(self.control_stream_id)?;
        cur.write_var_ascii(&self.descriptor_channel)?;
        cur.write_var_ascii(&self.control_channel)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(buf, template::CONSUMER_HELLO, CONSUMER_HELLO_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        let stream_id = cur.read_u32()?;
        let consumer_id = cur.read_u32()?;
        let supports_shm = cur.read_u8()?;
        let supports_progress = cur.read_u8()?;
        let mode = Mode::from_u8(cur.read_u8()?)?;
        cur.skip(1)?;
        Ok(Decoded::Msg(Self {
            stream_id,
            consumer_id,
            supports_shm,
            supports_progress,
            mode,
            max_rate_hz: cur.read_u32()?,
            expected_layout_version: cur.read_u32()?,
            progress_interval_us: cur.read_u32()?,
            progress_bytes_delta: cur.read_u32()?,
            progress_major_delta_units: cur.read_u32()?,
            descriptor_stream_id: cur.read_u32()?,
            control_stream_id: cur.read_u32()?,
            descriptor_channel: cur.read_var_ascii()?,
            control_channel: cur.read_var_ascii()?,
        }))
    }
}

// ---------------------------------------------------------------------
// consumerConfig
// ---------------------------------------------------------------------

pub const CONSUMER_CONFIG_BLOCK_LEN: u16 = 20;

/// Producer reply assigning a consumer its effective configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsumerConfig {
    pub stream_id: u32,
    pub consumer_id: u32,
    pub use_shm: u8,
    pub mode: Mode,
    pub descriptor_stream_id: u32,
    pub control_stream_id: u32,
    pub payload_fallback_uri: String,
    pub descriptor_channel: String,
    pub control_channel: String,
}

impl ConsumerConfig {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(CONSUMER_CONFIG_BLOCK_LEN, template::CONSUMER_CONFIG).encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.consumer_id)?;
        cur.write_u8(self.use_shm)?;
        cur.write_u8(self.mode as u8)?;
        cur.write_u16(0)?;
        cur.write_u32(self.descriptor_stream_id)?;
        cur.write_u32(self.control_stream_id)?;
        cur.write_var_ascii(&self.payload_fallback_uri)?;
        cur.write_var_ascii(&self.descriptor_channel)?;
        cur.write_var_ascii(&self.control_channel)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) =
            decode_header(buf, template::CONSUMER_CONFIG, CONSUMER_CONFIG_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        let stream_id = cur.read_u32()?;
        let consumer_id = cur.read_u32()?;
        let use_shm = cur.read_u8()?;
        let mode = Mode::from_u8(cur.read_u8()?)?;
        cur.skip(2)?;
        Ok(Decoded::Msg(Self {
            stream_id,
            consumer_id,
            use_shm,
            mode,
            descriptor_stream_id: cur.read_u32()?,
            control_stream_id: cur.read_u32()?,
            payload_fallback_uri: cur.read_var_ascii()?,
            descriptor_channel: cur.read_var_ascii()?,
            control_channel: cur.read_var_ascii()?,
        }))
    }
}

// ---------------------------------------------------------------------
// dataSourceAnnounce
// ---------------------------------------------------------------------

pub const DATA_SOURCE_ANNOUNCE_BLOCK_LEN: u16 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataSourceAnnounce {
    pub stream_id: u32,
    pub producer_id: u32,
    pub data_source_id: u32,
    pub epoch: u64,
    pub meta_version: u32,
    pub name: String,
    pub summary: String,
}

impl DataSourceAnnounce {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(DATA_SOURCE_ANNOUNCE_BLOCK_LEN, template::DATA_SOURCE_ANNOUNCE)
            .encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.producer_id)?;
        cur.write_u32(self.data_source_id)?;
        cur.write_u64(self.epoch)?;
        cur.write_u32(self.meta_version)?;
        cur.write_var_ascii(&self.name)?;
        cur.write_var_ascii(&self.summary)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::DATA_SOURCE_ANNOUNCE,
            DATA_SOURCE_ANNOUNCE_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        Ok(Decoded::Msg(Self {
            stream_id: cur.read_u32()?,
            producer_id: cur.read_u32()?,
            data_source_id: cur.read_u32()?,
            epoch: cur.read_u64()?,
            meta_version: cur.read_u32()?,
            name: cur.read_var_ascii()?,
            summary: cur.read_var_ascii()?,
        }))
    }
}

// ---------------------------------------------------------------------
// dataSourceMeta (attributes group)
// ---------------------------------------------------------------------

pub const DATA_SOURCE_META_BLOCK_LEN: u16 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetaAttribute {
    pub key: String,
    pub format: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataSourceMeta {
    pub stream_id: u32,
    pub meta_version: u32,
    pub timestamp_ns: u64,
    pub attributes: Vec<MetaAttribute>,
}

impl DataSourceMeta {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(DATA_SOURCE_META_BLOCK_LEN, template::DATA_SOURCE_META)
            .encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.meta_version)?;
        cur.write_u64(self.timestamp_ns)?;
        cur.write_group_header(self.attributes.len() as u16, 0)?;
        for attr in &self.attributes {
            cur.write_var_ascii(&attr.key)?;
            cur.write_var_ascii(&attr.format)?;
            cur.write_var_bytes(&attr.value)?;
        }
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) =
            decode_header(buf, template::DATA_SOURCE_META, DATA_SOURCE_META_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        let stream_id = cur.read_u32()?;
        let meta_version = cur.read_u32()?;
        let timestamp_ns = cur.read_u64()?;
        let (count, _block) = cur.read_group_header()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            attributes.push(MetaAttribute {
                key: cur.read_var_ascii()?,
                format: cur.read_var_ascii()?,
                value: cur.read_var_bytes()?,
            });
        }
        Ok(Decoded::Msg(Self {
            stream_id,
            meta_version,
            timestamp_ns,
            attributes,
        }))
    }
}

// ---------------------------------------------------------------------
// metaBlobAnnounce / metaBlobChunk / metaBlobComplete
// ---------------------------------------------------------------------

pub const META_BLOB_ANNOUNCE_BLOCK_LEN: u16 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaBlobAnnounce {
    pub stream_id: u32,
    pub meta_version: u32,
    pub blob_type: u32,
    pub total_len: u64,
    pub checksum: u64,
}

impl MetaBlobAnnounce {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(META_BLOB_ANNOUNCE_BLOCK_LEN, template::META_BLOB_ANNOUNCE)
            .encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.meta_version)?;
        cur.write_u32(self.blob_type)?;
        cur.write_u64(self.total_len)?;
        cur.write_u64(self.checksum)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::META_BLOB_ANNOUNCE,
            META_BLOB_ANNOUNCE_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        Ok(Decoded::Msg(Self {
            stream_id: cur.read_u32()?,
            meta_version: cur.read_u32()?,
            blob_type: cur.read_u32()?,
            total_len: cur.read_u64()?,
            checksum: cur.read_u64()?,
        }))
    }
}

pub const META_BLOB_CHUNK_BLOCK_LEN: u16 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetaBlobChunk {
    pub stream_id: u32,
    pub meta_version: u32,
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl MetaBlobChunk {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(META_BLOB_CHUNK_BLOCK_LEN, template::META_BLOB_CHUNK)
            .encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.meta_version)?;
        cur.write_u64(self.offset)?;
        cur.write_var_bytes(&self.bytes)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(buf, template::META_BLOB_CHUNK, META_BLOB_CHUNK_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        Ok(Decoded::Msg(Self {
            stream_id: cur.read_u32()?,
            meta_version: cur.read_u32()?,
            offset: cur.read_u64()?,
            bytes: cur.read_var_bytes()?,
        }))
    }
}

pub const META_BLOB_COMPLETE_BLOCK_LEN: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaBlobComplete {
    pub stream_id: u32,
    pub meta_version: u32,
    pub checksum: u64,
}

impl MetaBlobComplete {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(META_BLOB_COMPLETE_BLOCK_LEN, template::META_BLOB_COMPLETE)
            .encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.meta_version)?;
        cur.write_u64(self.checksum)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::META_BLOB_COMPLETE,
            META_BLOB_COMPLETE_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        Ok(Decoded::Msg(Self {
            stream_id: cur.read_u32()?,
            meta_version: cur.read_u32()?,
            checksum: cur.read_u64()?,
        }))
    }
}

// ---------------------------------------------------------------------
// controlResponse
// ---------------------------------------------------------------------

pub const CONTROL_RESPONSE_BLOCK_LEN: u16 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub correlation_id: i64,
    pub code: ResponseCode,
    pub error_message: String,
}

impl ControlResponse {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(CONTROL_RESPONSE_BLOCK_LEN, template::CONTROL_RESPONSE)
            .encode(&mut cur)?;
        cur.write_i64(self.correlation_id)?;
        cur.write_u8(self.code as u8)?;
        cur.write_bytes(&[0u8; 3])?;
        cur.write_var_ascii(&self.error_message)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) =
            decode_header(buf, template::CONTROL_RESPONSE, CONTROL_RESPONSE_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        let correlation_id = cur.read_i64()?;
        let code = ResponseCode::from_u8(cur.read_u8()?)?;
        cur.skip(3)?;
        Ok(Decoded::Msg(Self {
            correlation_id,
            code,
            error_message: cur.read_var_ascii()?,
        }))
    }
}

// ---------------------------------------------------------------------
// shmPoolAnnounce (pools group)
// ---------------------------------------------------------------------

pub const SHM_POOL_ANNOUNCE_BLOCK_LEN: u16 = 40;
pub const SHM_POOL_ANNOUNCE_POOL_BLOCK_LEN: u16 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShmPoolAnnouncePool {
    pub pool_id: u16,
    pub pool_nslots: u32,
    pub stride_bytes: u32,
    pub region_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShmPoolAnnounce {
    pub stream_id: u32,
    pub producer_id: u32,
    pub epoch: u64,
    pub announce_timestamp_ns: u64,
    pub announce_clock_domain: u8,
    pub layout_version: u32,
    pub header_nslots: u32,
    pub header_slot_bytes: u16,
    pub header_region_uri: String,
    pub pools: Vec<ShmPoolAnnouncePool>,
}

impl ShmPoolAnnounce {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(SHM_POOL_ANNOUNCE_BLOCK_LEN, template::SHM_POOL_ANNOUNCE)
            .encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.producer_id)?;
        cur.write_u64(self.epoch)?;
        cur.write_u64(self.announce_timestamp_ns)?;
        cur.write_u8(self.announce_clock_domain)?;
        cur.write_bytes(&[0u8; 3])?;
        cur.write_u32(self.layout_version)?;
        cur.write_u32(self.header_nslots)?;
        cur.write_u16(self.header_slot_bytes)?;
        cur.write_u16(0)?;
        cur.write_group_header(self.pools.len() as u16, SHM_POOL_ANNOUNCE_POOL_BLOCK_LEN)?;
        for pool in &self.pools {
            cur.write_u16(pool.pool_id)?;
            cur.write_u16(0)?;
            cur.write_u32(pool.pool_nslots)?;
            cur.write_u32(pool.stride_bytes)?;
            cur.write_var_ascii(&pool.region_uri)?;
        }
        cur.write_var_ascii(&self.header_region_uri)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) =
            decode_header(buf, template::SHM_POOL_ANNOUNCE, SHM_POOL_ANNOUNCE_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        let stream_id = cur.read_u32()?;
        let producer_id = cur.read_u32()?;
        let epoch = cur.read_u64()?;
        let announce_timestamp_ns = cur.read_u64()?;
        let announce_clock_domain = cur.read_u8()?;
        // Reject unknown clock domains early; the value is retained raw.
        ClockDomain::from_u8(announce_clock_domain)?;
        cur.skip(3)?;
        let layout_version = cur.read_u32()?;
        let header_nslots = cur.read_u32()?;
        let header_slot_bytes = cur.read_u16()?;
        cur.skip(2)?;
        let (count, block) = cur.read_group_header()?;
        let mut pools = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let pool_id = cur.read_u16()?;
            cur.skip(2)?;
            let pool_nslots = cur.read_u32()?;
            let stride_bytes = cur.read_u32()?;
            // Step over any block growth from a newer-but-compatible writer.
            if block as usize > SHM_POOL_ANNOUNCE_POOL_BLOCK_LEN as usize {
                cur.skip(block as usize - SHM_POOL_ANNOUNCE_POOL_BLOCK_LEN as usize)?;
            }
            pools.push(ShmPoolAnnouncePool {
                pool_id,
                pool_nslots,
                stride_bytes,
                region_uri: cur.read_var_ascii()?,
            });
        }
        Ok(Decoded::Msg(Self {
            stream_id,
            producer_id,
            epoch,
            announce_timestamp_ns,
            announce_clock_domain,
            layout_version,
            header_nslots,
            header_slot_bytes,
            header_region_uri: cur.read_var_ascii()?,
            pools,
        }))
    }
}

// ---------------------------------------------------------------------
// frameDescriptor
// ---------------------------------------------------------------------

pub const FRAME_DESCRIPTOR_BLOCK_LEN: u16 = 40;

/// The sole trigger for consumer-side reads; payload never rides the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDescriptor {
    pub stream_id: u32,
    pub meta_version: u32,
    pub epoch: u64,
    pub seq: u64,
    pub timestamp_ns: u64,
    pub trace_id: u64,
}

impl FrameDescriptor {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(FRAME_DESCRIPTOR_BLOCK_LEN, template::FRAME_DESCRIPTOR)
            .encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.meta_version)?;
        cur.write_u64(self.epoch)?;
        cur.write_u64(self.seq)?;
        cur.write_u64(self.timestamp_ns)?;
        cur.write_u64(self.trace_id)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) =
            decode_header(buf, template::FRAME_DESCRIPTOR, FRAME_DESCRIPTOR_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        Ok(Decoded::Msg(Self {
            stream_id: cur.read_u32()?,
            meta_version: cur.read_u32()?,
            epoch: cur.read_u64()?,
            seq: cur.read_u64()?,
            timestamp_ns: cur.read_u64()?,
            trace_id: cur.read_u64()?,
        }))
    }
}

// ---------------------------------------------------------------------
// frameProgress
// ---------------------------------------------------------------------

pub const FRAME_PROGRESS_BLOCK_LEN: u16 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameProgress {
    pub stream_id: u32,
    pub state: ProgressState,
    pub epoch: u64,
    pub seq: u64,
    pub payload_bytes_filled: u64,
}

impl FrameProgress {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(FRAME_PROGRESS_BLOCK_LEN, template::FRAME_PROGRESS).encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u8(self.state as u8)?;
        cur.write_bytes(&[0u8; 3])?;
        cur.write_u64(self.epoch)?;
        cur.write_u64(self.seq)?;
        cur.write_u64(self.payload_bytes_filled)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(buf, template::FRAME_PROGRESS, FRAME_PROGRESS_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        let stream_id = cur.read_u32()?;
        let state = ProgressState::from_u8(cur.read_u8()?)?;
        cur.skip(3)?;
        Ok(Decoded::Msg(Self {
            stream_id,
            state,
            epoch: cur.read_u64()?,
            seq: cur.read_u64()?,
            payload_bytes_filled: cur.read_u64()?,
        }))
    }
}

// ---------------------------------------------------------------------
// producerQos / consumerQos
// ---------------------------------------------------------------------

pub const PRODUCER_QOS_BLOCK_LEN: u16 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProducerQos {
    pub stream_id: u32,
    pub epoch: u64,
    pub seq: u64,
    pub frames_published: u64,
    pub bytes_published: u64,
    pub timestamp_ns: u64,
}

impl ProducerQos {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(PRODUCER_QOS_BLOCK_LEN, template::PRODUCER_QOS).encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(0)?;
        cur.write_u64(self.epoch)?;
        cur.write_u64(self.seq)?;
        cur.write_u64(self.frames_published)?;
        cur.write_u64(self.bytes_published)?;
        cur.write_u64(self.timestamp_ns)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(buf, template::PRODUCER_QOS, PRODUCER_QOS_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        let stream_id = cur.read_u32()?;
        cur.skip(4)?;
        Ok(Decoded::Msg(Self {
            stream_id,
            epoch: cur.read_u64()?,
            seq: cur.read_u64()?,
            frames_published: cur.read_u64()?,
            bytes_published: cur.read_u64()?,
            timestamp_ns: cur.read_u64()?,
        }))
    }
}

pub const CONSUMER_QOS_BLOCK_LEN: u16 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerQos {
    pub stream_id: u32,
    pub consumer_id: u32,
    pub last_seq_seen: u64,
    pub drops_gap: u64,
    pub drops_late: u64,
    pub timestamp_ns: u64,
}

impl ConsumerQos {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(CONSUMER_QOS_BLOCK_LEN, template::CONSUMER_QOS).encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.consumer_id)?;
        cur.write_u64(self.last_seq_seen)?;
        cur.write_u64(self.drops_gap)?;
        cur.write_u64(self.drops_late)?;
        cur.write_u64(self.timestamp_ns)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(buf, template::CONSUMER_QOS, CONSUMER_QOS_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        Ok(Decoded::Msg(Self {
            stream_id: cur.read_u32()?,
            consumer_id: cur.read_u32()?,
            last_seq_seen: cur.read_u64()?,
            drops_gap: cur.read_u64()?,
            drops_late: cur.read_u64()?,
            timestamp_ns: cur.read_u64()?,
        }))
    }
}
