// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Discovery request/response codecs.
//!
//! Requests filter on any subset of stream id, producer id, data-source id,
//! data-source name, and tags; null sentinels and empty strings mean
//! "unfiltered". Responses carry full directory entries including nested
//! payload-pool and tag groups.

use crate::error::TpError;
use crate::types::{NULL_U32, NULL_U64};
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

pub const DISCOVERY_REQUEST_BLOCK_LEN: u16 = 28;

/// Query sent to the directory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest {
    pub correlation_id: i64,
    /// `NULL_U32` leaves the field unfiltered; same for the other ids.
    pub stream_id: u32,
    pub producer_id: u32,
    pub data_source_id: u32,
    pub response_stream_id: u32,
    pub max_results: u32,
    pub data_source_name: String,
    pub response_channel: String,
    /// Entries must carry every requested tag (subset match).
    pub tags: Vec<String>,
}

impl Default for DiscoveryRequest {
    fn default() -> Self {
        Self {
            correlation_id: 0,
            stream_id: NULL_U32,
            producer_id: NULL_U32,
            data_source_id: NULL_U32,
            response_stream_id: 0,
            max_results: 64,
            data_source_name: String::new(),
            response_channel: String::new(),
            tags: Vec::new(),
        }
    }
}

impl DiscoveryRequest {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(DISCOVERY_REQUEST_BLOCK_LEN, template::DISCOVERY_REQUEST)
            .encode(&mut cur)?;
        cur.write_i64(self.correlation_id)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.producer_id)?;
        cur.write_u32(self.data_source_id)?;
        cur.write_u32(self.response_stream_id)?;
        cur.write_u32(self.max_results)?;
        cur.write_group_header(self.tags.len() as u16, 0)?;
        for tag in &self.tags {
            cur.write_var_ascii(tag)?;
        }
        cur.write_var_ascii(&self.data_source_name)?;
        cur.write_var_ascii(&self.response_channel)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) =
            decode_header(buf, template::DISCOVERY_REQUEST, DISCOVERY_REQUEST_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        let correlation_id = cur.read_i64()?;
        let stream_id = cur.read_u32()?;
        let producer_id = cur.read_u32()?;
        let data_source_id = cur.read_u32()?;
        let response_stream_id = cur.read_u32()?;
        let max_results = cur.read_u32()?;
        let (count, _block) = cur.read_group_header()?;
        let mut tags = Vec::with_capacity(count as usize);
        for _ in 0..count {
            tags.push(cur.read_var_ascii()?);
        }
        Ok(Decoded::Msg(Self {
            correlation_id,
            stream_id,
            producer_id,
            data_source_id,
            response_stream_id,
            max_results,
            data_source_name: cur.read_var_ascii()?,
            response_channel: cur.read_var_ascii()?,
            tags,
        }))
    }
}

/// Response status. The error path carries no results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryStatus {
    Ok = 0,
    Error = 1,
}

impl DiscoveryStatus {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Ok,
            1 => Self::Error,
            other => {
                return Err(TpError::InvalidWire(format!(
                    "unknown discovery status {other}"
                )))
            }
        })
    }
}

/// One payload pool inside a discovery result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveryPool {
    pub pool_id: u16,
    pub nslots: u32,
    pub stride_bytes: u32,
    pub region_uri: String,
}

/// One directory entry in a discovery response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub stream_id: u32,
    pub producer_id: u32,
    pub data_source_id: u32,
    pub epoch: u64,
    pub layout_version: u32,
    pub header_nslots: u32,
    pub header_slot_bytes: u16,
    pub max_dims: u8,
    pub last_announce_ns: u64,
    pub data_source_name: String,
    pub header_region_uri: String,
    pub pools: Vec<DiscoveryPool>,
    pub tags: Vec<String>,
}

impl Default for DiscoveryResult {
    fn default() -> Self {
        Self {
            stream_id: 0,
            producer_id: 0,
            data_source_id: NULL_U32,
            epoch: 0,
            layout_version: 0,
            header_nslots: 0,
            header_slot_bytes: 0,
            max_dims: 0,
            last_announce_ns: NULL_U64,
            data_source_name: String::new(),
            header_region_uri: String::new(),
            pools: Vec::new(),
            tags: Vec::new(),
        }
    }
}

pub const DISCOVERY_RESPONSE_BLOCK_LEN: u16 = 12;
pub const DISCOVERY_RESULT_BLOCK_LEN: u16 = 40;
pub const DISCOVERY_POOL_BLOCK_LEN: u16 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub correlation_id: i64,
    pub status: DiscoveryStatus,
    pub error_message: String,
    pub results: Vec<DiscoveryResult>,
}

impl DiscoveryResponse {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(DISCOVERY_RESPONSE_BLOCK_LEN, template::DISCOVERY_RESPONSE)
            .encode(&mut cur)?;
        cur.write_i64(self.correlation_id)?;
        cur.write_u8(self.status as u8)?;
        cur.write_bytes(&[0u8; 3])?;
        cur.write_group_header(self.results.len() as u16, DISCOVERY_RESULT_BLOCK_LEN)?;
        for result in &self.results {
            cur.write_u32(result.stream_id)?;
            cur.write_u32(result.producer_id)?;
            cur.write_u32(result.data_source_id)?;
            cur.write_u64(result.epoch)?;
            cur.write_u32(result.layout_version)?;
            cur.write_u32(result.header_nslots)?;
            cur.write_u16(result.header_slot_bytes)?;
            cur.write_u8(result.max_dims)?;
            cur.write_u8(0)?;
            cur.write_u64(result.last_announce_ns)?;
            cur.write_group_header(result.pools.len() as u16, DISCOVERY_POOL_BLOCK_LEN)?;
            for pool in &result.pools {
                cur.write_u16(pool.pool_id)?;
                cur.write_u16(0)?;
                cur.write_u32(pool.nslots)?;
                cur.write_u32(pool.stride_bytes)?;
                cur.write_var_ascii(&pool.region_uri)?;
            }
            cur.write_group_header(result.tags.len() as u16, 0)?;
            for tag in &result.tags {
                cur.write_var_ascii(tag)?;
            }
            cur.write_var_ascii(&result.data_source_name)?;
            cur.write_var_ascii(&result.header_region_uri)?;
        }
        cur.write_var_ascii(&self.error_message)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::DISCOVERY_RESPONSE,
            DISCOVERY_RESPONSE_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        let correlation_id = cur.read_i64()?;
        let status = DiscoveryStatus::from_u8(cur.read_u8()?)?;
        cur.skip(3)?;
        let (count, _block) = cur.read_group_header()?;
        let mut results = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let stream_id = cur.read_u32()?;
            let producer_id = cur.read_u32()?;
            let data_source_id = cur.read_u32()?;
            let epoch = cur.read_u64()?;
            let layout_version = cur.read_u32()?;
            let header_nslots = cur.read_u32()?;
            let header_slot_bytes = cur.read_u16()?;
            let max_dims = cur.read_u8()?;
            cur.skip(1)?;
            let last_announce_ns = cur.read_u64()?;

            let (pool_count, _pool_block) = cur.read_group_header()?;
            let mut pools = Vec::with_capacity(pool_count as usize);
            for _ in 0..pool_count {
                let pool_id = cur.read_u16()?;
                cur.skip(2)?;
                pools.push(DiscoveryPool {
                    pool_id,
                    nslots: cur.read_u32()?,
                    stride_bytes: cur.read_u32()?,
                    region_uri: cur.read_var_ascii()?,
                });
            }

            let (tag_count, _tag_block) = cur.read_group_header()?;
            let mut tags = Vec::with_capacity(tag_count as usize);
            for _ in 0..tag_count {
                tags.push(cur.read_var_ascii()?);
            }

            results.push(DiscoveryResult {
                stream_id,
                producer_id,
                data_source_id,
                epoch,
                layout_version,
                header_nslots,
                header_slot_bytes,
                max_dims,
                last_announce_ns,
                data_source_name: cur.read_var_ascii()?,
                header_region_uri: cur.read_var_ascii()?,
                pools,
                tags,
            });
        }
        Ok(Decoded::Msg(Self {
            correlation_id,
            status,
            error_message: cur.read_var_ascii()?,
            results,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let req = DiscoveryRequest {
            correlation_id: 17,
            stream_id: 10_000,
            data_source_name: "camera-1".into(),
            response_stream_id: 2001,
            response_channel: "fabric:mem?endpoint=query-rsp".into(),
            tags: vec!["vision".into(), "fp32".into()],
            ..DiscoveryRequest::default()
        };
        let mut buf = [0u8; 512];
        let n = req.encode(&mut buf).unwrap();
        assert_eq!(
            DiscoveryRequest::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            req
        );
    }

    #[test]
    fn test_request_unfiltered_round_trip() {
        let req = DiscoveryRequest::default();
        let mut buf = [0u8; 128];
        let n = req.encode(&mut buf).unwrap();
        let back = DiscoveryRequest::decode(&buf[..n]).unwrap().into_msg().unwrap();
        assert_eq!(back.stream_id, NULL_U32);
        assert!(back.tags.is_empty());
    }

    #[test]
    fn test_response_round_trip() {
        let resp = DiscoveryResponse {
            correlation_id: 17,
            status: DiscoveryStatus::Ok,
            error_message: String::new(),
            results: vec![DiscoveryResult {
                stream_id: 10_000,
                producer_id: 1,
                data_source_id: 9,
                epoch: 2,
                layout_version: 1,
                header_nslots: 4,
                header_slot_bytes: 256,
                max_dims: 8,
                last_announce_ns: 1_000,
                data_source_name: "camera-1".into(),
                header_region_uri: "shm:file?path=/dev/shm/tp_hdr".into(),
                pools: vec![DiscoveryPool {
                    pool_id: 1,
                    nslots: 4,
                    stride_bytes: 64,
                    region_uri: "shm:file?path=/dev/shm/tp_p1".into(),
                }],
                tags: vec!["vision".into(), "fp32".into()],
            }],
        };
        let mut buf = [0u8; 1024];
        let n = resp.encode(&mut buf).unwrap();
        assert_eq!(
            DiscoveryResponse::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            resp
        );
    }

    #[test]
    fn test_error_response_round_trip() {
        let resp = DiscoveryResponse {
            correlation_id: 8,
            status: DiscoveryStatus::Error,
            error_message: "result limit exceeded".into(),
            results: Vec::new(),
        };
        let mut buf = [0u8; 256];
        let n = resp.encode(&mut buf).unwrap();
        let back = DiscoveryResponse::decode(&buf[..n]).unwrap().into_msg().unwrap();
        assert_eq!(back.status, DiscoveryStatus::Error);
        assert!(back.results.is_empty());
    }
}
