// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Driver control-stream codecs: attach/detach, keepalive, lease
//! revocation, and shutdown.

use crate::types::{
    HugepagesPolicy, LeaseRevokedReason, PublishMode, ResponseCode, Role, NULL_U32,
};
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
// shmAttachRequest
// ---------------------------------------------------------------------

pub const SHM_ATTACH_REQUEST_BLOCK_LEN: u16 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmAttachRequest {
    pub correlation_id: i64,
    pub stream_id: u32,
    pub client_id: u32,
    pub role: Role,
    pub publish_mode: PublishMode,
    pub require_hugepages: HugepagesPolicy,
    pub expected_layout_version: u32,
    /// `NULL_U32` asks the driver to assign one.
    pub desired_node_id: u32,
}

impl ShmAttachRequest {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(SHM_ATTACH_REQUEST_BLOCK_LEN, template::SHM_ATTACH_REQUEST)
            .encode(&mut cur)?;
        cur.write_i64(self.correlation_id)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.client_id)?;
        cur.write_u8(self.role as u8)?;
        cur.write_u8(self.publish_mode as u8)?;
        cur.write_u8(self.require_hugepages as u8)?;
        cur.write_u8(0)?;
        cur.write_u32(self.expected_layout_version)?;
        cur.write_u32(self.desired_node_id)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::SHM_ATTACH_REQUEST,
            SHM_ATTACH_REQUEST_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        let correlation_id = cur.read_i64()?;
        let stream_id = cur.read_u32()?;
        let client_id = cur.read_u32()?;
        let role = Role::from_u8(cur.read_u8()?)?;
        let publish_mode = PublishMode::from_u8(cur.read_u8()?)?;
        let require_hugepages = HugepagesPolicy::from_u8(cur.read_u8()?)?;
        cur.skip(1)?;
        Ok(Decoded::Msg(Self {
            correlation_id,
            stream_id,
            client_id,
            role,
            publish_mode,
            require_hugepages,
            expected_layout_version: cur.read_u32()?,
            desired_node_id: cur.read_u32()?,
        }))
    }
}

impl Default for ShmAttachRequest {
    fn default() -> Self {
        Self {
            correlation_id: 0,
            stream_id: 0,
            client_id: 0,
            role: Role::Consumer,
            publish_mode: PublishMode::RequireExisting,
            require_hugepages: HugepagesPolicy::Unspecified,
            expected_layout_version: crate::types::LAYOUT_VERSION,
            desired_node_id: NULL_U32,
        }
    }
}

// ---------------------------------------------------------------------
// shmAttachResponse (pools group)
// ---------------------------------------------------------------------

pub const SHM_ATTACH_RESPONSE_BLOCK_LEN: u16 = 56;
pub const SHM_ATTACH_RESPONSE_POOL_BLOCK_LEN: u16 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttachPoolInfo {
    pub pool_id: u16,
    pub nslots: u32,
    pub stride_bytes: u32,
    pub region_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmAttachResponse {
    pub correlation_id: i64,
    pub code: ResponseCode,
    pub lease_id: u64,
    pub lease_expiry_timestamp_ns: u64,
    pub stream_id: u32,
    pub layout_version: u32,
    pub epoch: u64,
    pub header_nslots: u32,
    pub header_slot_bytes: u16,
    pub max_dims: u8,
    pub node_id: u32,
    pub error_message: String,
    pub header_region_uri: String,
    pub pools: Vec<AttachPoolInfo>,
}

impl Default for ShmAttachResponse {
    fn default() -> Self {
        Self {
            correlation_id: 0,
            code: ResponseCode::Ok,
            lease_id: 0,
            lease_expiry_timestamp_ns: 0,
            stream_id: 0,
            layout_version: 0,
            epoch: 0,
            header_nslots: 0,
            header_slot_bytes: 0,
            max_dims: 0,
            node_id: NULL_U32,
            error_message: String::new(),
            header_region_uri: String::new(),
            pools: Vec::new(),
        }
    }
}

impl ShmAttachResponse {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(SHM_ATTACH_RESPONSE_BLOCK_LEN, template::SHM_ATTACH_RESPONSE)
            .encode(&mut cur)?;
        cur.write_i64(self.correlation_id)?;
        cur.write_u8(self.code as u8)?;
        cur.write_bytes(&[0u8; 3])?;
        cur.write_u64(self.lease_id)?;
        cur.write_u64(self.lease_expiry_timestamp_ns)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.layout_version)?;
        cur.write_u64(self.epoch)?;
        cur.write_u32(self.header_nslots)?;
        cur.write_u16(self.header_slot_bytes)?;
        cur.write_u8(self.max_dims)?;
        cur.write_u8(0)?;
        cur.write_u32(self.node_id)?;
        cur.write_group_header(self.pools.len() as u16, SHM_ATTACH_RESPONSE_POOL_BLOCK_LEN)?;
        for pool in &self.pools {
            cur.write_u16(pool.pool_id)?;
            cur.write_u16(0)?;
            cur.write_u32(pool.nslots)?;
            cur.write_u32(pool.stride_bytes)?;
            cur.write_var_ascii(&pool.region_uri)?;
        }
        cur.write_var_ascii(&self.error_message)?;
        cur.write_var_ascii(&self.header_region_uri)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::SHM_ATTACH_RESPONSE,
            SHM_ATTACH_RESPONSE_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        let correlation_id = cur.read_i64()?;
        let code = ResponseCode::from_u8(cur.read_u8()?)?;
        cur.skip(3)?;
        let lease_id = cur.read_u64()?;
        let lease_expiry_timestamp_ns = cur.read_u64()?;
        let stream_id = cur.read_u32()?;
        let layout_version = cur.read_u32()?;
        let epoch = cur.read_u64()?;
        let header_nslots = cur.read_u32()?;
        let header_slot_bytes = cur.read_u16()?;
        let max_dims = cur.read_u8()?;
        cur.skip(1)?;
        let node_id = cur.read_u32()?;
        let (count, _block) = cur.read_group_header()?;
        let mut pools = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let pool_id = cur.read_u16()?;
            cur.skip(2)?;
            pools.push(AttachPoolInfo {
                pool_id,
                nslots: cur.read_u32()?,
                stride_bytes: cur.read_u32()?,
                region_uri: cur.read_var_ascii()?,
            });
        }
        Ok(Decoded::Msg(Self {
            correlation_id,
            code,
            lease_id,
            lease_expiry_timestamp_ns,
            stream_id,
            layout_version,
            epoch,
            header_nslots,
            header_slot_bytes,
            max_dims,
            node_id,
            error_message: cur.read_var_ascii()?,
            header_region_uri: cur.read_var_ascii()?,
            pools,
        }))
    }
}

// ---------------------------------------------------------------------
// shmDetachRequest / shmDetachResponse
// ---------------------------------------------------------------------

pub const SHM_DETACH_REQUEST_BLOCK_LEN: u16 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmDetachRequest {
    pub correlation_id: i64,
    pub lease_id: u64,
    pub stream_id: u32,
    pub client_id: u32,
    pub role: Role,
}

impl ShmDetachRequest {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(SHM_DETACH_REQUEST_BLOCK_LEN, template::SHM_DETACH_REQUEST)
            .encode(&mut cur)?;
        cur.write_i64(self.correlation_id)?;
        cur.write_u64(self.lease_id)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.client_id)?;
        cur.write_u8(self.role as u8)?;
        cur.write_bytes(&[0u8; 3])?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::SHM_DETACH_REQUEST,
            SHM_DETACH_REQUEST_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        let correlation_id = cur.read_i64()?;
        let lease_id = cur.read_u64()?;
        let stream_id = cur.read_u32()?;
        let client_id = cur.read_u32()?;
        let role = Role::from_u8(cur.read_u8()?)?;
        cur.skip(3)?;
        Ok(Decoded::Msg(Self {
            correlation_id,
            lease_id,
            stream_id,
            client_id,
            role,
        }))
    }
}

pub const SHM_DETACH_RESPONSE_BLOCK_LEN: u16 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmDetachResponse {
    pub correlation_id: i64,
    pub code: ResponseCode,
    pub error_message: String,
}

impl ShmDetachResponse {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(SHM_DETACH_RESPONSE_BLOCK_LEN, template::SHM_DETACH_RESPONSE)
            .encode(&mut cur)?;
        cur.write_i64(self.correlation_id)?;
        cur.write_u8(self.code as u8)?;
        cur.write_bytes(&[0u8; 3])?;
        cur.write_var_ascii(&self.error_message)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::SHM_DETACH_RESPONSE,
            SHM_DETACH_RESPONSE_BLOCK_LEN,
        )?
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
// shmKeepalive
// ---------------------------------------------------------------------

pub const SHM_KEEPALIVE_BLOCK_LEN: u16 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmKeepalive {
    pub lease_id: u64,
    pub stream_id: u32,
    pub client_id: u32,
    pub role: Role,
    pub timestamp_ns: u64,
}

impl ShmKeepalive {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(SHM_KEEPALIVE_BLOCK_LEN, template::SHM_KEEPALIVE).encode(&mut cur)?;
        cur.write_u64(self.lease_id)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(self.client_id)?;
        cur.write_u8(self.role as u8)?;
        cur.write_bytes(&[0u8; 3])?;
        cur.write_u64(self.timestamp_ns)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(buf, template::SHM_KEEPALIVE, SHM_KEEPALIVE_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        let lease_id = cur.read_u64()?;
        let stream_id = cur.read_u32()?;
        let client_id = cur.read_u32()?;
        let role = Role::from_u8(cur.read_u8()?)?;
        cur.skip(3)?;
        Ok(Decoded::Msg(Self {
            lease_id,
            stream_id,
            client_id,
            role,
            timestamp_ns: cur.read_u64()?,
        }))
    }
}

// ---------------------------------------------------------------------
// shmLeaseRevoked / shmDriverShutdown
// ---------------------------------------------------------------------

pub const SHM_LEASE_REVOKED_BLOCK_LEN: u16 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmLeaseRevoked {
    pub lease_id: u64,
    pub stream_id: u32,
    pub reason: LeaseRevokedReason,
    pub timestamp_ns: u64,
}

impl ShmLeaseRevoked {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(SHM_LEASE_REVOKED_BLOCK_LEN, template::SHM_LEASE_REVOKED)
            .encode(&mut cur)?;
        cur.write_u64(self.lease_id)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u8(self.reason as u8)?;
        cur.write_bytes(&[0u8; 3])?;
        cur.write_u64(self.timestamp_ns)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::SHM_LEASE_REVOKED,
            SHM_LEASE_REVOKED_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        let lease_id = cur.read_u64()?;
        let stream_id = cur.read_u32()?;
        let reason = LeaseRevokedReason::from_u8(cur.read_u8()?)?;
        cur.skip(3)?;
        Ok(Decoded::Msg(Self {
            lease_id,
            stream_id,
            reason,
            timestamp_ns: cur.read_u64()?,
        }))
    }
}

pub const SHM_DRIVER_SHUTDOWN_BLOCK_LEN: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShmDriverShutdown {
    pub timestamp_ns: u64,
}

impl ShmDriverShutdown {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(SHM_DRIVER_SHUTDOWN_BLOCK_LEN, template::SHM_DRIVER_SHUTDOWN)
            .encode(&mut cur)?;
        cur.write_u64(self.timestamp_ns)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::SHM_DRIVER_SHUTDOWN,
            SHM_DRIVER_SHUTDOWN_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        Ok(Decoded::Msg(Self {
            timestamp_ns: cur.read_u64()?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_request_round_trip() {
        for desired in [NULL_U32, 7] {
            let req = ShmAttachRequest {
                correlation_id: 99,
                stream_id: 10_000,
                client_id: 5,
                role: Role::Producer,
                publish_mode: PublishMode::ExistingOrCreate,
                require_hugepages: HugepagesPolicy::Standard,
                expected_layout_version: 1,
                desired_node_id: desired,
            };
            let mut buf = [0u8; 64];
            let n = req.encode(&mut buf).unwrap();
            assert_eq!(
                ShmAttachRequest::decode(&buf[..n]).unwrap().into_msg().unwrap(),
                req
            );
        }
    }

    #[test]
    fn test_attach_response_round_trip() {
        let resp = ShmAttachResponse {
            correlation_id: 99,
            code: ResponseCode::Ok,
            lease_id: 0x1111,
            lease_expiry_timestamp_ns: 5_000_000_000,
            stream_id: 10_000,
            layout_version: 1,
            epoch: 3,
            header_nslots: 4,
            header_slot_bytes: 256,
            max_dims: 8,
            node_id: 2,
            error_message: String::new(),
            header_region_uri: "shm:file?path=/dev/shm/tp_10000_3_hdr".into(),
            pools: vec![AttachPoolInfo {
                pool_id: 1,
                nslots: 4,
                stride_bytes: 64,
                region_uri: "shm:file?path=/dev/shm/tp_10000_3_pool1".into(),
            }],
        };
        let mut buf = [0u8; 512];
        let n = resp.encode(&mut buf).unwrap();
        assert_eq!(
            ShmAttachResponse::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            resp
        );
    }

    #[test]
    fn test_attach_response_rejected_round_trip() {
        let resp = ShmAttachResponse {
            correlation_id: 1,
            code: ResponseCode::Rejected,
            error_message: "layout version mismatch".into(),
            ..ShmAttachResponse::default()
        };
        let mut buf = [0u8; 256];
        let n = resp.encode(&mut buf).unwrap();
        let back = ShmAttachResponse::decode(&buf[..n]).unwrap().into_msg().unwrap();
        assert_eq!(back.code, ResponseCode::Rejected);
        assert_eq!(back.error_message, "layout version mismatch");
    }

    #[test]
    fn test_detach_round_trip() {
        let req = ShmDetachRequest {
            correlation_id: 3,
            lease_id: 0x2222,
            stream_id: 10_000,
            client_id: 5,
            role: Role::Consumer,
        };
        let mut buf = [0u8; 64];
        let n = req.encode(&mut buf).unwrap();
        assert_eq!(
            ShmDetachRequest::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            req
        );

        let resp = ShmDetachResponse {
            correlation_id: 3,
            code: ResponseCode::Ok,
            error_message: String::new(),
        };
        let mut buf = [0u8; 64];
        let n = resp.encode(&mut buf).unwrap();
        assert_eq!(
            ShmDetachResponse::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            resp
        );
    }

    #[test]
    fn test_keepalive_round_trip() {
        let ka = ShmKeepalive {
            lease_id: 0x3333,
            stream_id: 10_000,
            client_id: 5,
            role: Role::Producer,
            timestamp_ns: 777,
        };
        let mut buf = [0u8; 64];
        let n = ka.encode(&mut buf).unwrap();
        assert_eq!(ShmKeepalive::decode(&buf[..n]).unwrap().into_msg().unwrap(), ka);
    }

    #[test]
    fn test_lease_revoked_round_trip() {
        for reason in [
            LeaseRevokedReason::Expired,
            LeaseRevokedReason::Admin,
            LeaseRevokedReason::Shutdown,
        ] {
            let revoked = ShmLeaseRevoked {
                lease_id: 1,
                stream_id: 2,
                reason,
                timestamp_ns: 3,
            };
            let mut buf = [0u8; 64];
            let n = revoked.encode(&mut buf).unwrap();
            assert_eq!(
                ShmLeaseRevoked::decode(&buf[..n]).unwrap().into_msg().unwrap(),
                revoked
            );
        }
    }

    #[test]
    fn test_shutdown_round_trip() {
        let s = ShmDriverShutdown { timestamp_ns: 42 };
        let mut buf = [0u8; 32];
        let n = s.encode(&mut buf).unwrap();
        assert_eq!(
            ShmDriverShutdown::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            s
        );
    }

    #[test]
    fn test_cross_decode_not_mine() {
        let ka = ShmKeepalive {
            lease_id: 1,
            stream_id: 2,
            client_id: 3,
            role: Role::Producer,
            timestamp_ns: 4,
        };
        let mut buf = [0u8; 64];
        let n = ka.encode(&mut buf).unwrap();
        assert_eq!(ShmAttachRequest::decode(&buf[..n]).unwrap(), Decoded::NotMine);
    }
}
