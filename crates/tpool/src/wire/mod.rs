// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Wire codecs for all fabric messages.
//!
//! # Framing
//!
//! Every message starts with an 8-byte header
//! `(block_length u16, template_id u16, schema_id u16, version u16)`
//! followed by the fixed block, then any repeating groups
//! (`count u16, block_length u16` headers), then trailing variable ASCII
//! fields with u32 length prefixes. Everything is little-endian.
//!
//! # Decoder Rules
//!
//! - A foreign `schema_id` is the soft [`Decoded::NotMine`] outcome so
//!   several codecs can share one subscription.
//! - `version` newer than ours is a hard reject.
//! - `block_length` must equal the decoder's fixed block size unless a
//!   message explicitly relaxes it.
//! - Nullable integers use the type's max value as the null sentinel.

pub mod control;
pub mod cursor;
pub mod discovery;
pub mod driver;
pub mod merge;
pub mod tensor;

pub use cursor::{Cursor, CursorMut};

use crate::error::TpError;
use crate::Result;

/// Schema identity for every tensor-pool message.
pub const SCHEMA_ID: u16 = 47;
pub const SCHEMA_VERSION: u16 = 1;

/// Encoded length of the message header.
pub const MESSAGE_HEADER_LEN: usize = 8;

/// Template ids. Gaps are reserved.
pub mod template {
    pub const CONSUMER_HELLO: u16 = 1;
    pub const CONSUMER_CONFIG: u16 = 2;
    pub const DATA_SOURCE_ANNOUNCE: u16 = 3;
    pub const DATA_SOURCE_META: u16 = 4;
    pub const META_BLOB_ANNOUNCE: u16 = 5;
    pub const META_BLOB_CHUNK: u16 = 6;
    pub const META_BLOB_COMPLETE: u16 = 7;
    pub const CONTROL_RESPONSE: u16 = 8;
    pub const SHM_POOL_ANNOUNCE: u16 = 9;
    pub const FRAME_DESCRIPTOR: u16 = 10;
    pub const FRAME_PROGRESS: u16 = 11;
    pub const SLOT_HEADER: u16 = 12;
    pub const SHM_ATTACH_REQUEST: u16 = 13;
    pub const SHM_ATTACH_RESPONSE: u16 = 14;
    pub const SHM_DETACH_REQUEST: u16 = 15;
    pub const SHM_DETACH_RESPONSE: u16 = 16;
    pub const SHM_KEEPALIVE: u16 = 17;
    pub const SHM_LEASE_REVOKED: u16 = 18;
    pub const SHM_DRIVER_SHUTDOWN: u16 = 19;
    pub const DISCOVERY_REQUEST: u16 = 20;
    pub const DISCOVERY_RESPONSE: u16 = 21;
    pub const SEQUENCE_MERGE_MAP_ANNOUNCE: u16 = 22;
    pub const SEQUENCE_MERGE_MAP_REQUEST: u16 = 23;
    pub const TIMESTAMP_MERGE_MAP_ANNOUNCE: u16 = 24;
    pub const TENSOR_HEADER: u16 = 25;
    pub const TIMESTAMP_MERGE_MAP_REQUEST: u16 = 26;
    pub const PRODUCER_QOS: u16 = 27;
    pub const CONSUMER_QOS: u16 = 28;
    pub const TRACE_LINK_SET: u16 = 29;
    pub const SHM_REGION_SUPERBLOCK: u16 = 30;
}

/// Outcome of a decode attempt against a shared subscription.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<T> {
    /// The message belongs to this codec and decoded cleanly.
    Msg(T),
    /// Foreign schema id or template id; not an error.
    NotMine,
}

impl<T> Decoded<T> {
    /// Unwrap for contexts that already dispatched on the template id.
    pub fn into_msg(self) -> Result<T> {
        match self {
            Self::Msg(m) => Ok(m),
            Self::NotMine => Err(TpError::InvalidWire("unexpected foreign message".into())),
        }
    }
}

/// The leading 8 bytes of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

impl MessageHeader {
    #[must_use]
    pub fn new(block_length: u16, template_id: u16) -> Self {
        Self {
            block_length,
            template_id,
            schema_id: SCHEMA_ID,
            version: SCHEMA_VERSION,
        }
    }

    pub fn encode(&self, cur: &mut CursorMut<'_>) -> Result<()> {
        cur.write_u16(self.block_length)?;
        cur.write_u16(self.template_id)?;
        cur.write_u16(self.schema_id)?;
        cur.write_u16(self.version)
    }

    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            block_length: cur.read_u16()?,
            template_id: cur.read_u16()?,
            schema_id: cur.read_u16()?,
            version: cur.read_u16()?,
        })
    }

    /// Gate a decode: `Ok(false)` means "not mine", `Ok(true)` means the
    /// header matches `template_id` with `expected_block` exactly.
    pub fn gate(&self, template_id: u16, expected_block: u16) -> Result<bool> {
        self.gate_relaxed(template_id, expected_block, false)
    }

    /// Gate with optional relaxation of the block-length equality (used by
    /// messages documented as tolerating trailing block growth).
    pub fn gate_relaxed(
        &self,
        template_id: u16,
        expected_block: u16,
        allow_longer_block: bool,
    ) -> Result<bool> {
        if self.schema_id != SCHEMA_ID || self.template_id != template_id {
            return Ok(false);
        }
        if self.version > SCHEMA_VERSION {
            return Err(TpError::InvalidWire(format!(
                "message version {} newer than supported {SCHEMA_VERSION}",
                self.version
            )));
        }
        let block_ok = if allow_longer_block {
            self.block_length >= expected_block
        } else {
            self.block_length == expected_block
        };
        if !block_ok {
            return Err(TpError::InvalidWire(format!(
                "block length {} does not match expected {expected_block}",
                self.block_length
            )));
        }
        Ok(true)
    }
}

/// Peek the template id of a framed buffer without consuming it.
pub fn peek_template_id(buf: &[u8]) -> Result<u16> {
    let mut cur = Cursor::new(buf);
    let header = MessageHeader::decode(&mut cur)?;
    Ok(header.template_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut buf = [0u8; MESSAGE_HEADER_LEN];
        let header = MessageHeader::new(32, template::FRAME_DESCRIPTOR);
        header.encode(&mut CursorMut::new(&mut buf)).unwrap();

        let back = MessageHeader::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back, header);
        assert_eq!(back.schema_id, SCHEMA_ID);
    }

    #[test]
    fn test_gate_foreign_schema_is_not_mine() {
        let header = MessageHeader {
            block_length: 32,
            template_id: template::FRAME_DESCRIPTOR,
            schema_id: 999,
            version: 1,
        };
        assert_eq!(header.gate(template::FRAME_DESCRIPTOR, 32).unwrap(), false);
    }

    #[test]
    fn test_gate_newer_version_rejected() {
        let header = MessageHeader {
            block_length: 32,
            template_id: 10,
            schema_id: SCHEMA_ID,
            version: SCHEMA_VERSION + 1,
        };
        assert!(header.gate(10, 32).is_err());
    }

    #[test]
    fn test_gate_block_length_mismatch_rejected() {
        let header = MessageHeader::new(30, 10);
        assert!(header.gate(10, 32).is_err());
        // Relaxed gating accepts a longer block but never a shorter one.
        let header = MessageHeader::new(40, 10);
        assert!(header.gate_relaxed(10, 32, true).unwrap());
        let header = MessageHeader::new(30, 10);
        assert!(header.gate_relaxed(10, 32, true).is_err());
    }
}
