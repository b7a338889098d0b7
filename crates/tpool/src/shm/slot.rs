// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Header-slot layout.
//!
//! Every header-ring slot is exactly 256 bytes:
//!
//! ```text
//! Offset  Size  Field
//! 0       8     seqlock word (see shm::seqlock)
//! 8       4     values_len_bytes
//! 12      4     payload_slot
//! 16      2     pool_id
//! 18      4     payload_offset
//! 22      8     timestamp_ns
//! 30      4     meta_version
//! 34      26    pad (always zero)
//! 60      4     tensor header length prefix
//! 64      148   framed tensor header
//! 212     44    unused
//! ```
//!
//! Slot `i` of the ring starts at `64 + i * 256`; the matching payload in
//! pool `p` starts at `64 + i * stride_p`. Both regions index by the same
//! `seq % nslots`.

use crate::error::TpError;
use crate::types::{TensorHeader, HEADER_SLOT_BYTES, SUPERBLOCK_SIZE_BYTES};
use crate::wire::tensor;
use crate::Result;

/// Offset of the fixed slot header behind the seqlock word.
pub const SLOT_FIELDS_OFFSET: usize = 8;

/// Offset of the zeroed pad region.
pub const SLOT_PAD_OFFSET: usize = 34;

/// Length of the zeroed pad region.
pub const SLOT_PAD_LEN: usize = 26;

/// Offset of the tensor-header length prefix.
pub const SLOT_TENSOR_OFFSET: usize = 60;

/// Byte offset of header slot `index` within its region.
#[inline]
#[must_use]
pub fn slot_offset(index: u32) -> usize {
    SUPERBLOCK_SIZE_BYTES + index as usize * HEADER_SLOT_BYTES
}

/// Byte offset of payload slot `index` within a pool of `stride_bytes`.
#[inline]
#[must_use]
pub fn payload_offset(index: u32, stride_bytes: u32) -> usize {
    SUPERBLOCK_SIZE_BYTES + index as usize * stride_bytes as usize
}

/// Fixed per-frame metadata inside a header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotHeader {
    pub values_len_bytes: u32,
    pub payload_slot: u32,
    pub pool_id: u16,
    pub payload_offset: u32,
    pub timestamp_ns: u64,
    pub meta_version: u32,
}

impl SlotHeader {
    /// Encode into a 256-byte slot buffer, zeroing the pad region.
    /// The seqlock word at offset 0 is never touched here.
    pub fn encode(&self, slot: &mut [u8]) -> Result<()> {
        if slot.len() < HEADER_SLOT_BYTES {
            return Err(TpError::InvalidWire("slot buffer too small".into()));
        }

        slot[8..12].copy_from_slice(&self.values_len_bytes.to_le_bytes());
        slot[12..16].copy_from_slice(&self.payload_slot.to_le_bytes());
        slot[16..18].copy_from_slice(&self.pool_id.to_le_bytes());
        slot[18..22].copy_from_slice(&self.payload_offset.to_le_bytes());
        slot[22..30].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        slot[30..34].copy_from_slice(&self.meta_version.to_le_bytes());
        slot[SLOT_PAD_OFFSET..SLOT_PAD_OFFSET + SLOT_PAD_LEN].fill(0);
        Ok(())
    }

    /// Decode from a 256-byte slot buffer.
    pub fn decode(slot: &[u8]) -> Result<Self> {
        if slot.len() < HEADER_SLOT_BYTES {
            return Err(TpError::InvalidWire("slot buffer too small".into()));
        }

        Ok(Self {
            values_len_bytes: u32::from_le_bytes(slot[8..12].try_into().unwrap()),
            payload_slot: u32::from_le_bytes(slot[12..16].try_into().unwrap()),
            pool_id: u16::from_le_bytes(slot[16..18].try_into().unwrap()),
            payload_offset: u32::from_le_bytes(slot[18..22].try_into().unwrap()),
            timestamp_ns: u64::from_le_bytes(slot[22..30].try_into().unwrap()),
            meta_version: u32::from_le_bytes(slot[30..34].try_into().unwrap()),
        })
    }
}

/// Encode the framed tensor header into its slot area.
pub fn write_tensor(slot: &mut [u8], tensor_header: &TensorHeader) -> Result<()> {
    if slot.len() < HEADER_SLOT_BYTES {
        return Err(TpError::InvalidWire("slot buffer too small".into()));
    }
    tensor::encode_length_prefixed(tensor_header, &mut slot[SLOT_TENSOR_OFFSET..HEADER_SLOT_BYTES])?;
    Ok(())
}

/// Decode the framed tensor header from its slot area.
pub fn read_tensor(slot: &[u8]) -> Result<TensorHeader> {
    if slot.len() < HEADER_SLOT_BYTES {
        return Err(TpError::InvalidWire("slot buffer too small".into()));
    }
    tensor::decode_length_prefixed(&slot[SLOT_TENSOR_OFFSET..HEADER_SLOT_BYTES])
}
