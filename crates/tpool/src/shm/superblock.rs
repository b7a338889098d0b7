// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Region superblock: the 64-byte block at offset 0 of every SHM file.
//!
//! # Byte Layout (little-endian)
//!
//! ```text
//! Offset  Size  Field
//! 0       8     magic ("TPOLSHM1")
//! 8       4     layout_version
//! 12      8     epoch
//! 20      4     stream_id
//! 24      2     region_type (i16)
//! 26      2     pool_id
//! 28      4     nslots (power of two)
//! 32      4     slot_bytes (256 for header rings)
//! 36      4     stride_bytes (>0 for pools)
//! 40      8     pid
//! 48      8     start_timestamp_ns
//! 56      8     activity_timestamp_ns
//! ```
//!
//! The activity timestamp is refreshed by the producer once per announce
//! period and doubles as the liveness signal for inspection tools.

use crate::error::TpError;
use crate::types::{RegionType, CACHE_LINE_BYTES, HEADER_SLOT_BYTES, MAGIC, NULL_U16, NULL_U32, NULL_U64, SUPERBLOCK_SIZE_BYTES};
use crate::Result;

/// Decoded superblock contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u64,
    pub layout_version: u32,
    pub epoch: u64,
    pub stream_id: u32,
    pub region_type: i16,
    pub pool_id: u16,
    pub nslots: u32,
    pub slot_bytes: u32,
    pub stride_bytes: u32,
    pub pid: u64,
    pub start_timestamp_ns: u64,
    pub activity_timestamp_ns: u64,
}

/// Expected values for superblock validation. Null-sentinel fields are not
/// enforced; `region_type == 0` likewise skips the type check.
#[derive(Debug, Clone, Copy)]
pub struct ExpectedSuperblock {
    pub stream_id: u32,
    pub layout_version: u32,
    pub epoch: u64,
    pub region_type: i16,
    pub pool_id: u16,
    pub nslots: u32,
    pub slot_bytes: u32,
    pub stride_bytes: u32,
}

impl Default for ExpectedSuperblock {
    fn default() -> Self {
        Self {
            stream_id: NULL_U32,
            layout_version: NULL_U32,
            epoch: NULL_U64,
            region_type: 0,
            pool_id: NULL_U16,
            nslots: NULL_U32,
            slot_bytes: NULL_U32,
            stride_bytes: NULL_U32,
        }
    }
}

impl Superblock {
    /// Build a fresh superblock for a region being created now.
    #[must_use]
    pub fn new(
        stream_id: u32,
        epoch: u64,
        layout_version: u32,
        region_type: RegionType,
        pool_id: u16,
        nslots: u32,
        slot_bytes: u32,
        stride_bytes: u32,
        now_ns: u64,
    ) -> Self {
        Self {
            magic: MAGIC,
            layout_version,
            epoch,
            stream_id,
            region_type: region_type as i16,
            pool_id,
            nslots,
            slot_bytes,
            stride_bytes,
            pid: std::process::id() as u64,
            start_timestamp_ns: now_ns,
            activity_timestamp_ns: now_ns,
        }
    }

    /// Decode from the first 64 bytes of a mapped region.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE_BYTES {
            return Err(TpError::InvalidWire(format!(
                "superblock needs {SUPERBLOCK_SIZE_BYTES} bytes, got {}",
                buf.len()
            )));
        }

        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());

        Ok(Self {
            magic: u64_at(0),
            layout_version: u32_at(8),
            epoch: u64_at(12),
            stream_id: u32_at(20),
            region_type: i16::from_le_bytes(buf[24..26].try_into().unwrap()),
            pool_id: u16::from_le_bytes(buf[26..28].try_into().unwrap()),
            nslots: u32_at(28),
            slot_bytes: u32_at(32),
            stride_bytes: u32_at(36),
            pid: u64_at(40),
            start_timestamp_ns: u64_at(48),
            activity_timestamp_ns: u64_at(56),
        })
    }

    /// Encode into the first 64 bytes of a buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < SUPERBLOCK_SIZE_BYTES {
            return Err(TpError::InvalidWire("superblock buffer too small".into()));
        }

        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..12].copy_from_slice(&self.layout_version.to_le_bytes());
        buf[12..20].copy_from_slice(&self.epoch.to_le_bytes());
        buf[20..24].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[24..26].copy_from_slice(&self.region_type.to_le_bytes());
        buf[26..28].copy_from_slice(&self.pool_id.to_le_bytes());
        buf[28..32].copy_from_slice(&self.nslots.to_le_bytes());
        buf[32..36].copy_from_slice(&self.slot_bytes.to_le_bytes());
        buf[36..40].copy_from_slice(&self.stride_bytes.to_le_bytes());
        buf[40..48].copy_from_slice(&self.pid.to_le_bytes());
        buf[48..56].copy_from_slice(&self.start_timestamp_ns.to_le_bytes());
        buf[56..64].copy_from_slice(&self.activity_timestamp_ns.to_le_bytes());
        Ok(())
    }

    /// Validate the magic and any enforced `expected` fields, plus the
    /// per-region-type structural invariants.
    pub fn validate(&self, expected: Option<&ExpectedSuperblock>) -> Result<()> {
        if self.magic != MAGIC {
            return Err(TpError::InvalidWire(format!(
                "superblock magic mismatch: {:#018x}",
                self.magic
            )));
        }

        if let Some(exp) = expected {
            if exp.layout_version != NULL_U32 && self.layout_version != exp.layout_version {
                return Err(TpError::LayoutMismatch {
                    expected: exp.layout_version,
                    actual: self.layout_version,
                });
            }
            if exp.epoch != NULL_U64 && self.epoch != exp.epoch {
                return Err(TpError::InvalidWire(format!(
                    "epoch mismatch: expected {}, got {}",
                    exp.epoch, self.epoch
                )));
            }
            if exp.stream_id != NULL_U32 && self.stream_id != exp.stream_id {
                return Err(TpError::InvalidWire(format!(
                    "stream id mismatch: expected {}, got {}",
                    exp.stream_id, self.stream_id
                )));
            }
            if exp.region_type != 0 && self.region_type != exp.region_type {
                return Err(TpError::InvalidWire(format!(
                    "region type mismatch: expected {}, got {}",
                    exp.region_type, self.region_type
                )));
            }
            if exp.pool_id != NULL_U16 && self.pool_id != exp.pool_id {
                return Err(TpError::InvalidWire(format!(
                    "pool id mismatch: expected {}, got {}",
                    exp.pool_id, self.pool_id
                )));
            }
            if exp.nslots != NULL_U32 && self.nslots != exp.nslots {
                return Err(TpError::InvalidWire(format!(
                    "nslots mismatch: expected {}, got {}",
                    exp.nslots, self.nslots
                )));
            }
            if exp.slot_bytes != NULL_U32 && self.slot_bytes != exp.slot_bytes {
                return Err(TpError::InvalidWire(format!(
                    "slot bytes mismatch: expected {}, got {}",
                    exp.slot_bytes, self.slot_bytes
                )));
            }
            if exp.stride_bytes != NULL_U32 && self.stride_bytes != exp.stride_bytes {
                return Err(TpError::InvalidWire(format!(
                    "stride bytes mismatch: expected {}, got {}",
                    exp.stride_bytes, self.stride_bytes
                )));
            }
        }

        if self.nslots == 0 || !self.nslots.is_power_of_two() {
            return Err(TpError::InvalidWire(format!(
                "nslots {} must be a nonzero power of two",
                self.nslots
            )));
        }

        match RegionType::from_i16(self.region_type)? {
            RegionType::PayloadPool => {
                if self.stride_bytes == 0 {
                    return Err(TpError::InvalidWire("pool stride must be > 0".into()));
                }
                validate_stride_alignment(self.stride_bytes)?;
            }
            RegionType::HeaderRing => {
                if self.slot_bytes != HEADER_SLOT_BYTES as u32 {
                    return Err(TpError::InvalidWire(format!(
                        "header slot bytes must be {HEADER_SLOT_BYTES}, got {}",
                        self.slot_bytes
                    )));
                }
            }
        }

        Ok(())
    }

    /// Total file size implied by this superblock.
    #[must_use]
    pub fn region_len(&self) -> usize {
        let per_slot = match RegionType::from_i16(self.region_type) {
            Ok(RegionType::HeaderRing) => self.slot_bytes as usize,
            _ => self.stride_bytes as usize,
        };
        SUPERBLOCK_SIZE_BYTES + self.nslots as usize * per_slot
    }
}

/// Pool strides must land payload slots on cache-line boundaries so one
/// consumer's read never false-shares with the next slot's write.
pub fn validate_stride_alignment(stride_bytes: u32) -> Result<()> {
    if stride_bytes % CACHE_LINE_BYTES != 0 {
        return Err(TpError::Config(format!(
            "pool stride {stride_bytes} not aligned to {CACHE_LINE_BYTES}"
        )));
    }
    Ok(())
}
