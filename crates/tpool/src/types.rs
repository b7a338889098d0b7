// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Core constants, enums, and the tensor header.
//!
//! Single source of truth for layout constants. **Never hardcode these
//! elsewhere**: superblock validation, slot encoding, and the driver all
//! read from here.

use crate::error::TpError;
use crate::Result;

/// Superblock size at the head of every SHM region.
pub const SUPERBLOCK_SIZE_BYTES: usize = 64;

/// Fixed size of one header-ring slot.
pub const HEADER_SLOT_BYTES: usize = 256;

/// Maximum tensor rank.
pub const MAX_DIMS: usize = 8;

/// The only SHM layout version this build understands.
pub const LAYOUT_VERSION: u32 = 1;

/// Superblock magic: ASCII `TPOLSHM1` read as a little-endian u64.
pub const MAGIC: u64 = u64::from_le_bytes(*b"TPOLSHM1");

/// Null sentinels for nullable wire integers (type max value).
pub const NULL_U8: u8 = u8::MAX;
pub const NULL_U16: u16 = u16::MAX;
pub const NULL_U32: u32 = u32::MAX;
pub const NULL_U64: u64 = u64::MAX;

/// Longest accepted channel or region URI.
pub const URI_MAX_LENGTH: usize = 4096;

/// Progress policy defaults used when no consumer sets a field.
pub const PROGRESS_INTERVAL_DEFAULT_US: u32 = 250;
pub const PROGRESS_BYTES_DELTA_DEFAULT: u32 = 64 * 1024;

/// Default announce cadence and derived freshness windows.
pub const ANNOUNCE_PERIOD_DEFAULT_NS: u64 = 1_000_000_000;
/// Directory entries expire after this many announce periods of silence.
pub const ANNOUNCE_FRESHNESS_MULTIPLIER: u64 = 3;
/// Consumer registry entries go stale after this many announce periods.
pub const CONSUMER_STALE_MULTIPLIER: u64 = 5;

/// Pool strides must be aligned to the platform cache line.
pub const CACHE_LINE_BYTES: u32 = 64;

/// Default stream-id allocation when only a base channel is configured.
pub const STREAM_ID_CONTROL: u32 = 1000;
pub const STREAM_ID_ANNOUNCE: u32 = 1001;
pub const STREAM_ID_DESCRIPTOR: u32 = 1100;
pub const STREAM_ID_QOS: u32 = 1200;
pub const STREAM_ID_METADATA: u32 = 1300;

/// Driver control plane: requests from clients, events back to them.
pub const STREAM_ID_DRIVER_REQUEST: u32 = 900;
pub const STREAM_ID_DRIVER_EVENTS: u32 = 901;

/// Directory service request/response streams.
pub const STREAM_ID_DISCOVERY_REQUEST: u32 = 2000;
pub const STREAM_ID_DISCOVERY_RESPONSE: u32 = 2001;

/// Element type of a tensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Dtype {
    Unknown = 0,
    Uint8 = 1,
    Int8 = 2,
    Uint16 = 3,
    Int16 = 4,
    Uint32 = 5,
    Int32 = 6,
    Uint64 = 7,
    Int64 = 8,
    Float32 = 9,
    Float64 = 10,
    Bool = 11,
    Bytes = 12,
    Bit = 13,
}

impl Dtype {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Unknown,
            1 => Self::Uint8,
            2 => Self::Int8,
            3 => Self::Uint16,
            4 => Self::Int16,
            5 => Self::Uint32,
            6 => Self::Int32,
            7 => Self::Uint64,
            8 => Self::Int64,
            9 => Self::Float32,
            10 => Self::Float64,
            11 => Self::Bool,
            12 => Self::Bytes,
            13 => Self::Bit,
            other => return Err(TpError::InvalidWire(format!("unknown dtype {other}"))),
        })
    }
}

/// Storage order of the major axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MajorOrder {
    Unknown = 0,
    Row = 1,
    Column = 2,
}

impl MajorOrder {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Unknown,
            1 => Self::Row,
            2 => Self::Column,
            other => return Err(TpError::InvalidWire(format!("unknown major order {other}"))),
        })
    }
}

/// Unit in which partial-frame progress is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProgressUnit {
    None = 0,
    Rows = 1,
    Columns = 2,
}

impl ProgressUnit {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::None,
            1 => Self::Rows,
            2 => Self::Columns,
            other => return Err(TpError::InvalidWire(format!("unknown progress unit {other}"))),
        })
    }
}

/// Consumer delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Stream = 1,
    RateLimited = 2,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Stream
    }
}

impl Mode {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::Stream,
            2 => Self::RateLimited,
            other => return Err(TpError::InvalidWire(format!("unknown mode {other}"))),
        })
    }
}

/// State carried by a frame-progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProgressState {
    Unknown = 0,
    Started = 1,
    Progress = 2,
    Complete = 3,
}

impl ProgressState {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Unknown,
            1 => Self::Started,
            2 => Self::Progress,
            3 => Self::Complete,
            other => return Err(TpError::InvalidWire(format!("unknown progress state {other}"))),
        })
    }
}

/// Role requested in a driver attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Producer = 1,
    Consumer = 2,
}

impl Role {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::Producer,
            2 => Self::Consumer,
            other => return Err(TpError::InvalidWire(format!("unknown role {other}"))),
        })
    }
}

/// Whether an attach may create the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PublishMode {
    RequireExisting = 1,
    ExistingOrCreate = 2,
}

impl PublishMode {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::RequireExisting,
            2 => Self::ExistingOrCreate,
            other => return Err(TpError::InvalidWire(format!("unknown publish mode {other}"))),
        })
    }
}

/// Hugepage requirement expressed in an attach request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HugepagesPolicy {
    Unspecified = 0,
    Standard = 1,
    Hugepages = 2,
}

impl HugepagesPolicy {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Unspecified,
            1 => Self::Standard,
            2 => Self::Hugepages,
            other => return Err(TpError::InvalidWire(format!("unknown hugepages policy {other}"))),
        })
    }
}

/// Driver response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    Unsupported = 1,
    InvalidParams = 2,
    Rejected = 3,
    InternalError = 4,
}

impl ResponseCode {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Ok,
            1 => Self::Unsupported,
            2 => Self::InvalidParams,
            3 => Self::Rejected,
            4 => Self::InternalError,
            other => return Err(TpError::InvalidWire(format!("unknown response code {other}"))),
        })
    }
}

/// SHM region flavor recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum RegionType {
    HeaderRing = 1,
    PayloadPool = 2,
}

impl RegionType {
    pub fn from_i16(v: i16) -> Result<Self> {
        Ok(match v {
            1 => Self::HeaderRing,
            2 => Self::PayloadPool,
            other => return Err(TpError::InvalidWire(format!("unknown region type {other}"))),
        })
    }
}

/// Clock domain an announce timestamp belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClockDomain {
    Monotonic = 0,
    RealtimeSynced = 1,
}

impl ClockDomain {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Monotonic,
            1 => Self::RealtimeSynced,
            other => return Err(TpError::InvalidWire(format!("unknown clock domain {other}"))),
        })
    }
}

/// Why a lease stopped being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LeaseRevokedReason {
    Expired = 1,
    Admin = 2,
    Shutdown = 3,
}

impl LeaseRevokedReason {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::Expired,
            2 => Self::Admin,
            3 => Self::Shutdown,
            other => return Err(TpError::InvalidWire(format!("unknown revoke reason {other}"))),
        })
    }
}

/// Sequence merge-map rule flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MergeRuleType {
    Offset = 0,
    Window = 1,
}

impl MergeRuleType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Offset,
            1 => Self::Window,
            other => return Err(TpError::InvalidWire(format!("unknown merge rule {other}"))),
        })
    }
}

/// Timestamp merge-map rule flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MergeTimeRuleType {
    OffsetNs = 0,
    WindowNs = 1,
}

impl MergeTimeRuleType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::OffsetNs,
            1 => Self::WindowNs,
            other => return Err(TpError::InvalidWire(format!("unknown time merge rule {other}"))),
        })
    }
}

/// Which clock a timestamp merge map aligns on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimestampSource {
    FrameDescriptor = 1,
    SlotHeader = 2,
}

impl TimestampSource {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::FrameDescriptor,
            2 => Self::SlotHeader,
            other => return Err(TpError::InvalidWire(format!("unknown timestamp source {other}"))),
        })
    }
}

/// Shape and element-layout metadata for one frame.
///
/// Lives inside every committed header slot and travels inline with
/// frame descriptors. Unused `dims`/`strides` tail entries are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorHeader {
    pub dtype: Dtype,
    pub major_order: MajorOrder,
    pub ndims: u8,
    pub progress_unit: ProgressUnit,
    pub progress_stride_bytes: u32,
    pub dims: [u64; MAX_DIMS],
    pub strides: [u64; MAX_DIMS],
}

impl Default for TensorHeader {
    fn default() -> Self {
        Self {
            dtype: Dtype::Unknown,
            major_order: MajorOrder::Unknown,
            ndims: 0,
            progress_unit: ProgressUnit::None,
            progress_stride_bytes: 0,
            dims: [0; MAX_DIMS],
            strides: [0; MAX_DIMS],
        }
    }
}

impl TensorHeader {
    /// Zero the dim/stride entries beyond `ndims`.
    pub fn normalize(&mut self) {
        for i in (self.ndims as usize).min(MAX_DIMS)..MAX_DIMS {
            self.dims[i] = 0;
            self.strides[i] = 0;
        }
    }

    /// Reject headers violating the layout invariants.
    ///
    /// Idempotent with [`Self::normalize`]: normalizing a valid header and
    /// re-validating never fails.
    pub fn validate(&self) -> Result<()> {
        if self.ndims as usize > MAX_DIMS {
            return Err(TpError::InvalidWire(format!(
                "ndims {} exceeds max {MAX_DIMS}",
                self.ndims
            )));
        }

        for i in (self.ndims as usize)..MAX_DIMS {
            if self.dims[i] != 0 || self.strides[i] != 0 {
                return Err(TpError::InvalidWire(format!(
                    "dim/stride {i} set beyond ndims {}",
                    self.ndims
                )));
            }
        }

        Ok(())
    }
}
