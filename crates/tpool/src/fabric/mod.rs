// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Messaging fabric adapter.
//!
//! The transport contract this crate depends on: ordered unicast streams
//! of length-delimited fragments, per-publication FIFO, connection status,
//! and back-pressure signaling. [`mem`] provides the in-process
//! implementation used by daemons, tests, and examples; descriptors,
//! control, QoS, metadata, and discovery traffic all ride it. Tensor
//! payloads never do.
//!
//! A stream is addressed by `(channel, stream_id)`. Publications fragment
//! messages larger than the fabric MTU; subscriptions deliver raw
//! fragments which a [`FragmentAssembler`] reassembles per subscription.

pub mod assembler;
pub mod idle;
pub mod mem;

pub use assembler::{Fragment, FragmentAssembler, FRAGMENT_BEGIN, FRAGMENT_END, FRAGMENT_UNFRAGMENTED};
pub use idle::IdleStrategy;
pub use mem::{MemFabric, Publication, Subscription};

use crate::error::TpError;
use crate::Result;

/// Maximum fragment payload carried by the fabric in one piece.
pub const FABRIC_MTU: usize = 1408;

/// Result of offering a message to a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Accepted; carries the new stream position.
    Ok(u64),
    /// Flow control pushed back; retry later.
    BackPressured,
    /// No subscriber is connected.
    NotConnected,
    /// Refused by administrative action.
    AdminAction,
    /// Publication closed.
    Closed,
    /// Stream position limit reached.
    MaxPositionExceeded,
}

impl OfferOutcome {
    /// Collapse into the crate error taxonomy.
    pub fn into_result(self) -> Result<u64> {
        match self {
            Self::Ok(position) => Ok(position),
            Self::BackPressured => Err(TpError::BackPressured),
            Self::NotConnected => Err(TpError::NotConnected),
            Self::AdminAction => Err(TpError::AdminAction),
            Self::Closed => Err(TpError::Closed),
            Self::MaxPositionExceeded => Err(TpError::MaxPositionExceeded),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// Address of one fabric stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamAddr {
    pub channel: String,
    pub stream_id: u32,
}

impl StreamAddr {
    #[must_use]
    pub fn new(channel: impl Into<String>, stream_id: u32) -> Self {
        Self {
            channel: channel.into(),
            stream_id,
        }
    }
}

impl std::fmt::Display for StreamAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.channel, self.stream_id)
    }
}
