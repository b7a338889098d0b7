// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Crate-wide error taxonomy.
//!
//! Every fallible public operation returns [`crate::Result`], carrying one of
//! the variants below. Transport-level soft outcomes (back-pressure, not
//! connected) are errors here so callers can apply their own retry policy
//! without the library guessing.

use std::fmt;
use std::io;

/// Errors surfaced by tensor-pool operations.
#[derive(Debug)]
pub enum TpError {
    /// Malformed configuration or URI.
    Config(String),

    /// SHM path outside the allowlist or failing the permission policy.
    NotAllowed(String),

    /// SHM path does not resolve to a regular file.
    NotRegular(String),

    /// SHM file smaller than the superblock.
    TooSmall { path: String, len: u64 },

    /// Operating system failure.
    Io(io::Error),

    /// Deadline elapsed before the operation completed.
    Timeout,

    /// Publication flow control pushed back; retry later.
    BackPressured,

    /// Publication has no connected subscriber.
    NotConnected,

    /// Publication or client has been closed.
    Closed,

    /// Publication refused by administrative action.
    AdminAction,

    /// Publication position limit reached.
    MaxPositionExceeded,

    /// Frame or message failed wire-format validation.
    InvalidWire(String),

    /// SHM layout version differs from the supported one.
    LayoutMismatch { expected: u32, actual: u32 },

    /// Request rejected by the driver.
    Rejected(String),

    /// Lease expired or was revoked.
    LeaseExpired,

    /// No payload pool can hold the requested length.
    NoPool { length: usize },

    /// Requested sequence was overwritten or never published.
    GapOrLate,

    /// Slot is still in progress; retry within the read deadline.
    NotReady,
}

impl fmt::Display for TpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::NotAllowed(path) => write!(f, "path not allowed: {path}"),
            Self::NotRegular(path) => write!(f, "not a regular file: {path}"),
            Self::TooSmall { path, len } => {
                write!(f, "region too small: {path} ({len} bytes)")
            }
            Self::Io(e) => write!(f, "io failure: {e}"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::BackPressured => write!(f, "publication back pressured"),
            Self::NotConnected => write!(f, "publication not connected"),
            Self::Closed => write!(f, "closed"),
            Self::AdminAction => write!(f, "publication refused: admin action"),
            Self::MaxPositionExceeded => write!(f, "publication max position exceeded"),
            Self::InvalidWire(msg) => write!(f, "invalid wire data: {msg}"),
            Self::LayoutMismatch { expected, actual } => {
                write!(f, "layout version mismatch: expected {expected}, got {actual}")
            }
            Self::Rejected(msg) => write!(f, "rejected by driver: {msg}"),
            Self::LeaseExpired => write!(f, "lease expired"),
            Self::NoPool { length } => {
                write!(f, "no payload pool can hold {length} bytes")
            }
            Self::GapOrLate => write!(f, "sequence overwritten or not published"),
            Self::NotReady => write!(f, "slot not ready"),
        }
    }
}

impl std::error::Error for TpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TpError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl TpError {
    /// True for the outcomes a caller is expected to retry on its own
    /// cadence rather than treat as a failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackPressured | Self::NotConnected | Self::NotReady | Self::MaxPositionExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let e = TpError::NoPool { length: 4096 };
        assert!(e.to_string().contains("4096"));

        let e = TpError::LayoutMismatch { expected: 1, actual: 2 };
        let s = e.to_string();
        assert!(s.contains('1') && s.contains('2'));
    }

    #[test]
    fn test_transient_classification() {
        assert!(TpError::BackPressured.is_transient());
        assert!(TpError::NotReady.is_transient());
        assert!(!TpError::GapOrLate.is_transient());
        assert!(!TpError::Closed.is_transient());
    }

    #[test]
    fn test_io_source_preserved() {
        use std::error::Error;
        let e = TpError::from(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(e.source().is_some());
    }
}
