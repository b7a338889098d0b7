// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Fragment reassembly.
//!
//! The fabric delivers messages as one or more flagged fragments:
//! `BEGIN|END` for an unfragmented message, otherwise a `BEGIN` fragment,
//! zero or more middle fragments (no flags), and an `END` fragment.
//! One assembler per subscription; never shared across threads.

use crate::error::TpError;
use crate::Result;

pub const FRAGMENT_BEGIN: u8 = 0b01;
pub const FRAGMENT_END: u8 = 0b10;
pub const FRAGMENT_UNFRAGMENTED: u8 = FRAGMENT_BEGIN | FRAGMENT_END;

/// One fabric fragment as delivered by a subscription poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub flags: u8,
    pub bytes: Vec<u8>,
}

impl Fragment {
    #[must_use]
    pub fn unfragmented(bytes: Vec<u8>) -> Self {
        Self {
            flags: FRAGMENT_UNFRAGMENTED,
            bytes,
        }
    }
}

/// Stitches fragment chains back into whole messages.
///
/// A `BEGIN` arriving mid-chain discards the partial message and starts
/// over (the fabric is ordered, so that only happens after a publisher
/// restart). Stray middle/`END` fragments without a chain are dropped
/// with an error so pollers can count them.
#[derive(Default)]
pub struct FragmentAssembler {
    partial: Option<Vec<u8>>,
    /// Reassembly ceiling; a chain growing past this is abandoned.
    max_message_len: usize,
}

impl FragmentAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            partial: None,
            max_message_len: 16 * 1024 * 1024,
        }
    }

    /// Feed one fragment; returns a completed message when the chain ends.
    pub fn push(&mut self, fragment: Fragment) -> Result<Option<Vec<u8>>> {
        let begin = fragment.flags & FRAGMENT_BEGIN != 0;
        let end = fragment.flags & FRAGMENT_END != 0;

        if begin && end {
            self.partial = None;
            return Ok(Some(fragment.bytes));
        }

        if begin {
            self.partial = Some(fragment.bytes);
            return Ok(None);
        }

        let Some(partial) = self.partial.as_mut() else {
            return Err(TpError::InvalidWire(
                "fragment continuation without a begin".into(),
            ));
        };

        if partial.len() + fragment.bytes.len() > self.max_message_len {
            self.partial = None;
            return Err(TpError::InvalidWire("fragment chain too large".into()));
        }

        partial.extend_from_slice(&fragment.bytes);
        if end {
            return Ok(self.partial.take());
        }
        Ok(None)
    }

    /// Drop any partial chain (subscription close / reattach).
    pub fn reset(&mut self) {
        self.partial = None;
    }
}

/// Split a message into fabric fragments of at most `mtu` payload bytes.
#[must_use]
pub fn fragment_message(message: &[u8], mtu: usize) -> Vec<Fragment> {
    if message.len() <= mtu {
        return vec![Fragment::unfragmented(message.to_vec())];
    }

    let mut fragments = Vec::with_capacity(message.len() / mtu + 1);
    let mut chunks = message.chunks(mtu).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let mut flags = 0u8;
        if first {
            flags |= FRAGMENT_BEGIN;
            first = false;
        }
        if chunks.peek().is_none() {
            flags |= FRAGMENT_END;
        }
        fragments.push(Fragment {
            flags,
            bytes: chunk.to_vec(),
        });
    }
    fragments
}
