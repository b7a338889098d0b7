// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Metadata blob transfer.
//!
//! Blobs larger than a single message travel as an announce, a run of
//! chunks with monotonic offsets, and a completion carrying the FNV-1a
//! checksum of the whole blob. The collector validates offsets as chunks
//! arrive and the checksum at completion.

use crate::error::TpError;
use crate::wire::control::{MetaBlobAnnounce, MetaBlobChunk, MetaBlobComplete};
use crate::Result;

/// Chunk payload size. Fits one fabric fragment with framing to spare.
pub const META_BLOB_CHUNK_BYTES: usize = 1024;

/// FNV-1a over the whole blob.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Split a blob into its announce / chunks / complete message sequence.
pub fn encode_blob(
    stream_id: u32,
    meta_version: u32,
    blob_type: u32,
    bytes: &[u8],
) -> (MetaBlobAnnounce, Vec<MetaBlobChunk>, MetaBlobComplete) {
    let checksum = fnv1a(bytes);
    let announce = MetaBlobAnnounce {
        stream_id,
        meta_version,
        blob_type,
        total_len: bytes.len() as u64,
        checksum,
    };
    let chunks = bytes
        .chunks(META_BLOB_CHUNK_BYTES)
        .enumerate()
        .map(|(i, chunk)| MetaBlobChunk {
            stream_id,
            meta_version,
            offset: (i * META_BLOB_CHUNK_BYTES) as u64,
            bytes: chunk.to_vec(),
        })
        .collect();
    let complete = MetaBlobComplete {
        stream_id,
        meta_version,
        checksum,
    };
    (announce, chunks, complete)
}

/// Receiving side of one blob transfer.
pub struct MetaBlobCollector {
    stream_id: u32,
    meta_version: u32,
    expected_len: u64,
    expected_checksum: u64,
    bytes: Vec<u8>,
}

impl MetaBlobCollector {
    pub fn begin(announce: &MetaBlobAnnounce) -> Result<Self> {
        if announce.total_len > 64 * 1024 * 1024 {
            return Err(TpError::InvalidWire(format!(
                "blob of {} bytes exceeds collector limit",
                announce.total_len
            )));
        }
        Ok(Self {
            stream_id: announce.stream_id,
            meta_version: announce.meta_version,
            expected_len: announce.total_len,
            expected_checksum: announce.checksum,
            bytes: Vec::with_capacity(announce.total_len as usize),
        })
    }

    /// Apply the next chunk. Offsets must be exactly contiguous.
    pub fn apply_chunk(&mut self, chunk: &MetaBlobChunk) -> Result<()> {
        if chunk.stream_id != self.stream_id || chunk.meta_version != self.meta_version {
            return Err(TpError::InvalidWire("chunk for a different blob".into()));
        }
        if chunk.offset != self.bytes.len() as u64 {
            return Err(TpError::InvalidWire(format!(
                "chunk offset {} does not continue at {}",
                chunk.offset,
                self.bytes.len()
            )));
        }
        if chunk.offset + chunk.bytes.len() as u64 > self.expected_len {
            return Err(TpError::InvalidWire("chunk overruns announced length".into()));
        }
        self.bytes.extend_from_slice(&chunk.bytes);
        Ok(())
    }

    /// Validate the completion and hand the blob over.
    pub fn complete(self, complete: &MetaBlobComplete) -> Result<Vec<u8>> {
        if complete.stream_id != self.stream_id || complete.meta_version != self.meta_version {
            return Err(TpError::InvalidWire("completion for a different blob".into()));
        }
        if self.bytes.len() as u64 != self.expected_len {
            return Err(TpError::InvalidWire(format!(
                "blob incomplete: {} of {} bytes",
                self.bytes.len(),
                self.expected_len
            )));
        }
        if complete.checksum != self.expected_checksum {
            return Err(TpError::InvalidWire("completion checksum differs from announce".into()));
        }
        let actual = fnv1a(&self.bytes);
        if actual != self.expected_checksum {
            return Err(TpError::InvalidWire(format!(
                "blob checksum mismatch: {actual:#x} != {:#x}",
                self.expected_checksum
            )));
        }
        Ok(self.bytes)
    }
}
