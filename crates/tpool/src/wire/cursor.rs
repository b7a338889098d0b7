// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Bounds-checked little-endian cursors.
//!
//! Every wire codec reads and writes through these; a short buffer is an
//! `InvalidWire` error, never a panic.

use crate::error::TpError;
use crate::Result;

/// Read cursor over a received buffer.
pub struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(TpError::InvalidWire(format!(
                "buffer underrun: need {n} bytes at offset {}, have {}",
                self.offset,
                self.remaining()
            )));
        }
        let s = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Variable ASCII field: u32 length prefix + bytes.
    pub fn read_var_ascii(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len > crate::types::URI_MAX_LENGTH {
            return Err(TpError::InvalidWire(format!("ascii field too long: {len}")));
        }
        let bytes = self.take(len)?;
        if !bytes.is_ascii() {
            return Err(TpError::InvalidWire("non-ascii bytes in ascii field".into()));
        }
        // Checked ASCII above, so UTF-8 conversion cannot fail.
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Variable binary field: u32 length prefix + bytes.
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Repeating-group header: `(count u16, block_length u16)`.
    pub fn read_group_header(&mut self) -> Result<(u16, u16)> {
        let count = self.read_u16()?;
        let block_length = self.read_u16()?;
        Ok((count, block_length))
    }

    /// Skip `n` bytes (relaxed decoders stepping over unknown block tails).
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n)?;
        Ok(())
    }
}

/// Write cursor over an outgoing buffer.
pub struct CursorMut<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> CursorMut<'a> {
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.offset + bytes.len();
        if end > self.buf.len() {
            return Err(TpError::InvalidWire(format!(
                "buffer overrun: need {} bytes at offset {}, have {}",
                bytes.len(),
                self.offset,
                self.buf.len() - self.offset
            )));
        }
        self.buf[self.offset..end].copy_from_slice(bytes);
        self.offset = end;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.put(&[v])
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put(bytes)
    }

    pub fn write_var_ascii(&mut self, s: &str) -> Result<()> {
        if !s.is_ascii() {
            return Err(TpError::InvalidWire("non-ascii string in ascii field".into()));
        }
        if s.len() > crate::types::URI_MAX_LENGTH {
            return Err(TpError::InvalidWire(format!("ascii field too long: {}", s.len())));
        }
        self.write_u32(s.len() as u32)?;
        self.put(s.as_bytes())
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u32(bytes.len() as u32)?;
        self.put(bytes)
    }

    pub fn write_group_header(&mut self, count: u16, block_length: u16) -> Result<()> {
        self.write_u16(count)?;
        self.write_u16(block_length)
    }
}
