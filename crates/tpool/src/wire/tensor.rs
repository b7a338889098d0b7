// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Tensor header codec.
//!
//! The same framed encoding is written into header slots (after the slot
//! header, behind a u32 length prefix) and carried inline where a message
//! embeds tensor metadata.
//!
//! Fixed block (140 bytes): dtype u8, major_order u8, ndims u8,
//! pad_align u8, progress_unit u8, reserved [u8;3], progress_stride_bytes
//! u32, dims [u64;8], strides [u64;8].

use crate::error::TpError;
use crate::types::{Dtype, MajorOrder, ProgressUnit, TensorHeader, MAX_DIMS};
use crate::wire::{template, Cursor, CursorMut, Decoded, MessageHeader, MESSAGE_HEADER_LEN};
use crate::Result;

/// Fixed block length of the tensorHeader message.
pub const TENSOR_HEADER_BLOCK_LEN: u16 = 140;

/// Full framed length (header + block).
pub const TENSOR_HEADER_ENCODED_LEN: usize = MESSAGE_HEADER_LEN + TENSOR_HEADER_BLOCK_LEN as usize;

/// Encode a framed tensor header. The header must already be validated.
pub fn encode(tensor: &TensorHeader, buf: &mut [u8]) -> Result<usize> {
    let mut cur = CursorMut::new(buf);
    MessageHeader::new(TENSOR_HEADER_BLOCK_LEN, template::TENSOR_HEADER).encode(&mut cur)?;

    cur.write_u8(tensor.dtype as u8)?;
    cur.write_u8(tensor.major_order as u8)?;
    cur.write_u8(tensor.ndims)?;
    cur.write_u8(0)?; // pad_align
    cur.write_u8(tensor.progress_unit as u8)?;
    cur.write_bytes(&[0u8; 3])?;
    cur.write_u32(tensor.progress_stride_bytes)?;
    for d in &tensor.dims {
        cur.write_u64(*d)?;
    }
    for s in &tensor.strides {
        cur.write_u64(*s)?;
    }

    Ok(cur.offset())
}

/// Decode a framed tensor header and validate its invariants.
pub fn decode(buf: &[u8]) -> Result<Decoded<TensorHeader>> {
    let mut cur = Cursor::new(buf);
    let header = MessageHeader::decode(&mut cur)?;
    if !header.gate(template::TENSOR_HEADER, TENSOR_HEADER_BLOCK_LEN)? {
        return Ok(Decoded::NotMine);
    }

    let dtype = Dtype::from_u8(cur.read_u8()?)?;
    let major_order = MajorOrder::from_u8(cur.read_u8()?)?;
    let ndims = cur.read_u8()?;
    let _pad_align = cur.read_u8()?;
    let progress_unit = ProgressUnit::from_u8(cur.read_u8()?)?;
    cur.skip(3)?;
    let progress_stride_bytes = cur.read_u32()?;

    let mut dims = [0u64; MAX_DIMS];
    for d in &mut dims {
        *d = cur.read_u64()?;
    }
    let mut strides = [0u64; MAX_DIMS];
    for s in &mut strides {
        *s = cur.read_u64()?;
    }

    let tensor = TensorHeader {
        dtype,
        major_order,
        ndims,
        progress_unit,
        progress_stride_bytes,
        dims,
        strides,
    };
    tensor.validate()?;
    Ok(Decoded::Msg(tensor))
}

/// Decode from behind a u32 length prefix, as stored in header slots.
pub fn decode_length_prefixed(buf: &[u8]) -> Result<TensorHeader> {
    let mut cur = Cursor::new(buf);
    let len = cur.read_u32()? as usize;
    if len < MESSAGE_HEADER_LEN || len > buf.len().saturating_sub(4) {
        return Err(TpError::InvalidWire(format!("bad tensor header length {len}")));
    }
    decode(cur.read_bytes(len)?)?.into_msg()
}

/// Encode behind a u32 length prefix; returns total bytes written.
pub fn encode_length_prefixed(tensor: &TensorHeader, buf: &mut [u8]) -> Result<usize> {
    if buf.len() < 4 + TENSOR_HEADER_ENCODED_LEN {
        return Err(TpError::InvalidWire("slot tensor area too small".into()));
    }
    let written = encode(tensor, &mut buf[4..])?;
    buf[0..4].copy_from_slice(&(written as u32).to_le_bytes());
    Ok(4 + written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TensorHeader {
        let mut t = TensorHeader {
            dtype: Dtype::Float32,
            major_order: MajorOrder::Row,
            ndims: 2,
            progress_unit: ProgressUnit::Rows,
            progress_stride_bytes: 8,
            ..TensorHeader::default()
        };
        t.dims[0] = 2;
        t.dims[1] = 2;
        t.strides[0] = 8;
        t.strides[1] = 4;
        t
    }

    #[test]
    fn test_round_trip() {
        let t = sample();
        let mut buf = [0u8; TENSOR_HEADER_ENCODED_LEN];
        let n = encode(&t, &mut buf).unwrap();
        assert_eq!(n, TENSOR_HEADER_ENCODED_LEN);

        match decode(&buf).unwrap() {
            Decoded::Msg(back) => assert_eq!(back, t),
            Decoded::NotMine => panic!("schema should match"),
        }
    }

    #[test]
    fn test_length_prefixed_round_trip() {
        let t = sample();
        let mut buf = [0u8; 4 + TENSOR_HEADER_ENCODED_LEN];
        let n = encode_length_prefixed(&t, &mut buf).unwrap();
        assert_eq!(n, 4 + TENSOR_HEADER_ENCODED_LEN);
        assert_eq!(decode_length_prefixed(&buf).unwrap(), t);
    }

    #[test]
    fn test_decode_rejects_tail_garbage() {
        let mut t = sample();
        t.ndims = 1; // dims[1] still set -> invalid after decode
        let mut buf = [0u8; TENSOR_HEADER_ENCODED_LEN];
        encode(&t, &mut buf).unwrap();
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_enum() {
        let t = sample();
        let mut buf = [0u8; TENSOR_HEADER_ENCODED_LEN];
        encode(&t, &mut buf).unwrap();
        buf[MESSAGE_HEADER_LEN] = 200; // dtype byte
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn test_foreign_template_not_mine() {
        let t = sample();
        let mut buf = [0u8; TENSOR_HEADER_ENCODED_LEN];
        encode(&t, &mut buf).unwrap();
        buf[2..4].copy_from_slice(&template::FRAME_DESCRIPTOR.to_le_bytes());
        assert_eq!(decode(&buf).unwrap(), Decoded::NotMine);
    }
}
