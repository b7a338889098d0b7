// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Merge-map and trace-link codecs.
//!
//! Merge maps describe how an external aligner joins several input streams
//! into one output stream, by sequence offset/window or by timestamp.
//! This crate only encodes and decodes them; both directions reject
//! structurally invalid maps (unknown rule types, duplicate inputs).
//!
//! `traceLinkSet` attaches parent trace ids to a published frame and is
//! checked by the producer's tracelink validator against its descriptor
//! history.

use crate::error::TpError;
use crate::types::{MergeRuleType, MergeTimeRuleType, TimestampSource};
use crate::wire::{template, Cursor, CursorMut, Decoded, MessageHeader};
use crate::Result;

fn decode_header<'a>(
    buf: &'a [u8],
    template_id: u16,
    block_len: u16,
) -> Result<Option<Cursor<'a>>> {
    let mut cur = Cursor::new(buf);
    let header = MessageHeader::decode(&mut cur)?;
    if !header.gate(template_id, block_len)? {
        return Ok(None);
    }
    Ok(Some(cur))
}

fn check_unique_inputs(ids: impl Iterator<Item = u32>) -> Result<()> {
    let mut seen = Vec::new();
    for id in ids {
        if seen.contains(&id) {
            return Err(TpError::InvalidWire(format!(
                "duplicate input stream id {id} in merge map"
            )));
        }
        seen.push(id);
    }
    Ok(())
}

// ---------------------------------------------------------------------
// sequenceMergeMapAnnounce / Request
// ---------------------------------------------------------------------

pub const SEQUENCE_MERGE_MAP_ANNOUNCE_BLOCK_LEN: u16 = 16;
pub const SEQUENCE_MERGE_RULE_BLOCK_LEN: u16 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceMergeRule {
    pub input_stream_id: u32,
    pub rule_type: MergeRuleType,
    pub seq_offset: i64,
    pub seq_window: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceMergeMapAnnounce {
    pub output_stream_id: u32,
    pub map_version: u32,
    pub epoch: u64,
    pub rules: Vec<SequenceMergeRule>,
}

impl SequenceMergeMapAnnounce {
    fn validate(&self) -> Result<()> {
        check_unique_inputs(self.rules.iter().map(|r| r.input_stream_id))
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.validate()?;
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(
            SEQUENCE_MERGE_MAP_ANNOUNCE_BLOCK_LEN,
            template::SEQUENCE_MERGE_MAP_ANNOUNCE,
        )
        .encode(&mut cur)?;
        cur.write_u32(self.output_stream_id)?;
        cur.write_u32(self.map_version)?;
        cur.write_u64(self.epoch)?;
        cur.write_group_header(self.rules.len() as u16, SEQUENCE_MERGE_RULE_BLOCK_LEN)?;
        for rule in &self.rules {
            cur.write_u32(rule.input_stream_id)?;
            cur.write_u8(rule.rule_type as u8)?;
            cur.write_bytes(&[0u8; 3])?;
            cur.write_i64(rule.seq_offset)?;
            cur.write_u64(rule.seq_window)?;
        }
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::SEQUENCE_MERGE_MAP_ANNOUNCE,
            SEQUENCE_MERGE_MAP_ANNOUNCE_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        let output_stream_id = cur.read_u32()?;
        let map_version = cur.read_u32()?;
        let epoch = cur.read_u64()?;
        let (count, _block) = cur.read_group_header()?;
        let mut rules = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let input_stream_id = cur.read_u32()?;
            let rule_type = MergeRuleType::from_u8(cur.read_u8()?)?;
            cur.skip(3)?;
            rules.push(SequenceMergeRule {
                input_stream_id,
                rule_type,
                seq_offset: cur.read_i64()?,
                seq_window: cur.read_u64()?,
            });
        }
        let msg = Self {
            output_stream_id,
            map_version,
            epoch,
            rules,
        };
        msg.validate()?;
        Ok(Decoded::Msg(msg))
    }
}

pub const SEQUENCE_MERGE_MAP_REQUEST_BLOCK_LEN: u16 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequenceMergeMapRequest {
    pub correlation_id: i64,
    pub output_stream_id: u32,
    pub response_stream_id: u32,
    pub response_channel: String,
}

impl SequenceMergeMapRequest {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(
            SEQUENCE_MERGE_MAP_REQUEST_BLOCK_LEN,
            template::SEQUENCE_MERGE_MAP_REQUEST,
        )
        .encode(&mut cur)?;
        cur.write_i64(self.correlation_id)?;
        cur.write_u32(self.output_stream_id)?;
        cur.write_u32(self.response_stream_id)?;
        cur.write_var_ascii(&self.response_channel)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::SEQUENCE_MERGE_MAP_REQUEST,
            SEQUENCE_MERGE_MAP_REQUEST_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        Ok(Decoded::Msg(Self {
            correlation_id: cur.read_i64()?,
            output_stream_id: cur.read_u32()?,
            response_stream_id: cur.read_u32()?,
            response_channel: cur.read_var_ascii()?,
        }))
    }
}

// ---------------------------------------------------------------------
// timestampMergeMapAnnounce / Request
// ---------------------------------------------------------------------

pub const TIMESTAMP_MERGE_MAP_ANNOUNCE_BLOCK_LEN: u16 = 16;
pub const TIMESTAMP_MERGE_RULE_BLOCK_LEN: u16 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampMergeRule {
    pub input_stream_id: u32,
    pub rule_type: MergeTimeRuleType,
    pub timestamp_source: TimestampSource,
    pub offset_ns: i64,
    pub window_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampMergeMapAnnounce {
    pub output_stream_id: u32,
    pub map_version: u32,
    pub epoch: u64,
    pub rules: Vec<TimestampMergeRule>,
}

impl TimestampMergeMapAnnounce {
    fn validate(&self) -> Result<()> {
        check_unique_inputs(self.rules.iter().map(|r| r.input_stream_id))
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.validate()?;
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(
            TIMESTAMP_MERGE_MAP_ANNOUNCE_BLOCK_LEN,
            template::TIMESTAMP_MERGE_MAP_ANNOUNCE,
        )
        .encode(&mut cur)?;
        cur.write_u32(self.output_stream_id)?;
        cur.write_u32(self.map_version)?;
        cur.write_u64(self.epoch)?;
        cur.write_group_header(self.rules.len() as u16, TIMESTAMP_MERGE_RULE_BLOCK_LEN)?;
        for rule in &self.rules {
            cur.write_u32(rule.input_stream_id)?;
            cur.write_u8(rule.rule_type as u8)?;
            cur.write_u8(rule.timestamp_source as u8)?;
            cur.write_u16(0)?;
            cur.write_i64(rule.offset_ns)?;
            cur.write_u64(rule.window_ns)?;
        }
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::TIMESTAMP_MERGE_MAP_ANNOUNCE,
            TIMESTAMP_MERGE_MAP_ANNOUNCE_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        let output_stream_id = cur.read_u32()?;
        let map_version = cur.read_u32()?;
        let epoch = cur.read_u64()?;
        let (count, _block) = cur.read_group_header()?;
        let mut rules = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let input_stream_id = cur.read_u32()?;
            let rule_type = MergeTimeRuleType::from_u8(cur.read_u8()?)?;
            let timestamp_source = TimestampSource::from_u8(cur.read_u8()?)?;
            cur.skip(2)?;
            rules.push(TimestampMergeRule {
                input_stream_id,
                rule_type,
                timestamp_source,
                offset_ns: cur.read_i64()?,
                window_ns: cur.read_u64()?,
            });
        }
        let msg = Self {
            output_stream_id,
            map_version,
            epoch,
            rules,
        };
        msg.validate()?;
        Ok(Decoded::Msg(msg))
    }
}

pub const TIMESTAMP_MERGE_MAP_REQUEST_BLOCK_LEN: u16 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimestampMergeMapRequest {
    pub correlation_id: i64,
    pub output_stream_id: u32,
    pub response_stream_id: u32,
    pub response_channel: String,
}

impl TimestampMergeMapRequest {
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(
            TIMESTAMP_MERGE_MAP_REQUEST_BLOCK_LEN,
            template::TIMESTAMP_MERGE_MAP_REQUEST,
        )
        .encode(&mut cur)?;
        cur.write_i64(self.correlation_id)?;
        cur.write_u32(self.output_stream_id)?;
        cur.write_u32(self.response_stream_id)?;
        cur.write_var_ascii(&self.response_channel)?;
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(
            buf,
            template::TIMESTAMP_MERGE_MAP_REQUEST,
            TIMESTAMP_MERGE_MAP_REQUEST_BLOCK_LEN,
        )?
        else {
            return Ok(Decoded::NotMine);
        };
        Ok(Decoded::Msg(Self {
            correlation_id: cur.read_i64()?,
            output_stream_id: cur.read_u32()?,
            response_stream_id: cur.read_u32()?,
            response_channel: cur.read_var_ascii()?,
        }))
    }
}

// ---------------------------------------------------------------------
// traceLinkSet
// ---------------------------------------------------------------------

pub const TRACE_LINK_SET_BLOCK_LEN: u16 = 32;
pub const TRACE_LINK_PARENT_BLOCK_LEN: u16 = 8;

/// Causal parents of one published frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLinkSet {
    pub stream_id: u32,
    pub epoch: u64,
    pub seq: u64,
    pub trace_id: u64,
    pub parents: Vec<u64>,
}

impl TraceLinkSet {
    fn validate(&self) -> Result<()> {
        if self.parents.is_empty() {
            return Err(TpError::InvalidWire("trace link set has no parents".into()));
        }
        let mut seen = Vec::with_capacity(self.parents.len());
        for parent in &self.parents {
            if seen.contains(parent) {
                return Err(TpError::InvalidWire(format!(
                    "duplicate parent trace id {parent:#x}"
                )));
            }
            seen.push(*parent);
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.validate()?;
        let mut cur = CursorMut::new(buf);
        MessageHeader::new(TRACE_LINK_SET_BLOCK_LEN, template::TRACE_LINK_SET).encode(&mut cur)?;
        cur.write_u32(self.stream_id)?;
        cur.write_u32(0)?;
        cur.write_u64(self.epoch)?;
        cur.write_u64(self.seq)?;
        cur.write_u64(self.trace_id)?;
        cur.write_group_header(self.parents.len() as u16, TRACE_LINK_PARENT_BLOCK_LEN)?;
        for parent in &self.parents {
            cur.write_u64(*parent)?;
        }
        Ok(cur.offset())
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>> {
        let Some(mut cur) = decode_header(buf, template::TRACE_LINK_SET, TRACE_LINK_SET_BLOCK_LEN)?
        else {
            return Ok(Decoded::NotMine);
        };
        let stream_id = cur.read_u32()?;
        cur.skip(4)?;
        let epoch = cur.read_u64()?;
        let seq = cur.read_u64()?;
        let trace_id = cur.read_u64()?;
        let (count, _block) = cur.read_group_header()?;
        let mut parents = Vec::with_capacity(count as usize);
        for _ in 0..count {
            parents.push(cur.read_u64()?);
        }
        let msg = Self {
            stream_id,
            epoch,
            seq,
            trace_id,
            parents,
        };
        msg.validate()?;
        Ok(Decoded::Msg(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_merge_map_round_trip() {
        let announce = SequenceMergeMapAnnounce {
            output_stream_id: 20_000,
            map_version: 1,
            epoch: 4,
            rules: vec![
                SequenceMergeRule {
                    input_stream_id: 10_000,
                    rule_type: MergeRuleType::Offset,
                    seq_offset: -3,
                    seq_window: 0,
                },
                SequenceMergeRule {
                    input_stream_id: 10_001,
                    rule_type: MergeRuleType::Window,
                    seq_offset: 0,
                    seq_window: 16,
                },
            ],
        };
        let mut buf = [0u8; 512];
        let n = announce.encode(&mut buf).unwrap();
        assert_eq!(
            SequenceMergeMapAnnounce::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            announce
        );
    }

    #[test]
    fn test_duplicate_input_rejected_both_ways() {
        let rule = SequenceMergeRule {
            input_stream_id: 10_000,
            rule_type: MergeRuleType::Offset,
            seq_offset: 0,
            seq_window: 0,
        };
        let announce = SequenceMergeMapAnnounce {
            output_stream_id: 20_000,
            map_version: 1,
            epoch: 1,
            rules: vec![rule, rule],
        };
        let mut buf = [0u8; 512];
        assert!(announce.encode(&mut buf).is_err());

        // Hand-build the same invalid map and check the decoder rejects it.
        let valid = SequenceMergeMapAnnounce {
            rules: vec![rule],
            ..announce.clone()
        };
        let n = valid.encode(&mut buf).unwrap();
        // Patch count to 2 and duplicate the rule bytes.
        let rule_start = n - SEQUENCE_MERGE_RULE_BLOCK_LEN as usize;
        let rule_bytes: Vec<u8> = buf[rule_start..n].to_vec();
        buf[n..n + rule_bytes.len()].copy_from_slice(&rule_bytes);
        let count_offset = rule_start - 4;
        buf[count_offset..count_offset + 2].copy_from_slice(&2u16.to_le_bytes());
        assert!(SequenceMergeMapAnnounce::decode(&buf[..n + rule_bytes.len()]).is_err());
    }

    #[test]
    fn test_timestamp_merge_map_round_trip() {
        let announce = TimestampMergeMapAnnounce {
            output_stream_id: 20_000,
            map_version: 2,
            epoch: 9,
            rules: vec![TimestampMergeRule {
                input_stream_id: 10_000,
                rule_type: MergeTimeRuleType::WindowNs,
                timestamp_source: TimestampSource::SlotHeader,
                offset_ns: 500,
                window_ns: 1_000_000,
            }],
        };
        let mut buf = [0u8; 256];
        let n = announce.encode(&mut buf).unwrap();
        assert_eq!(
            TimestampMergeMapAnnounce::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            announce
        );
    }

    #[test]
    fn test_merge_requests_round_trip() {
        let mut buf = [0u8; 256];
        let req = SequenceMergeMapRequest {
            correlation_id: 5,
            output_stream_id: 20_000,
            response_stream_id: 2001,
            response_channel: "fabric:mem?endpoint=aligner".into(),
        };
        let n = req.encode(&mut buf).unwrap();
        assert_eq!(
            SequenceMergeMapRequest::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            req
        );

        let req = TimestampMergeMapRequest {
            correlation_id: 6,
            output_stream_id: 20_000,
            response_stream_id: 2001,
            response_channel: String::new(),
        };
        let n = req.encode(&mut buf).unwrap();
        assert_eq!(
            TimestampMergeMapRequest::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            req
        );
    }

    #[test]
    fn test_trace_link_set_round_trip() {
        let set = TraceLinkSet {
            stream_id: 10_000,
            epoch: 1,
            seq: 42,
            trace_id: 0xabc,
            parents: vec![0x111, 0x222],
        };
        let mut buf = [0u8; 256];
        let n = set.encode(&mut buf).unwrap();
        assert_eq!(TraceLinkSet::decode(&buf[..n]).unwrap().into_msg().unwrap(), set);
    }

    #[test]
    fn test_trace_link_set_rejects_empty_and_duplicate_parents() {
        let mut buf = [0u8; 256];
        let empty = TraceLinkSet {
            stream_id: 1,
            epoch: 1,
            seq: 1,
            trace_id: 1,
            parents: vec![],
        };
        assert!(empty.encode(&mut buf).is_err());

        let dup = TraceLinkSet {
            parents: vec![7, 7],
            ..empty
        };
        assert!(dup.encode(&mut buf).is_err());
    }
}
