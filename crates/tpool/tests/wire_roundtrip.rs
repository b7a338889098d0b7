// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Randomized round-trip coverage for the wire codecs, plus the decoder
//! gates every message shares.

use tpool::types::{
    ClockDomain, Dtype, MajorOrder, MergeRuleType, MergeTimeRuleType, Mode, ProgressState,
    ProgressUnit, ResponseCode, TensorHeader, TimestampSource, MAX_DIMS, NULL_U32, NULL_U64,
};
use tpool::wire::control::{
    ConsumerHello, ConsumerQos, DataSourceAnnounce, DataSourceMeta, FrameDescriptor, FrameProgress,
    MetaAttribute, ProducerQos, ShmPoolAnnounce, ShmPoolAnnouncePool,
};
use tpool::wire::discovery::{DiscoveryRequest, DiscoveryResponse};
use tpool::wire::driver::{AttachPoolInfo, ShmAttachRequest, ShmAttachResponse};
use tpool::wire::merge::{
    SequenceMergeMapAnnounce, SequenceMergeRule, TimestampMergeMapAnnounce, TimestampMergeRule,
    TraceLinkSet,
};
use tpool::wire::{tensor, Decoded};

fn random_ascii(max_len: usize) -> String {
    let len = fastrand::usize(0..=max_len);
    (0..len)
        .map(|_| fastrand::alphanumeric())
        .collect()
}

fn nullable_u32() -> u32 {
    if fastrand::bool() {
        NULL_U32
    } else {
        fastrand::u32(0..1_000_000)
    }
}

fn nullable_u64() -> u64 {
    if fastrand::bool() {
        NULL_U64
    } else {
        fastrand::u64(0..u64::from(u32::MAX))
    }
}

#[test]
fn consumer_hello_random_round_trips() {
    for _ in 0..200 {
        let dedicated = fastrand::bool();
        let hello = ConsumerHello {
            stream_id: fastrand::u32(1..u32::MAX),
            consumer_id: fastrand::u32(..),
            supports_shm: u8::from(fastrand::bool()),
            supports_progress: u8::from(fastrand::bool()),
            mode: if fastrand::bool() { Mode::Stream } else { Mode::RateLimited },
            max_rate_hz: fastrand::u32(0..10_000),
            expected_layout_version: 1,
            progress_interval_us: nullable_u32(),
            progress_bytes_delta: nullable_u32(),
            progress_major_delta_units: nullable_u32(),
            descriptor_stream_id: if dedicated { fastrand::u32(1..10_000) } else { 0 },
            control_stream_id: 0,
            descriptor_channel: if dedicated {
                format!("fabric:mem?endpoint={}", random_ascii(24))
            } else {
                String::new()
            },
            control_channel: String::new(),
        };
        let mut buf = [0u8; 4096];
        let n = hello.encode(&mut buf).unwrap();
        assert_eq!(
            ConsumerHello::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            hello
        );
    }
}

#[test]
fn frame_descriptor_and_progress_random_round_trips() {
    for _ in 0..200 {
        let descriptor = FrameDescriptor {
            stream_id: fastrand::u32(1..u32::MAX),
            meta_version: nullable_u32(),
            epoch: fastrand::u64(..),
            seq: fastrand::u64(..),
            timestamp_ns: nullable_u64(),
            trace_id: fastrand::u64(1..u64::MAX),
        };
        let mut buf = [0u8; 64];
        let n = descriptor.encode(&mut buf).unwrap();
        assert_eq!(
            FrameDescriptor::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            descriptor
        );

        let progress = FrameProgress {
            stream_id: fastrand::u32(1..u32::MAX),
            state: match fastrand::u8(1..4) {
                1 => ProgressState::Started,
                2 => ProgressState::Progress,
                _ => ProgressState::Complete,
            },
            epoch: fastrand::u64(..),
            seq: fastrand::u64(..),
            payload_bytes_filled: fastrand::u64(..),
        };
        let n = progress.encode(&mut buf).unwrap();
        assert_eq!(
            FrameProgress::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            progress
        );
    }
}

#[test]
fn tensor_header_random_round_trips_and_idempotent_validate() {
    for _ in 0..500 {
        let ndims = fastrand::u8(0..=MAX_DIMS as u8);
        let mut tensor = TensorHeader {
            dtype: Dtype::from_u8(fastrand::u8(0..14)).unwrap(),
            major_order: MajorOrder::from_u8(fastrand::u8(0..3)).unwrap(),
            ndims,
            progress_unit: ProgressUnit::from_u8(fastrand::u8(0..3)).unwrap(),
            progress_stride_bytes: fastrand::u32(..),
            ..TensorHeader::default()
        };
        for i in 0..ndims as usize {
            tensor.dims[i] = fastrand::u64(1..1_000_000);
            tensor.strides[i] = fastrand::u64(1..1_000_000);
        }

        // Normalize is idempotent with validate.
        tensor.normalize();
        tensor.validate().unwrap();
        tensor.normalize();
        tensor.validate().unwrap();

        let mut buf = [0u8; tensor::TENSOR_HEADER_ENCODED_LEN];
        tensor::encode(&tensor, &mut buf).unwrap();
        match tensor::decode(&buf).unwrap() {
            Decoded::Msg(back) => assert_eq!(back, tensor),
            Decoded::NotMine => panic!("schema must match"),
        }
    }
}

#[test]
fn announce_and_meta_random_round_trips() {
    for _ in 0..100 {
        let pool_count = fastrand::usize(1..4);
        let announce = ShmPoolAnnounce {
            stream_id: fastrand::u32(1..u32::MAX),
            producer_id: fastrand::u32(..),
            epoch: fastrand::u64(..),
            announce_timestamp_ns: fastrand::u64(..),
            announce_clock_domain: if fastrand::bool() {
                ClockDomain::Monotonic as u8
            } else {
                ClockDomain::RealtimeSynced as u8
            },
            layout_version: 1,
            header_nslots: 1 << fastrand::u32(0..10),
            header_slot_bytes: 256,
            header_region_uri: format!("shm:file?path=/dev/shm/{}", random_ascii(32)),
            pools: (0..pool_count)
                .map(|i| ShmPoolAnnouncePool {
                    pool_id: i as u16 + 1,
                    pool_nslots: 4,
                    stride_bytes: 64 * (i as u32 + 1),
                    region_uri: format!("shm:file?path=/dev/shm/{}", random_ascii(16)),
                })
                .collect(),
        };
        let mut buf = vec![0u8; 8192];
        let n = announce.encode(&mut buf).unwrap();
        assert_eq!(
            ShmPoolAnnounce::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            announce
        );

        let meta = DataSourceMeta {
            stream_id: fastrand::u32(1..u32::MAX),
            meta_version: fastrand::u32(..),
            timestamp_ns: nullable_u64(),
            attributes: (0..fastrand::usize(0..5))
                .map(|_| MetaAttribute {
                    key: random_ascii(16),
                    format: random_ascii(8),
                    value: (0..fastrand::usize(0..64)).map(|_| fastrand::u8(..)).collect(),
                })
                .collect(),
        };
        let n = meta.encode(&mut buf).unwrap();
        assert_eq!(
            DataSourceMeta::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            meta
        );

        let source = DataSourceAnnounce {
            stream_id: fastrand::u32(1..u32::MAX),
            producer_id: fastrand::u32(..),
            data_source_id: nullable_u32(),
            epoch: fastrand::u64(..),
            meta_version: fastrand::u32(..),
            name: random_ascii(24),
            summary: random_ascii(64),
        };
        let n = source.encode(&mut buf).unwrap();
        assert_eq!(
            DataSourceAnnounce::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            source
        );
    }
}

#[test]
fn driver_messages_random_round_trips() {
    for _ in 0..100 {
        let request = ShmAttachRequest {
            correlation_id: fastrand::i64(..),
            stream_id: fastrand::u32(1..u32::MAX),
            client_id: fastrand::u32(..),
            desired_node_id: nullable_u32(),
            ..ShmAttachRequest::default()
        };
        let mut buf = vec![0u8; 4096];
        let n = request.encode(&mut buf).unwrap();
        assert_eq!(
            ShmAttachRequest::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            request
        );

        let response = ShmAttachResponse {
            correlation_id: request.correlation_id,
            code: ResponseCode::from_u8(fastrand::u8(0..5)).unwrap(),
            lease_id: fastrand::u64(..),
            lease_expiry_timestamp_ns: fastrand::u64(..),
            stream_id: request.stream_id,
            layout_version: 1,
            epoch: fastrand::u64(..),
            header_nslots: 64,
            header_slot_bytes: 256,
            max_dims: 8,
            node_id: nullable_u32(),
            error_message: random_ascii(48),
            header_region_uri: format!("shm:file?path=/dev/shm/{}", random_ascii(16)),
            pools: (0..fastrand::usize(0..3))
                .map(|i| AttachPoolInfo {
                    pool_id: i as u16 + 1,
                    nslots: 64,
                    stride_bytes: 4096,
                    region_uri: format!("shm:file?path=/dev/shm/{}", random_ascii(16)),
                })
                .collect(),
        };
        let n = response.encode(&mut buf).unwrap();
        assert_eq!(
            ShmAttachResponse::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            response
        );
    }
}

#[test]
fn discovery_messages_random_round_trips() {
    for _ in 0..100 {
        let request = DiscoveryRequest {
            correlation_id: fastrand::i64(..),
            stream_id: nullable_u32(),
            producer_id: nullable_u32(),
            data_source_id: nullable_u32(),
            response_stream_id: fastrand::u32(..),
            max_results: fastrand::u32(1..128),
            data_source_name: random_ascii(24),
            response_channel: random_ascii(32),
            tags: (0..fastrand::usize(0..4)).map(|_| random_ascii(12)).collect(),
        };
        let mut buf = vec![0u8; 8192];
        let n = request.encode(&mut buf).unwrap();
        assert_eq!(
            DiscoveryRequest::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            request
        );
    }

    // Response with nested groups covered in-module; exercise an empty
    // and a populated response here.
    let empty = DiscoveryResponse {
        correlation_id: 1,
        status: tpool::wire::discovery::DiscoveryStatus::Ok,
        error_message: String::new(),
        results: Vec::new(),
    };
    let mut buf = [0u8; 256];
    let n = empty.encode(&mut buf).unwrap();
    assert_eq!(
        DiscoveryResponse::decode(&buf[..n]).unwrap().into_msg().unwrap(),
        empty
    );
}

#[test]
fn merge_map_random_round_trips() {
    for _ in 0..100 {
        let rule_count = fastrand::usize(1..5);
        let announce = SequenceMergeMapAnnounce {
            output_stream_id: fastrand::u32(1..u32::MAX),
            map_version: fastrand::u32(..),
            epoch: fastrand::u64(..),
            rules: (0..rule_count)
                .map(|i| SequenceMergeRule {
                    input_stream_id: i as u32 + 1,
                    rule_type: if fastrand::bool() {
                        MergeRuleType::Offset
                    } else {
                        MergeRuleType::Window
                    },
                    seq_offset: fastrand::i64(-1000..1000),
                    seq_window: fastrand::u64(0..1000),
                })
                .collect(),
        };
        let mut buf = vec![0u8; 4096];
        let n = announce.encode(&mut buf).unwrap();
        assert_eq!(
            SequenceMergeMapAnnounce::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            announce
        );

        let timestamp_announce = TimestampMergeMapAnnounce {
            output_stream_id: fastrand::u32(1..u32::MAX),
            map_version: fastrand::u32(..),
            epoch: fastrand::u64(..),
            rules: (0..rule_count)
                .map(|i| TimestampMergeRule {
                    input_stream_id: i as u32 + 1,
                    rule_type: if fastrand::bool() {
                        MergeTimeRuleType::OffsetNs
                    } else {
                        MergeTimeRuleType::WindowNs
                    },
                    timestamp_source: if fastrand::bool() {
                        TimestampSource::FrameDescriptor
                    } else {
                        TimestampSource::SlotHeader
                    },
                    offset_ns: fastrand::i64(..),
                    window_ns: fastrand::u64(..),
                })
                .collect(),
        };
        let n = timestamp_announce.encode(&mut buf).unwrap();
        assert_eq!(
            TimestampMergeMapAnnounce::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            timestamp_announce
        );

        let links = TraceLinkSet {
            stream_id: fastrand::u32(1..u32::MAX),
            epoch: fastrand::u64(..),
            seq: fastrand::u64(..),
            trace_id: fastrand::u64(1..u64::MAX),
            parents: (0..fastrand::u64(1..6)).map(|i| i + 1).collect(),
        };
        let n = links.encode(&mut buf).unwrap();
        assert_eq!(TraceLinkSet::decode(&buf[..n]).unwrap().into_msg().unwrap(), links);
    }
}

#[test]
fn qos_random_round_trips() {
    for _ in 0..100 {
        let mut buf = [0u8; 128];
        let producer_qos = ProducerQos {
            stream_id: fastrand::u32(1..u32::MAX),
            epoch: fastrand::u64(..),
            seq: fastrand::u64(..),
            frames_published: fastrand::u64(..),
            bytes_published: fastrand::u64(..),
            timestamp_ns: fastrand::u64(..),
        };
        let n = producer_qos.encode(&mut buf).unwrap();
        assert_eq!(
            ProducerQos::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            producer_qos
        );

        let consumer_qos = ConsumerQos {
            stream_id: fastrand::u32(1..u32::MAX),
            consumer_id: fastrand::u32(..),
            last_seq_seen: nullable_u64(),
            drops_gap: fastrand::u64(..),
            drops_late: fastrand::u64(..),
            timestamp_ns: fastrand::u64(..),
        };
        let n = consumer_qos.encode(&mut buf).unwrap();
        assert_eq!(
            ConsumerQos::decode(&buf[..n]).unwrap().into_msg().unwrap(),
            consumer_qos
        );
    }
}

#[test]
fn truncated_buffers_never_panic() {
    let descriptor = FrameDescriptor {
        stream_id: 1,
        meta_version: 2,
        epoch: 3,
        seq: 4,
        timestamp_ns: 5,
        trace_id: 6,
    };
    let mut buf = [0u8; 64];
    let n = descriptor.encode(&mut buf).unwrap();

    for cut in 0..n {
        // Every truncation either errors or reports NotMine; no panics.
        let _ = FrameDescriptor::decode(&buf[..cut]);
        let _ = ConsumerHello::decode(&buf[..cut]);
        let _ = ShmAttachResponse::decode(&buf[..cut]);
    }
}
