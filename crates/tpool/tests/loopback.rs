// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Loopback publish/read scenarios: one producer, one consumer, regions
//! on a tempdir-backed filesystem, descriptors over the in-process
//! fabric.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tpool::client::{
    Consumer, ConsumerAttachConfig, ConsumerOptions, ConsumerPoolConfig, ClientContext, Frame,
    FrameMetadata, PoolConfig, Producer, ProducerConfig, ProducerOptions,
};
use tpool::fabric::MemFabric;
use tpool::shm::{create_region_file, AllowedPaths, Superblock};
use tpool::types::{Dtype, MajorOrder, RegionType, TensorHeader};
use tpool::wire::control::FrameDescriptor;
use tpool::TpError;

const STREAM_ID: u32 = 10_000;
const NSLOTS: u32 = 4;
const POOL_STRIDE: u32 = 64;

fn create_regions(dir: &Path, epoch: u64) {
    let header = Superblock::new(
        STREAM_ID,
        epoch,
        1,
        RegionType::HeaderRing,
        0,
        NSLOTS,
        256,
        0,
        1,
    );
    create_region_file(&dir.join(format!("tp_{STREAM_ID}_{epoch}_hdr")), &header).unwrap();

    let pool = Superblock::new(
        STREAM_ID,
        epoch,
        1,
        RegionType::PayloadPool,
        1,
        NSLOTS,
        0,
        POOL_STRIDE,
        1,
    );
    create_region_file(&dir.join(format!("tp_{STREAM_ID}_{epoch}_pool1")), &pool).unwrap();
}

fn producer_config(dir: &Path, epoch: u64) -> ProducerConfig {
    ProducerConfig {
        stream_id: STREAM_ID,
        producer_id: 1,
        epoch,
        layout_version: 1,
        header_nslots: NSLOTS,
        header_uri: format!("shm:file?path={}/tp_{STREAM_ID}_{epoch}_hdr", dir.display()),
        pools: vec![PoolConfig {
            pool_id: 1,
            nslots: NSLOTS,
            stride_bytes: POOL_STRIDE,
            uri: format!("shm:file?path={}/tp_{STREAM_ID}_{epoch}_pool1", dir.display()),
        }],
    }
}

fn consumer_config(dir: &Path, epoch: u64) -> ConsumerAttachConfig {
    ConsumerAttachConfig {
        stream_id: STREAM_ID,
        epoch,
        layout_version: 1,
        header_nslots: NSLOTS,
        header_uri: format!("shm:file?path={}/tp_{STREAM_ID}_{epoch}_hdr", dir.display()),
        pools: vec![ConsumerPoolConfig {
            pool_id: 1,
            nslots: NSLOTS,
            stride_bytes: POOL_STRIDE,
            uri: format!("shm:file?path={}/tp_{STREAM_ID}_{epoch}_pool1", dir.display()),
        }],
    }
}

fn context(dir: &Path, fabric: Arc<MemFabric>) -> ClientContext {
    let mut context = ClientContext::new(fabric);
    context
        .set_shm_base_path(dir)
        .set_allowed_paths(AllowedPaths::new([dir]));
    context
}

fn float_tensor_2x2() -> TensorHeader {
    let mut tensor = TensorHeader {
        dtype: Dtype::Float32,
        major_order: MajorOrder::Row,
        ndims: 2,
        ..TensorHeader::default()
    };
    tensor.dims[0] = 2;
    tensor.dims[1] = 2;
    tensor.strides[0] = 8;
    tensor.strides[1] = 4;
    tensor
}

fn float_payload() -> Vec<u8> {
    [1.0f32, 2.0, 3.0, 4.0]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

#[test]
fn loopback_publish_and_read_three_frames() {
    let dir = tempfile::tempdir().unwrap();
    create_regions(dir.path(), 1);

    let fabric = MemFabric::new();
    let context = context(dir.path(), Arc::clone(&fabric));

    let mut consumer = Consumer::new(&context, ConsumerOptions::new(STREAM_ID, 7)).unwrap();
    consumer.attach(&consumer_config(dir.path(), 1)).unwrap();
    let seen: Arc<Mutex<Vec<FrameDescriptor>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    consumer.set_descriptor_handler(Box::new(move |descriptor| {
        sink.lock().unwrap().push(*descriptor);
    }));

    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1)).unwrap();
    producer.attach(&producer_config(dir.path(), 1)).unwrap();

    let tensor = float_tensor_2x2();
    let payload = float_payload();
    let meta = FrameMetadata {
        timestamp_ns: 0,
        meta_version: 0,
    };

    for expected_seq in 0..3u64 {
        let seq = producer
            .offer_frame(
                &Frame {
                    tensor: &tensor,
                    payload: &payload,
                    trace_id: 0,
                },
                &meta,
            )
            .unwrap();
        assert_eq!(seq, expected_seq);
    }

    assert_eq!(consumer.poll_descriptors(16).unwrap(), 3);
    let descriptors = seen.lock().unwrap().clone();
    assert_eq!(descriptors.len(), 3);
    for (i, descriptor) in descriptors.iter().enumerate() {
        assert_eq!(descriptor.seq, i as u64);
        assert_eq!(descriptor.stream_id, STREAM_ID);
        assert_eq!(descriptor.epoch, 1);
        assert_ne!(descriptor.trace_id, 0);
    }

    for descriptor in &descriptors {
        let view = consumer.read_frame(descriptor.seq).unwrap();
        assert_eq!(view.payload, &payload[..]);
        assert_eq!(view.tensor.dtype, Dtype::Float32);
        assert_eq!(view.tensor.dims[..2], [2, 2]);
        assert_eq!(view.pool_id, 1);
        assert_eq!(view.meta_version, 0);
        assert_ne!(view.timestamp_ns, 0); // producer stamped the clock
    }

    let (gap, late, last_seen) = consumer.drop_counts();
    assert_eq!((gap, late), (0, 0));
    assert_eq!(last_seen, 2);
}

#[test]
fn back_pressure_leaves_producer_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    create_regions(dir.path(), 1);

    let fabric = MemFabric::new();
    let context = context(dir.path(), Arc::clone(&fabric));

    // A deliberately tiny subscription queue: two descriptors fit.
    let slow_subscription =
        fabric.add_subscription_with_capacity(context.descriptor_addr(), 2);

    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1)).unwrap();
    producer.attach(&producer_config(dir.path(), 1)).unwrap();

    let tensor = float_tensor_2x2();
    let payload = float_payload();
    let meta = FrameMetadata::default();

    let frame = Frame {
        tensor: &tensor,
        payload: &payload,
        trace_id: 0,
    };
    assert_eq!(producer.offer_frame(&frame, &meta).unwrap(), 0);
    assert_eq!(producer.offer_frame(&frame, &meta).unwrap(), 1);

    // Third offer hits flow control before any state changes.
    match producer.offer_frame(&frame, &meta) {
        Err(TpError::BackPressured) => {}
        other => panic!("expected BackPressured, got {other:?}"),
    }
    assert_eq!(producer.next_seq(), 2);

    // Retrying fails identically until the subscriber drains.
    assert!(matches!(
        producer.offer_frame(&frame, &meta),
        Err(TpError::BackPressured)
    ));
    assert_eq!(producer.next_seq(), 2);

    slow_subscription.poll(16);
    assert_eq!(producer.offer_frame(&frame, &meta).unwrap(), 2);
    assert_eq!(producer.next_seq(), 3);

    // The eventually published slot is committed and readable.
    let mut consumer = Consumer::new(&context, ConsumerOptions::new(STREAM_ID, 9)).unwrap();
    consumer.attach(&consumer_config(dir.path(), 1)).unwrap();
    let view = consumer.read_frame(2).unwrap();
    assert_eq!(view.payload, &payload[..]);
}

#[test]
fn wrapped_ring_reports_gap_or_late_for_overwritten_seq() {
    let dir = tempfile::tempdir().unwrap();
    create_regions(dir.path(), 1);

    let fabric = MemFabric::new();
    let context = context(dir.path(), Arc::clone(&fabric));

    let mut consumer = Consumer::new(&context, ConsumerOptions::new(STREAM_ID, 7)).unwrap();
    consumer.attach(&consumer_config(dir.path(), 1)).unwrap();

    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1)).unwrap();
    producer.attach(&producer_config(dir.path(), 1)).unwrap();

    let tensor = float_tensor_2x2();
    let payload = float_payload();
    let meta = FrameMetadata::default();

    // NSLOTS + 2 frames: seq 0 and 1 are overwritten by 4 and 5.
    for _ in 0..(NSLOTS + 2) {
        producer
            .offer_frame(
                &Frame {
                    tensor: &tensor,
                    payload: &payload,
                    trace_id: 0,
                },
                &meta,
            )
            .unwrap();
    }

    assert!(matches!(consumer.read_frame(0), Err(TpError::GapOrLate)));
    assert!(matches!(consumer.read_frame(1), Err(TpError::GapOrLate)));
    assert!(consumer.read_frame(4).is_ok());
    assert!(consumer.read_frame(5).is_ok());
}

#[test]
fn claim_commit_matches_offer_path() {
    let dir = tempfile::tempdir().unwrap();
    create_regions(dir.path(), 1);

    let fabric = MemFabric::new();
    let context = context(dir.path(), Arc::clone(&fabric));

    let mut consumer = Consumer::new(&context, ConsumerOptions::new(STREAM_ID, 7)).unwrap();
    consumer.attach(&consumer_config(dir.path(), 1)).unwrap();

    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1)).unwrap();
    producer.attach(&producer_config(dir.path(), 1)).unwrap();

    let payload = float_payload();
    let mut claim = producer.try_claim(payload.len()).unwrap();
    assert_eq!(claim.seq, 0);

    // While the claim is open the slot reads as not ready.
    assert!(matches!(consumer.read_frame(0), Err(TpError::NotReady)));

    producer
        .claim_payload_mut(&claim)
        .unwrap()
        .copy_from_slice(&payload);
    claim.tensor = float_tensor_2x2();
    producer
        .commit_claim(&claim, &FrameMetadata::default())
        .unwrap();

    let view = consumer.read_frame(0).unwrap();
    assert_eq!(view.payload, &payload[..]);

    // Aborted claims skip their sequence without disturbing readers.
    let aborted = producer.try_claim(payload.len()).unwrap();
    assert_eq!(aborted.seq, 1);
    producer.abort_claim(aborted);

    let mut claim = producer.try_claim(payload.len()).unwrap();
    assert_eq!(claim.seq, 2);
    producer
        .claim_payload_mut(&claim)
        .unwrap()
        .copy_from_slice(&payload);
    claim.tensor = float_tensor_2x2();
    producer
        .commit_claim(&claim, &FrameMetadata::default())
        .unwrap();
    assert!(consumer.read_frame(2).is_ok());
}

#[test]
fn no_pool_for_oversized_payload() {
    let dir = tempfile::tempdir().unwrap();
    create_regions(dir.path(), 1);

    let fabric = MemFabric::new();
    let context = context(dir.path(), Arc::clone(&fabric));

    let _consumer_sub = fabric.add_subscription(context.descriptor_addr());
    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1)).unwrap();
    producer.attach(&producer_config(dir.path(), 1)).unwrap();

    let tensor = float_tensor_2x2();
    let oversized = vec![0u8; POOL_STRIDE as usize + 1];
    match producer.offer_frame(
        &Frame {
            tensor: &tensor,
            payload: &oversized,
            trace_id: 0,
        },
        &FrameMetadata::default(),
    ) {
        Err(TpError::NoPool { length }) => assert_eq!(length, POOL_STRIDE as usize + 1),
        other => panic!("expected NoPool, got {other:?}"),
    }
    assert_eq!(producer.next_seq(), 0);
}

#[test]
fn torn_free_reads_under_concurrent_writer() {
    let dir = tempfile::tempdir().unwrap();
    create_regions(dir.path(), 1);

    let fabric = MemFabric::new();
    let context = context(dir.path(), Arc::clone(&fabric));

    // The consumer reads SHM directly and never drains descriptors, so
    // point its subscription at a dedicated endpoint and let the
    // producer drop unconnected shared-descriptor offers.
    let mut consumer_options = ConsumerOptions::new(STREAM_ID, 7);
    consumer_options.descriptor_channel = "fabric:mem?endpoint=torn".into();
    consumer_options.descriptor_stream_id = 4000;
    let mut consumer = Consumer::new(&context, consumer_options).unwrap();
    consumer.attach(&consumer_config(dir.path(), 1)).unwrap();

    let mut options = ProducerOptions::new(STREAM_ID, 1);
    options.drop_unconnected_descriptors = true;
    let mut producer = Producer::new(&context, options).unwrap();
    producer.attach(&producer_config(dir.path(), 1)).unwrap();

    const FRAMES: u64 = 20_000;
    let writer = std::thread::spawn(move || {
        let mut tensor = TensorHeader {
            dtype: Dtype::Uint8,
            major_order: MajorOrder::Row,
            ndims: 1,
            ..TensorHeader::default()
        };
        tensor.dims[0] = 32;
        for seq in 0..FRAMES {
            // Payload bytes all equal to a sequence-derived marker, so a
            // torn read is detectable as a mixed buffer.
            let payload = [(seq % 251) as u8; 32];
            producer
                .offer_frame(
                    &Frame {
                        tensor: &tensor,
                        payload: &payload,
                        trace_id: 0,
                    },
                    &FrameMetadata::default(),
                )
                .unwrap();
        }
        producer
    });

    let mut payload = Vec::new();
    let mut clean_reads = 0u64;
    while clean_reads < 2_000 {
        let seq = u64::from(fastrand::u32(0..FRAMES as u32));
        match consumer.read_frame_copy(seq, &mut payload) {
            Ok(_info) => {
                let marker = (seq % 251) as u8;
                assert!(
                    payload.iter().all(|b| *b == marker),
                    "torn read at seq {seq}"
                );
                clean_reads += 1;
            }
            Err(TpError::NotReady | TpError::GapOrLate) => {}
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }

    writer.join().unwrap();
}
