// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Consumer lifecycle over the fabric: hello, config reply, dedicated
//! descriptor streams with rate limiting, and progress delivery.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tpool::client::{
    ClientContext, Consumer, ConsumerAttachConfig, ConsumerOptions, ConsumerPoolConfig, Frame,
    FrameMetadata, PoolConfig, Producer, ProducerConfig, ProducerOptions,
};
use tpool::fabric::MemFabric;
use tpool::shm::{create_region_file, AllowedPaths, Superblock};
use tpool::types::{Dtype, MajorOrder, Mode, ProgressState, RegionType, TensorHeader};
use tpool::wire::control::FrameProgress;

const STREAM_ID: u32 = 10_000;

fn create_regions(dir: &Path) {
    let header = Superblock::new(STREAM_ID, 1, 1, RegionType::HeaderRing, 0, 8, 256, 0, 1);
    create_region_file(&dir.join("tp_hdr"), &header).unwrap();
    let pool = Superblock::new(STREAM_ID, 1, 1, RegionType::PayloadPool, 1, 8, 0, 64, 1);
    create_region_file(&dir.join("tp_pool1"), &pool).unwrap();
}

fn context(dir: &Path, fabric: Arc<MemFabric>) -> ClientContext {
    let mut context = ClientContext::new(fabric);
    context
        .set_shm_base_path(dir)
        .set_allowed_paths(AllowedPaths::new([dir]));
    context
}

fn producer_config(dir: &Path) -> ProducerConfig {
    ProducerConfig {
        stream_id: STREAM_ID,
        producer_id: 1,
        epoch: 1,
        layout_version: 1,
        header_nslots: 8,
        header_uri: format!("shm:file?path={}/tp_hdr", dir.display()),
        pools: vec![PoolConfig {
            pool_id: 1,
            nslots: 8,
            stride_bytes: 64,
            uri: format!("shm:file?path={}/tp_pool1", dir.display()),
        }],
    }
}

fn consumer_attach_config(dir: &Path) -> ConsumerAttachConfig {
    ConsumerAttachConfig {
        stream_id: STREAM_ID,
        epoch: 1,
        layout_version: 1,
        header_nslots: 8,
        header_uri: format!("shm:file?path={}/tp_hdr", dir.display()),
        pools: vec![ConsumerPoolConfig {
            pool_id: 1,
            nslots: 8,
            stride_bytes: 64,
            uri: format!("shm:file?path={}/tp_pool1", dir.display()),
        }],
    }
}

fn tensor() -> TensorHeader {
    let mut tensor = TensorHeader {
        dtype: Dtype::Uint8,
        major_order: MajorOrder::Row,
        ndims: 1,
        ..TensorHeader::default()
    };
    tensor.dims[0] = 4;
    tensor
}

#[test]
fn hello_gets_config_reply_with_fallback_uri() {
    let dir = tempfile::tempdir().unwrap();
    create_regions(dir.path());
    let fabric = MemFabric::new();
    let context = context(dir.path(), Arc::clone(&fabric));

    let mut options = ProducerOptions::new(STREAM_ID, 1);
    options.payload_fallback_uri = "fabric:mem?endpoint=fallback".to_string();
    let mut producer = Producer::new(&context, options).unwrap();
    producer.attach(&producer_config(dir.path())).unwrap();
    producer.enable_consumer_manager(8).unwrap();

    let mut consumer = Consumer::new(&context, ConsumerOptions::new(STREAM_ID, 7)).unwrap();
    consumer.attach(&consumer_attach_config(dir.path())).unwrap();

    consumer.send_hello().unwrap();
    producer.poll_control(16).unwrap();
    consumer.poll_control(16).unwrap();

    assert_eq!(consumer.payload_fallback_uri(), "fabric:mem?endpoint=fallback");
    assert_eq!(producer.consumer_manager().unwrap().registry().len(), 1);
}

#[test]
fn rate_limited_consumer_on_dedicated_stream() {
    let dir = tempfile::tempdir().unwrap();
    create_regions(dir.path());
    let fabric = MemFabric::new();
    let context = context(dir.path(), Arc::clone(&fabric));

    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1)).unwrap();
    producer.attach(&producer_config(dir.path())).unwrap();
    producer.enable_consumer_manager(8).unwrap();

    // A streaming consumer keeps the shared descriptor stream connected.
    let mut streaming = Consumer::new(&context, ConsumerOptions::new(STREAM_ID, 1)).unwrap();
    streaming.attach(&consumer_attach_config(dir.path())).unwrap();

    // A rate-limited consumer on its own stream: 20 Hz.
    let mut options = ConsumerOptions::new(STREAM_ID, 2);
    options.mode = Mode::RateLimited;
    options.max_rate_hz = 20;
    options.descriptor_channel = "fabric:mem?endpoint=c2".to_string();
    options.descriptor_stream_id = 5000;
    let mut limited = Consumer::new(&context, options).unwrap();
    limited.attach(&consumer_attach_config(dir.path())).unwrap();

    limited.send_hello().unwrap();
    producer.poll_control(16).unwrap();

    // Publish a burst well above the limit.
    let tensor = tensor();
    for _ in 0..50 {
        producer
            .offer_frame(
                &Frame {
                    tensor: &tensor,
                    payload: &[1, 2, 3, 4],
                    trace_id: 0,
                },
                &FrameMetadata::default(),
            )
            .unwrap();
    }

    let streamed = streaming.poll_descriptors(128).unwrap();
    let limited_count = limited.poll_descriptors(128).unwrap();
    assert_eq!(streamed, 50);
    // The burst lands within one rate window, so at most one descriptor
    // passes the 20 Hz gate.
    assert!(limited_count <= 1, "rate limit leaked {limited_count}");
}

#[test]
fn stale_consumer_swept_and_policy_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    create_regions(dir.path());
    let fabric = MemFabric::new();
    let context = context(dir.path(), Arc::clone(&fabric));

    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1)).unwrap();
    producer.attach(&producer_config(dir.path())).unwrap();
    producer.enable_consumer_manager(8).unwrap();

    let mut options = ConsumerOptions::new(STREAM_ID, 3);
    options.supports_progress = true;
    options.progress_interval_us = 10;
    let consumer = Consumer::new(&context, options).unwrap();
    consumer.send_hello().unwrap();
    producer.poll_control(16).unwrap();

    {
        let manager = producer.consumer_manager().unwrap();
        assert_eq!(manager.registry().len(), 1);
        assert_eq!(manager.policy().interval_us, 10);
    }

    // A sweep far past the stale window evicts the entry and the policy
    // falls back to defaults.
    assert_eq!(producer.sweep_consumers(u64::MAX / 2), 1);

    let manager = producer.consumer_manager().unwrap();
    assert_eq!(manager.registry().len(), 0);
    assert_eq!(manager.policy().interval_us, 250);
}

#[test]
fn progress_records_reach_consumer_handler() {
    let dir = tempfile::tempdir().unwrap();
    create_regions(dir.path());
    let fabric = MemFabric::new();
    let context = context(dir.path(), Arc::clone(&fabric));

    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1)).unwrap();
    producer.attach(&producer_config(dir.path())).unwrap();
    producer.enable_consumer_manager(8).unwrap();

    let mut options = ConsumerOptions::new(STREAM_ID, 4);
    options.supports_progress = true;
    let mut consumer = Consumer::new(&context, options).unwrap();
    consumer.attach(&consumer_attach_config(dir.path())).unwrap();

    let records: Arc<Mutex<Vec<FrameProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&records);
    consumer.set_progress_handler(Box::new(move |progress| {
        sink.lock().unwrap().push(*progress);
    }));

    consumer.send_hello().unwrap();
    producer.poll_control(16).unwrap();

    // Started always goes out; Complete always goes out.
    assert!(producer.offer_progress(0, 0, ProgressState::Started, 0).unwrap());
    assert!(producer.offer_progress(0, 64, ProgressState::Complete, 0).unwrap());

    consumer.poll_progress(16).unwrap();
    let records = records.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].state, ProgressState::Started);
    assert_eq!(records[1].state, ProgressState::Complete);
    assert_eq!(records[1].payload_bytes_filled, 64);
}
