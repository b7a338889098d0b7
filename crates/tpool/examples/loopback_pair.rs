// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Loopback producer/consumer pair without a driver.
//!
//! Creates a header ring and one payload pool in a temp directory, then
//! streams a handful of FLOAT32 2x2 frames from a producer to a consumer
//! in the same process.
//!
//! ```text
//! cargo run --example loopback_pair
//! ```

use std::sync::{Arc, Mutex};

use tpool::client::{
    ClientContext, Consumer, ConsumerAttachConfig, ConsumerOptions, ConsumerPoolConfig, Frame,
    FrameMetadata, PoolConfig, Producer, ProducerConfig, ProducerOptions,
};
use tpool::fabric::MemFabric;
use tpool::shm::{create_region_file, AllowedPaths, Superblock};
use tpool::types::{Dtype, MajorOrder, RegionType, TensorHeader};

const STREAM_ID: u32 = 10_000;
const NSLOTS: u32 = 8;
const STRIDE: u32 = 64;

fn main() -> tpool::Result<()> {
    env_logger::init();

    let dir = std::env::temp_dir().join(format!("tpool-example-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;

    let header_path = dir.join("tp_hdr");
    create_region_file(
        &header_path,
        &Superblock::new(STREAM_ID, 1, 1, RegionType::HeaderRing, 0, NSLOTS, 256, 0, 0),
    )?;
    let pool_path = dir.join("tp_pool1");
    create_region_file(
        &pool_path,
        &Superblock::new(STREAM_ID, 1, 1, RegionType::PayloadPool, 1, NSLOTS, 0, STRIDE, 0),
    )?;

    let fabric = MemFabric::new();
    let mut context = ClientContext::new(fabric);
    context
        .set_shm_base_path(&dir)
        .set_allowed_paths(AllowedPaths::new([&dir]));

    let mut consumer = Consumer::new(&context, ConsumerOptions::new(STREAM_ID, 7))?;
    consumer.attach(&ConsumerAttachConfig {
        stream_id: STREAM_ID,
        epoch: 1,
        layout_version: 1,
        header_nslots: NSLOTS,
        header_uri: format!("shm:file?path={}", header_path.display()),
        pools: vec![ConsumerPoolConfig {
            pool_id: 1,
            nslots: NSLOTS,
            stride_bytes: STRIDE,
            uri: format!("shm:file?path={}", pool_path.display()),
        }],
    })?;

    let descriptors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&descriptors);
    consumer.set_descriptor_handler(Box::new(move |descriptor| {
        sink.lock().unwrap().push(*descriptor);
    }));

    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1))?;
    producer.attach(&ProducerConfig {
        stream_id: STREAM_ID,
        producer_id: 1,
        epoch: 1,
        layout_version: 1,
        header_nslots: NSLOTS,
        header_uri: format!("shm:file?path={}", header_path.display()),
        pools: vec![PoolConfig {
            pool_id: 1,
            nslots: NSLOTS,
            stride_bytes: STRIDE,
            uri: format!("shm:file?path={}", pool_path.display()),
        }],
    })?;

    let mut tensor = TensorHeader {
        dtype: Dtype::Float32,
        major_order: MajorOrder::Row,
        ndims: 2,
        ..TensorHeader::default()
    };
    tensor.dims[0] = 2;
    tensor.dims[1] = 2;

    for i in 0..5u32 {
        let values = [i as f32, 2.0, 3.0, 4.0];
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let seq = producer.offer_frame(
            &Frame {
                tensor: &tensor,
                payload: &payload,
                trace_id: 0,
            },
            &FrameMetadata::default(),
        )?;
        println!("published seq {seq}");
    }

    consumer.poll_descriptors(16)?;
    for descriptor in descriptors.lock().unwrap().iter() {
        let view = consumer.read_frame(descriptor.seq)?;
        let first = f32::from_le_bytes(view.payload[0..4].try_into().unwrap());
        println!(
            "read seq {} trace {:#x}: first element {first}",
            descriptor.seq, descriptor.trace_id
        );
    }

    let (gap, late, last) = consumer.drop_counts();
    println!("drops: gap={gap} late={late} last_seen={last}");

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}
