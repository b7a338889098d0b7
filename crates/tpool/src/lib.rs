// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! # tensor-pool: zero-copy tensor streaming over shared memory
//!
//! Producers publish fixed-layout tensor frames into shared-memory ring
//! regions; consumers read them in place by sequence number. Control
//! traffic, frame descriptors, QoS, metadata, and discovery ride an
//! ordered messaging fabric; tensor payloads never leave shared memory.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tpool::client::{ClientContext, Frame, FrameMetadata, Producer, ProducerOptions};
//! use tpool::fabric::MemFabric;
//! use tpool::types::{Dtype, MajorOrder, TensorHeader};
//!
//! fn main() -> tpool::Result<()> {
//!     let fabric = MemFabric::new();
//!     let context = ClientContext::new(fabric);
//!
//!     let mut producer = Producer::new(&context, ProducerOptions::new(10_000, 1))?;
//!     producer.attach_via_driver(tpool::types::PublishMode::ExistingOrCreate)?;
//!
//!     let mut tensor = TensorHeader {
//!         dtype: Dtype::Float32,
//!         major_order: MajorOrder::Row,
//!         ndims: 2,
//!         ..TensorHeader::default()
//!     };
//!     tensor.dims[0] = 2;
//!     tensor.dims[1] = 2;
//!
//!     let payload = [1.0f32, 2.0, 3.0, 4.0];
//!     let bytes: Vec<u8> = payload.iter().flat_map(|v| v.to_le_bytes()).collect();
//!     let seq = producer.offer_frame(
//!         &Frame { tensor: &tensor, payload: &bytes, trace_id: 0 },
//!         &FrameMetadata::default(),
//!     )?;
//!     println!("published seq {seq}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |  Producer                    Consumers                       |
//! |  offer/claim/commit          descriptor -> read_frame        |
//! +--------------------------------------------------------------+
//! |  SHM regions: superblock | header ring (seqlock slots)       |
//! |                          | payload pools (fixed stride)      |
//! +--------------------------------------------------------------+
//! |  Fabric: control | announce | descriptor | qos | metadata    |
//! |          driver control | discovery request/response         |
//! +--------------------------------------------------------------+
//! |  Driver: leases, epochs, exclusivity    Directory: queries   |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Modules
//!
//! - [`client`]: producer, consumer, context, cooperative loop
//! - [`shm`]: region mapping, superblocks, slots, the seqlock
//! - [`wire`]: every fabric message codec
//! - [`fabric`]: the ordered transport abstraction
//! - [`driver`]: lease client and contract-level driver core
//! - [`discovery`]: directory service and query client
//! - [`trace`]: trace-id generation and tracelink validation

pub mod client;
pub mod clock;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod fabric;
pub mod shm;
pub mod trace;
pub mod types;
pub mod wire;

pub use error::TpError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TpError>;
