// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Client-side cores: context, cooperative loop, producer, consumer, and
//! the producer-owned consumer registry.

pub mod client;
pub mod consumer;
pub mod context;
pub mod manager;
pub mod metadata;
pub mod producer;
pub mod progress;
pub mod registry;

pub use client::{Agent, Client};
pub use consumer::{
    Consumer, ConsumerAttachConfig, ConsumerOptions, ConsumerPoolConfig, ConsumerState, FrameInfo,
    FrameView,
};
pub use context::{ClientContext, ErrorHandler};
pub use manager::ConsumerManager;
pub use metadata::{encode_blob, fnv1a, MetaBlobCollector};
pub use producer::{
    BufferClaim, Frame, FrameMetadata, PoolConfig, Producer, ProducerConfig, ProducerOptions,
};
pub use progress::{ProgressPolicy, ProgressThrottle};
pub use registry::{ConsumerEntry, ConsumerRegistry};
