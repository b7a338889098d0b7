// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Directory service and its query client.

pub mod client;
pub mod service;

pub use client::DiscoveryClient;
pub use service::{DiscoveryConfig, DiscoveryService};
