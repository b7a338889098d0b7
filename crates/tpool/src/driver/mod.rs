// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Driver control plane: the client used by producers and consumers, and
//! the contract-level server core backing tests and the driver daemon.

pub mod client;
pub mod server;

pub use client::{AsyncPoll, AttachToken, DetachToken, DriverClient, DriverEvent, LeaseState};
pub use server::{DriverConfig, DriverCore, DriverService, PoolPlan};
