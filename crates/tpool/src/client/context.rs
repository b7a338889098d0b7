// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Client configuration.
//!
//! One [`ClientContext`] configures everything a client process needs:
//! the fabric handle, the base channel with its stream-id plan, the SHM
//! allowlist, lease timing, and the error handler invoked on lease
//! revocation or driver shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::TpError;
use crate::fabric::{IdleStrategy, MemFabric, StreamAddr};
use crate::shm::AllowedPaths;
use crate::types::{
    ANNOUNCE_PERIOD_DEFAULT_NS, NULL_U32, STREAM_ID_ANNOUNCE, STREAM_ID_CONTROL,
    STREAM_ID_DESCRIPTOR, STREAM_ID_DRIVER_EVENTS, STREAM_ID_DRIVER_REQUEST, STREAM_ID_METADATA,
    STREAM_ID_QOS,
};

/// Callback receiving surfaced failures (revocation, shutdown).
pub type ErrorHandler = Arc<dyn Fn(&TpError, &str) + Send + Sync>;

/// Client-wide configuration with builder-style setters.
#[derive(Clone)]
pub struct ClientContext {
    fabric: Arc<MemFabric>,
    pub client_id: u32,
    base_channel: String,
    control_stream_id: u32,
    announce_stream_id: u32,
    descriptor_stream_id: u32,
    qos_stream_id: u32,
    metadata_stream_id: u32,
    driver_request_stream_id: u32,
    driver_events_stream_id: u32,
    pub shm_base_path: PathBuf,
    pub allowed_paths: AllowedPaths,
    pub keepalive_interval_ns: u64,
    pub lease_expiry_grace_intervals: u32,
    pub announce_period_ns: u64,
    /// Round-trip allowance for request/response exchanges with the driver.
    pub message_timeout_ns: u64,
    pub idle_strategy: IdleStrategy,
    /// Drive subordinate agents from `Client::do_work` instead of
    /// requiring the application to poll each one.
    pub use_conductor_invoker: bool,
    pub error_handler: Option<ErrorHandler>,
}

impl ClientContext {
    /// Defaults: `/dev/shm` allowlist, 1 s keepalive with 3 grace
    /// intervals, 1 s announce period, 2 s driver timeout.
    #[must_use]
    pub fn new(fabric: Arc<MemFabric>) -> Self {
        let shm_base_path = PathBuf::from("/dev/shm");
        Self {
            fabric,
            client_id: std::process::id(),
            base_channel: "fabric:mem?endpoint=local".to_string(),
            control_stream_id: NULL_U32,
            announce_stream_id: NULL_U32,
            descriptor_stream_id: NULL_U32,
            qos_stream_id: NULL_U32,
            metadata_stream_id: NULL_U32,
            driver_request_stream_id: NULL_U32,
            driver_events_stream_id: NULL_U32,
            allowed_paths: AllowedPaths::new([shm_base_path.clone()]),
            shm_base_path,
            keepalive_interval_ns: 1_000_000_000,
            lease_expiry_grace_intervals: 3,
            announce_period_ns: ANNOUNCE_PERIOD_DEFAULT_NS,
            message_timeout_ns: 2_000_000_000,
            idle_strategy: IdleStrategy::default(),
            use_conductor_invoker: false,
            error_handler: None,
        }
    }

    #[must_use]
    pub fn fabric(&self) -> &Arc<MemFabric> {
        &self.fabric
    }

    pub fn set_client_id(&mut self, client_id: u32) -> &mut Self {
        self.client_id = client_id;
        self
    }

    pub fn set_base_channel(&mut self, channel: impl Into<String>) -> &mut Self {
        self.base_channel = channel.into();
        self
    }

    #[must_use]
    pub fn base_channel(&self) -> &str {
        &self.base_channel
    }

    pub fn set_control_stream_id(&mut self, id: u32) -> &mut Self {
        self.control_stream_id = id;
        self
    }

    pub fn set_announce_stream_id(&mut self, id: u32) -> &mut Self {
        self.announce_stream_id = id;
        self
    }

    pub fn set_descriptor_stream_id(&mut self, id: u32) -> &mut Self {
        self.descriptor_stream_id = id;
        self
    }

    pub fn set_qos_stream_id(&mut self, id: u32) -> &mut Self {
        self.qos_stream_id = id;
        self
    }

    pub fn set_metadata_stream_id(&mut self, id: u32) -> &mut Self {
        self.metadata_stream_id = id;
        self
    }

    pub fn set_shm_base_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.shm_base_path = path.into();
        self
    }

    pub fn set_allowed_paths(&mut self, allowed: AllowedPaths) -> &mut Self {
        self.allowed_paths = allowed;
        self
    }

    pub fn set_keepalive_interval_ns(&mut self, interval: u64) -> &mut Self {
        self.keepalive_interval_ns = interval;
        self
    }

    pub fn set_lease_expiry_grace_intervals(&mut self, grace: u32) -> &mut Self {
        self.lease_expiry_grace_intervals = grace;
        self
    }

    pub fn set_announce_period_ns(&mut self, period: u64) -> &mut Self {
        self.announce_period_ns = period;
        self
    }

    pub fn set_message_timeout_ns(&mut self, timeout: u64) -> &mut Self {
        self.message_timeout_ns = timeout;
        self
    }

    pub fn set_idle_strategy(&mut self, strategy: IdleStrategy) -> &mut Self {
        self.idle_strategy = strategy;
        self
    }

    pub fn set_use_conductor_invoker(&mut self, enabled: bool) -> &mut Self {
        self.use_conductor_invoker = enabled;
        self
    }

    pub fn set_error_handler(&mut self, handler: ErrorHandler) -> &mut Self {
        self.error_handler = Some(handler);
        self
    }

    /// Surface a non-local failure through the installed handler.
    pub(crate) fn surface_error(&self, error: &TpError, reason: &str) {
        if let Some(handler) = &self.error_handler {
            handler(error, reason);
        } else {
            log::error!("[CLIENT] {reason}: {error}");
        }
    }

    // Stream addressing. Explicit ids win; otherwise the default plan
    // applies on the base channel.

    #[must_use]
    pub fn control_addr(&self) -> StreamAddr {
        self.addr(self.control_stream_id, STREAM_ID_CONTROL)
    }

    #[must_use]
    pub fn announce_addr(&self) -> StreamAddr {
        self.addr(self.announce_stream_id, STREAM_ID_ANNOUNCE)
    }

    #[must_use]
    pub fn descriptor_addr(&self) -> StreamAddr {
        self.addr(self.descriptor_stream_id, STREAM_ID_DESCRIPTOR)
    }

    #[must_use]
    pub fn qos_addr(&self) -> StreamAddr {
        self.addr(self.qos_stream_id, STREAM_ID_QOS)
    }

    #[must_use]
    pub fn metadata_addr(&self) -> StreamAddr {
        self.addr(self.metadata_stream_id, STREAM_ID_METADATA)
    }

    #[must_use]
    pub fn driver_request_addr(&self) -> StreamAddr {
        self.addr(self.driver_request_stream_id, STREAM_ID_DRIVER_REQUEST)
    }

    #[must_use]
    pub fn driver_events_addr(&self) -> StreamAddr {
        self.addr(self.driver_events_stream_id, STREAM_ID_DRIVER_EVENTS)
    }

    /// Nanoseconds a lease stays valid after a keepalive.
    #[must_use]
    pub fn lease_validity_ns(&self) -> u64 {
        self.keepalive_interval_ns * u64::from(self.lease_expiry_grace_intervals)
    }

    fn addr(&self, configured: u32, fallback: u32) -> StreamAddr {
        let stream_id = if configured == NULL_U32 {
            fallback
        } else {
            configured
        };
        StreamAddr::new(self.base_channel.clone(), stream_id)
    }
}
