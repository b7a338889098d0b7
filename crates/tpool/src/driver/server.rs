// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Contract-level driver core.
//!
//! Implements exactly the policy surface clients depend on: SHM file
//! allocation, stream epochs, exclusive producer leases, layout-version
//! gating, hugepages gating, lease expiry, and node-id reuse cooldown.
//! Admin tooling and persistence live outside this crate.
//!
//! # Policy
//!
//! 1. `expected_layout_version` must match the driver's, else `REJECTED`.
//! 2. One live producer lease per stream.
//! 3. `REQUIRE_EXISTING` fails for streams never created in this driver
//!    instance (post-cooldown wipes count as never-existed).
//! 4. `HUGEPAGES` is refused unless the SHM base dir is hugetlbfs.
//! 5. Detach or expiry puts `(stream, node_id)` into a cooldown during
//!    which the same desired node id is refused.
//! 6. Expired leases emit `lease_revoked(EXPIRED)` on the events stream.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::client::client::Agent;
use crate::client::context::ClientContext;
use crate::fabric::{FragmentAssembler, Publication, Subscription};
use crate::shm::{create_region_file, Superblock};
use crate::types::{
    HugepagesPolicy, LeaseRevokedReason, PublishMode, RegionType, ResponseCode, Role,
    HEADER_SLOT_BYTES, LAYOUT_VERSION, MAX_DIMS, NULL_U32,
};
use crate::wire::driver::{
    AttachPoolInfo, ShmAttachRequest, ShmAttachResponse, ShmDetachRequest, ShmDetachResponse,
    ShmDriverShutdown, ShmKeepalive, ShmLeaseRevoked,
};
use crate::wire::{peek_template_id, template, Decoded};
use crate::Result;

/// Payload pool layout the driver creates per stream.
#[derive(Debug, Clone, Copy)]
pub struct PoolPlan {
    pub pool_id: u16,
    pub stride_bytes: u32,
}

/// Driver policy knobs.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub shm_base_dir: PathBuf,
    pub layout_version: u32,
    pub header_nslots: u32,
    pub pool_plans: Vec<PoolPlan>,
    pub keepalive_interval_ns: u64,
    pub lease_expiry_grace_intervals: u32,
    pub node_cooldown_ns: u64,
    /// Whether the base dir is hugetlbfs (checked by the daemon at boot).
    pub base_dir_is_hugetlbfs: bool,
}

impl DriverConfig {
    #[must_use]
    pub fn new(shm_base_dir: impl Into<PathBuf>) -> Self {
        Self {
            shm_base_dir: shm_base_dir.into(),
            layout_version: LAYOUT_VERSION,
            header_nslots: 64,
            pool_plans: vec![
                PoolPlan { pool_id: 1, stride_bytes: 4096 },
                PoolPlan { pool_id: 2, stride_bytes: 65536 },
            ],
            keepalive_interval_ns: 1_000_000_000,
            lease_expiry_grace_intervals: 3,
            node_cooldown_ns: 10_000_000_000,
            base_dir_is_hugetlbfs: false,
        }
    }

    fn lease_validity_ns(&self) -> u64 {
        self.keepalive_interval_ns * u64::from(self.lease_expiry_grace_intervals)
    }
}

#[derive(Debug, Clone)]
struct StreamState {
    epoch: u64,
    created: bool,
    header_region_uri: String,
    pools: Vec<AttachPoolInfo>,
    producer_lease: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    lease_id: u64,
    client_id: u32,
    stream_id: u32,
    role: Role,
    node_id: u32,
    expiry_ns: u64,
}

/// The driver state machine, fabric-agnostic for direct testing.
pub struct DriverCore {
    config: DriverConfig,
    streams: HashMap<u32, StreamState>,
    leases: HashMap<u64, Lease>,
    cooldowns: HashMap<(u32, u32), u64>,
    next_lease_id: u64,
    next_node_id: u32,
}

impl DriverCore {
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            streams: HashMap::new(),
            leases: HashMap::new(),
            cooldowns: HashMap::new(),
            next_lease_id: 1,
            next_node_id: 1,
        }
    }

    #[must_use]
    pub fn live_lease_count(&self) -> usize {
        self.leases.len()
    }

    /// Process one attach. Always returns a response; failures are carried
    /// in its `code`/`error_message`.
    pub fn handle_attach(&mut self, request: &ShmAttachRequest, now_ns: u64) -> ShmAttachResponse {
        match self.try_attach(request, now_ns) {
            Ok(response) => response,
            Err((code, message)) => ShmAttachResponse {
                correlation_id: request.correlation_id,
                code,
                error_message: message,
                ..ShmAttachResponse::default()
            },
        }
    }

    fn try_attach(
        &mut self,
        request: &ShmAttachRequest,
        now_ns: u64,
    ) -> std::result::Result<ShmAttachResponse, (ResponseCode, String)> {
        if request.stream_id == 0 {
            return Err((ResponseCode::InvalidParams, "stream id must be nonzero".into()));
        }
        if request.expected_layout_version != self.config.layout_version {
            return Err((
                ResponseCode::Rejected,
                format!(
                    "layout version {} not supported (driver has {})",
                    request.expected_layout_version, self.config.layout_version
                ),
            ));
        }
        if request.require_hugepages == HugepagesPolicy::Hugepages
            && !self.config.base_dir_is_hugetlbfs
        {
            return Err((
                ResponseCode::Rejected,
                "shm base dir is not hugetlbfs".into(),
            ));
        }

        // Node-id assignment with reuse cooldown.
        let node_id = if request.desired_node_id == NULL_U32 {
            let id = self.next_node_id;
            self.next_node_id += 1;
            id
        } else {
            let key = (request.stream_id, request.desired_node_id);
            if self.cooldowns.get(&key).is_some_and(|until| *until > now_ns) {
                return Err((
                    ResponseCode::Rejected,
                    format!("node id {} in reuse cooldown", request.desired_node_id),
                ));
            }
            request.desired_node_id
        };

        self.reap_dead_producer(request.stream_id, now_ns);

        let state = match request.role {
            Role::Producer => self.attach_producer(request, now_ns)?,
            Role::Consumer => self.attach_consumer(request)?,
        };

        let lease_id = self.next_lease_id;
        self.next_lease_id += 1;
        let expiry_ns = now_ns + self.config.lease_validity_ns();
        self.leases.insert(
            lease_id,
            Lease {
                lease_id,
                client_id: request.client_id,
                stream_id: request.stream_id,
                role: request.role,
                node_id,
                expiry_ns,
            },
        );
        if request.role == Role::Producer {
            if let Some(stream) = self.streams.get_mut(&request.stream_id) {
                stream.producer_lease = Some(lease_id);
            }
        }

        log::debug!(
            "[DRIVER] lease {lease_id:#x} issued: stream={} role={:?} node={node_id} epoch={}",
            request.stream_id,
            request.role,
            state.epoch
        );

        Ok(ShmAttachResponse {
            correlation_id: request.correlation_id,
            code: ResponseCode::Ok,
            lease_id,
            lease_expiry_timestamp_ns: expiry_ns,
            stream_id: request.stream_id,
            layout_version: self.config.layout_version,
            epoch: state.epoch,
            header_nslots: self.config.header_nslots,
            header_slot_bytes: HEADER_SLOT_BYTES as u16,
            max_dims: MAX_DIMS as u8,
            node_id,
            error_message: String::new(),
            header_region_uri: state.header_region_uri.clone(),
            pools: state.pools.clone(),
        })
    }

    /// Forget a producer lease that has silently expired, so the stream
    /// is attachable again even between sweep passes.
    fn reap_dead_producer(&mut self, stream_id: u32, now_ns: u64) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if let Some(lease_id) = stream.producer_lease {
            let dead = self
                .leases
                .get(&lease_id)
                .map_or(true, |lease| now_ns >= lease.expiry_ns);
            if dead {
                stream.producer_lease = None;
                if let Some(lease) = self.leases.remove(&lease_id) {
                    self.start_cooldown(&lease, now_ns);
                }
            }
        }
    }

    fn attach_producer(
        &mut self,
        request: &ShmAttachRequest,
        now_ns: u64,
    ) -> std::result::Result<StreamState, (ResponseCode, String)> {
        if let Some(stream) = self.streams.get(&request.stream_id) {
            if stream.producer_lease.is_some() {
                return Err((
                    ResponseCode::Rejected,
                    format!("stream {} already has a producer", request.stream_id),
                ));
            }
        }

        let created = self.streams.get(&request.stream_id).is_some_and(|s| s.created);
        match request.publish_mode {
            PublishMode::RequireExisting => {
                if !created {
                    return Err((
                        ResponseCode::Rejected,
                        format!("stream {} has never been created", request.stream_id),
                    ));
                }
                Ok(self.streams[&request.stream_id].clone())
            }
            PublishMode::ExistingOrCreate => {
                let next_epoch = self
                    .streams
                    .get(&request.stream_id)
                    .map_or(1, |s| s.epoch + 1);
                let state = self
                    .create_stream_files(request.stream_id, next_epoch, now_ns)
                    .map_err(|e| (ResponseCode::InternalError, e.to_string()))?;
                self.streams.insert(request.stream_id, state.clone());
                Ok(state)
            }
        }
    }

    fn attach_consumer(
        &mut self,
        request: &ShmAttachRequest,
    ) -> std::result::Result<StreamState, (ResponseCode, String)> {
        match self.streams.get(&request.stream_id) {
            Some(stream) if stream.created => Ok(stream.clone()),
            _ => Err((
                ResponseCode::Rejected,
                format!("stream {} does not exist", request.stream_id),
            )),
        }
    }

    fn create_stream_files(
        &self,
        stream_id: u32,
        epoch: u64,
        now_ns: u64,
    ) -> Result<StreamState> {
        let nslots = self.config.header_nslots;
        let header_path = self
            .config
            .shm_base_dir
            .join(format!("tp_{stream_id}_{epoch}_hdr"));
        let header_superblock = Superblock::new(
            stream_id,
            epoch,
            self.config.layout_version,
            RegionType::HeaderRing,
            0,
            nslots,
            HEADER_SLOT_BYTES as u32,
            0,
            now_ns,
        );
        create_region_file(&header_path, &header_superblock)?;

        let mut pools = Vec::with_capacity(self.config.pool_plans.len());
        for plan in &self.config.pool_plans {
            let pool_path = self
                .config
                .shm_base_dir
                .join(format!("tp_{stream_id}_{epoch}_pool{}", plan.pool_id));
            let pool_superblock = Superblock::new(
                stream_id,
                epoch,
                self.config.layout_version,
                RegionType::PayloadPool,
                plan.pool_id,
                nslots,
                0,
                plan.stride_bytes,
                now_ns,
            );
            create_region_file(&pool_path, &pool_superblock)?;
            pools.push(AttachPoolInfo {
                pool_id: plan.pool_id,
                nslots,
                stride_bytes: plan.stride_bytes,
                region_uri: format!("shm:file?path={}", pool_path.display()),
            });
        }

        Ok(StreamState {
            epoch,
            created: true,
            header_region_uri: format!("shm:file?path={}", header_path.display()),
            pools,
            producer_lease: None,
        })
    }

    /// Refresh a lease from a keepalive. Unknown leases are ignored (they
    /// raced an expiry sweep; the client learns from the revocation).
    pub fn handle_keepalive(&mut self, keepalive: &ShmKeepalive, now_ns: u64) {
        if let Some(lease) = self.leases.get_mut(&keepalive.lease_id) {
            lease.expiry_ns = now_ns + self.config.lease_validity_ns();
        }
    }

    pub fn handle_detach(&mut self, request: &ShmDetachRequest, now_ns: u64) -> ShmDetachResponse {
        let Some(lease) = self.leases.remove(&request.lease_id) else {
            return ShmDetachResponse {
                correlation_id: request.correlation_id,
                code: ResponseCode::Rejected,
                error_message: format!("unknown lease {:#x}", request.lease_id),
            };
        };

        self.release_lease(&lease, now_ns);
        ShmDetachResponse {
            correlation_id: request.correlation_id,
            code: ResponseCode::Ok,
            error_message: String::new(),
        }
    }

    fn release_lease(&mut self, lease: &Lease, now_ns: u64) {
        if lease.role == Role::Producer {
            if let Some(stream) = self.streams.get_mut(&lease.stream_id) {
                if stream.producer_lease == Some(lease.lease_id) {
                    stream.producer_lease = None;
                }
            }
        }
        self.start_cooldown(lease, now_ns);
    }

    fn start_cooldown(&mut self, lease: &Lease, now_ns: u64) {
        self.cooldowns.insert(
            (lease.stream_id, lease.node_id),
            now_ns + self.config.node_cooldown_ns,
        );
    }

    /// Revoke every lease past its expiry. Returns the revocations to be
    /// broadcast on the events stream.
    pub fn expire_leases(&mut self, now_ns: u64) -> Vec<ShmLeaseRevoked> {
        let expired: Vec<Lease> = self
            .leases
            .values()
            .filter(|l| now_ns >= l.expiry_ns)
            .copied()
            .collect();

        let mut revocations = Vec::with_capacity(expired.len());
        for lease in expired {
            self.leases.remove(&lease.lease_id);
            self.release_lease(&lease, now_ns);
            log::warn!(
                "[DRIVER] lease {:#x} expired (stream {}, client {})",
                lease.lease_id,
                lease.stream_id,
                lease.client_id
            );
            revocations.push(ShmLeaseRevoked {
                lease_id: lease.lease_id,
                stream_id: lease.stream_id,
                reason: LeaseRevokedReason::Expired,
                timestamp_ns: now_ns,
            });
        }
        revocations
    }

    /// Revoke everything for shutdown. Returns the revocations followed by
    /// the shutdown notice the caller broadcasts.
    pub fn shutdown(&mut self, now_ns: u64) -> (Vec<ShmLeaseRevoked>, ShmDriverShutdown) {
        let leases: Vec<Lease> = self.leases.values().copied().collect();
        let mut revocations = Vec::with_capacity(leases.len());
        for lease in leases {
            self.leases.remove(&lease.lease_id);
            self.release_lease(&lease, now_ns);
            revocations.push(ShmLeaseRevoked {
                lease_id: lease.lease_id,
                stream_id: lease.stream_id,
                reason: LeaseRevokedReason::Shutdown,
                timestamp_ns: now_ns,
            });
        }
        (revocations, ShmDriverShutdown { timestamp_ns: now_ns })
    }

    /// Forget a stream entirely; subsequent `REQUIRE_EXISTING` attaches
    /// treat it as never created.
    pub fn wipe_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }
}

/// Fabric-facing wrapper driving a [`DriverCore`] from the request stream.
pub struct DriverService {
    core: DriverCore,
    request_subscription: Subscription,
    events_publication: Publication,
    assembler: FragmentAssembler,
    last_expiry_sweep_ns: u64,
    expiry_sweep_interval_ns: u64,
}

impl DriverService {
    pub fn new(context: &ClientContext, config: DriverConfig) -> Self {
        let fabric = context.fabric();
        let expiry_sweep_interval_ns = config.keepalive_interval_ns / 2;
        Self {
            core: DriverCore::new(config),
            request_subscription: fabric.add_subscription(context.driver_request_addr()),
            events_publication: fabric.add_publication(context.driver_events_addr()),
            assembler: FragmentAssembler::new(),
            last_expiry_sweep_ns: 0,
            expiry_sweep_interval_ns: expiry_sweep_interval_ns.max(1),
        }
    }

    #[must_use]
    pub fn core(&self) -> &DriverCore {
        &self.core
    }

    #[must_use]
    pub fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn offer(&self, buf: &[u8]) {
        // Events are best-effort; clients recover via timeouts and leases.
        if !self.events_publication.offer(buf).is_ok() {
            log::warn!("[DRIVER] events stream offer failed");
        }
    }

    fn dispatch(&mut self, message: &[u8], now_ns: u64) -> Result<()> {
        let mut buf = vec![0u8; 16384];
        match peek_template_id(message)? {
            template::SHM_ATTACH_REQUEST => {
                if let Decoded::Msg(request) = ShmAttachRequest::decode(message)? {
                    let response = self.core.handle_attach(&request, now_ns);
                    let len = response.encode(&mut buf)?;
                    self.offer(&buf[..len]);
                }
            }
            template::SHM_KEEPALIVE => {
                if let Decoded::Msg(keepalive) = ShmKeepalive::decode(message)? {
                    self.core.handle_keepalive(&keepalive, now_ns);
                }
            }
            template::SHM_DETACH_REQUEST => {
                if let Decoded::Msg(request) = ShmDetachRequest::decode(message)? {
                    let response = self.core.handle_detach(&request, now_ns);
                    let len = response.encode(&mut buf)?;
                    self.offer(&buf[..len]);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Broadcast shutdown and revoke everything.
    pub fn shutdown(&mut self, now_ns: u64) -> Result<()> {
        let (revocations, shutdown) = self.core.shutdown(now_ns);
        let mut buf = [0u8; 128];
        for revoked in revocations {
            let len = revoked.encode(&mut buf)?;
            self.offer(&buf[..len]);
        }
        let len = shutdown.encode(&mut buf)?;
        self.offer(&buf[..len]);
        Ok(())
    }
}

impl Agent for DriverService {
    fn do_work(&mut self, now_ns: u64) -> Result<usize> {
        let mut work = 0;

        for fragment in self.request_subscription.poll(32) {
            if let Some(message) = self.assembler.push(fragment)? {
                self.dispatch(&message, now_ns)?;
                work += 1;
            }
        }

        if now_ns.saturating_sub(self.last_expiry_sweep_ns) >= self.expiry_sweep_interval_ns {
            self.last_expiry_sweep_ns = now_ns;
            let mut buf = [0u8; 128];
            for revoked in self.core.expire_leases(now_ns) {
                let len = revoked.encode(&mut buf)?;
                self.offer(&buf[..len]);
                work += 1;
            }
        }

        Ok(work)
    }
}
