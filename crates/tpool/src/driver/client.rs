// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Driver client: attach, keepalive, detach, and event delivery.
//!
//! Requests ride the driver request stream; responses and unsolicited
//! events (lease revocation, shutdown) come back on the driver events
//! stream, disambiguated by correlation id. Both sync and async shapes
//! are offered; the sync calls drive the same async machinery against a
//! deadline and therefore need the driver running on another thread or
//! process.

use std::collections::VecDeque;

use crate::clock;
use crate::client::context::ClientContext;
use crate::error::TpError;
use crate::fabric::{FragmentAssembler, Publication, Subscription};
use crate::types::{ResponseCode, Role};
use crate::wire::driver::{
    ShmAttachRequest, ShmAttachResponse, ShmDetachRequest, ShmDetachResponse, ShmDriverShutdown,
    ShmKeepalive, ShmLeaseRevoked,
};
use crate::wire::{peek_template_id, template, Decoded};
use crate::Result;

/// Outcome of polling an async operation.
#[derive(Debug)]
pub enum AsyncPoll<T> {
    NotReady,
    Ready(T),
}

/// Token for an in-flight attach. Cancel by dropping and calling
/// [`DriverClient::cancel_attach`], or simply ignore it; the entry is
/// garbage-collected at its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachToken {
    correlation_id: i64,
    deadline_ns: u64,
}

/// Token for an in-flight detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachToken {
    correlation_id: i64,
    deadline_ns: u64,
}

/// Unsolicited driver events surfaced to the owning producer/consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    LeaseRevoked(ShmLeaseRevoked),
    Shutdown(ShmDriverShutdown),
}

/// Lease bookkeeping owned by the client.
#[derive(Debug, Clone, Copy)]
pub struct LeaseState {
    pub lease_id: u64,
    pub stream_id: u32,
    pub role: Role,
    pub node_id: u32,
    pub expiry_ns: u64,
    pub last_keepalive_ns: u64,
    pub keepalive_interval_ns: u64,
    pub grace_intervals: u32,
}

impl LeaseState {
    /// True when a keepalive must go out now to stay inside the interval,
    /// allowing `rtt_allowance_ns` for the message to arrive.
    #[must_use]
    pub fn keepalive_due(&self, now_ns: u64, rtt_allowance_ns: u64) -> bool {
        now_ns + rtt_allowance_ns >= self.last_keepalive_ns + self.keepalive_interval_ns
    }

    /// Record a sent keepalive and extend the expiry horizon.
    pub fn record_keepalive(&mut self, now_ns: u64) {
        self.last_keepalive_ns = now_ns;
        self.expiry_ns =
            now_ns + self.keepalive_interval_ns * u64::from(self.grace_intervals);
    }

    #[must_use]
    pub fn is_expired(&self, now_ns: u64) -> bool {
        now_ns >= self.expiry_ns
    }
}

enum Pending {
    Attach {
        token: AttachToken,
        response: Option<ShmAttachResponse>,
    },
    Detach {
        token: DetachToken,
        response: Option<ShmDetachResponse>,
    },
}

pub struct DriverClient {
    request_publication: Publication,
    events_subscription: Subscription,
    assembler: FragmentAssembler,
    client_id: u32,
    timeout_ns: u64,
    keepalive_interval_ns: u64,
    grace_intervals: u32,
    pending: Vec<Pending>,
    events: VecDeque<DriverEvent>,
    lease: Option<LeaseState>,
}

impl DriverClient {
    pub fn new(context: &ClientContext) -> Self {
        let fabric = context.fabric();
        Self {
            request_publication: fabric.add_publication(context.driver_request_addr()),
            events_subscription: fabric.add_subscription(context.driver_events_addr()),
            assembler: FragmentAssembler::new(),
            client_id: context.client_id,
            timeout_ns: context.message_timeout_ns,
            keepalive_interval_ns: context.keepalive_interval_ns,
            grace_intervals: context.lease_expiry_grace_intervals,
            pending: Vec::new(),
            events: VecDeque::new(),
            lease: None,
        }
    }

    #[must_use]
    pub fn lease(&self) -> Option<&LeaseState> {
        self.lease.as_ref()
    }

    pub fn clear_lease(&mut self) {
        self.lease = None;
    }

    /// Correlation ids are process-unique: every client on the shared
    /// events stream sees every response and must never mistake another
    /// client's for its own.
    fn next_correlation(&mut self) -> i64 {
        use std::sync::atomic::{AtomicI64, Ordering};
        static NEXT: AtomicI64 = AtomicI64::new(1);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    /// Start an attach. The request's correlation id is assigned here.
    pub fn attach_async(&mut self, mut request: ShmAttachRequest) -> Result<AttachToken> {
        request.correlation_id = self.next_correlation();
        request.client_id = self.client_id;

        let mut buf = [0u8; 64];
        let len = request.encode(&mut buf)?;
        self.request_publication.offer(&buf[..len]).into_result()?;

        let token = AttachToken {
            correlation_id: request.correlation_id,
            deadline_ns: clock::now_monotonic_ns() + self.timeout_ns,
        };
        self.pending.push(Pending::Attach {
            token,
            response: None,
        });
        Ok(token)
    }

    /// Poll an attach. `Ready` carries the full response; callers inspect
    /// `code` for rejection. Timing out removes the pending entry.
    pub fn attach_poll(&mut self, token: AttachToken) -> Result<AsyncPoll<ShmAttachResponse>> {
        self.drain_events()?;

        let index = self
            .pending
            .iter()
            .position(|p| matches!(p, Pending::Attach { token: t, .. } if *t == token))
            .ok_or_else(|| TpError::Config("unknown attach token".into()))?;

        if let Pending::Attach { response, .. } = &mut self.pending[index] {
            if let Some(response) = response.take() {
                self.pending.swap_remove(index);
                if response.code == ResponseCode::Ok {
                    self.lease = Some(LeaseState {
                        lease_id: response.lease_id,
                        stream_id: response.stream_id,
                        role: Role::Producer, // overwritten below from request side
                        node_id: response.node_id,
                        expiry_ns: response.lease_expiry_timestamp_ns,
                        last_keepalive_ns: clock::now_monotonic_ns(),
                        keepalive_interval_ns: self.keepalive_interval_ns,
                        grace_intervals: self.grace_intervals,
                    });
                }
                return Ok(AsyncPoll::Ready(response));
            }
        }

        if clock::now_monotonic_ns() >= token.deadline_ns {
            self.pending.swap_remove(index);
            return Err(TpError::Timeout);
        }
        Ok(AsyncPoll::NotReady)
    }

    /// Drop an in-flight attach; its late response is discarded.
    pub fn cancel_attach(&mut self, token: AttachToken) {
        self.pending
            .retain(|p| !matches!(p, Pending::Attach { token: t, .. } if *t == token));
    }

    /// Blocking attach: drives [`Self::attach_poll`] against the deadline.
    pub fn attach(&mut self, request: ShmAttachRequest, role: Role) -> Result<ShmAttachResponse> {
        let token = self.attach_async(request)?;
        loop {
            match self.attach_poll(token)? {
                AsyncPoll::Ready(response) => {
                    if let Some(lease) = self.lease.as_mut() {
                        lease.role = role;
                    }
                    return Ok(response);
                }
                AsyncPoll::NotReady => std::thread::sleep(std::time::Duration::from_micros(50)),
            }
        }
    }

    /// Record the role on the lease after an async attach completes.
    pub fn set_lease_role(&mut self, role: Role) {
        if let Some(lease) = self.lease.as_mut() {
            lease.role = role;
        }
    }

    /// Send a keepalive for the held lease and extend its expiry.
    pub fn keepalive(&mut self, now_ns: u64) -> Result<()> {
        let lease = self.lease.ok_or(TpError::LeaseExpired)?;
        let keepalive = ShmKeepalive {
            lease_id: lease.lease_id,
            stream_id: lease.stream_id,
            client_id: self.client_id,
            role: lease.role,
            timestamp_ns: now_ns,
        };
        let mut buf = [0u8; 64];
        let len = keepalive.encode(&mut buf)?;
        self.request_publication.offer(&buf[..len]).into_result()?;
        if let Some(lease) = self.lease.as_mut() {
            lease.record_keepalive(now_ns);
        }
        Ok(())
    }

    /// True when the periodic loop should send a keepalive now.
    #[must_use]
    pub fn keepalive_due(&self, now_ns: u64, rtt_allowance_ns: u64) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| l.keepalive_due(now_ns, rtt_allowance_ns))
    }

    /// Start a detach for the held lease.
    pub fn detach_async(&mut self) -> Result<DetachToken> {
        let lease = self.lease.ok_or(TpError::LeaseExpired)?;
        let correlation_id = self.next_correlation();
        let request = ShmDetachRequest {
            correlation_id,
            lease_id: lease.lease_id,
            stream_id: lease.stream_id,
            client_id: self.client_id,
            role: lease.role,
        };
        let mut buf = [0u8; 64];
        let len = request.encode(&mut buf)?;
        self.request_publication.offer(&buf[..len]).into_result()?;

        let token = DetachToken {
            correlation_id,
            deadline_ns: clock::now_monotonic_ns() + self.timeout_ns,
        };
        self.pending.push(Pending::Detach {
            token,
            response: None,
        });
        Ok(token)
    }

    pub fn detach_poll(&mut self, token: DetachToken) -> Result<AsyncPoll<ShmDetachResponse>> {
        self.drain_events()?;

        let index = self
            .pending
            .iter()
            .position(|p| matches!(p, Pending::Detach { token: t, .. } if *t == token))
            .ok_or_else(|| TpError::Config("unknown detach token".into()))?;

        if let Pending::Detach { response, .. } = &mut self.pending[index] {
            if let Some(response) = response.take() {
                self.pending.swap_remove(index);
                self.lease = None;
                return Ok(AsyncPoll::Ready(response));
            }
        }

        if clock::now_monotonic_ns() >= token.deadline_ns {
            self.pending.swap_remove(index);
            return Err(TpError::Timeout);
        }
        Ok(AsyncPoll::NotReady)
    }

    /// Blocking detach.
    pub fn detach(&mut self) -> Result<ShmDetachResponse> {
        let token = self.detach_async()?;
        loop {
            match self.detach_poll(token)? {
                AsyncPoll::Ready(response) => return Ok(response),
                AsyncPoll::NotReady => std::thread::sleep(std::time::Duration::from_micros(50)),
            }
        }
    }

    /// Drain the events stream and hand back unsolicited events relevant
    /// to this client (lease revocation for the held lease, shutdown).
    pub fn poll_events(&mut self) -> Result<Vec<DriverEvent>> {
        self.drain_events()?;
        Ok(self.events.drain(..).collect())
    }

    fn drain_events(&mut self) -> Result<()> {
        for fragment in self.events_subscription.poll(64) {
            let Some(message) = self.assembler.push(fragment)? else {
                continue;
            };
            self.dispatch(&message)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, message: &[u8]) -> Result<()> {
        match peek_template_id(message)? {
            template::SHM_ATTACH_RESPONSE => {
                if let Decoded::Msg(response) = ShmAttachResponse::decode(message)? {
                    for pending in &mut self.pending {
                        if let Pending::Attach { token, response: slot } = pending {
                            if token.correlation_id == response.correlation_id {
                                *slot = Some(response);
                                break;
                            }
                        }
                    }
                }
            }
            template::SHM_DETACH_RESPONSE => {
                if let Decoded::Msg(response) = ShmDetachResponse::decode(message)? {
                    for pending in &mut self.pending {
                        if let Pending::Detach { token, response: slot } = pending {
                            if token.correlation_id == response.correlation_id {
                                *slot = Some(response);
                                break;
                            }
                        }
                    }
                }
            }
            template::SHM_LEASE_REVOKED => {
                if let Decoded::Msg(revoked) = ShmLeaseRevoked::decode(message)? {
                    let ours = self
                        .lease
                        .as_ref()
                        .is_some_and(|l| l.lease_id == revoked.lease_id);
                    if ours {
                        log::warn!(
                            "[DRIVER] lease {:#x} revoked ({:?})",
                            revoked.lease_id,
                            revoked.reason
                        );
                        self.lease = None;
                        self.events.push_back(DriverEvent::LeaseRevoked(revoked));
                    }
                }
            }
            template::SHM_DRIVER_SHUTDOWN => {
                if let Decoded::Msg(shutdown) = ShmDriverShutdown::decode(message)? {
                    self.events.push_back(DriverEvent::Shutdown(shutdown));
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.request_publication.close();
        self.events_subscription.close();
        self.assembler.reset();
        self.pending.clear();
        self.lease = None;
    }
}
