// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! In-process fabric implementation.
//!
//! Streams are `(channel, stream_id)` keys into a shared registry; each
//! subscription owns a bounded fragment queue fed by every publication on
//! the same stream. Per-publication FIFO holds because a publication
//! pushes a message's fragments contiguously under the subscriber list
//! lock. Large messages are fragmented at [`FABRIC_MTU`]; streams that
//! carry multi-fragment messages have a single publisher by construction
//! (producer metadata, directory responses), which keeps chains
//! contiguous per subscription.
//!
//! Back-pressure is real: a subscriber queue without room for the whole
//! fragment chain fails the offer with `BackPressured` and nothing is
//! enqueued anywhere.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::fabric::assembler::{fragment_message, Fragment};
use crate::fabric::{OfferOutcome, StreamAddr, FABRIC_MTU};
use crate::types::NULL_U64;

/// Default per-subscription fragment queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct SubscriberSlot {
    id: u64,
    sender: Sender<Fragment>,
    closed: Arc<AtomicBool>,
}

struct StreamCore {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    position: AtomicU64,
    admin_blocked: AtomicBool,
    /// `NULL_U64` = unlimited.
    max_position: AtomicU64,
    next_subscriber_id: AtomicU64,
}

impl StreamCore {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            position: AtomicU64::new(0),
            admin_blocked: AtomicBool::new(false),
            max_position: AtomicU64::new(NULL_U64),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    fn live_subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|s| !s.closed.load(Ordering::Acquire))
            .count()
    }
}

/// Registry of in-process streams. Cheap to clone via `Arc`.
pub struct MemFabric {
    streams: DashMap<StreamAddr, Arc<StreamCore>>,
    closed: AtomicBool,
    publication_count: AtomicUsize,
}

impl MemFabric {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: DashMap::new(),
            closed: AtomicBool::new(false),
            publication_count: AtomicUsize::new(0),
        })
    }

    fn core(&self, addr: &StreamAddr) -> Arc<StreamCore> {
        self.streams
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(StreamCore::new()))
            .clone()
    }

    /// Create a publication on a stream.
    pub fn add_publication(self: &Arc<Self>, addr: StreamAddr) -> Publication {
        self.publication_count.fetch_add(1, Ordering::Relaxed);
        log::debug!("[FABRIC] publication added on {addr}");
        Publication {
            fabric: Arc::clone(self),
            core: self.core(&addr),
            addr,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a subscription with the default queue capacity.
    pub fn add_subscription(self: &Arc<Self>, addr: StreamAddr) -> Subscription {
        self.add_subscription_with_capacity(addr, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a subscription with an explicit queue capacity.
    pub fn add_subscription_with_capacity(
        self: &Arc<Self>,
        addr: StreamAddr,
        capacity: usize,
    ) -> Subscription {
        let core = self.core(&addr);
        let (sender, receiver) = bounded(capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let id = core.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        core.subscribers.lock().push(SubscriberSlot {
            id,
            sender,
            closed: Arc::clone(&closed),
        });
        log::debug!("[FABRIC] subscription {id} added on {addr}");
        Subscription {
            core,
            addr,
            receiver,
            id,
            closed,
        }
    }

    /// Block or unblock a stream (admin simulation; drivers use this to
    /// refuse publications during shutdown).
    pub fn set_admin_blocked(&self, addr: &StreamAddr, blocked: bool) {
        self.core(addr).admin_blocked.store(blocked, Ordering::Release);
    }

    /// Cap a stream position (tests exercise `MaxPositionExceeded`).
    pub fn set_max_position(&self, addr: &StreamAddr, max: u64) {
        self.core(addr).max_position.store(max, Ordering::Release);
    }

    /// Close the whole fabric; all later offers return `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Write side of one stream.
pub struct Publication {
    fabric: Arc<MemFabric>,
    core: Arc<StreamCore>,
    addr: StreamAddr,
    closed: AtomicBool,
}

impl Publication {
    /// Probe whether an offer of `message_len` bytes would currently be
    /// accepted, without enqueueing anything. Producers use this to avoid
    /// consuming sequence state when the stream is pushing back.
    pub fn try_reserve(&self, message_len: usize) -> OfferOutcome {
        if self.closed.load(Ordering::Acquire) || self.fabric.is_closed() {
            return OfferOutcome::Closed;
        }
        if self.core.admin_blocked.load(Ordering::Acquire) {
            return OfferOutcome::AdminAction;
        }
        let max = self.core.max_position.load(Ordering::Acquire);
        let position = self.core.position.load(Ordering::Acquire);
        if max != NULL_U64 && position + message_len as u64 > max {
            return OfferOutcome::MaxPositionExceeded;
        }

        let fragment_count = message_len.div_ceil(FABRIC_MTU).max(1);
        let mut subscribers = self.core.subscribers.lock();
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
        if subscribers.is_empty() {
            return OfferOutcome::NotConnected;
        }
        for subscriber in subscribers.iter() {
            let free = subscriber
                .sender
                .capacity()
                .map_or(usize::MAX, |cap| cap - subscriber.sender.len());
            if free < fragment_count {
                return OfferOutcome::BackPressured;
            }
        }
        OfferOutcome::Ok(position)
    }

    /// Offer one whole message. All-or-nothing across subscribers.
    pub fn offer(&self, message: &[u8]) -> OfferOutcome {
        if self.closed.load(Ordering::Acquire) || self.fabric.is_closed() {
            return OfferOutcome::Closed;
        }
        if self.core.admin_blocked.load(Ordering::Acquire) {
            return OfferOutcome::AdminAction;
        }

        let max = self.core.max_position.load(Ordering::Acquire);
        let position = self.core.position.load(Ordering::Acquire);
        if max != NULL_U64 && position + message.len() as u64 > max {
            return OfferOutcome::MaxPositionExceeded;
        }

        let fragments = fragment_message(message, FABRIC_MTU);

        let mut subscribers = self.core.subscribers.lock();
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
        if subscribers.is_empty() {
            return OfferOutcome::NotConnected;
        }

        // Reserve room everywhere before pushing anywhere, so a slow
        // subscriber back-pressures the message rather than truncating it.
        for subscriber in subscribers.iter() {
            let free = subscriber
                .sender
                .capacity()
                .map_or(usize::MAX, |cap| cap - subscriber.sender.len());
            if free < fragments.len() {
                return OfferOutcome::BackPressured;
            }
        }

        for subscriber in subscribers.iter() {
            for fragment in &fragments {
                match subscriber.sender.try_send(fragment.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        // Capacity was reserved above; a concurrent
                        // publisher raced us. The chain for this
                        // subscriber is torn, which its assembler reports.
                        log::warn!(
                            "[FABRIC] queue overflow on {} subscriber {}",
                            self.addr,
                            subscriber.id
                        );
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        }

        let new_position = position + message.len() as u64;
        self.core.position.store(new_position, Ordering::Release);
        OfferOutcome::Ok(new_position)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.core.live_subscriber_count() > 0
    }

    #[must_use]
    pub fn addr(&self) -> &StreamAddr {
        &self.addr
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.core.position.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read side of one stream. One fragment queue per subscription.
pub struct Subscription {
    core: Arc<StreamCore>,
    addr: StreamAddr,
    receiver: Receiver<Fragment>,
    id: u64,
    closed: Arc<AtomicBool>,
}

impl Subscription {
    /// Drain up to `limit` fragments.
    pub fn poll(&self, limit: usize) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        while fragments.len() < limit {
            match self.receiver.try_recv() {
                Ok(fragment) => fragments.push(fragment),
                Err(_) => break,
            }
        }
        fragments
    }

    #[must_use]
    pub fn addr(&self) -> &StreamAddr {
        &self.addr
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.core.subscribers.lock().retain(|s| s.id != self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TpError;
    use crate::fabric::FragmentAssembler;

    fn addr() -> StreamAddr {
        StreamAddr::new("fabric:mem?endpoint=test", 1000)
    }

    #[test]
    fn test_offer_without_subscriber_not_connected() {
        let fabric = MemFabric::new();
        let publication = fabric.add_publication(addr());
        assert_eq!(publication.offer(b"hi"), OfferOutcome::NotConnected);
        assert!(!publication.is_connected());
    }

    #[test]
    fn test_publish_subscribe_round_trip() {
        let fabric = MemFabric::new();
        let subscription = fabric.add_subscription(addr());
        let publication = fabric.add_publication(addr());
        assert!(publication.is_connected());

        assert!(publication.offer(b"alpha").is_ok());
        assert!(publication.offer(b"beta").is_ok());

        let fragments = subscription.poll(10);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].bytes, b"alpha");
        assert_eq!(fragments[1].bytes, b"beta");
    }

    #[test]
    fn test_fragmentation_and_reassembly() {
        let fabric = MemFabric::new();
        let subscription = fabric.add_subscription(addr());
        let publication = fabric.add_publication(addr());

        let message: Vec<u8> = (0..4000).map(|i| (i % 251) as u8).collect();
        assert!(publication.offer(&message).is_ok());

        let mut assembler = FragmentAssembler::new();
        let mut delivered = Vec::new();
        for fragment in subscription.poll(100) {
            if let Some(msg) = assembler.push(fragment).unwrap() {
                delivered.push(msg);
            }
        }
        assert_eq!(delivered, vec![message]);
    }

    #[test]
    fn test_back_pressure_is_all_or_nothing() {
        let fabric = MemFabric::new();
        let subscription = fabric.add_subscription_with_capacity(addr(), 2);
        let publication = fabric.add_publication(addr());

        assert!(publication.offer(b"one").is_ok());
        assert!(publication.offer(b"two").is_ok());
        assert_eq!(publication.offer(b"three"), OfferOutcome::BackPressured);

        // Nothing partial was enqueued.
        assert_eq!(subscription.pending(), 2);

        // Draining unblocks the stream.
        subscription.poll(10);
        assert!(publication.offer(b"three").is_ok());
    }

    #[test]
    fn test_two_subscribers_both_receive() {
        let fabric = MemFabric::new();
        let sub_a = fabric.add_subscription(addr());
        let sub_b = fabric.add_subscription(addr());
        let publication = fabric.add_publication(addr());

        assert!(publication.offer(b"x").is_ok());
        assert_eq!(sub_a.poll(10).len(), 1);
        assert_eq!(sub_b.poll(10).len(), 1);
    }

    #[test]
    fn test_closed_subscription_disconnects() {
        let fabric = MemFabric::new();
        let subscription = fabric.add_subscription(addr());
        let publication = fabric.add_publication(addr());
        assert!(publication.is_connected());

        subscription.close();
        assert_eq!(publication.offer(b"x"), OfferOutcome::NotConnected);
    }

    #[test]
    fn test_admin_block_and_close() {
        let fabric = MemFabric::new();
        let _subscription = fabric.add_subscription(addr());
        let publication = fabric.add_publication(addr());

        fabric.set_admin_blocked(&addr(), true);
        assert_eq!(publication.offer(b"x"), OfferOutcome::AdminAction);
        fabric.set_admin_blocked(&addr(), false);
        assert!(publication.offer(b"x").is_ok());

        publication.close();
        assert_eq!(publication.offer(b"x"), OfferOutcome::Closed);
    }

    #[test]
    fn test_max_position() {
        let fabric = MemFabric::new();
        let _subscription = fabric.add_subscription(addr());
        let publication = fabric.add_publication(addr());
        fabric.set_max_position(&addr(), 4);

        assert!(publication.offer(b"abcd").is_ok());
        assert_eq!(publication.offer(b"e"), OfferOutcome::MaxPositionExceeded);
    }

    #[test]
    fn test_offer_outcome_into_result() {
        assert!(matches!(
            OfferOutcome::BackPressured.into_result(),
            Err(TpError::BackPressured)
        ));
        assert_eq!(OfferOutcome::Ok(9).into_result().unwrap(), 9);
    }
}
