// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Discovery client: fire a query, poll for the correlated response.

use crate::clock;
use crate::error::TpError;
use crate::fabric::{FragmentAssembler, MemFabric, Publication, StreamAddr, Subscription};
use crate::wire::discovery::{DiscoveryRequest, DiscoveryResponse};
use crate::wire::Decoded;
use crate::Result;

use std::sync::Arc;

pub struct DiscoveryClient {
    request_publication: Publication,
    response_subscription: Subscription,
    response_addr: StreamAddr,
    assembler: FragmentAssembler,
    next_correlation_id: i64,
}

impl DiscoveryClient {
    /// `request_addr` is the directory's request stream; `response_addr`
    /// is this client's private response endpoint.
    pub fn new(fabric: &Arc<MemFabric>, request_addr: StreamAddr, response_addr: StreamAddr) -> Self {
        Self {
            request_publication: fabric.add_publication(request_addr),
            response_subscription: fabric.add_subscription(response_addr.clone()),
            response_addr,
            assembler: FragmentAssembler::new(),
            next_correlation_id: 1,
        }
    }

    /// Send a query; returns its correlation id.
    pub fn request(&mut self, mut request: DiscoveryRequest) -> Result<i64> {
        request.correlation_id = self.next_correlation_id;
        self.next_correlation_id += 1;
        request.response_channel = self.response_addr.channel.clone();
        request.response_stream_id = self.response_addr.stream_id;

        let mut buf = vec![0u8; 512 + request.tags.iter().map(|t| 8 + t.len()).sum::<usize>()];
        let len = request.encode(&mut buf)?;
        self.request_publication.offer(&buf[..len]).into_result()?;
        Ok(request.correlation_id)
    }

    /// Non-blocking poll for the response to `correlation_id`.
    pub fn poll(&mut self, correlation_id: i64) -> Result<Option<DiscoveryResponse>> {
        for fragment in self.response_subscription.poll(16) {
            let Some(message) = self.assembler.push(fragment)? else {
                continue;
            };
            if let Decoded::Msg(response) = DiscoveryResponse::decode(&message)? {
                if response.correlation_id == correlation_id {
                    return Ok(Some(response));
                }
                // A response for a cancelled or stale query; drop it.
            }
        }
        Ok(None)
    }

    /// Blocking poll with a deadline. The directory must run on another
    /// thread or be stepped by the caller between polls.
    pub fn poll_timeout(&mut self, correlation_id: i64, timeout_ns: u64) -> Result<DiscoveryResponse> {
        let deadline = clock::now_monotonic_ns() + timeout_ns;
        loop {
            if let Some(response) = self.poll(correlation_id)? {
                return Ok(response);
            }
            if clock::now_monotonic_ns() >= deadline {
                return Err(TpError::Timeout);
            }
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
    }

    pub fn close(&mut self) {
        self.request_publication.close();
        self.response_subscription.close();
        self.assembler.reset();
    }
}
