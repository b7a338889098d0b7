// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! The cooperative client loop.
//!
//! Everything runs on one thread: subscription polls, publication offers,
//! and callbacks. Applications either call [`Client::do_work`] themselves
//! or hand their agents to [`Client::run_while`] which applies the
//! configured idle strategy between passes.

use crate::clock;
use crate::client::context::ClientContext;
use crate::fabric::idle::Idler;
use crate::Result;

/// A unit of cooperative work driven by the client loop.
///
/// Producers, consumers, driver cores, and the directory service all
/// implement this; `do_work` returns how much it accomplished so the
/// idle strategy can back off on quiet passes.
pub trait Agent {
    fn do_work(&mut self, now_ns: u64) -> Result<usize>;
}

/// Lifecycle states of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Initialized,
    Started,
    Closed,
}

/// Top-level handle tying a context to the cooperative loop.
pub struct Client {
    context: ClientContext,
    idler: Idler,
    state: ClientState,
}

impl Client {
    #[must_use]
    pub fn new(context: ClientContext) -> Self {
        let idler = Idler::new(context.idle_strategy.clone());
        Self {
            context,
            idler,
            state: ClientState::Initialized,
        }
    }

    #[must_use]
    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state == ClientState::Closed {
            return Err(crate::TpError::Closed);
        }
        self.state = ClientState::Started;
        log::debug!("[CLIENT] started (client_id={})", self.context.client_id);
        Ok(())
    }

    /// One pass over the given agents. Returns total work done.
    pub fn do_work(&mut self, agents: &mut [&mut dyn Agent]) -> Result<usize> {
        if self.state != ClientState::Started {
            return Err(crate::TpError::Closed);
        }
        let now_ns = clock::now_monotonic_ns();
        let mut work = 0;
        for agent in agents.iter_mut() {
            work += agent.do_work(now_ns)?;
        }
        self.idler.idle(work);
        Ok(work)
    }

    /// Drive the agents until `keep_running` goes false, idling between
    /// unproductive passes.
    pub fn run_while(
        &mut self,
        agents: &mut [&mut dyn Agent],
        mut keep_running: impl FnMut() -> bool,
    ) -> Result<()> {
        while keep_running() {
            self.do_work(agents)?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if self.state != ClientState::Closed {
            self.state = ClientState::Closed;
            log::debug!("[CLIENT] closed (client_id={})", self.context.client_id);
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ClientState::Closed
    }
}
