// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Directory daemon.
//!
//! Subscribes to the announce and metadata streams, answers discovery
//! queries, and prunes entries that stop announcing. Single-threaded
//! cooperative loop; SIGINT/SIGTERM flip a flag checked between passes.

mod config;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tpool::clock;
use tpool::client::Agent;
use tpool::discovery::DiscoveryService;
use tpool::fabric::{IdleStrategy, MemFabric};
use tpool::fabric::idle::Idler;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <config.json>", args[0]);
        std::process::exit(2);
    }

    let config = match config::load(Path::new(&args[1])) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tpool-discoveryd: {e}");
            std::process::exit(2);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    install_signal_handler(&running);

    let fabric = MemFabric::new();
    let mut service = DiscoveryService::new(fabric, config);
    service.start();

    let mut idler = Idler::new(IdleStrategy::default());
    while running.load(Ordering::Acquire) {
        match service.do_work(clock::now_monotonic_ns()) {
            Ok(work) => idler.idle(work),
            Err(e) => {
                log::error!("[DISCOVERY] fatal: {e}");
                service.close();
                std::process::exit(1);
            }
        }
    }

    log::info!("[DISCOVERY] shutting down");
    service.close();
}

fn install_signal_handler(running: &Arc<AtomicBool>) {
    static RUNNING: std::sync::OnceLock<Arc<AtomicBool>> = std::sync::OnceLock::new();
    let _ = RUNNING.set(Arc::clone(running));

    extern "C" fn handle(_signum: libc::c_int) {
        if let Some(flag) = RUNNING.get() {
            flag.store(false, Ordering::Release);
        }
    }

    let handler: extern "C" fn(libc::c_int) = handle;
    // SAFETY: handle only touches an atomic flag, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}
