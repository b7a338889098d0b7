// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! One-shot discovery query.
//!
//! ```text
//! tpool-discovery-query [--stream <id>] [--producer <id>] [--source <id>]
//!                       [--name <s>] [--tag <t>]... [--max <n>]
//! ```
//!
//! Runs the query against the directory reachable on the local fabric
//! endpoint and prints matching entries. Exit codes: 0 results printed,
//! 1 query error or timeout, 2 usage.

use tpool::client::Agent;
use tpool::clock;
use tpool::discovery::{DiscoveryClient, DiscoveryConfig, DiscoveryService};
use tpool::fabric::{MemFabric, StreamAddr};
use tpool::types::{STREAM_ID_DISCOVERY_REQUEST, STREAM_ID_DISCOVERY_RESPONSE};
use tpool::wire::discovery::{DiscoveryRequest, DiscoveryStatus};

fn usage(program: &str) -> ! {
    eprintln!(
        "usage: {program} [--stream <id>] [--producer <id>] [--source <id>] \
         [--name <s>] [--tag <t>]... [--max <n>]"
    );
    std::process::exit(2);
}

fn next_arg<'a>(args: &'a [String], i: &mut usize) -> &'a str {
    *i += 1;
    if *i >= args.len() {
        usage(&args[0]);
    }
    &args[*i]
}

fn parse_arg<T: std::str::FromStr>(args: &[String], i: &mut usize) -> T {
    next_arg(args, i).parse().unwrap_or_else(|_| usage(&args[0]))
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut request = DiscoveryRequest::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--stream" => request.stream_id = parse_arg(&args, &mut i),
            "--producer" => request.producer_id = parse_arg(&args, &mut i),
            "--source" => request.data_source_id = parse_arg(&args, &mut i),
            "--name" => request.data_source_name = next_arg(&args, &mut i).to_string(),
            "--tag" => {
                let tag = next_arg(&args, &mut i).to_string();
                request.tags.push(tag);
            }
            "--max" => request.max_results = parse_arg(&args, &mut i),
            _ => usage(&args[0]),
        }
        i += 1;
    }

    let fabric = MemFabric::new();
    let config = DiscoveryConfig::default();
    let channel = config.channel.clone();
    let mut service = DiscoveryService::new(std::sync::Arc::clone(&fabric), config);
    service.start();

    let mut client = DiscoveryClient::new(
        &fabric,
        StreamAddr::new(channel.clone(), STREAM_ID_DISCOVERY_REQUEST),
        StreamAddr::new(channel, STREAM_ID_DISCOVERY_RESPONSE),
    );

    let correlation_id = match client.request(request) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("query failed: {e}");
            std::process::exit(1);
        }
    };

    // Single-process loopback: step the directory, then poll.
    let deadline = clock::now_monotonic_ns() + 2_000_000_000;
    let response = loop {
        if let Err(e) = service.do_work(clock::now_monotonic_ns()) {
            eprintln!("directory error: {e}");
            std::process::exit(1);
        }
        match client.poll(correlation_id) {
            Ok(Some(response)) => break response,
            Ok(None) if clock::now_monotonic_ns() < deadline => {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            Ok(None) => {
                eprintln!("query timed out");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("poll failed: {e}");
                std::process::exit(1);
            }
        }
    };

    if response.status != DiscoveryStatus::Ok {
        eprintln!("query error: {}", response.error_message);
        std::process::exit(1);
    }

    println!("{} result(s)", response.results.len());
    for result in &response.results {
        println!(
            "stream {} producer {} epoch {} name {:?} tags {:?}",
            result.stream_id, result.producer_id, result.epoch, result.data_source_name, result.tags
        );
        println!("  header {} ({} slots)", result.header_region_uri, result.header_nslots);
        for pool in &result.pools {
            println!(
                "  pool {} stride {} uri {}",
                pool.pool_id, pool.stride_bytes, pool.region_uri
            );
        }
    }
}
