// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Create a header ring plus payload pools for one stream.
//!
//! ```text
//! tpool-shm-create <dir> <stream_id> <epoch> <nslots> <pool_id:stride>...
//! ```
//!
//! Files land as `<dir>/tp_<stream>_<epoch>_hdr` and `..._pool<id>`,
//! matching the driver's naming. Exit codes: 0 created, 2 usage/config
//! error, 1 create failure.

use std::path::PathBuf;

use tpool::clock;
use tpool::shm::{create_region_file, validate_stride_alignment, Superblock};
use tpool::types::{RegionType, HEADER_SLOT_BYTES, LAYOUT_VERSION};

fn usage(program: &str) -> ! {
    eprintln!("usage: {program} <dir> <stream_id> <epoch> <nslots> <pool_id:stride>...");
    std::process::exit(2);
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 6 {
        usage(&args[0]);
    }

    let dir = PathBuf::from(&args[1]);
    let stream_id: u32 = args[2].parse().unwrap_or_else(|_| usage(&args[0]));
    let epoch: u64 = args[3].parse().unwrap_or_else(|_| usage(&args[0]));
    let nslots: u32 = args[4].parse().unwrap_or_else(|_| usage(&args[0]));

    if stream_id == 0 || nslots == 0 || !nslots.is_power_of_two() {
        eprintln!("stream_id must be nonzero and nslots a power of two");
        std::process::exit(2);
    }

    let mut pools = Vec::new();
    for spec in &args[5..] {
        let Some((pool_id, stride)) = spec.split_once(':') else {
            usage(&args[0]);
        };
        let pool_id: u16 = pool_id.parse().unwrap_or_else(|_| usage(&args[0]));
        let stride: u32 = stride.parse().unwrap_or_else(|_| usage(&args[0]));
        if let Err(e) = validate_stride_alignment(stride) {
            eprintln!("pool {pool_id}: {e}");
            std::process::exit(2);
        }
        pools.push((pool_id, stride));
    }

    let now_ns = clock::now_realtime_ns();
    let header_path = dir.join(format!("tp_{stream_id}_{epoch}_hdr"));
    let header = Superblock::new(
        stream_id,
        epoch,
        LAYOUT_VERSION,
        RegionType::HeaderRing,
        0,
        nslots,
        HEADER_SLOT_BYTES as u32,
        0,
        now_ns,
    );
    if let Err(e) = create_region_file(&header_path, &header) {
        eprintln!("{}: {e}", header_path.display());
        std::process::exit(1);
    }
    println!("created {} ({} bytes)", header_path.display(), header.region_len());

    for (pool_id, stride) in pools {
        let pool_path = dir.join(format!("tp_{stream_id}_{epoch}_pool{pool_id}"));
        let superblock = Superblock::new(
            stream_id,
            epoch,
            LAYOUT_VERSION,
            RegionType::PayloadPool,
            pool_id,
            nslots,
            0,
            stride,
            now_ns,
        );
        if let Err(e) = create_region_file(&pool_path, &superblock) {
            eprintln!("{}: {e}", pool_path.display());
            std::process::exit(1);
        }
        println!(
            "created {} ({} bytes)",
            pool_path.display(),
            superblock.region_len()
        );
    }
}
