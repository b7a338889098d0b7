// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Dump a region's superblock and, for header rings, each slot's seqlock
//! state. Permission checks are relaxed; this tool only reads.
//!
//! ```text
//! tpool-shm-inspect <path>
//! ```

use std::path::Path;

use tpool::shm::{seqlock, slot, AllowedPaths, ShmRegion, SlotHeader};
use tpool::types::{RegionType, HEADER_SLOT_BYTES};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <path>", args[0]);
        std::process::exit(2);
    }

    let path = Path::new(&args[1]);
    let Some(parent) = path.parent() else {
        eprintln!("{}: no parent directory", path.display());
        std::process::exit(2);
    };

    let mut allowed = AllowedPaths::new([parent]);
    allowed.enforce_permissions = false;

    let uri = format!("shm:file?path={}", path.display());
    let region = match ShmRegion::map(&uri, false, &allowed) {
        Ok(region) => region,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            std::process::exit(1);
        }
    };

    let superblock = match region.read_superblock() {
        Ok(superblock) => superblock,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            std::process::exit(1);
        }
    };

    println!("magic              {:#018x}", superblock.magic);
    println!("layout_version     {}", superblock.layout_version);
    println!("stream_id          {}", superblock.stream_id);
    println!("epoch              {}", superblock.epoch);
    println!("region_type        {}", superblock.region_type);
    println!("pool_id            {}", superblock.pool_id);
    println!("nslots             {}", superblock.nslots);
    println!("slot_bytes         {}", superblock.slot_bytes);
    println!("stride_bytes       {}", superblock.stride_bytes);
    println!("pid                {}", superblock.pid);
    println!("start_timestamp_ns {}", superblock.start_timestamp_ns);
    println!("activity_ns        {}", superblock.activity_timestamp_ns);

    if superblock.region_type != RegionType::HeaderRing as i16 {
        return;
    }

    println!();
    println!("slot  seq        state        len      pool  timestamp_ns");
    let mut slot_buf = [0u8; HEADER_SLOT_BYTES];
    for index in 0..superblock.nslots {
        if region.copy_to(slot::slot_offset(index), &mut slot_buf).is_err() {
            break;
        }
        let word = u64::from_le_bytes(slot_buf[0..8].try_into().unwrap());
        let state = if seqlock::is_committed(word) {
            "committed"
        } else {
            "in-progress"
        };
        let header = SlotHeader::decode(&slot_buf).unwrap_or_default();
        println!(
            "{index:<5} {:<10} {state:<12} {:<8} {:<5} {}",
            seqlock::seq_value(word),
            header.values_len_bytes,
            header.pool_id,
            header.timestamp_ns
        );
    }
}
