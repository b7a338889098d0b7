// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! SHM path validation: allowlist, file-type, symlink, and permission
//! policy rejections, all before any region state is touched.

use std::path::Path;

use tpool::shm::{create_region_file, AllowedPaths, ShmRegion, Superblock};
use tpool::types::RegionType;
use tpool::TpError;

fn make_region(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("tp_10000_1_hdr");
    let superblock = Superblock::new(10_000, 1, 1, RegionType::HeaderRing, 0, 4, 256, 0, 1);
    create_region_file(&path, &superblock).unwrap();
    path
}

fn uri(path: &Path) -> String {
    format!("shm:file?path={}", path.display())
}

#[test]
fn path_outside_allowlist_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let path = make_region(dir.path());

    let allowed = AllowedPaths::new([elsewhere.path()]);
    match ShmRegion::map(&uri(&path), false, &allowed) {
        Err(TpError::NotAllowed(message)) => assert!(message.contains("allowlist")),
        other => panic!("expected NotAllowed, got {other:?}"),
    }
}

#[test]
fn fifo_rejected_as_not_regular() {
    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("tp_fifo");
    let status = std::process::Command::new("mkfifo")
        .arg(&fifo)
        .status()
        .expect("mkfifo");
    assert!(status.success());

    let allowed = AllowedPaths::new([dir.path()]);
    match ShmRegion::map(&uri(&fifo), false, &allowed) {
        Err(TpError::NotRegular(_)) => {}
        other => panic!("expected NotRegular, got {other:?}"),
    }
}

#[test]
fn symlink_in_final_component_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = make_region(dir.path());
    let link = dir.path().join("tp_link");
    std::os::unix::fs::symlink(&path, &link).unwrap();

    let allowed = AllowedPaths::new([dir.path()]);
    match ShmRegion::map(&uri(&link), false, &allowed) {
        Err(TpError::NotAllowed(message)) => assert!(message.contains("symlink")),
        other => panic!("expected NotAllowed, got {other:?}"),
    }

    // The target itself still maps.
    assert!(ShmRegion::map(&uri(&path), false, &allowed).is_ok());
}

#[test]
fn symlink_escape_from_allowlisted_dir_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let target = make_region(outside.path());

    // Inside the allowlist, but pointing out of it.
    let link = dir.path().join("tp_escape");
    std::os::unix::fs::symlink(&target, &link).unwrap();

    let allowed = AllowedPaths::new([dir.path()]);
    assert!(matches!(
        ShmRegion::map(&uri(&link), false, &allowed),
        Err(TpError::NotAllowed(_))
    ));
}

#[test]
fn malformed_uris_rejected_as_config() {
    let allowed = AllowedPaths::default();
    for bad in [
        "file:///dev/shm/x",
        "shm:file?path=relative/path",
        "shm:file?require_hugepages=true",
        "shm:file?path=/x|require_hugepages=maybe",
        "shm:file?path=/x|unknown=1",
    ] {
        match ShmRegion::map(bad, false, &allowed) {
            Err(TpError::Config(_)) => {}
            other => panic!("{bad}: expected Config error, got {other:?}"),
        }
    }
}

#[test]
fn world_accessible_region_rejected_by_policy() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = make_region(dir.path());
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o664)).unwrap();

    let allowed = AllowedPaths::new([dir.path()]);
    assert!(matches!(
        ShmRegion::map(&uri(&path), false, &allowed),
        Err(TpError::NotAllowed(_))
    ));

    // 0o660 satisfies the default forbidden mask.
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o660)).unwrap();
    assert!(ShmRegion::map(&uri(&path), false, &allowed).is_ok());
}

#[test]
fn missing_file_is_not_allowed_not_a_panic() {
    let dir = tempfile::tempdir().unwrap();
    let allowed = AllowedPaths::new([dir.path()]);
    let ghost = dir.path().join("tp_missing");
    assert!(matches!(
        ShmRegion::map(&uri(&ghost), false, &allowed),
        Err(TpError::NotAllowed(_))
    ));
}
