// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Mapped SHM regions.
//!
//! [`ShmRegion`] is the exclusive owner of one mapped file: it validates
//! the path against the allowlist policy, opens, maps the whole file
//! `MAP_SHARED`, and unmaps on drop. Raw pointers never leave this module
//! except through the slot accessors used by the publish/read protocol.
//!
//! # Security Checks (in order, before the file is opened)
//!
//! 1. URI parses as `shm:file` with an absolute path.
//! 2. The final path component is not a symlink.
//! 3. The path canonicalizes and refers to a regular file.
//! 4. The canonical path sits under an allowlisted base directory.
//! 5. Ownership/mode match the permission policy (when enforced).
//!
//! Hugepages validation happens post-open against the backing filesystem
//! (needs the fd for `fstatfs`).

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::ptr;

use crate::error::TpError;
use crate::shm::superblock::{ExpectedSuperblock, Superblock};
use crate::shm::uri::ShmUri;
use crate::types::{NULL_U32, SUPERBLOCK_SIZE_BYTES};
use crate::Result;

#[cfg(target_os = "linux")]
const HUGETLBFS_MAGIC: i64 = 0x958458f6;

/// Allowlist and permission policy applied to every mapped path.
#[derive(Debug, Clone)]
pub struct AllowedPaths {
    bases: Vec<PathBuf>,
    pub enforce_permissions: bool,
    /// Expected owner uid; `NULL_U32` skips the check.
    pub expected_uid: u32,
    /// Expected owner gid; `NULL_U32` skips the check.
    pub expected_gid: u32,
    /// Mode bits that must not be set (default: any "other" access).
    pub forbidden_mode: u32,
}

impl Default for AllowedPaths {
    fn default() -> Self {
        Self {
            bases: Vec::new(),
            enforce_permissions: true,
            expected_uid: NULL_U32,
            expected_gid: NULL_U32,
            forbidden_mode: 0o007,
        }
    }
}

impl AllowedPaths {
    /// Allow everything under the given base directories.
    #[must_use]
    pub fn new<I, P>(bases: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            bases: bases.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// An empty allowlist admits any path (opt-in, for tools).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    fn base_allows(&self, canonical: &Path) -> bool {
        if self.bases.is_empty() {
            return true;
        }
        self.bases.iter().any(|base| {
            std::fs::canonicalize(base)
                .map(|b| canonical.starts_with(&b))
                .unwrap_or(false)
        })
    }

    fn check_permissions(&self, path: &Path, meta: &std::fs::Metadata) -> Result<()> {
        if !self.enforce_permissions {
            return Ok(());
        }
        if self.expected_uid != NULL_U32 && meta.uid() != self.expected_uid {
            return Err(TpError::NotAllowed(format!(
                "{}: owner uid {} != expected {}",
                path.display(),
                meta.uid(),
                self.expected_uid
            )));
        }
        if self.expected_gid != NULL_U32 && meta.gid() != self.expected_gid {
            return Err(TpError::NotAllowed(format!(
                "{}: owner gid {} != expected {}",
                path.display(),
                meta.gid(),
                self.expected_gid
            )));
        }
        if meta.mode() & self.forbidden_mode != 0 {
            return Err(TpError::NotAllowed(format!(
                "{}: mode {:o} has forbidden bits {:o}",
                path.display(),
                meta.mode() & 0o7777,
                self.forbidden_mode
            )));
        }
        Ok(())
    }
}

/// One mapped SHM file. Unmaps on drop.
#[derive(Debug)]
pub struct ShmRegion {
    ptr: *mut u8,
    len: usize,
    uri: ShmUri,
    writable: bool,
}

// SAFETY: the mapping is MAP_SHARED memory whose concurrent access is
// governed by the per-slot seqlock protocol; moving the owner between
// threads does not change the protocol.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Validate `uri` against `allowed`, open, and map the whole file.
    pub fn map(uri: &str, writable: bool, allowed: &AllowedPaths) -> Result<Self> {
        let parsed = ShmUri::parse(uri)?;
        let path = Path::new(&parsed.path);

        let link_meta = std::fs::symlink_metadata(path)
            .map_err(|e| TpError::NotAllowed(format!("{}: {e}", path.display())))?;
        if link_meta.file_type().is_symlink() {
            return Err(TpError::NotAllowed(format!(
                "{}: symlink in final component",
                path.display()
            )));
        }

        let canonical = std::fs::canonicalize(path)
            .map_err(|e| TpError::NotAllowed(format!("{}: {e}", path.display())))?;
        let meta = std::fs::metadata(&canonical)?;
        if !meta.file_type().is_file() {
            return Err(TpError::NotRegular(canonical.display().to_string()));
        }
        if !allowed.base_allows(&canonical) {
            return Err(TpError::NotAllowed(format!(
                "{}: outside allowlisted base paths",
                canonical.display()
            )));
        }
        allowed.check_permissions(&canonical, &meta)?;

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&canonical)?;

        if parsed.require_hugepages {
            check_hugepages(&file, &canonical)?;
        }

        let len = file.metadata()?.len();
        if len < SUPERBLOCK_SIZE_BYTES as u64 {
            return Err(TpError::TooSmall {
                path: canonical.display().to_string(),
                len,
            });
        }
        let len = len as usize;

        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };

        // SAFETY:
        // - addr null lets the kernel pick the placement
        // - len is the exact file size from fstat, > 0
        // - prot matches the open mode; MAP_SHARED for cross-process data
        // - fd is valid for the lifetime of this call; the mapping keeps
        //   its own reference afterwards, so dropping `file` is fine
        // - MAP_FAILED is checked below
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(TpError::Io(std::io::Error::last_os_error()));
        }

        log::debug!("[SHM] mapped {} len={len} writable={writable}", parsed.path);

        Ok(Self {
            ptr: addr.cast::<u8>(),
            len,
            uri: parsed,
            writable,
        })
    }

    /// Release the mapping. Idempotent; also runs on drop.
    pub fn unmap(&mut self) {
        if !self.ptr.is_null() && self.len != 0 {
            // SAFETY: ptr/len came from a successful mmap and have not been
            // unmapped yet (guarded by the null check + reset below).
            unsafe {
                libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
            }
            log::debug!("[SHM] unmapped {}", self.uri.path);
        }
        self.ptr = ptr::null_mut();
        self.len = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn uri(&self) -> &ShmUri {
        &self.uri
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Raw base pointer. Crate-internal; slot access goes through the
    /// offset helpers so bounds stay checked in one place.
    #[inline]
    #[must_use]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Pointer to byte `offset`, bounds-checked against the mapping.
    pub(crate) fn ptr_at(&self, offset: usize, span: usize) -> Result<*mut u8> {
        if self.ptr.is_null() {
            return Err(TpError::Closed);
        }
        if offset.checked_add(span).map_or(true, |end| end > self.len) {
            return Err(TpError::InvalidWire(format!(
                "offset {offset}+{span} outside region of {} bytes",
                self.len
            )));
        }
        // SAFETY: offset+span is within the mapping per the check above.
        Ok(unsafe { self.ptr.add(offset) })
    }

    /// Copy `out.len()` bytes starting at `offset` out of the mapping.
    /// Concurrent writers can race the copy; callers that care validate
    /// through the seqlock protocol instead.
    pub fn copy_to(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let src = self.ptr_at(offset, out.len())?;
        // SAFETY: src spans out.len() bytes inside the mapping per
        // ptr_at; dst is a caller-owned buffer; the ranges cannot
        // overlap.
        unsafe { ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Copy out and decode the superblock.
    pub fn read_superblock(&self) -> Result<Superblock> {
        let src = self.ptr_at(0, SUPERBLOCK_SIZE_BYTES)?;
        let mut buf = [0u8; SUPERBLOCK_SIZE_BYTES];
        // SAFETY: src spans SUPERBLOCK_SIZE_BYTES inside the mapping; dst
        // is a local array of the same size; the ranges cannot overlap.
        unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), SUPERBLOCK_SIZE_BYTES) };
        Superblock::decode(&buf)
    }

    /// Encode a superblock at offset 0. Requires a writable mapping.
    pub fn write_superblock(&self, superblock: &Superblock) -> Result<()> {
        if !self.writable {
            return Err(TpError::NotAllowed(format!(
                "{}: region mapped read-only",
                self.uri.path
            )));
        }
        let dst = self.ptr_at(0, SUPERBLOCK_SIZE_BYTES)?;
        let mut buf = [0u8; SUPERBLOCK_SIZE_BYTES];
        superblock.encode(&mut buf)?;
        // SAFETY: dst spans SUPERBLOCK_SIZE_BYTES inside a writable
        // mapping; src is a local array; no overlap.
        unsafe { ptr::copy_nonoverlapping(buf.as_ptr(), dst, SUPERBLOCK_SIZE_BYTES) };
        Ok(())
    }

    /// Refresh the superblock activity timestamp in place.
    pub fn touch_activity(&self, now_ns: u64) -> Result<()> {
        if !self.writable {
            return Err(TpError::NotAllowed(format!(
                "{}: region mapped read-only",
                self.uri.path
            )));
        }
        let dst = self.ptr_at(56, 8)?;
        let bytes = now_ns.to_le_bytes();
        // SAFETY: 8 writable bytes at offset 56 per ptr_at; concurrent
        // readers treat the field as advisory, torn reads are tolerable.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, 8) };
        Ok(())
    }

    /// Validate the superblock, including structural invariants shared by
    /// producer and consumer attach paths.
    pub fn validate_superblock(&self, expected: Option<&ExpectedSuperblock>) -> Result<Superblock> {
        let superblock = self.read_superblock()?;
        superblock.validate(expected)?;
        if superblock.region_len() > self.len {
            return Err(TpError::TooSmall {
                path: self.uri.path.clone(),
                len: self.len as u64,
            });
        }
        Ok(superblock)
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        self.unmap();
    }
}

fn check_hugepages(file: &File, path: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: zeroed statfs is a valid out-param; fstatfs only writes it.
        let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
        // SAFETY: file holds an open fd for the duration of the call.
        let rc = unsafe { libc::fstatfs(file.as_raw_fd(), &mut stat) };
        if rc != 0 {
            return Err(TpError::Io(std::io::Error::last_os_error()));
        }
        if i64::from(stat.f_type) != HUGETLBFS_MAGIC {
            return Err(TpError::NotAllowed(format!(
                "{}: require_hugepages set but filesystem is not hugetlbfs",
                path.display()
            )));
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = file;
        Err(TpError::NotAllowed(format!(
            "{}: require_hugepages unsupported on this platform",
            path.display()
        )))
    }
}

/// Create and format a region file of the size implied by `superblock`.
///
/// Used by the driver and the shm-create tool; producers and consumers
/// only ever map existing files.
pub fn create_region_file(path: &Path, superblock: &Superblock) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(superblock.region_len() as u64)?;

    let mut buf = [0u8; SUPERBLOCK_SIZE_BYTES];
    superblock.encode(&mut buf)?;
    use std::io::Write;
    (&file).write_all(&buf)?;
    (&file).flush()?;

    // Keep the file inaccessible to "other" by default; the allowlist
    // permission policy rejects world-accessible regions.
    let mut perms = file.metadata()?.permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o660);
    file.set_permissions(perms)?;

    log::debug!(
        "[SHM] created {} ({} bytes)",
        path.display(),
        superblock.region_len()
    );
    Ok(())
}
