// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory regions and exchange tokens.
//!
//! The server creates one region per concern (slot pool, one region per
//! queue) with `shm_open` + `ftruncate` + `mmap`; the client attaches with
//! the [`MemoryExchangeHandle`] token it received over the side channel.
//! The token names the region — the peer reconstructs the mapping from the
//! name rather than from a passed descriptor, so the side channel only has
//! to move a few bytes.
//!
//! # Region Lifecycle
//!
//! 1. Server creates a region with [`SharedRegion::create`]
//! 2. The region's [`MemoryExchangeHandle`] travels over the side channel
//! 3. Client attaches with [`SharedRegion::attach`]
//! 4. Both sides unmap on drop; the creator also unlinks
//!
//! # Naming Convention
//!
//! `/shmcast_p{pid}_{group}_{role}` — the pid keeps two servers that drew
//! the same in-process group counter value from colliding. Names must start
//! with `/`, contain no other `/` and stay under the POSIX 255-byte cap.

use crate::error::{Error, Result};
use crate::handle::Group;
use std::ffi::CString;
use std::io;
use std::ptr;

/// Page size every mapping is aligned to
pub const PAGE_SIZE: usize = 4096;

/// Opaque token naming a shared memory region.
///
/// Travels over the side channel next to a protocol message; the receiving
/// side attaches the region it names. Contains no pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryExchangeHandle {
    name: String,
    len: u64,
}

impl MemoryExchangeHandle {
    /// Region name (POSIX shm object name)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Region length in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when the token names a zero-length region (never valid here)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Serialize for side-channel transport: `u16` name length, name bytes,
    /// `u64` region length, all little-endian.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut out = Vec::with_capacity(2 + name.len() + 8);
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Inverse of [`to_bytes`](Self::to_bytes); rejects truncated or
    /// non-UTF-8 input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::Protocol("memory handle token truncated".into()));
        }
        let name_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let expected = 2 + name_len + 8;
        if bytes.len() != expected {
            return Err(Error::Protocol(format!(
                "memory handle token length {} (expected {expected})",
                bytes.len()
            )));
        }
        let name = std::str::from_utf8(&bytes[2..2 + name_len])
            .map_err(|_| Error::Protocol("memory handle name is not UTF-8".into()))?
            .to_string();
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[2 + name_len..]);
        Ok(Self {
            name,
            len: u64::from_le_bytes(len_bytes),
        })
    }
}

/// Build the region name for one concern of one server instance
#[must_use]
pub fn region_name(group: Group, role: &str) -> String {
    let pid = std::process::id();
    format!("/shmcast_p{pid}_{group}_{role}")
}

/// Mapped POSIX shared memory region.
///
/// Unmaps on drop; the creating side also unlinks the name so regions die
/// with their server.
pub struct SharedRegion {
    ptr: *mut u8,
    size: usize,
    name: String,
    owner: bool,
}

// SAFETY: The pointer refers to a MAP_SHARED mapping that stays valid for
// the lifetime of the struct. Concurrent access is governed by the slot
// and queue protocols built on top; the region itself hands out raw bytes.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a region of `size` bytes, zero-initialized.
    ///
    /// A leftover object with the same name is unlinked first.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        validate_name(name)?;
        let c_name = c_string(name)?;

        // SAFETY:
        // - c_name is a valid null-terminated CString created above
        // - shm_unlink on a possibly absent name is harmless; errors ignored
        // - O_CREAT|O_RDWR|O_EXCL either creates a fresh object or fails
        // - 0o600 restricts the object to the owning user
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // SAFETY: fd is a valid descriptor from the successful shm_open above;
        // ftruncate fails gracefully if size exceeds system limits.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid and not used after this error path.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(Error::Io(err));
        }

        let ptr = map(fd, size)?;

        // SAFETY:
        // - ptr points to a fresh MAP_SHARED mapping of exactly `size` bytes
        // - No other mapping of this object exists yet (O_EXCL creation)
        unsafe {
            ptr::write_bytes(ptr, 0, size);
        }

        log::debug!("[Shm] created region {name} ({size} bytes)");
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Attach the region named by an exchange handle.
    ///
    /// The token comes from the peer and is not trusted: the name is
    /// re-validated and the object's actual size must match the token.
    pub fn attach(handle: &MemoryExchangeHandle) -> Result<Self> {
        validate_name(&handle.name)?;
        if handle.is_empty() || handle.len > usize::MAX as u64 {
            return Err(Error::Protocol(format!(
                "memory handle length {} unusable",
                handle.len
            )));
        }
        let size = handle.len as usize;
        let c_name = c_string(&handle.name)?;

        // SAFETY: c_name is a valid null-terminated CString; mode is ignored
        // without O_CREAT.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // The peer may have truncated or replaced the object; mapping past
        // its real end would SIGBUS on first touch, so check up front.
        // SAFETY: fd is valid from the successful shm_open above; stat is
        // zero-initialized and fully written by fstat on success.
        let actual = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(Error::Io(err));
            }
            stat.st_size as u64
        };
        if actual < handle.len {
            // SAFETY: fd is valid and unused after this point.
            unsafe { libc::close(fd) };
            return Err(Error::Protocol(format!(
                "region {} is {actual} bytes, token claims {}",
                handle.name, handle.len
            )));
        }

        let ptr = map(fd, size)?;
        Ok(Self {
            ptr,
            size,
            name: handle.name.clone(),
            owner: false,
        })
    }

    /// Exchange token for this region
    #[must_use]
    pub fn handle(&self) -> MemoryExchangeHandle {
        MemoryExchangeHandle {
            name: self.name.clone(),
            len: self.size as u64,
        }
    }

    /// Raw pointer to the mapped bytes
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapping length in bytes
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment of the mapping start (page-aligned by mmap)
    #[inline]
    #[must_use]
    pub fn alignment(&self) -> usize {
        PAGE_SIZE
    }

    /// Region name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from a successful mmap in create()/attach()
        // and munmap runs at most once per mapping.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
        if self.owner {
            if let Ok(c_name) = c_string(&self.name) {
                // SAFETY: unlink only touches the filesystem namespace; a
                // missing name is fine.
                unsafe {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
    // SAFETY:
    // - null addr lets the kernel pick a page-aligned address
    // - PROT_READ|PROT_WRITE with MAP_SHARED is the standard cross-process
    //   read-write mapping
    // - fd is valid per the callers; offset 0 maps from the start
    // - MAP_FAILED is checked below
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    // SAFETY: fd is valid; the mapping (when it succeeded) keeps its own
    // reference to the object, so closing is safe either way.
    unsafe { libc::close(fd) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(ptr.cast::<u8>())
}

fn validate_name(name: &str) -> Result<()> {
    if !name.starts_with('/') || name.len() < 2 {
        return Err(Error::Protocol(format!(
            "region name must start with '/': {name}"
        )));
    }
    if name[1..].contains('/') {
        return Err(Error::Protocol(format!(
            "region name cannot contain '/' after the prefix: {name}"
        )));
    }
    if name.len() > 255 {
        return Err(Error::Protocol("region name too long (max 255)".into()));
    }
    Ok(())
}

fn c_string(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::Protocol(format!("region name contains NUL: {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/shmcast_test_{ts}")
    }

    #[test]
    fn test_validate_name_rules() {
        assert!(validate_name("/pool").is_ok());
        assert!(validate_name("pool").is_err());
        assert!(validate_name("/a/b").is_err());
        assert!(validate_name("/").is_err());
    }

    #[test]
    fn test_region_name_shape() {
        let g = Group::next();
        let name = region_name(g, "pool");
        assert!(name.starts_with("/shmcast_p"));
        assert!(name.ends_with("_pool"));
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn test_create_and_attach_share_bytes() {
        let name = unique_name();
        let created = SharedRegion::create(&name, PAGE_SIZE).expect("create failed");
        assert_eq!(created.size(), PAGE_SIZE);

        // SAFETY: the region was just created with PAGE_SIZE bytes; offsets
        // 0 and 1 are in bounds.
        unsafe {
            *created.as_ptr() = 0xA5;
            *created.as_ptr().add(1) = 0x5A;
        }

        let attached = SharedRegion::attach(&created.handle()).expect("attach failed");
        // SAFETY: same object, same size; both offsets were written above.
        unsafe {
            assert_eq!(*attached.as_ptr(), 0xA5);
            assert_eq!(*attached.as_ptr().add(1), 0x5A);
        }
    }

    #[test]
    fn test_attach_unknown_name_fails() {
        let handle = MemoryExchangeHandle {
            name: "/shmcast_does_not_exist_123".into(),
            len: 64,
        };
        assert!(SharedRegion::attach(&handle).is_err());
    }

    #[test]
    fn test_attach_rejects_oversized_token() {
        let name = unique_name();
        let created = SharedRegion::create(&name, PAGE_SIZE).expect("create failed");
        let lying = MemoryExchangeHandle {
            name: created.name().to_string(),
            len: (PAGE_SIZE * 4) as u64,
        };
        assert!(matches!(
            SharedRegion::attach(&lying),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_creator_unlinks_on_drop() {
        let name = unique_name();
        let created = SharedRegion::create(&name, PAGE_SIZE).expect("create failed");
        let handle = created.handle();
        drop(created);
        assert!(SharedRegion::attach(&handle).is_err());
    }

    #[test]
    fn test_handle_byte_roundtrip() {
        let handle = MemoryExchangeHandle {
            name: "/shmcast_p1_g0000000000000001_pool".into(),
            len: 8192,
        };
        let bytes = handle.to_bytes();
        let back = MemoryExchangeHandle::from_bytes(&bytes).expect("decode failed");
        assert_eq!(back, handle);
    }

    #[test]
    fn test_handle_truncated_rejected() {
        let handle = MemoryExchangeHandle {
            name: "/x".into(),
            len: 1,
        };
        let mut bytes = handle.to_bytes();
        bytes.pop();
        assert!(MemoryExchangeHandle::from_bytes(&bytes).is_err());
    }
}
