// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use safeipc_common::OsError;
use std::ffi::CString;
use std::fmt;
use std::hash::{BuildHasher, Hasher, RandomState};
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Length of an opaque shared-memory region id on the wire.
pub const SHM_ID_LEN: usize = 16;

static REGION_COUNTER: AtomicU64 = AtomicU64::new(0);
static PROCESS_TAG: OnceLock<u32> = OnceLock::new();

/// Opaque identifier of a shared-memory region.
///
/// Ids are exchanged over the handshake socket; the peer reconstructs
/// the POSIX shm name from the id alone.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmId([u8; SHM_ID_LEN]);

impl ShmId {
    /// Generates a process-unique id: pid, a per-process counter and a
    /// random per-process tag to survive pid reuse across restarts.
    pub fn generate() -> ShmId {
        let tag = *PROCESS_TAG.get_or_init(|| {
            let mut hasher = RandomState::new().build_hasher();
            hasher.write_u64(0);
            hasher.finish() as u32
        });
        let pid = std::process::id();
        let counter = REGION_COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut bytes = [0u8; SHM_ID_LEN];
        bytes[..4].copy_from_slice(&pid.to_le_bytes());
        bytes[4..12].copy_from_slice(&counter.to_le_bytes());
        bytes[12..].copy_from_slice(&tag.to_le_bytes());
        ShmId(bytes)
    }

    pub fn from_bytes(bytes: [u8; SHM_ID_LEN]) -> ShmId {
        ShmId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHM_ID_LEN] {
        &self.0
    }

    /// POSIX shm object name for this id.
    pub fn shm_name(&self) -> CString {
        let mut name = String::with_capacity(9 + SHM_ID_LEN * 2);
        name.push_str("/safeipc-");
        for byte in self.0 {
            name.push_str(&format!("{byte:02x}"));
        }
        CString::new(name).expect("no interior nul in hex name")
    }
}

impl fmt::Debug for ShmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShmId(")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// An open shared-memory object and its mapped size.
#[derive(Debug)]
pub struct ShmHandle {
    pub(crate) fd: OwnedFd,
    pub(crate) size: usize,
}

impl ShmHandle {
    pub fn size(&self) -> usize {
        self.size
    }
}

struct ShmPath {
    name: CString,
}

impl Drop for ShmPath {
    fn drop(&mut self) {
        _ = shm_unlink(self.name.as_c_str());
    }
}

/// A shared-memory object addressable by `ShmId`.
///
/// The creator unlinks the name once the peer confirmed opening it; the
/// object then lives on as anonymous shared memory until the last fd and
/// mapping are gone. Dropping an un-unlinked handle removes the name.
pub struct NamedShmHandle {
    inner: ShmHandle,
    id: ShmId,
    path: Option<ShmPath>,
}

impl NamedShmHandle {
    /// Creates a region of at least `size` bytes (rounded up to whole
    /// pages) under a fresh id.
    pub fn create(size: usize) -> Result<NamedShmHandle, OsError> {
        let id = ShmId::generate();
        let name = id.shm_name();
        let size = page_aligned_size(size);
        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IWUSR | Mode::S_IRUSR,
        )
        .map_err(|e| OsError::from_errno(e, "shm_open"))?;
        if let Err(errno) = ftruncate(&fd, size as libc::off_t) {
            _ = shm_unlink(name.as_c_str());
            return Err(OsError::from_errno(errno, "ftruncate"));
        }
        Ok(NamedShmHandle {
            inner: ShmHandle { fd, size },
            id,
            path: Some(ShmPath { name }),
        })
    }

    /// Opens a region created by a peer.
    pub fn open(id: ShmId) -> Result<NamedShmHandle, OsError> {
        let name = id.shm_name();
        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| OsError::from_errno(e, "shm_open"))?;
        let file = std::fs::File::from(fd);
        let size = file
            .metadata()
            .map_err(|e| OsError::from_io(&e, "shm metadata"))?
            .len() as usize;
        Ok(NamedShmHandle {
            inner: ShmHandle {
                fd: file.into(),
                size,
            },
            id,
            path: None,
        })
    }

    pub fn id(&self) -> ShmId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Removes the name from the filesystem namespace. The region stays
    /// alive through existing fds and mappings.
    pub fn unlink(&mut self) {
        self.path = None;
    }

    pub fn is_linked(&self) -> bool {
        self.path.is_some()
    }

    /// Maps the whole region read-write.
    pub fn map(self) -> Result<MappedMem, OsError> {
        let length = NonZeroUsize::new(self.inner.size)
            .ok_or_else(|| OsError::new(safeipc_common::ErrorKind::Unexpected, "empty mapping"))?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.inner.fd,
                0,
            )
        }
        .map_err(|e| OsError::from_errno(e, "mmap"))?;
        Ok(MappedMem { ptr, mem: self })
    }
}

impl fmt::Debug for NamedShmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedShmHandle")
            .field("id", &self.id)
            .field("size", &self.inner.size)
            .field("linked", &self.path.is_some())
            .finish()
    }
}

/// A mapped shared-memory region; unmapped on drop.
#[derive(Debug)]
pub struct MappedMem {
    ptr: NonNull<libc::c_void>,
    mem: NamedShmHandle,
}

impl MappedMem {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.mem.size()) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.mem.size()) }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        self.mem.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn id(&self) -> ShmId {
        self.mem.id()
    }

    pub fn handle(&self) -> &NamedShmHandle {
        &self.mem
    }

    pub fn unlink(&mut self) {
        self.mem.unlink();
    }
}

impl Drop for MappedMem {
    fn drop(&mut self) {
        unsafe {
            _ = munmap(self.ptr, self.mem.size());
        }
    }
}

// The mapping is plain memory; synchronization of its contents is the
// responsibility of the protocol layered on top.
unsafe impl Send for MappedMem {}
unsafe impl Sync for MappedMem {}

pub(crate) fn page_aligned_size(size: usize) -> usize {
    let page_size = page_size::get();
    // round up to nearest page
    ((size.max(1) - 1) & !(page_size - 1)) + page_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_round_trip() {
        let a = ShmId::generate();
        let b = ShmId::generate();
        assert_ne!(a, b);
        assert_eq!(ShmId::from_bytes(*a.as_bytes()), a);
        let name = a.shm_name();
        assert!(name.to_str().unwrap().starts_with("/safeipc-"));
    }

    #[test]
    fn page_alignment() {
        let page = page_size::get();
        assert_eq!(page_aligned_size(1), page);
        assert_eq!(page_aligned_size(page), page);
        assert_eq!(page_aligned_size(page + 1), 2 * page);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn create_open_write_read() {
        let region = NamedShmHandle::create(64).unwrap();
        let id = region.id();
        let mut mapped = region.map().unwrap();
        mapped.as_slice_mut()[..5].copy_from_slice(b"hello");

        let peer = NamedShmHandle::open(id).unwrap().map().unwrap();
        assert_eq!(&peer.as_slice()[..5], b"hello");

        // After unlink the name is gone but the mapping stays valid.
        mapped.unlink();
        assert!(NamedShmHandle::open(id).is_err());
        assert_eq!(&peer.as_slice()[..5], b"hello");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn drop_unlinks_unconfirmed_region() {
        let region = NamedShmHandle::create(16).unwrap();
        let id = region.id();
        drop(region);
        assert!(NamedShmHandle::open(id).is_err());
    }
}
