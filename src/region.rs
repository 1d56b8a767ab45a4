//! Shared memory regions: creation, mapping, one-way freezing, and
//! descriptor export for cross-process transfer.
//!
//! A [`SharedRegion`] owns one kernel shared-memory object plus at most one
//! local mapping of it. Descriptors live in `Option<OwnedFd>` fields and
//! move out with `Option::take`, so a descriptor can never be released
//! twice. A single region is not safe for concurrent mutation; callers
//! lock externally if they share one across threads.

use std::ffi::c_void;
use std::os::fd::OwnedFd;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use rustix::fs::{FallocateFlags, Mode};
use rustix::io::Errno;
use rustix::mm::{self, MapFlags, ProtFlags};
#[cfg(not(target_os = "android"))]
use rustix::shm;

use crate::error::{Error, Result};
use crate::probe;

/// How the kernel object behind a region was created. Selected once at
/// create time; freeze dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// Anonymous memory file (`memfd_create`), sealable.
    AnonymousFile,
    /// POSIX shared memory object, unlinked immediately after creation.
    NamedUnlinked,
    /// Android ashmem; freezing changes the protection mask in place.
    PlatformAnon,
}

/// A duplicated descriptor plus the metadata header the IPC transport
/// carries alongside it. Independent of the source region's lifetime.
#[derive(Debug)]
pub struct RegionHandle {
    pub fd: OwnedFd,
    pub size: usize,
    pub read_only: bool,
}

/// Active mapping record. Releases exactly the recorded length from
/// exactly the recorded address when dropped.
#[derive(Debug)]
struct Mapping {
    addr: *mut c_void,
    len: usize,
}

// The mapping is plain memory; the record may move between threads along
// with the region that owns it.
unsafe impl Send for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = mm::munmap(self.addr, self.len) {
                log::warn!("munmap failed: {err}");
            }
        }
    }
}

/// One kernel shared-memory object plus its local mapping state.
#[derive(Debug)]
pub struct SharedRegion {
    /// Primary descriptor. `None` once closed or transferred.
    fd: Option<OwnedFd>,
    /// Pre-duplicated read-only view, obtained at create time on
    /// freezeable memfd/named regions and consumed by [`freeze`].
    ///
    /// [`freeze`]: SharedRegion::freeze
    frozen_fd: Option<OwnedFd>,
    mapping: Option<Mapping>,
    size: usize,
    read_only: bool,
    freezeable: bool,
    backing: Option<BackingKind>,
}

impl SharedRegion {
    /// Creates a writable region of `size` bytes, zero-filled.
    pub fn create(size: usize) -> Result<Self> {
        Self::create_internal(size, false, false)
    }

    /// Creates a writable region that can later be frozen read-only and
    /// handed to a less-trusted process.
    pub fn create_freezeable(size: usize) -> Result<Self> {
        Self::create_internal(size, true, false)
    }

    fn create_internal(size: usize, freezeable: bool, force_named: bool) -> Result<Self> {
        if size == 0 {
            return Err(Error::Allocation(Errno::INVAL));
        }

        let mut fd: Option<OwnedFd> = None;
        let mut frozen_fd: Option<OwnedFd> = None;
        let mut backing = BackingKind::NamedUnlinked;

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = force_named;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if !force_named && probe::have_memfd() {
            use rustix::fs::MemfdFlags;

            let mut flags = MemfdFlags::CLOEXEC;
            if freezeable {
                flags |= MemfdFlags::ALLOW_SEALING;
            }
            // No falling back from here: in a sandboxed child, shm_open is
            // already blocked, and this should not fail anyway.
            let memfd = rustix::fs::memfd_create("shm-region", flags).map_err(|err| {
                log::warn!("failed to create memfd: {err}");
                Error::Allocation(err)
            })?;
            if freezeable {
                frozen_fd = Some(dup_read_only(&memfd).map_err(|err| {
                    log::warn!("failed to create read-only memfd: {err}");
                    Error::Allocation(err)
                })?);
            }
            fd = Some(memfd);
            backing = BackingKind::AnonymousFile;
        }

        #[cfg(target_os = "android")]
        if fd.is_none() {
            fd = Some(crate::ashmem::create(size).map_err(|err| {
                log::warn!("failed to create ashmem region: {err}");
                Error::Allocation(err)
            })?);
            backing = BackingKind::PlatformAnon;
        }

        #[cfg(not(target_os = "android"))]
        if fd.is_none() {
            let (named, named_frozen) = create_named(freezeable)?;
            frozen_fd = named_frozen;
            fd = Some(named);
        }

        let fd = fd.expect("backing selection always yields a descriptor");

        // ashmem takes its size at creation; everything else is a file
        // that starts empty.
        if backing != BackingKind::PlatformAnon {
            set_size(&fd, size)?;
        }

        log::debug!("created {backing:?} region of {size} bytes (freezeable: {freezeable})");

        Ok(SharedRegion {
            fd: Some(fd),
            frozen_fd,
            mapping: None,
            size,
            read_only: false,
            freezeable,
            backing: Some(backing),
        })
    }

    /// Adopts a descriptor received from another process, together with
    /// the metadata header that traveled with it. Adopted regions are
    /// never freezeable; their write status is shared with the sender.
    pub fn from_handle(handle: RegionHandle) -> Self {
        SharedRegion {
            fd: Some(handle.fd),
            frozen_fd: None,
            mapping: None,
            size: handle.size,
            read_only: handle.read_only,
            freezeable: false,
            backing: None,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_freezeable(&self) -> bool {
        self.freezeable
    }

    /// `None` for regions adopted from a received handle.
    pub fn backing(&self) -> Option<BackingKind> {
        self.backing
    }

    /// Maps the first `len` bytes of the region, read-write unless the
    /// region is read-only. The kernel chooses the address.
    pub fn map(&mut self, len: usize) -> Result<()> {
        self.map_inner(len, ptr::null_mut())
    }

    /// Like [`map`], but requests a specific address. The address is a
    /// hint, not `MAP_FIXED` (which would clobber whatever is already
    /// mapped there); if the kernel places the mapping elsewhere it is
    /// torn down and the call fails with [`Error::AddressUnavailable`].
    ///
    /// [`map`]: SharedRegion::map
    pub fn map_at(&mut self, len: usize, addr: *mut c_void) -> Result<()> {
        self.map_inner(len, addr)
    }

    fn map_inner(&mut self, len: usize, requested: *mut c_void) -> Result<()> {
        let fd = self.fd.as_ref().expect("map called on a closed region");
        assert!(self.mapping.is_none(), "region is already mapped");
        assert!(len <= self.size, "mapping larger than the region");

        let mut prot = ProtFlags::READ;
        if !self.read_only {
            prot |= ProtFlags::WRITE;
        }

        let addr = unsafe { mm::mmap(requested, len, prot, MapFlags::SHARED, fd, 0) }
            .map_err(|err| {
                log::warn!("mmap failed: {err}");
                Error::Map(err)
            })?;

        if !requested.is_null() && addr != requested {
            unsafe {
                if let Err(err) = mm::munmap(addr, len) {
                    log::warn!("munmap of misplaced mapping failed: {err}");
                }
            }
            return Err(Error::AddressUnavailable);
        }

        self.mapping = Some(Mapping { addr, len });
        Ok(())
    }

    /// Releases the active mapping. No-op when nothing is mapped.
    pub fn unmap(&mut self) {
        self.mapping = None;
    }

    pub fn mapped_ptr(&self) -> Option<*mut c_void> {
        self.mapping.as_ref().map(|m| m.addr)
    }

    pub fn mapped_len(&self) -> Option<usize> {
        self.mapping.as_ref().map(|m| m.len)
    }

    /// The mapped bytes, if mapped.
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.mapping
            .as_ref()
            .map(|m| unsafe { slice::from_raw_parts(m.addr.cast(), m.len) })
    }

    /// The mapped bytes, writable. `None` when unmapped or read-only; a
    /// read-only region never exposes a writable view.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.read_only {
            return None;
        }
        self.mapping
            .as_ref()
            .map(|m| unsafe { slice::from_raw_parts_mut(m.addr.cast(), m.len) })
    }

    /// Permanently converts the region to read-only, in place.
    ///
    /// Requires a region created with [`create_freezeable`] that has not
    /// been frozen or exported, and no active mapping (the producing side
    /// unmaps its own view first). On [`Error::Seal`] the writable region
    /// is preserved unchanged.
    ///
    /// [`create_freezeable`]: SharedRegion::create_freezeable
    pub fn freeze(&mut self) -> Result<()> {
        if self.read_only || !self.freezeable {
            return Err(Error::NotFreezeable);
        }
        assert!(self.mapping.is_none(), "unmap the region before freezing it");
        let backing = self
            .backing
            .expect("freezeable regions always record a backing");

        match backing {
            BackingKind::AnonymousFile => {
                #[cfg(any(target_os = "linux", target_os = "android"))]
                {
                    let fd = self.fd.as_ref().expect("freeze called on a closed region");
                    // Seals are defense-in-depth; access control proper is
                    // the read-only duplicate plus sandboxed children not
                    // reaching /proc/self/fd.
                    if probe::seals_enabled() {
                        seal_memfd(fd)?;
                    }
                    self.fd = Some(
                        self.frozen_fd
                            .take()
                            .expect("freezeable memfd region lost its read-only descriptor"),
                    );
                }
                #[cfg(not(any(target_os = "linux", target_os = "android")))]
                unreachable!("memfd backing only exists on Linux and Android");
            }
            BackingKind::NamedUnlinked => {
                assert!(
                    self.fd.is_some(),
                    "freeze called on a closed region"
                );
                self.fd = Some(
                    self.frozen_fd
                        .take()
                        .expect("freezeable named region lost its read-only descriptor"),
                );
            }
            BackingKind::PlatformAnon => {
                #[cfg(target_os = "android")]
                {
                    let fd = self.fd.as_ref().expect("freeze called on a closed region");
                    crate::ashmem::set_prot_read_only(fd).map_err(Error::Seal)?;
                }
                #[cfg(not(target_os = "android"))]
                unreachable!("ashmem backing only exists on Android");
            }
        }

        self.read_only = true;
        self.freezeable = false;
        Ok(())
    }

    /// Duplicates the descriptor for transmission to another process.
    ///
    /// The region becomes unfreezeable even if duplication fails: once a
    /// descriptor may exist elsewhere, its write status is no longer ours
    /// alone to change. With `close_local` the local descriptors are
    /// closed after duplication; an existing mapping stays valid, but no
    /// further map/freeze/export is possible on this instance.
    pub fn export_for_transfer(&mut self, close_local: bool) -> Result<RegionHandle> {
        self.freezeable = false;
        let fd = self.fd.as_ref().expect("export called on a closed region");
        let dup = rustix::io::dup(fd).map_err(Error::Share)?;
        let handle = RegionHandle {
            fd: dup,
            size: self.size,
            read_only: self.read_only,
        };
        if close_local {
            self.close(false);
        }
        Ok(handle)
    }

    /// Releases the mapping (when `unmap_first`) and both descriptors.
    /// A freezeable region that was never frozen signals a likely logic
    /// error upstream; that gets a diagnostic, not a failure.
    pub fn close(&mut self, unmap_first: bool) {
        if unmap_first {
            self.unmap();
        }
        self.fd = None;
        if self.frozen_fd.take().is_some() {
            log::warn!("freezeable shared memory was never frozen");
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        self.close(true);
    }
}

/// Probes for an address where a mapping of `len` bytes would likely fit,
/// by reserving and immediately releasing it. Suitable as a hint for
/// [`SharedRegion::map_at`]; nothing keeps the range free in between.
pub fn find_free_address(len: usize) -> Option<*mut c_void> {
    let addr =
        unsafe { mm::mmap_anonymous(ptr::null_mut(), len, ProtFlags::empty(), MapFlags::PRIVATE) }
            .ok()?;
    unsafe {
        let _ = mm::munmap(addr, len);
    }
    Some(addr)
}

fn retry_eintr<T>(mut f: impl FnMut() -> rustix::io::Result<T>) -> rustix::io::Result<T> {
    loop {
        match f() {
            Err(Errno::INTR) => continue,
            other => return other,
        }
    }
}

/// Opens a read-only duplicate of a memfd through procfs. The same trick
/// could restore write access, which is why sandboxed children must not
/// reach /proc/self/fd.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn dup_read_only(fd: &OwnedFd) -> rustix::io::Result<OwnedFd> {
    use rustix::fs::OFlags;
    use std::os::fd::AsRawFd;

    let path = format!("/proc/self/fd/{}", fd.as_raw_fd());
    retry_eintr(|| rustix::fs::open(&path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty()))
}

/// Bound on create-exclusive name collisions before giving up; collisions
/// should essentially never repeat, and a backing store that fails some
/// other way must not turn this into an infinite loop.
#[cfg(not(target_os = "android"))]
const NAME_RETRY_LIMIT: u32 = 128;

/// POSIX fallback: create a named object, grab a read-only descriptor if
/// freezing must stay possible, then unlink the name. No name survives
/// this function on any path.
#[cfg(not(target_os = "android"))]
fn create_named(freezeable: bool) -> Result<(OwnedFd, Option<OwnedFd>)> {
    static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);
    let prefix = probe::shm_name_prefix();

    for _ in 0..NAME_RETRY_LIMIT {
        // O_EXCL means predictable names are not a problem; the counter
        // just makes first-try success the common case.
        let name = format!("{prefix}{}", NAME_COUNTER.fetch_add(1, Ordering::Relaxed));
        let fd = match retry_eintr(|| {
            shm::open(
                name.as_str(),
                shm::OFlags::RDWR | shm::OFlags::CREATE | shm::OFlags::EXCL,
                Mode::RUSR | Mode::WUSR,
            )
        }) {
            Ok(fd) => fd,
            Err(Errno::EXIST) => continue,
            Err(err) => {
                log::warn!("failed to open shm: {err}");
                return Err(Error::Allocation(err));
            }
        };

        // The read-only descriptor must exist before the unlink; after it
        // the name is gone and no read-only view could be opened anymore.
        let frozen_fd = if freezeable {
            match retry_eintr(|| shm::open(name.as_str(), shm::OFlags::RDONLY, Mode::RUSR)) {
                Ok(ro) => Some(ro),
                Err(err) => {
                    log::warn!("failed to re-open freezeable shm: {err}");
                    let _ = shm::unlink(name.as_str());
                    return Err(Error::Allocation(err));
                }
            }
        } else {
            None
        };

        if let Err(err) = shm::unlink(name.as_str()) {
            // Should not happen. Assume the name actually leaked and bail
            // out now, while the object is still zero-length.
            log::warn!("failed to unlink shm: {err}");
            return Err(Error::Allocation(err));
        }

        return Ok((fd, frozen_fd));
    }

    log::warn!("shm name collisions persisted through {NAME_RETRY_LIMIT} attempts");
    Err(Error::Allocation(Errno::EXIST))
}

/// Sizes the object, reserving space up front: a sparse object can raise
/// SIGBUS on write when the backing store fills up later.
fn set_size(fd: &OwnedFd, size: usize) -> Result<()> {
    match retry_eintr(|| rustix::fs::fallocate(fd, FallocateFlags::empty(), 0, size as u64)) {
        Ok(()) => Ok(()),
        Err(err @ (Errno::OPNOTSUPP | Errno::INVAL | Errno::NODEV)) => {
            // Some filesystems cannot fallocate; fall back to a plain
            // resize and accept allocation faults, as before fallocate.
            log::warn!("fallocate failed to set shm size: {err}; falling back to ftruncate");
            retry_eintr(|| rustix::fs::ftruncate(fd, size as u64)).map_err(|err| {
                log::warn!("ftruncate failed to set shm size: {err}");
                Error::Allocation(err)
            })
        }
        Err(err) => {
            log::warn!("fallocate failed to set shm size: {err}");
            Err(Error::Allocation(err))
        }
    }
}

/// Applies immutability seals to a memfd about to be frozen.
///
/// `F_SEAL_WRITE` alone is unreliable: a process that forked while a
/// writable mapping existed makes it fail outright. `F_SEAL_FUTURE_WRITE`
/// (Linux 5.1) blocks new write access while tolerating mappings that
/// predate the seal, so it is tried first; without it, the basic seals
/// leave a fork that inherited a writable mapping able to keep writing.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn seal_memfd(fd: &OwnedFd) -> Result<()> {
    use rustix::fs::SealFlags;

    let seals = SealFlags::GROW | SealFlags::SHRINK | SealFlags::SEAL;
    match rustix::fs::fcntl_add_seals(fd, seals | SealFlags::FUTURE_WRITE) {
        Ok(()) => Ok(()),
        Err(Errno::INVAL) => {
            log::warn!(
                "future-write seal unsupported; a pre-freeze fork could retain write access"
            );
            rustix::fs::fcntl_add_seals(fd, seals).map_err(|err| {
                log::warn!("failed to seal memfd: {err}");
                Error::Seal(err)
            })
        }
        Err(err) => {
            log::warn!("failed to seal memfd: {err}");
            Err(Error::Seal(err))
        }
    }
}
