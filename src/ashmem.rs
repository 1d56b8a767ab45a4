//! Android ashmem shims. rustix wraps neither the device nor its ioctls,
//! so these go through libc directly.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use rustix::io::Errno;

// _IOW(0x77, 3, size_t) and _IOW(0x77, 5, unsigned long); the argument
// width follows the pointer width.
#[cfg(target_pointer_width = "64")]
const ASHMEM_SET_SIZE: libc::c_ulong = 0x4008_7703;
#[cfg(target_pointer_width = "32")]
const ASHMEM_SET_SIZE: libc::c_ulong = 0x4004_7703;
#[cfg(target_pointer_width = "64")]
const ASHMEM_SET_PROT_MASK: libc::c_ulong = 0x4008_7705;
#[cfg(target_pointer_width = "32")]
const ASHMEM_SET_PROT_MASK: libc::c_ulong = 0x4004_7705;

/// Opens a fresh ashmem region of `size` bytes. The size is fixed at
/// creation; there is no truncation step afterwards.
pub fn create(size: usize) -> rustix::io::Result<OwnedFd> {
    let raw = unsafe { libc::open(c"/dev/ashmem".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if raw < 0 {
        return Err(last_errno());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    ioctl(&fd, ASHMEM_SET_SIZE, size as libc::c_ulong)?;
    Ok(fd)
}

/// Forces the region to read-only semantics, in place. Mappings that
/// already exist keep their protection; new writable mappings are refused
/// by the kernel from here on.
pub fn set_prot_read_only(fd: &OwnedFd) -> rustix::io::Result<()> {
    ioctl(fd, ASHMEM_SET_PROT_MASK, libc::PROT_READ as libc::c_ulong)
}

fn ioctl(fd: &OwnedFd, request: libc::c_ulong, arg: libc::c_ulong) -> rustix::io::Result<()> {
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg) };
    if rc < 0 { Err(last_errno()) } else { Ok(()) }
}

fn last_errno() -> Errno {
    Errno::from_raw_os_error(
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL),
    )
}
