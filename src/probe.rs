//! Process-wide capability probing for the allocation backing.
//!
//! Every probe runs at most once per process and the result is cached;
//! reading a cached result from any thread is safe.

use std::env;
use std::sync::OnceLock;

use rustix::fs::{Access, MemfdFlags, SealFlags, memfd_create};

/// Disables the memfd sealing path when set, for diagnosing seal-related
/// failures. The frozen descriptor is still read-only; only the
/// defense-in-depth seals are skipped.
pub const ENV_NO_SEALS: &str = "SHM_REGION_NO_SEALS";

/// Marks the process as intentionally sandboxed. Suppresses the warning
/// when the procfs probe below fails, which is expected once a sandbox has
/// cut off `/proc`.
pub const ENV_SANDBOXED: &str = "SHM_REGION_SANDBOXED";

/// Whether `memfd_create` is usable as the allocation backing.
pub fn have_memfd() -> bool {
    static HAVE: OnceLock<bool> = OnceLock::new();
    *HAVE.get_or_init(probe_memfd)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn probe_memfd() -> bool {
    // Read-only duplication goes through /proc/self/fd, so memfd is only
    // usable if procfs is reachable. In a sandboxed child the probe may
    // first run after procfs is already gone; that case is expected and
    // freezing is expected to be unavailable there too.
    if env::var_os(ENV_SANDBOXED).is_none()
        && rustix::fs::access("/proc/self/fd", Access::READ_OK | Access::EXEC_OK).is_err()
    {
        log::warn!("cannot use memfd without procfs");
        return false;
    }
    match memfd_create("shm-region-probe", MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING) {
        Ok(_fd) => true,
        Err(err) => {
            debug_assert_eq!(err, rustix::io::Errno::NOSYS);
            false
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn probe_memfd() -> bool {
    false
}

/// Whether freeze should apply memfd seals at all (env escape hatch).
pub fn seals_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| env::var_os(ENV_NO_SEALS).is_none())
}

/// Whether the kernel supports `F_SEAL_FUTURE_WRITE` (Linux 5.1+).
///
/// Without it, freeze falls back to the grow/shrink/seal set alone, which
/// a process that forked while holding a writable mapping can still defeat.
pub fn have_future_write_seal() -> bool {
    static HAVE: OnceLock<bool> = OnceLock::new();
    *HAVE.get_or_init(|| {
        if !have_memfd() {
            return false;
        }
        let Ok(fd) = memfd_create(
            "shm-region-probe",
            MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING,
        ) else {
            return false;
        };
        rustix::fs::fcntl_add_seals(&fd, SealFlags::FUTURE_WRITE).is_ok()
    })
}

/// Name prefix for the named-object fallback: an optional Snap namespace
/// component plus a per-process component, so sandbox policies scoped to
/// the prefix admit these objects and names rarely collide.
pub fn shm_name_prefix() -> String {
    static PREFIX: OnceLock<String> = OnceLock::new();
    PREFIX
        .get_or_init(|| {
            // A Snap package gets no private /dev/shm; AppArmor instead
            // admits anything under snap.<instance>. (SNAP_NAME covers
            // snapd <= 2.35.)
            let snap = env::var("SNAP_INSTANCE_NAME")
                .or_else(|_| env::var("SNAP_NAME"))
                .ok();
            let pid = rustix::process::getpid().as_raw_nonzero().get();
            build_name_prefix(snap.as_deref(), pid)
        })
        .clone()
}

fn build_name_prefix(snap: Option<&str>, pid: i32) -> String {
    match snap {
        Some(snap) => format!("/snap.{snap}.shm-region.{pid}."),
        None => format!("/shm-region.{pid}."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_prefix_embeds_pid() {
        assert_eq!(build_name_prefix(None, 1234), "/shm-region.1234.");
    }

    #[test]
    fn name_prefix_honors_snap_namespace() {
        assert_eq!(
            build_name_prefix(Some("inkscape"), 7),
            "/snap.inkscape.shm-region.7."
        );
    }

    #[test]
    fn probes_are_stable_across_calls() {
        assert_eq!(have_memfd(), have_memfd());
        assert_eq!(have_future_write_seal(), have_future_write_seal());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn future_write_seal_implies_memfd() {
        if have_future_write_seal() {
            assert!(have_memfd());
        }
    }
}
