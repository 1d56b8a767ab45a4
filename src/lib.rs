//! Cross-process shared memory regions with one-way freezing.
//!
//! A [`SharedRegion`] wraps one kernel shared-memory object plus its local
//! mapping. The producing process creates a region, optionally writes into
//! it, freezes it into a permanently read-only form, and exports a
//! descriptor for an IPC channel to carry to another process; the receiving
//! process adopts the descriptor and maps it. Moving the descriptor between
//! processes is the transport's job, not this crate's.
//!
//! The backing object is chosen at create time from what the platform
//! offers: an anonymous memory file (`memfd_create`, preferred — no name,
//! no collisions, sealable), a POSIX shared memory object created under a
//! transient name and unlinked immediately, or ashmem on Android.
//!
//! Freezing gives a security-relevant guarantee: the frozen descriptor
//! cannot be used to obtain a writable mapping, even by a less-trusted
//! process it is handed to. On memfd this is backed by file seals; note
//! that without `F_SEAL_FUTURE_WRITE` (Linux < 5.1) a process that forked
//! while a writable mapping existed can still write through the inherited
//! mapping — see [`have_future_write_seal`].
//!
//! # Environment
//!
//! - `SHM_REGION_NO_SEALS` — skip the memfd sealing step, for diagnosing
//!   seal-related failures.
//! - `SHM_REGION_SANDBOXED` — declare the process intentionally sandboxed,
//!   silencing the warning when the procfs capability probe fails.
//! - `SNAP_INSTANCE_NAME` / `SNAP_NAME` — when present, named objects get
//!   the `snap.<name>.` prefix the Snap confinement policy permits.

#[cfg(target_os = "android")]
mod ashmem;
mod error;
mod probe;
mod region;

pub use error::{Error, Result};
pub use probe::{ENV_NO_SEALS, ENV_SANDBOXED, have_future_write_seal, have_memfd};
pub use region::{BackingKind, RegionHandle, SharedRegion, find_free_address};
