use rustix::io::Errno;

/// Failures surfaced by region operations.
///
/// Every kernel-call failure maps onto exactly one of these; precondition
/// violations (double-map, map-after-close, freeze-while-mapped) are caller
/// bugs and assert instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Creating or sizing the backing object failed. No region exists.
    #[error("shared memory allocation failed: {0}")]
    Allocation(#[source] Errno),

    /// Mapping the region into the address space failed.
    #[error("shared memory mapping failed: {0}")]
    Map(#[source] Errno),

    /// A fixed-address mapping request could not be honored; the kernel
    /// placed the mapping elsewhere and it was torn down.
    #[error("mapping not available at the requested address")]
    AddressUnavailable,

    /// Applying immutability seals at freeze time failed. The writable
    /// region is preserved.
    #[error("sealing shared memory failed: {0}")]
    Seal(#[source] Errno),

    /// The region cannot be frozen: it was not created freezeable, was
    /// already frozen, or has been exported.
    #[error("region is not freezeable")]
    NotFreezeable,

    /// Duplicating the descriptor for cross-process transfer failed.
    #[error("duplicating descriptor for transfer failed: {0}")]
    Share(#[source] Errno),
}

pub type Result<T> = std::result::Result<T, Error>;
