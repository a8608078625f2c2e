//! Arena error kinds.

/// Failures the guest memory arena can report.
///
/// Corresponds to the `LoadResourceError` family in the core error design:
/// arena failures are always resource failures (the host refused a mapping
/// or protection change), never logic errors.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("guest arena already initialized in this process")]
    AlreadyInitialized,

    #[error("failed to reserve guest address space: {0}")]
    Reserve(#[source] std::io::Error),

    #[error("failed to change page protection: {0}")]
    Protect(#[source] std::io::Error),

    #[error("region {guest_addr:#010x}+{size:#x} lies outside the 4 GiB arena")]
    OutOfRange { guest_addr: u32, size: u64 },
}
