//! Typed compile failures.

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("block at {0:#010x} exceeded the 64 KiB scan bound without reaching a terminator")]
    BlockTooLarge(u32),
    #[error("executable allocator is out of memory compiling block at {0:#010x}")]
    OutOfExecutableMemory(u32),
}
