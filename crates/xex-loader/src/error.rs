//! Typed load failures.
//!
//! Every failure mode named in the loader's design is a distinct variant;
//! none are recovered internally, all propagate straight to the caller.

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("bad XEX2 magic {0:#010x}")]
    BadMagic(u32),
    #[error("truncated optional header table")]
    TruncatedOptionalHeaders,
    #[error("truncated security info at offset {0:#x}")]
    TruncatedSecurityInfo(u32),
    #[error("truncated import library table")]
    TruncatedImportLibraries,
    #[error("unknown compression type {0}")]
    UnknownCompression(u32),
    #[error("unsupported compression scheme: {0}")]
    UnsupportedCompression(&'static str),
    #[error("unknown encryption type {0}")]
    UnknownEncryption(u32),
    #[error("encrypted image and unencrypted-fallback is not enabled")]
    EncryptionNotPermitted,
    #[error("truncated raw-block descriptor table")]
    TruncatedRawBlock,
    #[error("decompressed image is {actual:#x} bytes, short of the advertised {expected:#x}")]
    ShortImage { expected: u32, actual: usize },
    #[error("malformed LZX bitstream: {0}")]
    Lzx(&'static str),
    #[error("no MZ/PE header found in the decompressed image")]
    MissingPeHeader,
    #[error(transparent)]
    Arena(#[from] xenon_arena::ArenaError),
}
