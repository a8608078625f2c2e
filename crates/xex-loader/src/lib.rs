//! XEX2 container parsing for Xenon titles.
//!
//! Owns everything between "bytes read off disk" and "an executable
//! image mapped into the guest arena with its imports resolved": the
//! big-endian container header and optional-header table ([`header`]),
//! LZX decompression ([`lzx`]), the raw/verbatim/compressed dispatch
//! that picks between them ([`decompress`]), the embedded PE header walk
//! ([`pe`]), and the glue that ties parsing, decompression, mapping, and
//! import-thunk installation together ([`load`]).

pub mod decompress;
pub mod error;
pub mod header;
pub mod load;
pub mod lzx;
pub mod pe;

pub use decompress::DecompressOptions;
pub use error::LoadError;
pub use header::{ImportLibrary, ModuleInfo, XexCompressionType, XexEncryptionType};
pub use load::{load as load_module, LoadedModule};
pub use pe::{PeInfo, SectionHeader};
