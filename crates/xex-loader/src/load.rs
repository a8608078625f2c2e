//! Ties header parsing, decompression, and PE inspection together: maps
//! a decompressed image into the guest arena and installs import
//! thunks.

use ppc_cpu::{encode_thunk, ThunkTable, KERNEL_NAMESPACE};
use xenon_arena::{AccessMode, GuestArena};

use crate::decompress::{self, DecompressOptions};
use crate::error::LoadError;
use crate::header::{self, ModuleInfo};
use crate::pe::{self, PeInfo};

/// Everything the executor needs to start a thread at a loaded module's
/// entry point.
#[derive(Debug)]
pub struct LoadedModule {
    pub info: ModuleInfo,
    /// `None` when the decompressed image has no recognisable `MZ`/`PE`
    /// header; the XEX2 payload itself is still the governing source of
    /// truth for bytes, so this is diagnostic, not load-bearing.
    pub pe: Option<PeInfo>,
    pub image_base: u32,
    pub image_size: u32,
    pub entry_point: u32,
}

/// Parses, decompresses, maps, and resolves imports for a XEX2 file
/// already read into memory.
///
/// # Errors
///
/// Propagates any [`LoadError`] raised while parsing the container,
/// decompressing the payload, or committing/copying into the arena.
pub fn load(
    arena: &GuestArena,
    data: &[u8],
    thunks: &mut ThunkTable,
    opts: DecompressOptions,
) -> Result<LoadedModule, LoadError> {
    let info = header::parse(data)?;
    let image = decompress::decompress_image(data, &info, opts)?;
    let pe = pe::parse(&image).ok();

    let image_base = info.image_base_address;
    let image_size = image.len() as u32;

    let region = arena.reserve(image_base, u64::from(image_size))?;
    arena.commit(region, AccessMode::ExecuteReadWrite)?;
    let dest = arena.translate(image_base);
    // SAFETY: `region` was just committed read-write-execute and sized
    // to exactly `image.len()` bytes starting at `image_base`.
    unsafe {
        std::ptr::copy_nonoverlapping(image.as_ptr(), dest, image.len());
    }

    resolve_imports(arena, &info, thunks);

    let entry_point = if info.entry_point != 0 { info.entry_point } else { pe.as_ref().map_or(0, |p| p.entry_point) };

    Ok(LoadedModule { info, pe, image_base, image_size, entry_point })
}

/// Installs a three-instruction thunk at every function-import slot and
/// zero-fills every variable-import slot, matching the original
/// loader's "xam-named libraries get a distinct dispatch namespace"
/// policy: imports exported by a library whose name contains "xam" are
/// tagged with [`KERNEL_NAMESPACE`] so the kernel shim can route them to
/// the user-facing namespace instead of the core kernel's.
///
/// The per-record ordinal is the record's index within its owning
/// library — the container's import records carry only a target guest
/// address and a function/variable flag (4.F.2 step 4), not an ordinal
/// of their own, so position is the ordinal.
fn resolve_imports(arena: &GuestArena, info: &ModuleInfo, thunks: &mut ThunkTable) {
    for lib in &info.import_libraries {
        let namespace_tag = if lib.is_xam() { KERNEL_NAMESPACE } else { 0 };
        for (ordinal, &record) in lib.records.iter().enumerate() {
            let is_variable = record & 0x8000_0000 != 0;
            let guest_addr = record & 0x7FFF_FFFF;
            if is_variable {
                write_be_u32(arena, guest_addr, 0);
            } else {
                let dispatch_ordinal = ordinal as u32 | namespace_tag;
                let words = encode_thunk(dispatch_ordinal);
                for (i, word) in words.iter().enumerate() {
                    write_be_u32(arena, guest_addr + (i as u32) * 4, *word);
                }
                thunks.register(guest_addr, dispatch_ordinal);
            }
        }
    }
}

fn write_be_u32(arena: &GuestArena, guest_addr: u32, value: u32) {
    let ptr = arena.translate(guest_addr);
    // SAFETY: `guest_addr` lies inside the image region just committed
    // read-write by `load`; the write is 4-byte aligned import-table
    // traffic, never read back through a differently-typed reference.
    unsafe {
        std::ptr::write_unaligned(ptr.cast::<u32>(), value.to_be());
    }
}
