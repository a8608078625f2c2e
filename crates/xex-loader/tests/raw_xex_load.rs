//! S4: loading an uncompressed XEX2 container end to end — header parse,
//! straight copy into the guest arena, and entry-point resolution with
//! no PE header present to fall back on.

use ppc_cpu::ThunkTable;
use xenon_arena::GuestArena;
use xex_loader::DecompressOptions;

fn build_minimal_xex(image: &[u8], entry_point: u32, image_base: u32) -> Vec<u8> {
    // 24-byte container header, one optional header (entry point), no
    // security info, no import libraries, compression/encryption None.
    let mut data = Vec::new();
    data.extend_from_slice(b"XEX2");
    data.extend_from_slice(&0u32.to_be_bytes()); // module flags
    let pe_data_offset_pos = data.len();
    data.extend_from_slice(&0u32.to_be_bytes()); // pe_data_offset, patched below
    data.extend_from_slice(&0u32.to_be_bytes()); // reserved
    data.extend_from_slice(&0u32.to_be_bytes()); // security_offset = 0 (none)
    data.extend_from_slice(&2u32.to_be_bytes()); // opt_header_count

    // HEADER_ENTRY_POINT = 0x0001_0100
    data.extend_from_slice(&0x0001_0100u32.to_be_bytes());
    data.extend_from_slice(&entry_point.to_be_bytes());
    // HEADER_IMAGE_BASE_ADDRESS = 0x0001_0201
    data.extend_from_slice(&0x0001_0201u32.to_be_bytes());
    data.extend_from_slice(&image_base.to_be_bytes());

    let pe_data_offset = data.len() as u32;
    data[pe_data_offset_pos..pe_data_offset_pos + 4].copy_from_slice(&pe_data_offset.to_be_bytes());
    data.extend_from_slice(image);
    data
}

#[test]
fn raw_image_lands_in_the_arena_at_its_declared_base() {
    let image: Vec<u8> = (0..64u8).collect();
    let entry_point = 0x8201_0000;
    let image_base = 0x8200_0000;
    let data = build_minimal_xex(&image, entry_point, image_base);

    // The image lands at 0x8200_0000, so the arena needs the full 4 GiB
    // reservation rather than the cut-down size other tests use — it's
    // still just a `PROT_NONE` virtual reservation, not physical memory.
    let arena = GuestArena::initialize().expect("arena");
    let mut thunks = ThunkTable::new();
    let module = xex_loader::load_module(&arena, &data, &mut thunks, DecompressOptions::default()).expect("load");

    assert_eq!(module.image_base, image_base);
    assert_eq!(module.image_size, image.len() as u32);
    assert_eq!(module.entry_point, entry_point);
    assert!(module.pe.is_none(), "raw payload here carries no MZ/PE header");

    let ptr = arena.translate(image_base);
    let mapped = unsafe { std::slice::from_raw_parts(ptr, image.len()) };
    assert_eq!(mapped, image.as_slice());
}
