//! XEX2 container header, optional headers, security info, and the
//! import-library table.
//!
//! The container is big-endian throughout (unlike the PE image it wraps,
//! which is read native little-endian once unwrapped — see [`crate::pe`]).

use crate::error::LoadError;

pub const XEX2_MAGIC: u32 = 0x5845_5832; // "XEX2"
pub const XEX1_MAGIC: u32 = 0x5845_5831; // "XEX1"

const HEADER_ENTRY_POINT: u32 = 0x0001_0100;
const HEADER_IMAGE_BASE_ADDRESS: u32 = 0x0001_0201;
const HEADER_DEFAULT_STACK_SIZE: u32 = 0x0002_0200;
const HEADER_DEFAULT_HEAP_SIZE: u32 = 0x0002_0401;
const HEADER_SYSTEM_FLAGS: u32 = 0x0003_0000;
const HEADER_ORIGINAL_BASE_ADDRESS: u32 = 0x0001_0001;
const HEADER_IMPORT_LIBRARIES: u32 = 0x0001_03FF;
const HEADER_BASE_FILE_FORMAT: u32 = 0x0000_03FF;

/// Compression applied to the PE payload that follows the security info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XexCompressionType {
    None,
    Raw,
    Compressed,
    DeltaCompressed,
}

impl TryFrom<u32> for XexCompressionType {
    type Error = LoadError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Raw),
            2 => Ok(Self::Compressed),
            3 => Ok(Self::DeltaCompressed),
            other => Err(LoadError::UnknownCompression(other)),
        }
    }
}

/// Encryption applied to the PE payload, checked before decompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XexEncryptionType {
    None,
    Normal,
}

impl TryFrom<u32> for XexEncryptionType {
    type Error = LoadError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Normal),
            other => Err(LoadError::UnknownEncryption(other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SecurityInfo {
    pub header_size: u32,
    pub image_size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FileFormatInfo {
    pub offset: u32,
    pub info_size: u32,
    pub encryption_type: XexEncryptionType,
    pub compression_type: XexCompressionType,
}

/// A single imported library's resolved name and its raw 32-bit
/// big-endian import records, each either a variable slot (high bit set,
/// the remaining bits a guest address to zero-fill) or a function thunk
/// slot (a guest address to receive the three-instruction thunk).
#[derive(Debug, Clone)]
pub struct ImportLibrary {
    pub name: String,
    pub version: u32,
    pub version_min: u32,
    pub records: Vec<u32>,
}

impl ImportLibrary {
    /// Xenia tags every ordinal exported by a library whose name contains
    /// "xam" with the user-facing kernel namespace; every other library
    /// (core `xboxkrnl`, title-specific libraries) dispatches untagged.
    #[must_use]
    pub fn is_xam(&self) -> bool {
        self.name.to_ascii_lowercase().contains("xam")
    }
}

/// A single raw-copy block: `data_size` bytes copied from the source
/// followed by `zero_size` zero bytes, used by the `(None, Raw)`
/// decompression path.
#[derive(Debug, Clone, Copy)]
pub struct RawDataDescriptor {
    pub data_size: u32,
    pub zero_size: u32,
}

/// Parsed module metadata: everything the loader learns about a title
/// before it decompresses or maps a single byte of the PE image.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub entry_point: u32,
    pub image_base_address: u32,
    pub original_base_address: u32,
    pub default_stack_size: u32,
    pub default_heap_size: u32,
    pub system_flags: u32,
    pub pe_data_offset: u32,
    pub security_info: Option<SecurityInfo>,
    pub file_format: Option<FileFormatInfo>,
    pub import_libraries: Vec<ImportLibrary>,
}

fn read_be_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Parses the 24-byte container header, walks the optional-header table,
/// the security info, and (if present) the import-library table.
///
/// # Errors
///
/// Returns [`LoadError::BadMagic`] if the file doesn't open with `XEX1`/
/// `XEX2`, [`LoadError::TruncatedOptionalHeaders`] if the declared header
/// count runs past the end of the file, [`LoadError::TruncatedSecurityInfo`]
/// if the security offset doesn't leave room for its two fields, or
/// [`LoadError::TruncatedImportLibraries`] if a library record runs past
/// the string table or the file.
pub fn parse(data: &[u8]) -> Result<ModuleInfo, LoadError> {
    let magic = read_be_u32(data, 0).ok_or(LoadError::BadMagic(0))?;
    if magic != XEX2_MAGIC && magic != XEX1_MAGIC {
        return Err(LoadError::BadMagic(magic));
    }
    let pe_data_offset = read_be_u32(data, 8).ok_or(LoadError::TruncatedOptionalHeaders)?;
    let security_offset = read_be_u32(data, 16).ok_or(LoadError::TruncatedOptionalHeaders)?;
    let opt_header_count = read_be_u32(data, 20).ok_or(LoadError::TruncatedOptionalHeaders)?;

    let mut info = ModuleInfo {
        pe_data_offset,
        ..ModuleInfo::default()
    };

    let mut import_libraries_offset = None;
    let mut base_file_format_offset = None;

    for i in 0..opt_header_count {
        let entry_offset = 24 + (i as usize) * 8;
        let key = read_be_u32(data, entry_offset).ok_or(LoadError::TruncatedOptionalHeaders)?;
        let value = read_be_u32(data, entry_offset + 4).ok_or(LoadError::TruncatedOptionalHeaders)?;
        match key {
            HEADER_ENTRY_POINT => info.entry_point = value,
            HEADER_IMAGE_BASE_ADDRESS => info.image_base_address = value,
            HEADER_ORIGINAL_BASE_ADDRESS => info.original_base_address = value,
            HEADER_DEFAULT_STACK_SIZE => info.default_stack_size = value,
            HEADER_DEFAULT_HEAP_SIZE => info.default_heap_size = value,
            HEADER_SYSTEM_FLAGS => info.system_flags = value,
            HEADER_IMPORT_LIBRARIES => import_libraries_offset = Some(value),
            HEADER_BASE_FILE_FORMAT => base_file_format_offset = Some(value),
            _ => {
                // Headers whose low byte exceeds 1 point at a larger
                // structure rather than carrying their payload inline;
                // none beyond import libraries and file-format info are
                // consumed by this loader.
            }
        }
    }

    if security_offset != 0 {
        let header_size = read_be_u32(data, security_offset as usize)
            .ok_or(LoadError::TruncatedSecurityInfo(security_offset))?;
        let image_size = read_be_u32(data, security_offset as usize + 4)
            .ok_or(LoadError::TruncatedSecurityInfo(security_offset))?;
        info.security_info = Some(SecurityInfo { header_size, image_size });
    }

    if let Some(offset) = base_file_format_offset {
        let offset = offset as usize;
        let info_size = read_be_u32(data, offset).ok_or(LoadError::TruncatedOptionalHeaders)?;
        let raw = read_be_u32(data, offset + 4).ok_or(LoadError::TruncatedOptionalHeaders)?;
        let encryption_type = XexEncryptionType::try_from(raw >> 16)?;
        let compression_type = XexCompressionType::try_from(raw & 0xFFFF)?;
        info.file_format = Some(FileFormatInfo {
            offset: offset as u32,
            info_size,
            encryption_type,
            compression_type,
        });
    }

    if let Some(offset) = import_libraries_offset {
        info.import_libraries = parse_import_libraries(data, offset as usize)?;
    }

    Ok(info)
}

fn parse_import_libraries(data: &[u8], offset: usize) -> Result<Vec<ImportLibrary>, LoadError> {
    let string_table_size =
        read_be_u32(data, offset).ok_or(LoadError::TruncatedImportLibraries)? as usize;
    let lib_count = read_be_u32(data, offset + 4).ok_or(LoadError::TruncatedImportLibraries)?;

    let string_table_start = offset + 8;
    let string_table_end = string_table_start + string_table_size;
    let string_table = data
        .get(string_table_start..string_table_end)
        .ok_or(LoadError::TruncatedImportLibraries)?;

    let mut names = Vec::new();
    let mut cursor = 0;
    while cursor < string_table.len() {
        let end = string_table[cursor..]
            .iter()
            .position(|&b| b == 0)
            .map_or(string_table.len(), |p| cursor + p);
        if end > cursor {
            names.push(String::from_utf8_lossy(&string_table[cursor..end]).into_owned());
        }
        cursor = end + 1;
    }

    // 4-byte-align the cursor past the string table before the record list.
    let aligned_size = (string_table_size + 3) & !3;
    let mut pos = string_table_start + aligned_size;

    let mut libraries = Vec::with_capacity(lib_count as usize);
    for name in names.into_iter().take(lib_count as usize) {
        let record_size = read_be_u32(data, pos).ok_or(LoadError::TruncatedImportLibraries)? as usize;
        let version = read_be_u32(data, pos + 4).ok_or(LoadError::TruncatedImportLibraries)?;
        let version_min = read_be_u32(data, pos + 8).ok_or(LoadError::TruncatedImportLibraries)?;
        if record_size < 20 {
            return Err(LoadError::TruncatedImportLibraries);
        }
        let record_count = (record_size - 20) / 4;
        let mut records = Vec::with_capacity(record_count);
        for i in 0..record_count {
            let record = read_be_u32(data, pos + 20 + i * 4).ok_or(LoadError::TruncatedImportLibraries)?;
            records.push(record);
        }
        libraries.push(ImportLibrary { name, version, version_min, records });
        pos += record_size;
    }

    Ok(libraries)
}

/// Reads the `(data_size, zero_size)` block descriptors following the
/// fixed `FileFormatInfo` fields, used by the `(None, Raw)` decompression
/// path.
#[must_use]
pub fn raw_block_descriptors(data: &[u8], file_format: &FileFormatInfo) -> Vec<RawDataDescriptor> {
    const FILE_FORMAT_INFO_FIXED_SIZE: u32 = 8;
    let block_count = file_format
        .info_size
        .saturating_sub(FILE_FORMAT_INFO_FIXED_SIZE)
        / 8;
    let base = file_format.offset as usize + FILE_FORMAT_INFO_FIXED_SIZE as usize;
    (0..block_count as usize)
        .filter_map(|i| {
            let data_size = read_be_u32(data, base + i * 8)?;
            let zero_size = read_be_u32(data, base + i * 8 + 4)?;
            Some(RawDataDescriptor { data_size, zero_size })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_be_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    #[test]
    fn rejects_bad_magic() {
        let data = vec![0u8; 24];
        let err = parse(&data).unwrap_err();
        assert!(matches!(err, LoadError::BadMagic(0)));
    }

    #[test]
    fn parses_minimal_header_with_no_optional_headers() {
        let mut data = Vec::new();
        push_be_u32(&mut data, XEX2_MAGIC);
        push_be_u32(&mut data, 0); // module_flags
        push_be_u32(&mut data, 24); // pe_data_offset
        push_be_u32(&mut data, 0); // reserved
        push_be_u32(&mut data, 0); // security_offset
        push_be_u32(&mut data, 0); // opt_header_count
        let info = parse(&data).expect("parse");
        assert_eq!(info.pe_data_offset, 24);
        assert!(info.security_info.is_none());
        assert!(info.import_libraries.is_empty());
    }

    #[test]
    fn parses_entry_point_optional_header() {
        let mut data = Vec::new();
        push_be_u32(&mut data, XEX2_MAGIC);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 1); // one optional header
        push_be_u32(&mut data, HEADER_ENTRY_POINT);
        push_be_u32(&mut data, 0x8200_1234);
        let info = parse(&data).expect("parse");
        assert_eq!(info.entry_point, 0x8200_1234);
    }

    #[test]
    fn parses_security_info() {
        let mut data = Vec::new();
        push_be_u32(&mut data, XEX2_MAGIC);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 24); // security_offset right after the header
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 0x180); // header_size
        push_be_u32(&mut data, 0x0010_0000); // image_size
        let info = parse(&data).expect("parse");
        let sec = info.security_info.expect("security info");
        assert_eq!(sec.header_size, 0x180);
        assert_eq!(sec.image_size, 0x0010_0000);
    }

    #[test]
    fn parses_variable_length_import_libraries() {
        let mut data = Vec::new();
        push_be_u32(&mut data, XEX2_MAGIC);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 0);
        push_be_u32(&mut data, 1);
        push_be_u32(&mut data, HEADER_IMPORT_LIBRARIES);
        let import_table_offset = 32u32;
        push_be_u32(&mut data, import_table_offset);
        assert_eq!(data.len(), import_table_offset as usize);

        // String table: two names, "xam.xex" and "xboxkrnl.exe", padded to
        // a 4-byte boundary.
        let mut string_table = b"xam.xex\0xboxkrnl.exe\0".to_vec();
        while string_table.len() % 4 != 0 {
            string_table.push(0);
        }
        push_be_u32(&mut data, string_table.len() as u32);
        push_be_u32(&mut data, 2); // lib_count
        data.extend_from_slice(&string_table);

        // Library 0: "xam.xex", one function import record.
        push_be_u32(&mut data, 20 + 4); // record_size
        push_be_u32(&mut data, 0x0200_0000); // version
        push_be_u32(&mut data, 0x0100_0000); // version_min
        push_be_u32(&mut data, 0x8200_5000); // import record (thunk addr)

        // Library 1: "xboxkrnl.exe", two records.
        push_be_u32(&mut data, 20 + 8);
        push_be_u32(&mut data, 0x0200_0000);
        push_be_u32(&mut data, 0x0100_0000);
        push_be_u32(&mut data, 0x8200_6000);
        push_be_u32(&mut data, 0x8000_7000); // variable import (high bit set)

        let info = parse(&data).expect("parse");
        assert_eq!(info.import_libraries.len(), 2);
        assert_eq!(info.import_libraries[0].name, "xam.xex");
        assert!(info.import_libraries[0].is_xam());
        assert_eq!(info.import_libraries[0].records, vec![0x8200_5000]);
        assert_eq!(info.import_libraries[1].name, "xboxkrnl.exe");
        assert!(!info.import_libraries[1].is_xam());
        assert_eq!(info.import_libraries[1].records, vec![0x8200_6000, 0x8000_7000]);
    }
}
