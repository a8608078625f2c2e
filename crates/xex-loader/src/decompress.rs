//! PE payload decompression: dispatches on `(encryption, compression)`
//! per the file format info parsed out of the optional headers.

use crate::error::LoadError;
use crate::header::{raw_block_descriptors, ModuleInfo, XexCompressionType, XexEncryptionType};
use crate::lzx;

/// Xbox 360 titles use a 128 KiB LZX window; the loader doesn't have a
/// header field carrying this explicitly, so it's the fixed default used
/// whenever the `Compressed` path runs.
const DEFAULT_WINDOW_BITS: u32 = 17;

#[derive(Debug, Clone, Copy, Default)]
pub struct DecompressOptions {
    /// Dev-build escape hatch: proceed with an encrypted image as if it
    /// were plaintext instead of failing fast. Off by default.
    pub allow_unencrypted_fallback: bool,
}

/// Produces the decompressed PE image bytes, dispatching on the module's
/// declared `(encryption, compression)` pair.
///
/// # Errors
///
/// Returns [`LoadError::EncryptionNotPermitted`] for an encrypted image
/// without the fallback enabled, [`LoadError::UnsupportedCompression`]
/// for `DeltaCompressed` (not implemented — title patches only), or
/// [`LoadError::ShortImage`] if the result is shorter than the advertised
/// image size.
pub fn decompress_image(data: &[u8], info: &ModuleInfo, opts: DecompressOptions) -> Result<Vec<u8>, LoadError> {
    let file_format = info.file_format.as_ref();
    let encryption = file_format.map_or(XexEncryptionType::None, |f| f.encryption_type);
    if encryption == XexEncryptionType::Normal && !opts.allow_unencrypted_fallback {
        return Err(LoadError::EncryptionNotPermitted);
    }

    let compression = file_format.map_or(XexCompressionType::None, |f| f.compression_type);
    let image_size = info
        .security_info
        .map_or(data.len().saturating_sub(info.pe_data_offset as usize), |s| s.image_size as usize);

    let image = match compression {
        XexCompressionType::None => decompress_none(data, info, image_size)?,
        XexCompressionType::Raw => decompress_raw(data, info, image_size)?,
        XexCompressionType::Compressed => decompress_lzx(data, info, image_size)?,
        XexCompressionType::DeltaCompressed => {
            return Err(LoadError::UnsupportedCompression("delta-compressed (title patch) images"))
        }
    };

    if image.len() < image_size {
        return Err(LoadError::ShortImage { expected: image_size as u32, actual: image.len() });
    }
    Ok(image)
}

/// `(None, None)`: a verbatim copy from the PE data offset.
fn decompress_none(data: &[u8], info: &ModuleInfo, image_size: usize) -> Result<Vec<u8>, LoadError> {
    let start = info.pe_data_offset as usize;
    let end = (start + image_size).min(data.len());
    let slice = data
        .get(start..end)
        .ok_or(LoadError::ShortImage { expected: image_size as u32, actual: 0 })?;
    Ok(slice.to_vec())
}

/// `(None, Raw)`: a sequence of `{data_size, zero_size}` blocks copied
/// then zero-filled into the output image.
fn decompress_raw(data: &[u8], info: &ModuleInfo, image_size: usize) -> Result<Vec<u8>, LoadError> {
    let file_format = info.file_format.as_ref().ok_or(LoadError::TruncatedRawBlock)?;
    let descriptors = raw_block_descriptors(data, file_format);

    let mut out = Vec::with_capacity(image_size);
    let mut src = info.pe_data_offset as usize;
    for descriptor in descriptors {
        let data_size = descriptor.data_size as usize;
        let end = src + data_size;
        let chunk = data.get(src..end).ok_or(LoadError::TruncatedRawBlock)?;
        out.extend_from_slice(chunk);
        out.resize(out.len() + descriptor.zero_size as usize, 0);
        src = end;
    }
    Ok(out)
}

/// `(None, Compressed)`: strip the XEX2 block-chain wrapper and run the
/// full LZX decoder against the concatenated payload.
fn decompress_lzx(data: &[u8], info: &ModuleInfo, image_size: usize) -> Result<Vec<u8>, LoadError> {
    let start = info.pe_data_offset as usize;
    let chunk_chain = data
        .get(start..)
        .ok_or(LoadError::ShortImage { expected: image_size as u32, actual: 0 })?;
    let compressed = lzx::unwrap_xex_block_chain(chunk_chain);
    lzx::decompress(&compressed, image_size, DEFAULT_WINDOW_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{FileFormatInfo, SecurityInfo};

    #[test]
    fn none_compression_copies_verbatim() {
        let data = vec![0xAA; 64];
        let info = ModuleInfo {
            pe_data_offset: 8,
            security_info: Some(SecurityInfo { header_size: 0, image_size: 16 }),
            ..ModuleInfo::default()
        };
        let image = decompress_image(&data, &info, DecompressOptions::default()).expect("decompress");
        assert_eq!(image.len(), 16);
    }

    #[test]
    fn encrypted_image_fails_without_fallback() {
        let data = vec![0u8; 64];
        let info = ModuleInfo {
            pe_data_offset: 0,
            file_format: Some(FileFormatInfo {
                offset: 0,
                info_size: 8,
                encryption_type: XexEncryptionType::Normal,
                compression_type: XexCompressionType::None,
            }),
            ..ModuleInfo::default()
        };
        let err = decompress_image(&data, &info, DecompressOptions::default()).unwrap_err();
        assert!(matches!(err, LoadError::EncryptionNotPermitted));
    }

    #[test]
    fn raw_blocks_copy_then_zero_fill() {
        let mut data = Vec::new();
        // file_format header at offset 0: {info_size, encryption<<16|compression}
        data.extend_from_slice(&24u32.to_be_bytes()); // info_size = 8 + 2 descriptors*8
        data.extend_from_slice(&1u32.to_be_bytes()); // compression = Raw
        data.extend_from_slice(&4u32.to_be_bytes()); // descriptor0.data_size
        data.extend_from_slice(&2u32.to_be_bytes()); // descriptor0.zero_size
        data.extend_from_slice(&4u32.to_be_bytes()); // descriptor1.data_size
        data.extend_from_slice(&0u32.to_be_bytes()); // descriptor1.zero_size
        let pe_data_offset = data.len() as u32;
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let info = ModuleInfo {
            pe_data_offset,
            file_format: Some(FileFormatInfo {
                offset: 0,
                info_size: 24,
                encryption_type: XexEncryptionType::None,
                compression_type: XexCompressionType::Raw,
            }),
            ..ModuleInfo::default()
        };
        let image = decompress_image(&data, &info, DecompressOptions::default()).expect("decompress");
        assert_eq!(image, vec![1, 2, 3, 4, 0, 0, 5, 6, 7, 8]);
    }
}
