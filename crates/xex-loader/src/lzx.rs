//! LZX decompression.
//!
//! The Xbox 360 compresses XEX2 PE payloads with a constrained variant of
//! the Microsoft CAB LZX algorithm: a 16-bit-little-endian-aligned
//! bitstream feeding three canonical Huffman trees (main, length, and an
//! aligned-offset tree used only by `Aligned` blocks) over a sliding
//! window, with a three-entry recency cache (R0/R1/R2) standing in for
//! the most recently used match offsets. This is the full decompression
//! path, not a raw-copy stand-in — see [`crate::decompress`] for how the
//! XEX2 container picks between this, the raw-block path, and a verbatim
//! copy based on the file format's declared compression type.

use crate::error::LoadError;

const MIN_MATCH: u32 = 2;
const NUM_CHARS: u32 = 256;
const BLOCKTYPE_VERBATIM: u32 = 1;
const BLOCKTYPE_ALIGNED: u32 = 2;
const BLOCKTYPE_UNCOMPRESSED: u32 = 3;
const PRETREE_NUM_ELEMENTS: usize = 20;
const ALIGNED_NUM_ELEMENTS: usize = 8;
const NUM_PRIMARY_LENGTHS: u32 = 7;
const NUM_SECONDARY_LENGTHS: usize = 249;
const MAX_CODE_LEN: usize = 16;

// Number of position slots per window size, indexed by `window_bits - 15`.
// Values beyond a 21-bit window are carried for completeness even though
// Xbox 360 titles are only ever observed at 17.
const NUM_POSITION_SLOTS: [u32; 11] = [30, 32, 34, 36, 38, 42, 50, 66, 98, 162, 290];

#[rustfmt::skip]
const POSITION_EXTRA_BITS: [u32; 51] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4,
    5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10,
    11, 11, 12, 12, 13, 13, 14, 14, 15, 15, 16, 16,
    17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17,
    17, 17, 17,
];

#[rustfmt::skip]
const POSITION_BASE: [u32; 51] = [
          0,       1,       2,       3,       4,       6,
          8,      12,      16,      24,      32,      48,
         64,      96,     128,     192,     256,     384,
        512,     768,    1024,    1536,    2048,    3072,
       4096,    6144,    8192,   12288,   16384,   24576,
      32768,   49152,   65536,   98304,  131072,  196608,
     262144,  393216,  524288,  655360,  786432,  917504,
    1048576, 1179648, 1310720, 1441792, 1572864, 1703936,
    1835008, 1966080, 2097152,
];

/// The three block types a `Verbatim`/`Aligned` body can hold, plus the
/// literal `Uncompressed` escape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    Verbatim,
    Aligned,
    Uncompressed,
}

/// 16-bit-little-endian-aligned MSB-first bit reader over an LZX stream.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    buf: u32,
    bits_left: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, buf: 0, bits_left: 0 }
    }

    fn ensure_bits(&mut self, need: u32) {
        while self.bits_left < need && self.pos + 1 < self.data.len() {
            let word = u32::from(self.data[self.pos]) | (u32::from(self.data[self.pos + 1]) << 8);
            self.pos += 2;
            self.buf |= word << (32 - 16 - self.bits_left);
            self.bits_left += 16;
        }
    }

    fn peek(&mut self, n: u32) -> u32 {
        if n == 0 {
            return 0;
        }
        self.ensure_bits(n);
        self.buf >> (32 - n)
    }

    fn skip(&mut self, n: u32) {
        self.buf = self.buf.wrapping_shl(n);
        self.bits_left = self.bits_left.saturating_sub(n);
    }

    fn read(&mut self, n: u32) -> u32 {
        let v = self.peek(n);
        self.skip(n);
        v
    }

    fn read_bit(&mut self) -> u32 {
        self.read(1)
    }

    /// Discards buffered bits back to the next 16-bit boundary, used
    /// before an `Uncompressed` block's raw reseed words and raw bytes.
    fn align16(&mut self) {
        let drop = self.bits_left & 15;
        if drop != 0 {
            self.skip(drop);
        }
    }

    /// Drops all buffered bits and reads a raw little-endian `u32`
    /// directly from the byte stream, as `Uncompressed` blocks do for
    /// their R0/R1/R2 reseed values.
    fn read_raw_u32_le(&mut self) -> Result<u32, LoadError> {
        self.buf = 0;
        self.bits_left = 0;
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(LoadError::Lzx("truncated uncompressed-block reseed"))?;
        self.pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_raw_bytes(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(LoadError::Lzx("truncated uncompressed block"))?;
        self.pos += n;
        Ok(slice)
    }

    fn align_byte(&mut self) {
        if self.pos % 2 != 0 {
            self.pos += 1;
        }
    }
}

/// A canonical Huffman decode table built from a code-length-per-symbol
/// array, using the standard sorted-symbol-list construction: symbols are
/// grouped by code length and assigned codes in length-then-symbol order,
/// so decoding walks bit by bit comparing against the first code of each
/// length rather than needing a direct-lookup table sized to the longest
/// code.
struct HuffmanTable {
    count: [u16; MAX_CODE_LEN + 1],
    symbol: Vec<u16>,
}

impl HuffmanTable {
    fn build(lens: &[u16]) -> Result<Self, LoadError> {
        let mut count = [0u16; MAX_CODE_LEN + 1];
        for &len in lens {
            if len as usize > MAX_CODE_LEN {
                return Err(LoadError::Lzx("huffman code length exceeds 16 bits"));
            }
            count[len as usize] += 1;
        }
        count[0] = 0;

        let mut offsets = [0u16; MAX_CODE_LEN + 2];
        for len in 1..=MAX_CODE_LEN {
            offsets[len + 1] = offsets[len] + count[len];
        }

        let mut symbol = vec![0u16; lens.len()];
        let mut next = offsets;
        for (sym, &len) in lens.iter().enumerate() {
            if len != 0 {
                let slot = &mut next[len as usize];
                symbol[*slot as usize] = sym as u16;
                *slot += 1;
            }
        }
        Ok(Self { count, symbol })
    }

    fn decode(&self, bits: &mut BitReader) -> Result<u16, LoadError> {
        let mut code = 0i32;
        let mut first = 0i32;
        let mut index = 0i32;
        for len in 1..=MAX_CODE_LEN {
            code |= bits.read_bit() as i32;
            let count = i32::from(self.count[len]);
            if code - first < count {
                return Ok(self.symbol[(index + (code - first)) as usize]);
            }
            index += count;
            first = (first + count) << 1;
            code <<= 1;
        }
        Err(LoadError::Lzx("no huffman code matched the bitstream"))
    }
}

/// Persistent decoder state: the sliding window, the three entropy
/// trees, and the recency offset cache. Code lengths for the main and
/// length trees persist across blocks (each block only updates the
/// positions it touches), matching LZX's incremental tree-update design.
struct Decoder {
    window: Vec<u8>,
    window_pos: usize,
    main_lens: Vec<u16>,
    length_lens: Vec<u16>,
    r0: u32,
    r1: u32,
    r2: u32,
}

impl Decoder {
    fn new(window_bits: u32) -> Self {
        let window_size = 1usize << window_bits;
        let num_position_slots = NUM_POSITION_SLOTS
            .get((window_bits.saturating_sub(15)) as usize)
            .copied()
            .unwrap_or(34);
        let main_elements = NUM_CHARS + num_position_slots * NUM_PRIMARY_LENGTHS;
        Self {
            window: vec![0u8; window_size],
            window_pos: 0,
            main_lens: vec![0u16; main_elements as usize],
            length_lens: vec![0u16; NUM_SECONDARY_LENGTHS],
            r0: 1,
            r1: 1,
            r2: 1,
        }
    }

    fn window_mask(&self) -> usize {
        self.window.len() - 1
    }

    /// Reads a pretree (20 raw 4-bit lengths) and uses it to decode a run
    /// of code lengths for `lens[first..last]`, applying the delta/RLE
    /// escapes (17/18/19) that let a block touch only the symbols whose
    /// length actually changed.
    fn read_lengths(bits: &mut BitReader, lens: &mut [u16], first: usize, last: usize) -> Result<(), LoadError> {
        let mut pretree_lens = [0u16; PRETREE_NUM_ELEMENTS];
        for slot in &mut pretree_lens {
            *slot = bits.read(4) as u16;
        }
        let pretree = HuffmanTable::build(&pretree_lens)?;

        let mut i = first;
        while i < last {
            let sym = pretree.decode(bits)?;
            match sym {
                17 => {
                    let run = bits.read(4) + 4;
                    for _ in 0..run {
                        if i >= last {
                            break;
                        }
                        lens[i] = 0;
                        i += 1;
                    }
                }
                18 => {
                    let run = bits.read(5) + 20;
                    for _ in 0..run {
                        if i >= last {
                            break;
                        }
                        lens[i] = 0;
                        i += 1;
                    }
                }
                19 => {
                    let run = bits.read(1) + 4;
                    let z = pretree.decode(bits)? as u32;
                    let new_len = ((u32::from(lens[i]) + 17 - z) % 17) as u16;
                    for _ in 0..run {
                        if i >= last {
                            break;
                        }
                        lens[i] = new_len;
                        i += 1;
                    }
                }
                sym if sym <= 16 => {
                    lens[i] = ((u32::from(lens[i]) + 17 - u32::from(sym)) % 17) as u16;
                    i += 1;
                }
                _ => return Err(LoadError::Lzx("invalid pretree symbol")),
            }
        }
        Ok(())
    }

    fn decode_block(
        &mut self,
        bits: &mut BitReader,
        block_type: BlockType,
        aligned_tree: Option<&HuffmanTable>,
        main_tree: &HuffmanTable,
        length_tree: &HuffmanTable,
        mut remaining: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), LoadError> {
        let mask = self.window_mask();
        while remaining > 0 {
            let sym = u32::from(main_tree.decode(bits)?);
            if sym < NUM_CHARS {
                let byte = sym as u8;
                self.window[self.window_pos] = byte;
                self.window_pos = (self.window_pos + 1) & mask;
                out.push(byte);
                remaining -= 1;
                continue;
            }

            let sym = sym - NUM_CHARS;
            let len_slot = sym % NUM_PRIMARY_LENGTHS;
            let pos_slot = sym / NUM_PRIMARY_LENGTHS;

            let mut match_length = MIN_MATCH;
            if len_slot == NUM_PRIMARY_LENGTHS - 1 {
                match_length += u32::from(length_tree.decode(bits)?) + NUM_PRIMARY_LENGTHS - 1;
            } else {
                match_length += len_slot;
            }

            let pos_slot = pos_slot as usize;
            let match_offset = match pos_slot {
                0 => self.r0,
                1 => {
                    let offset = self.r1;
                    self.r1 = self.r0;
                    self.r0 = offset;
                    offset
                }
                2 => {
                    let offset = self.r2;
                    self.r2 = self.r0;
                    self.r0 = offset;
                    offset
                }
                _ => {
                    let extra = POSITION_EXTRA_BITS[pos_slot];
                    let offset = match block_type {
                        BlockType::Aligned if extra >= 3 => {
                            let verbatim = bits.read(extra - 3);
                            let aligned = aligned_tree
                                .ok_or(LoadError::Lzx("aligned block missing aligned-offset tree"))?
                                .decode(bits)? as u32;
                            POSITION_BASE[pos_slot] + (verbatim << 3) + aligned
                        }
                        _ if extra > 0 => POSITION_BASE[pos_slot] + bits.read(extra),
                        _ => POSITION_BASE[pos_slot],
                    };
                    self.r2 = self.r1;
                    self.r1 = self.r0;
                    self.r0 = offset;
                    offset
                }
            };
            let match_offset = if match_offset == 0 { 1 } else { match_offset };

            let mut src_pos = (self.window_pos.wrapping_sub(match_offset as usize)) & mask;
            for _ in 0..match_length {
                if remaining == 0 {
                    break;
                }
                let byte = self.window[src_pos];
                self.window[self.window_pos] = byte;
                self.window_pos = (self.window_pos + 1) & mask;
                src_pos = (src_pos + 1) & mask;
                out.push(byte);
                remaining -= 1;
            }
        }
        Ok(())
    }
}

/// Clamps a declared window-bits value to the 15..=21 range this
/// decoder supports; Xbox 360 titles are always 17.
#[must_use]
pub fn clamp_window_bits(window_bits: u32) -> u32 {
    window_bits.clamp(15, 21)
}

/// Decompresses a raw LZX bitstream (the concatenation of an XEX2 block
/// chain's payloads — see [`unwrap_xex_block_chain`]) into exactly
/// `uncompressed_size` bytes.
///
/// # Errors
///
/// Returns [`LoadError::Lzx`] on a malformed bitstream (an unknown block
/// type, a Huffman code with no match in its table, or a truncated
/// `Uncompressed` block).
pub fn decompress(compressed: &[u8], uncompressed_size: usize, window_bits: u32) -> Result<Vec<u8>, LoadError> {
    let window_bits = clamp_window_bits(window_bits);
    let mut decoder = Decoder::new(window_bits);
    let mut bits = BitReader::new(compressed);
    let mut out = Vec::with_capacity(uncompressed_size);

    while out.len() < uncompressed_size {
        let block_type = match bits.read(3) {
            BLOCKTYPE_VERBATIM => BlockType::Verbatim,
            BLOCKTYPE_ALIGNED => BlockType::Aligned,
            BLOCKTYPE_UNCOMPRESSED => BlockType::Uncompressed,
            other => return Err(LoadError::Lzx(block_type_name(other))),
        };
        let mut block_size = bits.read(24) as usize;
        if block_size == 0 {
            break;
        }
        block_size = block_size.min(uncompressed_size - out.len());

        match block_type {
            BlockType::Verbatim | BlockType::Aligned => {
                let aligned_tree = if block_type == BlockType::Aligned {
                    let mut lens = [0u16; ALIGNED_NUM_ELEMENTS];
                    for slot in &mut lens {
                        *slot = bits.read(3) as u16;
                    }
                    Some(HuffmanTable::build(&lens)?)
                } else {
                    None
                };

                let main_len = decoder.main_lens.len();
                Decoder::read_lengths(&mut bits, &mut decoder.main_lens, 0, NUM_CHARS as usize)?;
                Decoder::read_lengths(&mut bits, &mut decoder.main_lens, NUM_CHARS as usize, main_len)?;
                let main_tree = HuffmanTable::build(&decoder.main_lens)?;

                let length_len = decoder.length_lens.len();
                Decoder::read_lengths(&mut bits, &mut decoder.length_lens, 0, length_len)?;
                let length_tree = HuffmanTable::build(&decoder.length_lens)?;

                decoder.decode_block(
                    &mut bits,
                    block_type,
                    aligned_tree.as_ref(),
                    &main_tree,
                    &length_tree,
                    block_size as u32,
                    &mut out,
                )?;
            }
            BlockType::Uncompressed => {
                bits.align16();
                decoder.r0 = bits.read_raw_u32_le()?;
                decoder.r1 = bits.read_raw_u32_le()?;
                decoder.r2 = bits.read_raw_u32_le()?;
                let raw = bits.read_raw_bytes(block_size)?;
                let mask = decoder.window_mask();
                for &byte in raw {
                    decoder.window[decoder.window_pos] = byte;
                    decoder.window_pos = (decoder.window_pos + 1) & mask;
                    out.push(byte);
                }
                bits.align_byte();
            }
        }
    }

    Ok(out)
}

fn block_type_name(raw: u32) -> &'static str {
    match raw {
        0 => "invalid (zero) LZX block type",
        _ => "unrecognized LZX block type",
    }
}

/// Strips the XEX2-specific 24-byte block-chain wrapper — each chunk is
/// preceded by `{big-endian u32 block_size, 20-byte SHA-1 of the next
/// chunk}` — and concatenates the chunk payloads into one contiguous LZX
/// bitstream. The hash is trusted, not recomputed (decompression only,
/// no re-encoding or integrity re-verification is in scope here).
#[must_use]
pub fn unwrap_xex_block_chain(data: &[u8]) -> Vec<u8> {
    const CHUNK_HEADER_SIZE: usize = 24;
    let mut compressed = Vec::with_capacity(data.len());
    let mut offset = 0;
    while offset + CHUNK_HEADER_SIZE <= data.len() {
        let size_bytes = &data[offset..offset + 4];
        let mut block_size =
            u32::from_be_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]]) as usize;
        offset += CHUNK_HEADER_SIZE;
        if block_size == 0 {
            break;
        }
        block_size = block_size.min(data.len() - offset);
        compressed.extend_from_slice(&data[offset..offset + block_size]);
        offset += block_size;
    }
    compressed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huffman_table_decodes_single_symbol_code() {
        // Two symbols, length 1 each: canonical codes are 0 and 1.
        let table = HuffmanTable::build(&[1, 1]).expect("build");
        let data = [0b1000_0000, 0];
        let mut bits = BitReader::new(&data);
        assert_eq!(table.decode(&mut bits).expect("decode"), 1);
    }

    #[test]
    fn bit_reader_reads_msb_first_within_le_word() {
        // Little-endian word 0x0001 -> bits (MSB first) 0000000000000001.
        let data = [0x01, 0x00];
        let mut bits = BitReader::new(&data);
        assert_eq!(bits.read(15), 0);
        assert_eq!(bits.read(1), 1);
    }

    #[test]
    fn unwrap_xex_block_chain_strips_headers() {
        let mut data = Vec::new();
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        let out = unwrap_xex_block_chain(&data);
        assert_eq!(out, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn clamp_window_bits_enforces_xex2_range() {
        assert_eq!(clamp_window_bits(10), 15);
        assert_eq!(clamp_window_bits(30), 21);
        assert_eq!(clamp_window_bits(17), 17);
    }
}
