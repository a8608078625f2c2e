//! Block scanning: decides where a compiled block starts and ends.
//!
//! A block spans from its entry guest address to the first terminator —
//! an unconditional function return (`bclr` with the "always" `BO`
//! encoding) or a register-indirect branch through the count register
//! (`bcctr`). Anything else just keeps the scan going, including
//! conditional branches and `bl`, which the baseline lowers as fallthrough
//! with no direct block-to-block linking (4.E.5).

use ppc_cpu::Decoded;

use crate::error::BackendError;

/// Scanned forward instructions end-to-end exceeding this many bytes of
/// PPC code abort the scan — a malformed or pathological instruction
/// stream should never pin the compiler in an unbounded loop.
pub const MAX_BLOCK_BYTES: u32 = 64 * 1024;

/// One decoded instruction plus the guest address it was fetched from.
#[derive(Debug, Clone, Copy)]
pub struct ScannedInstruction {
    pub address: u32,
    pub decoded: Decoded,
}

/// Scans forward from `start` using `fetch` (typically `arena_base +
/// addr`, big-endian-interpreted) until a terminator is found, returning
/// every instruction scanned including the terminator itself.
///
/// # Errors
///
/// Returns [`BackendError::BlockTooLarge`] if [`MAX_BLOCK_BYTES`] is
/// exceeded without finding a terminator.
pub fn scan_block(start: u32, fetch: impl Fn(u32) -> u32) -> Result<Vec<ScannedInstruction>, BackendError> {
    let mut instructions = Vec::new();
    let mut address = start;
    loop {
        if address.wrapping_sub(start) >= MAX_BLOCK_BYTES {
            return Err(BackendError::BlockTooLarge(start));
        }
        let decoded = Decoded::new(fetch(address));
        let is_terminator = decoded.is_return() || decoded.is_ctr_branch();
        instructions.push(ScannedInstruction { address, decoded });
        if is_terminator {
            return Ok(instructions);
        }
        address = address.wrapping_add(4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_bclr_always() -> u32 {
        (19 << 26) | (0b10100 << 21) | (16 << 1)
    }

    fn encode_bcctr_always() -> u32 {
        (19 << 26) | (0b10100 << 21) | (528 << 1)
    }

    fn encode_nop() -> u32 {
        0x6000_0000 // ori r0, r0, 0
    }

    #[test]
    fn stops_at_unconditional_return() {
        let words = [encode_nop(), encode_nop(), encode_bclr_always()];
        let scanned = scan_block(0x1000, |addr| {
            let idx = ((addr - 0x1000) / 4) as usize;
            words[idx]
        })
        .expect("scan");
        assert_eq!(scanned.len(), 3);
        assert!(scanned.last().unwrap().decoded.is_return());
    }

    #[test]
    fn stops_at_ctr_branch() {
        let words = [encode_nop(), encode_bcctr_always()];
        let scanned = scan_block(0x2000, |addr| {
            let idx = ((addr - 0x2000) / 4) as usize;
            words[idx]
        })
        .expect("scan");
        assert_eq!(scanned.len(), 2);
        assert!(scanned.last().unwrap().decoded.is_ctr_branch());
    }

    #[test]
    fn aborts_past_safety_bound() {
        let err = scan_block(0, |_| encode_nop()).unwrap_err();
        assert!(matches!(err, BackendError::BlockTooLarge(0)));
    }
}
