//! Basic-block JIT: scans a guest PPC block, lowers it to AArch64, and
//! caches the compiled code by guest entry address.
//!
//! A compiled block is a free function of `(arena_base, context)` built
//! around the static register assignment in [`regmap`]: hot guest GPRs
//! are loaded into their pinned host registers on entry and spilled back
//! on exit, matching the calling convention `ppc_cpu::ThreadState`'s fixed
//! field offsets exist to support (4.E.2/4.E.3). [`lower`] handles one
//! instruction at a time; this module only adds the block-level framing
//! (prologue/epilogue, exit PC) and the cache/invalidation bookkeeping.

pub mod error;
pub mod lower;
pub mod regmap;
pub mod scanner;

use std::collections::HashMap;

use aarch64_asm::{Emitter, FinalizedCode, Reg};
use ppc_cpu::{Decoded, ThreadState};
use xenon_arena::GuestArena;

pub use error::BackendError;
pub use scanner::{ScannedInstruction, MAX_BLOCK_BYTES};

/// Total bytes a compiled block's frame reserves: `X29`/`X30` plus the
/// five [`regmap::SAVED_PAIRS`].
const FRAME_BYTES: u32 = 96;

/// One compiled basic block.
pub struct CompiledBlock {
    pub guest_address: u32,
    pub guest_size: u32,
    /// Whether this block's terminator was a `bclr`-always return, as
    /// opposed to a `bcctr`-always indirect branch — the only two shapes
    /// [`scanner::scan_block`] ever stops on. An executor uses this to
    /// decide whether the thread's call has returned or merely jumped.
    pub terminates_in_return: bool,
    code: FinalizedCode,
}

impl CompiledBlock {
    #[must_use]
    pub fn host_code_ptr(&self) -> *const u8 {
        self.code.as_ptr()
    }

    #[must_use]
    pub fn host_code_size(&self) -> usize {
        self.code.size()
    }

    /// Enters the compiled block.
    ///
    /// # Safety
    ///
    /// `arena_base` must be the live guest arena's base pointer and
    /// `context` must point at a `ThreadState` that stays valid for the
    /// duration of the call. The caller must also guarantee the bytes at
    /// `guest_address..guest_address + guest_size` haven't changed since
    /// this block was compiled — self-modifying writes must go through
    /// [`JitBackend::invalidate`] first.
    pub unsafe fn call(&self, arena_base: *mut u8, context: *mut ThreadState) {
        let entry: extern "C" fn(*mut u8, *mut ThreadState) = unsafe { std::mem::transmute(self.code.as_ptr()) };
        entry(arena_base, context);
    }
}

/// Compiles PPC basic blocks on demand and caches them by guest entry
/// address (4.E.6), with range-based invalidation for self-modifying code.
#[derive(Default)]
pub struct JitBackend {
    blocks: HashMap<u32, CompiledBlock>,
}

impl JitBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn lookup(&self, guest_address: u32) -> Option<&CompiledBlock> {
        self.blocks.get(&guest_address)
    }

    /// Returns the block cached at `guest_address`, compiling it first on
    /// a cache miss.
    ///
    /// # Errors
    ///
    /// Propagates [`BackendError`] from [`compile_block`].
    pub fn compile_or_get(
        &mut self,
        guest_address: u32,
        fetch: impl Fn(u32) -> u32,
    ) -> Result<&CompiledBlock, BackendError> {
        if !self.blocks.contains_key(&guest_address) {
            let block = compile_block(guest_address, fetch)?;
            self.blocks.insert(guest_address, block);
        }
        Ok(self.blocks.get(&guest_address).expect("just inserted or already present"))
    }

    /// Evicts every cached block whose guest range overlaps
    /// `[start, start + len)`. The freed host code is dropped along with
    /// its `CompiledBlock`, unmapping the executable region.
    pub fn invalidate(&mut self, start: u32, len: u32) {
        let end = start.wrapping_add(len);
        self.blocks.retain(|_, block| {
            let block_end = block.guest_address.wrapping_add(block.guest_size);
            !(block.guest_address < end && start < block_end)
        });
    }

    /// Convenience wrapper over [`Self::compile_or_get`] that fetches
    /// straight out of a live [`GuestArena`] instead of a caller-supplied
    /// closure, for executors that don't need any fetch indirection.
    ///
    /// # Errors
    ///
    /// See [`Self::compile_or_get`].
    pub fn compile_or_get_from_arena(&mut self, guest_address: u32, arena: &GuestArena) -> Result<&CompiledBlock, BackendError> {
        self.compile_or_get(guest_address, |addr| fetch_be_u32(arena, addr))
    }
}

/// Reads one big-endian 32-bit instruction word out of the guest arena at
/// `addr`, matching the interpreter's own big-endian memory model (4.D.2).
///
/// # Safety note
///
/// This trusts the caller to have already committed the page backing
/// `addr` (see [`GuestArena::translate`]'s documented contract); it is the
/// same assumption every other direct arena reader in this workspace
/// makes.
fn fetch_be_u32(arena: &GuestArena, addr: u32) -> u32 {
    // SAFETY: `translate` returns a raw pointer into the reserved 4 GiB
    // arena; reading 4 bytes from it is in-bounds as long as the caller
    // has committed that page, which is the same contract every loader
    // and interpreter memory access in this workspace relies on.
    unsafe {
        let ptr = arena.translate(addr);
        u32::from_be_bytes(std::ptr::read_unaligned(ptr.cast::<[u8; 4]>()))
    }
}

/// Compiles the single basic block starting at `guest_address`, per
/// 4.E.4's block-shape rule: scan until [`scanner::scan_block`] finds a
/// terminator, lower every instruction in order, and wrap the result in
/// the fixed calling-convention prologue/epilogue.
///
/// # Errors
///
/// Returns [`BackendError::BlockTooLarge`] if the scan runs past
/// [`scanner::MAX_BLOCK_BYTES`], or [`BackendError::OutOfExecutableMemory`]
/// if the host allocator can't satisfy the finalized code's mapping.
pub fn compile_block(guest_address: u32, fetch: impl Fn(u32) -> u32) -> Result<CompiledBlock, BackendError> {
    let instructions = scanner::scan_block(guest_address, fetch)?;
    let guest_size = instructions.len() as u32 * 4;
    let terminator = instructions[instructions.len() - 1].decoded;
    let terminates_in_return = terminator.is_return();

    let mut e = Emitter::new();
    emit_prologue(&mut e);

    let last = instructions.len() - 1;
    for (i, insn) in instructions.iter().enumerate() {
        lower::lower_one(&mut e, insn.decoded, i == last);
    }

    emit_epilogue(&mut e, terminator);

    let code = e.finalize().ok_or(BackendError::OutOfExecutableMemory(guest_address))?;
    Ok(CompiledBlock {
        guest_address,
        guest_size,
        terminates_in_return,
        code,
    })
}

/// `X0` carries the arena base, `X1` the context pointer (AAPCS64), moved
/// into their pinned registers after the frame is set up and every hot
/// GPR is loaded from the context.
fn emit_prologue(e: &mut Emitter) {
    e.sub_imm(Reg::SP, Reg::SP, FRAME_BYTES);
    e.stp(Reg::FP, Reg::LR, Reg::SP, 0);
    for (i, (a, b)) in regmap::SAVED_PAIRS.iter().enumerate() {
        e.stp(*a, *b, Reg::SP, 16 + i as i32 * 16);
    }

    e.mov(regmap::ARENA_BASE_REG, Reg::X0);
    e.mov(regmap::CONTEXT_REG, Reg::X1);

    for ppc_reg in regmap::HOT_GPR_LOW..=regmap::HOT_GPR_HIGH {
        let host = regmap::hot_gpr(ppc_reg).expect("hot range");
        e.ldr(host, regmap::CONTEXT_REG, regmap::gpr_context_offset(ppc_reg));
    }
}

/// Spills every hot GPR back to the context, writes the block's exit PC
/// (`LR` for a `bclr`-always return, `CTR` for a `bcctr`-always indirect
/// branch — the only two shapes [`scanner::scan_block`] ever terminates
/// on), restores the saved registers, and returns to the caller.
fn emit_epilogue(e: &mut Emitter, terminator: Decoded) {
    for ppc_reg in regmap::HOT_GPR_LOW..=regmap::HOT_GPR_HIGH {
        let host = regmap::hot_gpr(ppc_reg).expect("hot range");
        e.str(host, regmap::CONTEXT_REG, regmap::gpr_context_offset(ppc_reg));
    }

    let scratch = Reg::X10;
    let exit_pc_offset = if terminator.is_ctr_branch() {
        ThreadState::CTR_OFFSET as i32
    } else {
        ThreadState::LR_OFFSET as i32
    };
    e.ldr(scratch, regmap::CONTEXT_REG, exit_pc_offset);
    e.strw(scratch, regmap::CONTEXT_REG, ThreadState::PC_OFFSET as i32);

    for (i, (a, b)) in regmap::SAVED_PAIRS.iter().enumerate().rev() {
        e.ldp(*a, *b, Reg::SP, 16 + i as i32 * 16);
    }
    e.ldp(Reg::FP, Reg::LR, Reg::SP, 0);
    e.add_imm(Reg::SP, Reg::SP, FRAME_BYTES);
    e.ret(Reg::LR);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_addi(rt: u32, ra: u32, simm: i16) -> u32 {
        (14 << 26) | (rt << 21) | (ra << 16) | (simm as u16 as u32)
    }

    fn encode_bclr_always() -> u32 {
        (19 << 26) | (0b10100 << 21) | (16 << 1)
    }

    fn encode_bcctr_always() -> u32 {
        (19 << 26) | (0b10100 << 21) | (528 << 1)
    }

    #[test]
    fn compiles_minimal_block_and_caches_it() {
        let words = [encode_addi(3, 0, 5), encode_bclr_always()];
        let mut backend = JitBackend::new();
        let block = backend
            .compile_or_get(0x1000, |addr| words[((addr - 0x1000) / 4) as usize])
            .expect("compile");
        assert_eq!(block.guest_address, 0x1000);
        assert_eq!(block.guest_size, 8);
        assert!(block.host_code_size() > 0);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn second_lookup_hits_cache_without_recompiling() {
        let words = [encode_bclr_always()];
        let mut backend = JitBackend::new();
        backend.compile_or_get(0x2000, |_| words[0]).expect("compile");
        let calls = std::cell::Cell::new(0);
        backend
            .compile_or_get(0x2000, |addr| {
                calls.set(calls.get() + 1);
                words[((addr - 0x2000) / 4) as usize]
            })
            .expect("cache hit");
        assert_eq!(calls.get(), 0, "a cached block must not re-invoke fetch");
    }

    #[test]
    fn invalidate_evicts_overlapping_blocks_only() {
        let words = [encode_bclr_always()];
        let mut backend = JitBackend::new();
        backend.compile_or_get(0x1000, |_| words[0]).expect("compile a");
        backend.compile_or_get(0x2000, |_| words[0]).expect("compile b");
        backend.invalidate(0x1000, 4);
        assert!(backend.lookup(0x1000).is_none());
        assert!(backend.lookup(0x2000).is_some());
    }

    #[test]
    fn ctr_terminated_block_reads_ctr_for_exit_pc() {
        let words = [encode_bcctr_always()];
        let block = compile_block(0x3000, |_| words[0]).expect("compile");
        assert_eq!(block.guest_size, 4);
    }

    #[test]
    fn block_exceeding_scan_bound_fails_to_compile() {
        let err = compile_block(0, |_| encode_addi(0, 0, 0)).unwrap_err();
        assert!(matches!(err, BackendError::BlockTooLarge(0)));
    }
}
