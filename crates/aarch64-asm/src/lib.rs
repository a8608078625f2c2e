//! AArch64 machine code emitter.
//!
//! Encodes raw little-endian 32-bit AArch64 instruction words to a growable
//! buffer, then copies that buffer into an executable host mapping and
//! flushes the instruction cache across the written range. This is the only
//! place in the workspace that turns bytes into branchable code.

mod emitter;
mod reg;

pub use emitter::{Emitter, FinalizedCode};
pub use reg::{Cond, Reg, Shift, VReg};
