//! PowerPC (Xenon) instruction decoding and interpretation.
//!
//! This crate owns the guest CPU model: instruction field decoding
//! ([`decode`]), the fixed-ABI register file shared with the JIT backend
//! ([`state`]), HLE kernel-call dispatch ([`dispatch`]), and a
//! fetch-decode-execute interpreter usable standalone or as the JIT's
//! fallback path for instructions it hasn't compiled yet ([`interp`]).

pub mod decode;
pub mod dispatch;
pub mod interp;
pub mod state;

pub use decode::Decoded;
pub use dispatch::{encode_thunk, DispatchResult, KernelDispatch, NullDispatch, ThunkTable, KERNEL_NAMESPACE};
pub use interp::{Interpreter, StepResult};
pub use state::{ConditionRegister, Reservation, ThreadState, XerRegister};
