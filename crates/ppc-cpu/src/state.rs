//! `ThreadState`: the fixed-ABI register context shared between the
//! interpreter and JIT-compiled code.
//!
//! Layout is load-bearing. Compiled blocks address fields of this struct
//! directly through a context pointer pinned in a callee-saved AArch64
//! register, so every offset below is part of the calling convention, not
//! an implementation detail. The `layout` tests assert each offset with
//! `core::mem::offset_of!` rather than trusting the field order to stay
//! correct under edits.

use xenon_base::{Observable, Value};

/// Condition register: eight 4-bit fields, each carrying LT/GT/EQ/SO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConditionRegister(pub u32);

impl ConditionRegister {
    pub const LT: u32 = 0b1000;
    pub const GT: u32 = 0b0100;
    pub const EQ: u32 = 0b0010;
    pub const SO: u32 = 0b0001;

    #[must_use]
    pub const fn field(self, crf: u32) -> u32 {
        let shift = (7 - crf) * 4;
        (self.0 >> shift) & 0xF
    }

    pub fn set_field(&mut self, crf: u32, bits: u32) {
        let shift = (7 - crf) * 4;
        let mask = 0xFu32 << shift;
        self.0 = (self.0 & !mask) | ((bits & 0xF) << shift);
    }

    /// Sets CR0 from a signed 64-bit comparison against zero, preserving SO
    /// from the current XER summary overflow bit.
    pub fn set_cr0(&mut self, value: i64, xer_so: bool) {
        let mut bits = if value < 0 {
            Self::LT
        } else if value > 0 {
            Self::GT
        } else {
            Self::EQ
        };
        if xer_so {
            bits |= Self::SO;
        }
        self.set_field(0, bits);
    }

    pub fn set_bit(&mut self, crbit: u32, set: bool) {
        let shift = 31 - crbit;
        if set {
            self.0 |= 1 << shift;
        } else {
            self.0 &= !(1 << shift);
        }
    }

    #[must_use]
    pub const fn bit(self, crbit: u32) -> bool {
        let shift = 31 - crbit;
        (self.0 >> shift) & 1 != 0
    }
}

/// Fixed-point exception register: carry, overflow, summary overflow, plus
/// the byte-count field used by `lswx`/`stswx` (unsupported here; kept for
/// layout fidelity).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XerRegister(pub u64);

impl XerRegister {
    const CA_BIT: u64 = 1 << 29;
    const OV_BIT: u64 = 1 << 30;
    const SO_BIT: u64 = 1 << 31;

    #[must_use]
    pub const fn ca(self) -> bool {
        self.0 & Self::CA_BIT != 0
    }

    pub fn set_ca(&mut self, set: bool) {
        self.set_bit(Self::CA_BIT, set);
    }

    #[must_use]
    pub const fn ov(self) -> bool {
        self.0 & Self::OV_BIT != 0
    }

    pub fn set_ov(&mut self, set: bool) {
        self.set_bit(Self::OV_BIT, set);
        if set {
            self.set_bit(Self::SO_BIT, true);
        }
    }

    #[must_use]
    pub const fn so(self) -> bool {
        self.0 & Self::SO_BIT != 0
    }

    fn set_bit(&mut self, mask: u64, set: bool) {
        if set {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }
}

/// A single reservation established by `lwarx`/`ldarx`, cleared by any
/// intervening store to the reserved granule or by `stwcx.`/`stdcx.`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reservation {
    pub address: Option<u32>,
}

/// The full PPC register file plus interpreter/JIT bookkeeping.
///
/// Fields up to and including `vmx` occupy the fixed-offset prefix the
/// calling convention depends on; everything after is free to move.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct ThreadState {
    pub r: [u64; 32],
    pub lr: u64,
    pub ctr: u64,
    pub xer: XerRegister,
    pub cr: ConditionRegister,
    _pad_cr_fpscr: [u8; 4],
    pub fpscr: u32,
    _reserved: [u8; 1024 - 292],
    pub fpr: [f64; 32],
    _pad1: [u8; 2048 - 1024 - 32 * 8],
    pub vmx: [[u8; 16]; 128],

    pub pc: u32,
    pub reservation: Reservation,
    pub running: bool,
    pub exit_code: i32,
    pub thread_id: u32,
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ThreadState {
    #[must_use]
    pub fn new(thread_id: u32) -> Self {
        Self {
            r: [0; 32],
            lr: 0,
            ctr: 0,
            xer: XerRegister::default(),
            cr: ConditionRegister::default(),
            _pad_cr_fpscr: [0; 4],
            fpscr: 0,
            _reserved: [0; 1024 - 292],
            fpr: [0.0; 32],
            _pad1: [0; 2048 - 1024 - 32 * 8],
            vmx: [[0; 16]; 128],
            pc: 0,
            reservation: Reservation::default(),
            running: false,
            exit_code: 0,
            thread_id,
        }
    }

    /// Byte offset of `r[0]` within the struct, as required by the
    /// calling convention; exposed for the JIT backend's context layout.
    pub const GPR_BASE: usize = 0;
    pub const LR_OFFSET: usize = 256;
    pub const CTR_OFFSET: usize = 264;
    pub const XER_OFFSET: usize = 272;
    pub const CR_OFFSET: usize = 280;
    pub const FPSCR_OFFSET: usize = 288;
    pub const FPR_BASE: usize = 1024;
    pub const VMX_BASE: usize = 2048;
    pub const PC_OFFSET: usize = 4096;

    /// Formats every path [`Observable::query_paths`] reports as a
    /// `name = value` line, for `--verbose`-style diagnostic dumps.
    #[must_use]
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for path in self.query_paths() {
            if let Some(value) = self.query(path) {
                let _ = writeln!(out, "{path} = {value}");
            }
        }
        out
    }
}

impl Observable for ThreadState {
    fn query(&self, path: &str) -> Option<Value> {
        if let Some(idx) = path.strip_prefix("r") {
            if let Ok(n) = idx.parse::<usize>() {
                return self.r.get(n).copied().map(Value::U64);
            }
        }
        if let Some(idx) = path.strip_prefix("fpr") {
            if let Ok(n) = idx.parse::<usize>() {
                return self.fpr.get(n).map(|v| Value::String(format!("{v}")));
            }
        }
        match path {
            "lr" => Some(Value::U64(self.lr)),
            "ctr" => Some(Value::U64(self.ctr)),
            "xer" => Some(Value::U64(self.xer.0)),
            "cr" => Some(Value::U32(self.cr.0)),
            "fpscr" => Some(Value::U32(self.fpscr)),
            "pc" => Some(Value::U32(self.pc)),
            "running" => Some(Value::Bool(self.running)),
            "exit_code" => Some(Value::String(format!("{}", self.exit_code))),
            "thread_id" => Some(Value::U32(self.thread_id)),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "r0", "r1", "r2", "r3", "lr", "ctr", "xer", "cr", "fpscr", "pc", "running",
            "exit_code", "thread_id",
        ]
    }
}

#[cfg(test)]
mod layout {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn gpr_offsets_match_abi() {
        assert_eq!(offset_of!(ThreadState, r), 0);
        for i in 0..32 {
            assert_eq!(std::mem::offset_of!(ThreadState, r) + i * 8, i * 8);
        }
    }

    #[test]
    fn scalar_register_offsets_match_abi() {
        assert_eq!(offset_of!(ThreadState, lr), ThreadState::LR_OFFSET);
        assert_eq!(offset_of!(ThreadState, ctr), ThreadState::CTR_OFFSET);
        assert_eq!(offset_of!(ThreadState, xer), ThreadState::XER_OFFSET);
        assert_eq!(offset_of!(ThreadState, cr), ThreadState::CR_OFFSET);
        assert_eq!(offset_of!(ThreadState, fpscr), ThreadState::FPSCR_OFFSET);
    }

    #[test]
    fn fpr_and_vmx_offsets_match_abi() {
        assert_eq!(offset_of!(ThreadState, fpr), ThreadState::FPR_BASE);
        assert_eq!(offset_of!(ThreadState, vmx), ThreadState::VMX_BASE);
    }

    #[test]
    fn pc_offset_matches_abi() {
        assert_eq!(offset_of!(ThreadState, pc), ThreadState::PC_OFFSET);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr_field_round_trips() {
        let mut cr = ConditionRegister::default();
        cr.set_field(0, ConditionRegister::LT);
        assert_eq!(cr.field(0), ConditionRegister::LT);
        cr.set_field(7, ConditionRegister::EQ | ConditionRegister::SO);
        assert_eq!(cr.field(7), ConditionRegister::EQ | ConditionRegister::SO);
        // CR0 untouched by writing CR7.
        assert_eq!(cr.field(0), ConditionRegister::LT);
    }

    #[test]
    fn cr0_reflects_signed_comparison() {
        let mut cr = ConditionRegister::default();
        cr.set_cr0(-1, false);
        assert_eq!(cr.field(0), ConditionRegister::LT);
        cr.set_cr0(0, true);
        assert_eq!(cr.field(0), ConditionRegister::EQ | ConditionRegister::SO);
    }

    #[test]
    fn xer_overflow_also_sets_summary_overflow() {
        let mut xer = XerRegister::default();
        xer.set_ov(true);
        assert!(xer.ov());
        assert!(xer.so());
    }

    #[test]
    fn new_thread_state_is_zeroed_and_idle() {
        let ts = ThreadState::new(3);
        assert_eq!(ts.r[3], 0);
        assert!(!ts.running);
        assert_eq!(ts.thread_id, 3);
    }

    #[test]
    fn observable_reports_gpr_and_scalar_paths() {
        let mut ts = ThreadState::new(0);
        ts.r[3] = 42;
        ts.pc = 0x8200_1000;
        assert_eq!(ts.query("r3"), Some(Value::U64(42)));
        assert_eq!(ts.query("pc"), Some(Value::U32(0x8200_1000)));
        assert!(ts.query("bogus").is_none());
    }
}
