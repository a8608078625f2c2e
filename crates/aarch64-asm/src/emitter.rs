//! Instruction encoding and finalization to executable memory.

use crate::reg::{Cond, Reg, Shift, VReg};
use mmap_rs::MmapOptions;

#[inline]
const fn rd(r: Reg) -> u32 {
    r.encoding() & 0x1F
}

#[inline]
const fn rn(r: Reg) -> u32 {
    (r.encoding() & 0x1F) << 5
}

#[inline]
const fn rm(r: Reg) -> u32 {
    (r.encoding() & 0x1F) << 16
}

#[inline]
const fn vd(r: VReg) -> u32 {
    r.encoding() & 0x1F
}

#[inline]
const fn vn(r: VReg) -> u32 {
    (r.encoding() & 0x1F) << 5
}

#[inline]
const fn vm(r: VReg) -> u32 {
    (r.encoding() & 0x1F) << 16
}

/// A growable buffer of AArch64 instruction words under construction.
///
/// One `Emitter` per compiled block. Nothing it does can fail; only
/// [`Emitter::finalize`] can, if the host is out of executable memory.
pub struct Emitter {
    code: Vec<u8>,
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            code: Vec::with_capacity(64 * 1024),
        }
    }

    pub fn reset(&mut self) {
        self.code.clear();
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    fn emit32(&mut self, instruction: u32) {
        self.code.extend_from_slice(&instruction.to_le_bytes());
    }

    // ---- Data processing (immediate) ----------------------------------

    pub fn mov(&mut self, rd_: Reg, rn_: Reg) {
        // ORR Xd, XZR, Xn
        self.emit32(0xAA00_03E0 | rd(rd_) | rm(rn_));
    }

    pub fn mov_imm(&mut self, rd_: Reg, imm: u64) {
        self.movz(rd_, imm as u16, 0);
        if imm > 0xFFFF {
            self.movk(rd_, (imm >> 16) as u16, 16);
        }
        if imm > 0xFFFF_FFFF {
            self.movk(rd_, (imm >> 32) as u16, 32);
        }
        if imm > 0xFFFF_FFFF_FFFF {
            self.movk(rd_, (imm >> 48) as u16, 48);
        }
    }

    pub fn movz(&mut self, rd_: Reg, imm: u16, shift: u8) {
        let hw = u32::from(shift / 16);
        self.emit32(0xD280_0000 | (hw << 21) | (u32::from(imm) << 5) | rd(rd_));
    }

    pub fn movk(&mut self, rd_: Reg, imm: u16, shift: u8) {
        let hw = u32::from(shift / 16);
        self.emit32(0xF280_0000 | (hw << 21) | (u32::from(imm) << 5) | rd(rd_));
    }

    pub fn add_imm(&mut self, rd_: Reg, rn_: Reg, imm12: u32) {
        self.emit32(0x9100_0000 | ((imm12 & 0xFFF) << 10) | rn(rn_) | rd(rd_));
    }

    pub fn sub_imm(&mut self, rd_: Reg, rn_: Reg, imm12: u32) {
        self.emit32(0xD100_0000 | ((imm12 & 0xFFF) << 10) | rn(rn_) | rd(rd_));
    }

    pub fn adds_imm(&mut self, rd_: Reg, rn_: Reg, imm12: u32) {
        self.emit32(0xB100_0000 | ((imm12 & 0xFFF) << 10) | rn(rn_) | rd(rd_));
    }

    pub fn subs_imm(&mut self, rd_: Reg, rn_: Reg, imm12: u32) {
        self.emit32(0xF100_0000 | ((imm12 & 0xFFF) << 10) | rn(rn_) | rd(rd_));
    }

    // ---- Data processing (register) ------------------------------------

    pub fn add(&mut self, rd_: Reg, rn_: Reg, rm_: Reg, sh: Shift, amount: u8) {
        self.emit32(
            0x8B00_0000
                | ((sh as u32) << 22)
                | (u32::from(amount & 0x3F) << 10)
                | rm(rm_)
                | rn(rn_)
                | rd(rd_),
        );
    }

    pub fn sub(&mut self, rd_: Reg, rn_: Reg, rm_: Reg, sh: Shift, amount: u8) {
        self.emit32(
            0xCB00_0000
                | ((sh as u32) << 22)
                | (u32::from(amount & 0x3F) << 10)
                | rm(rm_)
                | rn(rn_)
                | rd(rd_),
        );
    }

    pub fn adds(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0xAB00_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn subs(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0xEB00_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn adc(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x9A00_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn adcs(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0xBA00_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn sbc(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0xDA00_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn sbcs(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0xFA00_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn and(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x8A00_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn orr(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0xAA00_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn eor(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0xCA00_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn orn(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0xAA20_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn bic(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x8A20_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn eon(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0xCA20_0000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn lsl_reg(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x9AC0_2000 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn lsr_reg(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x9AC0_2400 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn asr_reg(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x9AC0_2800 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn ror_reg(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x9AC0_2C00 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn mul(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        // MADD Xd, Xn, Xm, XZR
        self.emit32(0x9B00_7C00 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn smull(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x9B20_7C00 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn umull(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x9BA0_7C00 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn sdiv(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x9AC0_0C00 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn udiv(&mut self, rd_: Reg, rn_: Reg, rm_: Reg) {
        self.emit32(0x9AC0_0800 | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn clz(&mut self, rd_: Reg, rn_: Reg) {
        self.emit32(0xDAC0_1000 | rn(rn_) | rd(rd_));
    }

    pub fn rbit(&mut self, rd_: Reg, rn_: Reg) {
        self.emit32(0xDAC0_0000 | rn(rn_) | rd(rd_));
    }

    pub fn rev(&mut self, rd_: Reg, rn_: Reg) {
        self.emit32(0xDAC0_0C00 | rn(rn_) | rd(rd_));
    }

    pub fn rev16(&mut self, rd_: Reg, rn_: Reg) {
        self.emit32(0xDAC0_0400 | rn(rn_) | rd(rd_));
    }

    pub fn rev32(&mut self, rd_: Reg, rn_: Reg) {
        self.emit32(0xDAC0_0800 | rn(rn_) | rd(rd_));
    }

    // ---- Sign/zero extension --------------------------------------------

    pub fn sxtb(&mut self, rd_: Reg, rn_: Reg) {
        self.emit32(0x9340_1C00 | rn(rn_) | rd(rd_));
    }

    pub fn sxth(&mut self, rd_: Reg, rn_: Reg) {
        self.emit32(0x9340_3C00 | rn(rn_) | rd(rd_));
    }

    pub fn sxtw(&mut self, rd_: Reg, rn_: Reg) {
        self.emit32(0x9340_7C00 | rn(rn_) | rd(rd_));
    }

    pub fn uxtb(&mut self, rd_: Reg, rn_: Reg) {
        self.emit32(0x5300_1C00 | rn(rn_) | rd(rd_));
    }

    pub fn uxth(&mut self, rd_: Reg, rn_: Reg) {
        self.emit32(0x5300_3C00 | rn(rn_) | rd(rd_));
    }

    // ---- Comparison ------------------------------------------------------

    pub fn cmp(&mut self, rn_: Reg, rm_: Reg) {
        self.subs(Reg::XZR, rn_, rm_);
    }

    pub fn cmp_imm(&mut self, rn_: Reg, imm12: u32) {
        self.subs_imm(Reg::XZR, rn_, imm12);
    }

    pub fn cmn(&mut self, rn_: Reg, rm_: Reg) {
        self.adds(Reg::XZR, rn_, rm_);
    }

    pub fn tst(&mut self, rn_: Reg, rm_: Reg) {
        // ANDS XZR, Xn, Xm
        self.emit32(0xEA00_0000 | rm(rm_) | rn(rn_) | rd(Reg::XZR));
    }

    // ---- Conditional select -----------------------------------------------

    pub fn csel(&mut self, rd_: Reg, rn_: Reg, rm_: Reg, cc: Cond) {
        self.emit32(0x9A80_0000 | ((cc as u32) << 12) | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn csinc(&mut self, rd_: Reg, rn_: Reg, rm_: Reg, cc: Cond) {
        self.emit32(0x9A80_0400 | ((cc as u32) << 12) | rm(rm_) | rn(rn_) | rd(rd_));
    }

    pub fn cset(&mut self, rd_: Reg, cc: Cond) {
        // CSINC Xd, XZR, XZR, invert(cc)
        self.csinc(rd_, Reg::XZR, Reg::XZR, cc.invert());
    }

    pub fn fcsel_d(&mut self, vd_: VReg, vn_: VReg, vm_: VReg, cc: Cond) {
        self.emit32(0x1E60_0C00 | vm(vm_) | ((cc as u32) << 12) | vn(vn_) | vd(vd_));
    }

    // ---- Branches ----------------------------------------------------------

    pub fn b(&mut self, offset_bytes: i32) {
        let imm26 = (offset_bytes >> 2) as u32;
        self.emit32(0x1400_0000 | (imm26 & 0x03FF_FFFF));
    }

    pub fn b_cond(&mut self, cc: Cond, offset_bytes: i32) {
        let imm19 = (offset_bytes >> 2) as u32;
        self.emit32(0x5400_0000 | ((imm19 & 0x7_FFFF) << 5) | cc as u32);
    }

    pub fn bl(&mut self, offset_bytes: i32) {
        let imm26 = (offset_bytes >> 2) as u32;
        self.emit32(0x9400_0000 | (imm26 & 0x03FF_FFFF));
    }

    pub fn br(&mut self, rn_: Reg) {
        self.emit32(0xD61F_0000 | rn(rn_));
    }

    pub fn blr(&mut self, rn_: Reg) {
        self.emit32(0xD63F_0000 | rn(rn_));
    }

    pub fn ret(&mut self, rn_: Reg) {
        self.emit32(0xD65F_0000 | rn(rn_));
    }

    pub fn cbz(&mut self, rt: Reg, offset_bytes: i32) {
        let imm19 = (offset_bytes >> 2) as u32;
        self.emit32(0xB400_0000 | ((imm19 & 0x7_FFFF) << 5) | rd(rt));
    }

    pub fn cbnz(&mut self, rt: Reg, offset_bytes: i32) {
        let imm19 = (offset_bytes >> 2) as u32;
        self.emit32(0xB500_0000 | ((imm19 & 0x7_FFFF) << 5) | rd(rt));
    }

    // ---- Memory access -------------------------------------------------

    pub fn ldr(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm12 = ((offset >> 3) & 0xFFF) as u32;
        self.emit32(0xF940_0000 | (imm12 << 10) | rn(rn_) | rd(rt));
    }

    pub fn ldrw(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm12 = ((offset >> 2) & 0xFFF) as u32;
        self.emit32(0xB940_0000 | (imm12 << 10) | rn(rn_) | rd(rt));
    }

    pub fn ldrh(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm12 = ((offset >> 1) & 0xFFF) as u32;
        self.emit32(0x7940_0000 | (imm12 << 10) | rn(rn_) | rd(rt));
    }

    pub fn ldrb(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm12 = (offset & 0xFFF) as u32;
        self.emit32(0x3940_0000 | (imm12 << 10) | rn(rn_) | rd(rt));
    }

    pub fn str(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm12 = ((offset >> 3) & 0xFFF) as u32;
        self.emit32(0xF900_0000 | (imm12 << 10) | rn(rn_) | rd(rt));
    }

    pub fn strw(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm12 = ((offset >> 2) & 0xFFF) as u32;
        self.emit32(0xB900_0000 | (imm12 << 10) | rn(rn_) | rd(rt));
    }

    pub fn strh(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm12 = ((offset >> 1) & 0xFFF) as u32;
        self.emit32(0x7900_0000 | (imm12 << 10) | rn(rn_) | rd(rt));
    }

    pub fn strb(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm12 = (offset & 0xFFF) as u32;
        self.emit32(0x3900_0000 | (imm12 << 10) | rn(rn_) | rd(rt));
    }

    pub fn ldp(&mut self, rt1: Reg, rt2: Reg, rn_: Reg, offset: i32) {
        let imm7 = ((offset >> 3) & 0x7F) as u32;
        self.emit32(0xA940_0000 | (imm7 << 15) | (rt2.encoding() << 10) | rn(rn_) | rd(rt1));
    }

    pub fn stp(&mut self, rt1: Reg, rt2: Reg, rn_: Reg, offset: i32) {
        let imm7 = ((offset >> 3) & 0x7F) as u32;
        self.emit32(0xA900_0000 | (imm7 << 15) | (rt2.encoding() << 10) | rn(rn_) | rd(rt1));
    }

    pub fn ldr_pre(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm9 = (offset & 0x1FF) as u32;
        self.emit32(0xF840_0C00 | (imm9 << 12) | rn(rn_) | rd(rt));
    }

    pub fn ldr_post(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm9 = (offset & 0x1FF) as u32;
        self.emit32(0xF840_0400 | (imm9 << 12) | rn(rn_) | rd(rt));
    }

    pub fn str_pre(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm9 = (offset & 0x1FF) as u32;
        self.emit32(0xF800_0C00 | (imm9 << 12) | rn(rn_) | rd(rt));
    }

    pub fn str_post(&mut self, rt: Reg, rn_: Reg, offset: i32) {
        let imm9 = (offset & 0x1FF) as u32;
        self.emit32(0xF800_0400 | (imm9 << 12) | rn(rn_) | rd(rt));
    }

    // ---- Atomics (load-acquire-exclusive / store-release-exclusive) -------

    pub fn ldaxr(&mut self, rt: Reg, rn_: Reg) {
        self.emit32(0xC85F_FC00 | rn(rn_) | rd(rt));
    }

    pub fn ldaxrw(&mut self, rt: Reg, rn_: Reg) {
        self.emit32(0x885F_FC00 | rn(rn_) | rd(rt));
    }

    pub fn stlxr(&mut self, rs: Reg, rt: Reg, rn_: Reg) {
        self.emit32(0xC800_FC00 | rm(rs) | rn(rn_) | rd(rt));
    }

    pub fn stlxrw(&mut self, rs: Reg, rt: Reg, rn_: Reg) {
        self.emit32(0x8800_FC00 | rm(rs) | rn(rn_) | rd(rt));
    }

    // ---- NEON ------------------------------------------------------------

    pub fn fmov_vtog(&mut self, rd_: Reg, vn_: VReg) {
        self.emit32(0x9E66_0000 | vn(vn_) | rd(rd_));
    }

    pub fn fmov_gtov(&mut self, vd_: VReg, rn_: Reg) {
        self.emit32(0x9E67_0000 | rn(rn_) | vd(vd_));
    }

    pub fn ldr_v128(&mut self, vt: VReg, rn_: Reg, offset: i32) {
        let imm12 = ((offset >> 4) & 0xFFF) as u32;
        self.emit32(0x3DC0_0000 | (imm12 << 10) | rn(rn_) | vd(vt));
    }

    pub fn str_v128(&mut self, vt: VReg, rn_: Reg, offset: i32) {
        let imm12 = ((offset >> 4) & 0xFFF) as u32;
        self.emit32(0x3D80_0000 | (imm12 << 10) | rn(rn_) | vd(vt));
    }

    pub fn fadd_4s(&mut self, vd_: VReg, vn_: VReg, vm_: VReg) {
        self.emit32(0x4E20_D400 | vm(vm_) | vn(vn_) | vd(vd_));
    }

    pub fn fsub_4s(&mut self, vd_: VReg, vn_: VReg, vm_: VReg) {
        self.emit32(0x4EA0_D400 | vm(vm_) | vn(vn_) | vd(vd_));
    }

    pub fn fmul_4s(&mut self, vd_: VReg, vn_: VReg, vm_: VReg) {
        self.emit32(0x6E20_DC00 | vm(vm_) | vn(vn_) | vd(vd_));
    }

    pub fn fdiv_4s(&mut self, vd_: VReg, vn_: VReg, vm_: VReg) {
        self.emit32(0x6E20_FC00 | vm(vm_) | vn(vn_) | vd(vd_));
    }

    pub fn fmla_4s(&mut self, vd_: VReg, vn_: VReg, vm_: VReg) {
        self.emit32(0x4E20_CC00 | vm(vm_) | vn(vn_) | vd(vd_));
    }

    pub fn fabs_4s(&mut self, vd_: VReg, vn_: VReg) {
        self.emit32(0x4EA0_F800 | vn(vn_) | vd(vd_));
    }

    pub fn fneg_4s(&mut self, vd_: VReg, vn_: VReg) {
        self.emit32(0x6EA0_F800 | vn(vn_) | vd(vd_));
    }

    pub fn fsqrt_4s(&mut self, vd_: VReg, vn_: VReg) {
        self.emit32(0x6EA1_F800 | vn(vn_) | vd(vd_));
    }

    pub fn fmin_4s(&mut self, vd_: VReg, vn_: VReg, vm_: VReg) {
        self.emit32(0x4EA0_F400 | vm(vm_) | vn(vn_) | vd(vd_));
    }

    pub fn fmax_4s(&mut self, vd_: VReg, vn_: VReg, vm_: VReg) {
        self.emit32(0x4E20_F400 | vm(vm_) | vn(vn_) | vd(vd_));
    }

    pub fn and_v(&mut self, vd_: VReg, vn_: VReg, vm_: VReg) {
        self.emit32(0x4E20_1C00 | vm(vm_) | vn(vn_) | vd(vd_));
    }

    pub fn orr_v(&mut self, vd_: VReg, vn_: VReg, vm_: VReg) {
        self.emit32(0x4EA0_1C00 | vm(vm_) | vn(vn_) | vd(vd_));
    }

    pub fn eor_v(&mut self, vd_: VReg, vn_: VReg, vm_: VReg) {
        self.emit32(0x6E20_1C00 | vm(vm_) | vn(vn_) | vd(vd_));
    }

    pub fn dup_4s(&mut self, vd_: VReg, vn_: VReg, index: u8) {
        let imm5 = (u32::from(index & 3) << 3) | 0x04;
        self.emit32(0x5E00_0400 | (imm5 << 16) | vn(vn_) | vd(vd_));
    }

    pub fn ins_4s(&mut self, vd_: VReg, dst_idx: u8, vn_: VReg, src_idx: u8) {
        let imm5 = (u32::from(dst_idx & 3) << 3) | 0x04;
        let imm4 = u32::from(src_idx & 3) << 1;
        self.emit32(0x6E00_0400 | (imm5 << 16) | (imm4 << 11) | vn(vn_) | vd(vd_));
    }

    pub fn fcvtzs_4s(&mut self, vd_: VReg, vn_: VReg) {
        self.emit32(0x4EA1_B800 | vn(vn_) | vd(vd_));
    }

    pub fn scvtf_4s(&mut self, vd_: VReg, vn_: VReg) {
        self.emit32(0x4E21_D800 | vn(vn_) | vd(vd_));
    }

    pub fn fmadd_d(&mut self, vd_: VReg, vn_: VReg, vm_: VReg, va: VReg) {
        self.emit32(0x1F40_0000 | vm(vm_) | ((va.encoding() & 0x1F) << 10) | vn(vn_) | vd(vd_));
    }

    pub fn fmsub_d(&mut self, vd_: VReg, vn_: VReg, vm_: VReg, va: VReg) {
        self.emit32(0x1F40_8000 | vm(vm_) | ((va.encoding() & 0x1F) << 10) | vn(vn_) | vd(vd_));
    }

    pub fn fnmadd_d(&mut self, vd_: VReg, vn_: VReg, vm_: VReg, va: VReg) {
        self.emit32(0x1F60_0000 | vm(vm_) | ((va.encoding() & 0x1F) << 10) | vn(vn_) | vd(vd_));
    }

    pub fn fnmsub_d(&mut self, vd_: VReg, vn_: VReg, vm_: VReg, va: VReg) {
        self.emit32(0x1F60_8000 | vm(vm_) | ((va.encoding() & 0x1F) << 10) | vn(vn_) | vd(vd_));
    }

    // ---- System ------------------------------------------------------------

    pub fn nop(&mut self) {
        self.emit32(0xD503_201F);
    }

    pub fn brk(&mut self, imm: u16) {
        self.emit32(0xD420_0000 | (u32::from(imm) << 5));
    }

    pub fn dmb_ish(&mut self) {
        self.emit32(0xD503_3BBF);
    }

    pub fn dsb_ish(&mut self) {
        self.emit32(0xD503_3B9F);
    }

    pub fn isb(&mut self) {
        self.emit32(0xD503_3FDF);
    }

    pub fn svc(&mut self, imm: u16) {
        self.emit32(0xD400_0001 | (u32::from(imm) << 5));
    }

    pub fn mrs(&mut self, rt: Reg, sysreg: u32) {
        self.emit32(0xD530_0000 | sysreg | rd(rt));
    }

    pub fn msr(&mut self, sysreg: u32, rt: Reg) {
        self.emit32(0xD510_0000 | sysreg | rd(rt));
    }

    // ---- Label patching ------------------------------------------------

    /// Patch a 26-bit unconditional branch at `branch_offset` to target
    /// `target_offset`, both byte offsets into this buffer.
    pub fn patch_branch(&mut self, branch_offset: usize, target_offset: usize) {
        let delta = (target_offset as i64 - branch_offset as i64) as i32;
        let imm26 = ((delta >> 2) as u32) & 0x03FF_FFFF;
        let word = u32::from_le_bytes(self.code[branch_offset..branch_offset + 4].try_into().unwrap());
        let patched = (word & 0xFC00_0000) | imm26;
        self.code[branch_offset..branch_offset + 4].copy_from_slice(&patched.to_le_bytes());
    }

    /// Patch a 19-bit conditional/CBZ-class branch at `branch_offset` to
    /// target `target_offset`.
    pub fn patch_cond_branch(&mut self, branch_offset: usize, target_offset: usize) {
        let delta = (target_offset as i64 - branch_offset as i64) as i32;
        let imm19 = ((delta >> 2) as u32) & 0x7_FFFF;
        let word = u32::from_le_bytes(self.code[branch_offset..branch_offset + 4].try_into().unwrap());
        let patched = (word & 0xFF00_001F) | (imm19 << 5);
        self.code[branch_offset..branch_offset + 4].copy_from_slice(&patched.to_le_bytes());
    }

    /// Copy the buffer into an executable mapping and flush the
    /// instruction cache across the written range.
    ///
    /// Returns `None` if the buffer is empty or the host allocator is out
    /// of memory — callers must treat this as "abort the compile", never
    /// retry silently, per the encoder's documented failure model.
    #[must_use]
    pub fn finalize(self) -> Option<FinalizedCode> {
        if self.code.is_empty() {
            return None;
        }
        let size = self.code.len();
        let mut mmap = MmapOptions::new(size).ok()?.map_mut().ok()?;
        mmap[..size].copy_from_slice(&self.code);
        // SAFETY: the mapping was just written with the exact bytes being
        // made executable below; no other thread can observe it yet.
        let exec = unsafe { mmap.make_exec() }.ok()?;
        flush_icache(exec.as_ptr(), size);
        Some(FinalizedCode { mmap: exec, size })
    }
}

/// An executable code region produced by [`Emitter::finalize`].
pub struct FinalizedCode {
    mmap: mmap_rs::MmapMut,
    size: usize,
}

impl FinalizedCode {
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_icache(start: *const u8, len: usize) {
    // SAFETY: `start..start+len` is the region just written by `finalize`,
    // backed by the mapping this function is called from; the DC/IC/DSB/ISB
    // sequence below is the architecturally mandated way to make newly
    // written instructions visible before branching to them.
    unsafe {
        let end = start.add(len) as usize;
        let mut addr = start as usize & !63;
        while addr < end {
            std::arch::asm!("dc cvau, {0}", in(reg) addr);
            addr += 64;
        }
        std::arch::asm!("dsb ish");
        let mut addr = start as usize & !63;
        while addr < end {
            std::arch::asm!("ic ivau, {0}", in(reg) addr);
            addr += 64;
        }
        std::arch::asm!("dsb ish");
        std::arch::asm!("isb");
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_start: *const u8, _len: usize) {
    log::debug!("icache flush skipped: not running on an aarch64 host");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_is_known_encoding() {
        let mut e = Emitter::new();
        e.nop();
        assert_eq!(e.code(), 0xD503_201Fu32.to_le_bytes());
    }

    #[test]
    fn add_imm_encodes_fields() {
        let mut e = Emitter::new();
        e.add_imm(Reg::X3, Reg::X4, 7);
        let word = u32::from_le_bytes(e.code().try_into().unwrap());
        assert_eq!(word & 0xFF00_0000, 0x9100_0000);
        assert_eq!((word >> 10) & 0xFFF, 7);
        assert_eq!((word >> 5) & 0x1F, 4);
        assert_eq!(word & 0x1F, 3);
    }

    #[test]
    fn mov_imm_emits_movz_only_for_small_values() {
        let mut e = Emitter::new();
        e.mov_imm(Reg::X0, 0x42);
        assert_eq!(e.code().len(), 4);
    }

    #[test]
    fn mov_imm_emits_full_sequence_for_large_values() {
        let mut e = Emitter::new();
        e.mov_imm(Reg::X0, 0xDEAD_BEEF_0000_0001);
        assert_eq!(e.code().len(), 16);
    }

    #[test]
    fn patch_branch_rewrites_imm26_preserving_opcode() {
        let mut e = Emitter::new();
        let branch_at = e.offset();
        e.b(0);
        e.nop();
        e.nop();
        e.patch_branch(branch_at, e.offset());
        let word = u32::from_le_bytes(e.code()[branch_at..branch_at + 4].try_into().unwrap());
        assert_eq!(word & 0xFC00_0000, 0x1400_0000);
        assert_eq!(word & 0x03FF_FFFF, 2); // 8 bytes / 4
    }

    #[test]
    fn cset_inverts_condition() {
        let mut e = Emitter::new();
        e.cset(Reg::X0, Cond::Eq);
        let word = u32::from_le_bytes(e.code().try_into().unwrap());
        // CSINC Xd, XZR, XZR, NE (inverse of EQ)
        assert_eq!((word >> 12) & 0xF, Cond::Ne as u32);
    }

    #[test]
    fn finalize_empty_returns_none() {
        let e = Emitter::new();
        assert!(e.finalize().is_none());
    }

    #[test]
    fn finalize_nonempty_produces_code() {
        let mut e = Emitter::new();
        e.nop();
        e.ret(Reg::LR);
        let code = e.finalize().expect("finalize");
        assert_eq!(code.size(), 8);
        assert!(!code.as_ptr().is_null());
    }
}
