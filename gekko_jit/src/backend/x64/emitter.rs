//! x64 byte emitter.
//!
//! Emits the small instruction vocabulary the recompiler's register cache
//! and branch coordinator need: 32-bit MOVs in every reg/mem/imm shape,
//! MOVAPD for the floating bank, SUB-from-memory for the downcount, and
//! rel32 jumps with forward fixups. Code goes into an owned byte buffer;
//! mapping and protection are the block cache's concern.

use super::operand::{MemOperand, Operand};
use super::registers::{Gpr, Xmm};

/// Encode a REX prefix.
#[inline]
pub const fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
}

/// Encode a ModR/M byte.
#[inline]
pub const fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Condition codes for Jcc, in hardware encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

/// A forward branch whose rel32 field is filled in later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupBranch {
    /// Buffer offset of the 4-byte displacement.
    patch_offset: usize,
}

/// The code buffer plus emission helpers.
#[derive(Debug, Default)]
pub struct Emitter {
    code: Vec<u8>,
}

impl Emitter {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    /// Current offset; the address the next instruction will be emitted at.
    #[inline]
    pub fn position(&self) -> usize {
        self.code.len()
    }

    /// The emitted bytes so far.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the emitter, returning the finished code.
    pub fn take_code(self) -> Vec<u8> {
        self.code
    }

    #[inline]
    fn emit_u8(&mut self, b: u8) {
        self.code.push(b);
    }

    #[inline]
    fn emit_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a REX prefix if any extension bit is needed.
    fn emit_rex_rb(&mut self, reg_high: bool, base_high: bool) {
        if reg_high || base_high {
            self.emit_u8(rex(false, reg_high, false, base_high));
        }
    }

    /// Emit ModR/M (+ SIB, + displacement) for a [base + disp] operand.
    fn emit_modrm_mem(&mut self, reg_low: u8, mem: MemOperand) {
        let base_low = mem.base.low_bits();
        let mode = if mem.disp == 0 && !mem.base.needs_displacement() {
            0b00
        } else if mem.disp_fits_i8() {
            0b01
        } else {
            0b10
        };
        self.emit_u8(modrm(mode, reg_low, base_low));
        if mem.base.needs_sib_as_base() {
            // Scale 1, no index, base in the low bits.
            self.emit_u8(modrm(0b00, 0b100, base_low));
        }
        match mode {
            0b01 => self.emit_u8(mem.disp as i8 as u8),
            0b10 => self.emit_u32(mem.disp as u32),
            _ => {}
        }
    }

    // =========================================================================
    // 32-bit MOV
    // =========================================================================

    /// MOV between 32-bit operands. Memory-to-memory is not encodable.
    pub fn mov32(&mut self, dst: Operand<Gpr>, src: Operand<Gpr>) {
        match (dst, src) {
            (Operand::Reg(d), Operand::Reg(s)) => {
                if d == s {
                    return;
                }
                self.emit_rex_rb(d.high_bit(), s.high_bit());
                self.emit_u8(0x8B);
                self.emit_u8(modrm(0b11, d.low_bits(), s.low_bits()));
            }
            (Operand::Reg(d), Operand::Mem(m)) => {
                self.emit_rex_rb(d.high_bit(), m.base.high_bit());
                self.emit_u8(0x8B);
                self.emit_modrm_mem(d.low_bits(), m);
            }
            (Operand::Mem(m), Operand::Reg(s)) => {
                self.emit_rex_rb(s.high_bit(), m.base.high_bit());
                self.emit_u8(0x89);
                self.emit_modrm_mem(s.low_bits(), m);
            }
            (Operand::Reg(d), Operand::Imm32(v)) => {
                self.emit_rex_rb(false, d.high_bit());
                self.emit_u8(0xB8 + d.low_bits());
                self.emit_u32(v);
            }
            (Operand::Mem(m), Operand::Imm32(v)) => {
                self.emit_rex_rb(false, m.base.high_bit());
                self.emit_u8(0xC7);
                self.emit_modrm_mem(0, m);
                self.emit_u32(v);
            }
            _ => unreachable!("unencodable mov32 operand combination"),
        }
    }

    // =========================================================================
    // MOVAPD
    // =========================================================================

    /// MOVAPD xmm, m128.
    pub fn movapd_load(&mut self, dst: Xmm, src: MemOperand) {
        self.emit_u8(0x66);
        self.emit_rex_rb(dst.high_bit(), src.base.high_bit());
        self.emit_u8(0x0F);
        self.emit_u8(0x28);
        self.emit_modrm_mem(dst.low_bits(), src);
    }

    /// MOVAPD m128, xmm.
    pub fn movapd_store(&mut self, dst: MemOperand, src: Xmm) {
        self.emit_u8(0x66);
        self.emit_rex_rb(src.high_bit(), dst.base.high_bit());
        self.emit_u8(0x0F);
        self.emit_u8(0x29);
        self.emit_modrm_mem(src.low_bits(), dst);
    }

    /// MOVAPD xmm, xmm.
    pub fn movapd_reg(&mut self, dst: Xmm, src: Xmm) {
        if dst == src {
            return;
        }
        self.emit_u8(0x66);
        self.emit_rex_rb(dst.high_bit(), src.high_bit());
        self.emit_u8(0x0F);
        self.emit_u8(0x28);
        self.emit_u8(modrm(0b11, dst.low_bits(), src.low_bits()));
    }

    // =========================================================================
    // SUB
    // =========================================================================

    /// SUB m32, imm.
    pub fn sub32_mem_imm(&mut self, dst: MemOperand, imm: u32) {
        self.emit_rex_rb(false, dst.base.high_bit());
        if (imm as i32) >= -128 && (imm as i32) <= 127 {
            self.emit_u8(0x83);
            self.emit_modrm_mem(5, dst);
            self.emit_u8(imm as u8);
        } else {
            self.emit_u8(0x81);
            self.emit_modrm_mem(5, dst);
            self.emit_u32(imm);
        }
    }

    // =========================================================================
    // Branches
    // =========================================================================

    /// Jcc rel32 with the target filled in later via `set_jump_target`.
    pub fn jcc(&mut self, cond: Cond) -> FixupBranch {
        self.emit_u8(0x0F);
        self.emit_u8(0x80 + cond as u8);
        let patch_offset = self.position();
        self.emit_u32(0);
        FixupBranch { patch_offset }
    }

    /// JMP rel32 with the target filled in later.
    pub fn jmp(&mut self) -> FixupBranch {
        self.emit_u8(0xE9);
        let patch_offset = self.position();
        self.emit_u32(0);
        FixupBranch { patch_offset }
    }

    /// JMP rel32 to an already-emitted offset.
    pub fn jmp_to(&mut self, target: usize) {
        self.emit_u8(0xE9);
        let next = self.position() + 4;
        self.emit_u32((target as i64 - next as i64) as u32);
    }

    /// Resolve a forward branch to the current position.
    pub fn set_jump_target(&mut self, fixup: FixupBranch) {
        let rel = (self.position() as i64 - (fixup.patch_offset as i64 + 4)) as u32;
        self.code[fixup.patch_offset..fixup.patch_offset + 4].copy_from_slice(&rel.to_le_bytes());
    }
}

/// The register the guest state block is addressed off.
pub const STATE_REG: Gpr = Gpr::Rbp;

/// Primary scratch register, never allocated by the cache.
pub const SCRATCH: Gpr = Gpr::Rax;

/// Extra scratch register; allocatable, claimed via `scratch_at` when needed.
pub const SCRATCH_EXTRA: Gpr = Gpr::Rcx;

/// State-slot operand helper.
#[inline]
pub const fn state_slot(disp: i32) -> MemOperand {
    MemOperand::base_disp(STATE_REG, disp)
}

// =============================================================================
// Tests
// =============================================================================
