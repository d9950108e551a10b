//! GPR bank policy.
//!
//! General-purpose registers are 32-bit guest values stored in the state
//! block's GPR array and moved with 32-bit MOVs. This is the only bank that
//! participates in constant propagation.

use std::cell::RefCell;

use gekko_ppc::{constprop::ConstantPropagation, state, CodeOp, RegSet};

use crate::backend::x64::emitter::{state_slot, Emitter};
use crate::backend::x64::operand::{MemOperand, Operand};
use crate::backend::x64::registers::Gpr;

use super::{BankPolicy, LoadSource, StoreSource};

/// Allocation order for the GPR bank.
///
/// Callee-saved registers come first so cached guest values survive helper
/// calls; RCX sits last because it doubles as the extra scratch register.
#[cfg(windows)]
const ALLOCATION_ORDER: [Gpr; 11] = [
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::R12,
    Gpr::Rcx,
];

#[cfg(not(windows))]
const ALLOCATION_ORDER: [Gpr; 11] = [
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::Rcx,
];

/// Bank policy for general-purpose registers.
pub struct GprPolicy {
    constants: RefCell<ConstantPropagation>,
}

impl GprPolicy {
    pub fn new(constants: ConstantPropagation) -> Self {
        GprPolicy {
            constants: RefCell::new(constants),
        }
    }

    /// The constant-propagation snapshot driving this bank's immediates.
    pub fn constants(&self) -> &RefCell<ConstantPropagation> {
        &self.constants
    }
}

impl Default for GprPolicy {
    fn default() -> Self {
        Self::new(ConstantPropagation::new())
    }
}

impl BankPolicy for GprPolicy {
    type Reg = Gpr;

    fn allocation_order(&self) -> &'static [Gpr] {
        &ALLOCATION_ORDER
    }

    fn default_location(&self, preg: usize) -> MemOperand {
        state_slot(state::gpr_offset(preg))
    }

    fn imm(&self, preg: usize) -> Option<u32> {
        self.constants.borrow().gpr(preg)
    }

    fn discard_imm(&self, preg: usize) {
        self.constants.borrow_mut().clear_gpr(preg);
    }

    fn emit_load(&self, e: &mut Emitter, dst: Gpr, src: LoadSource) {
        match src {
            LoadSource::Mem(m) => e.mov32(Operand::Reg(dst), Operand::Mem(m)),
            LoadSource::Imm32(v) => e.mov32(Operand::Reg(dst), Operand::Imm32(v)),
        }
    }

    fn emit_store(&self, e: &mut Emitter, dst: MemOperand, src: StoreSource<Gpr>) {
        match src {
            StoreSource::Reg(r) => e.mov32(Operand::Mem(dst), Operand::Reg(r)),
            StoreSource::Imm32(v) => e.mov32(Operand::Mem(dst), Operand::Imm32(v)),
        }
    }

    fn reg_utilization(&self, op: &CodeOp) -> RegSet {
        op.gpr_will_be_read | op.gpr_will_be_written
    }

    fn input_regs(&self, op: &CodeOp) -> RegSet {
        op.regs_in
    }
}
