//! FPR bank policy.
//!
//! Floating registers are 128-bit paired singles moved with MOVAPD; the
//! state slots are 16-byte aligned. The bank never carries immediates.

use gekko_ppc::{state, CodeOp, RegSet};

use crate::backend::x64::emitter::{state_slot, Emitter};
use crate::backend::x64::operand::MemOperand;
use crate::backend::x64::registers::Xmm;

use super::{BankPolicy, LoadSource, StoreSource};

/// Allocation order for the FPR bank. The high registers come first; XMM0
/// and XMM1 stay out as scratch.
const ALLOCATION_ORDER: [Xmm; 14] = [
    Xmm::Xmm6,
    Xmm::Xmm7,
    Xmm::Xmm8,
    Xmm::Xmm9,
    Xmm::Xmm10,
    Xmm::Xmm11,
    Xmm::Xmm12,
    Xmm::Xmm13,
    Xmm::Xmm14,
    Xmm::Xmm15,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
];

/// Bank policy for floating-point registers.
#[derive(Default)]
pub struct FprPolicy;

impl FprPolicy {
    pub fn new() -> Self {
        FprPolicy
    }
}

impl BankPolicy for FprPolicy {
    type Reg = Xmm;

    fn allocation_order(&self) -> &'static [Xmm] {
        &ALLOCATION_ORDER
    }

    fn default_location(&self, preg: usize) -> MemOperand {
        state_slot(state::ps_offset(preg))
    }

    fn imm(&self, _preg: usize) -> Option<u32> {
        None
    }

    fn discard_imm(&self, _preg: usize) {}

    fn emit_load(&self, e: &mut Emitter, dst: Xmm, src: LoadSource) {
        match src {
            LoadSource::Mem(m) => e.movapd_load(dst, m),
            LoadSource::Imm32(_) => unreachable!("no immediates in the fpr bank"),
        }
    }

    fn emit_store(&self, e: &mut Emitter, dst: MemOperand, src: StoreSource<Xmm>) {
        match src {
            StoreSource::Reg(r) => e.movapd_store(dst, r),
            StoreSource::Imm32(_) => unreachable!("no immediates in the fpr bank"),
        }
    }

    fn reg_utilization(&self, op: &CodeOp) -> RegSet {
        op.fpr_in_xmm
    }

    fn input_regs(&self, op: &CodeOp) -> RegSet {
        op.fregs_in
    }
}
