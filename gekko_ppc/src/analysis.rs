//! Analyzed instruction stream.
//!
//! The block analyzer walks the guest code once and annotates every
//! instruction with the register footprint the recompiler and its register
//! allocator need: inputs/outputs per bank, liveness-derived "in use" and
//! "will be read/written" sets, discardability, and branch metadata. The
//! allocator never decodes instructions itself; these records are its only
//! view of the future.

use crate::bitset::RegSet;

/// Direction of a branch relative to the block being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchDirection {
    /// Branches forward to a later instruction in the same block.
    Forward,
    /// Branches backward to an earlier instruction in the same block.
    Backward,
    /// Leaves the block.
    Outside,
}

/// Metadata for one branch instruction found by the analyzer.
///
/// `source_index`/`target_index` are op indices into the block; for an
/// `Outside` branch the target index is meaningless.
#[derive(Debug, Clone)]
pub struct BranchInfo {
    /// Guest address of the branch instruction.
    pub address: u32,
    /// Guest address it branches to.
    pub branch_to: u32,
    /// Op index of the branch instruction.
    pub source_index: usize,
    /// Op index of the target instruction (in-block directions only).
    pub target_index: usize,
    pub direction: BranchDirection,
    /// GPRs read on some path between source and target.
    pub regs_in: RegSet,
    /// GPRs written on some path between source and target.
    pub regs_out: RegSet,
    /// FPRs read on some path between source and target.
    pub fregs_in: RegSet,
    /// FPRs written on some path between source and target.
    pub fregs_out: RegSet,
    /// The branched-over range contains an instruction that flushes the
    /// register state and continues (e.g. a conditional block exit).
    pub contains_flush_and_continue: bool,
}

impl BranchInfo {
    /// First op index covered by this branch.
    #[inline]
    pub fn start_index(&self) -> usize {
        self.source_index.min(self.target_index)
    }

    /// One past the last op index covered by this branch.
    ///
    /// Backward branches end after the branch instruction itself.
    #[inline]
    pub fn end_index(&self) -> usize {
        match self.direction {
            BranchDirection::Forward => self.target_index,
            _ => self.source_index + 1,
        }
    }
}

/// One analyzed guest instruction.
#[derive(Debug, Clone, Default)]
pub struct CodeOp {
    /// Guest address of the instruction.
    pub address: u32,
    /// Emulated cycles this instruction costs.
    pub cycles: u32,

    /// GPRs this instruction reads.
    pub regs_in: RegSet,
    /// GPRs this instruction writes.
    pub regs_out: RegSet,
    /// FPRs this instruction reads.
    pub fregs_in: RegSet,
    /// FPRs this instruction writes.
    pub fregs_out: RegSet,

    /// GPRs live at this instruction.
    pub gpr_in_use: RegSet,
    /// FPRs live at this instruction.
    pub fpr_in_use: RegSet,
    /// GPRs that will be read again before the block ends.
    pub gpr_will_be_read: RegSet,
    /// GPRs that will be written before being read again.
    pub gpr_will_be_written: RegSet,
    /// FPRs worth keeping in XMM registers from here on.
    pub fpr_in_xmm: RegSet,
    /// GPRs whose current value is dead past this instruction.
    pub gpr_discardable: RegSet,
    /// FPRs whose current value is dead past this instruction.
    pub fpr_discardable: RegSet,

    /// Guest address this op branches to, if it is a branch.
    pub branch_to: Option<u32>,
    /// Some branch in the block targets this op.
    pub is_branch_target: bool,
    /// The recompiler will fall back to the interpreter for this op.
    pub fallback_to_interpreter: bool,
}

/// The analyzer's output for one basic block.
///
/// `branch_infos` is sorted by `BranchInfo::start_index`, which is what the
/// in-block branch coordinator relies on when growing a region.
#[derive(Debug, Clone, Default)]
pub struct BlockAnalysis {
    pub ops: Vec<CodeOp>,
    pub branch_infos: Vec<BranchInfo>,
}

impl BlockAnalysis {
    /// Number of instructions left in the block after op `index`.
    #[inline]
    pub fn instructions_left(&self, index: usize) -> usize {
        self.ops.len().saturating_sub(index)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(source: usize, target: usize, direction: BranchDirection) -> BranchInfo {
        BranchInfo {
            address: 0,
            branch_to: 0,
            source_index: source,
            target_index: target,
            direction,
            regs_in: RegSet::EMPTY,
            regs_out: RegSet::EMPTY,
            fregs_in: RegSet::EMPTY,
            fregs_out: RegSet::EMPTY,
            contains_flush_and_continue: false,
        }
    }

    #[test]
    fn test_forward_branch_range() {
        let bi = branch(2, 8, BranchDirection::Forward);
        assert_eq!(bi.start_index(), 2);
        assert_eq!(bi.end_index(), 8);
    }

    #[test]
    fn test_backward_branch_range() {
        // A backward branch covers the loop body and ends after the branch.
        let bi = branch(9, 4, BranchDirection::Backward);
        assert_eq!(bi.start_index(), 4);
        assert_eq!(bi.end_index(), 10);
    }

    #[test]
    fn test_instructions_left() {
        let block = BlockAnalysis {
            ops: vec![CodeOp::default(); 5],
            branch_infos: Vec::new(),
        };
        assert_eq!(block.instructions_left(0), 5);
        assert_eq!(block.instructions_left(4), 1);
        assert_eq!(block.instructions_left(7), 0);
    }
}
