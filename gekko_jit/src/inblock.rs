//! In-block branch coordinator.
//!
//! Short branches that stay inside the block being compiled do not have to
//! leave the JIT: if the combined register footprint of a run of branches
//! fits in the host banks, the coordinator pins that footprint, snapshots
//! the register caches, and emits the branch range as a fork region. Every
//! branch target inside the region is a *barrier*: the caches are rewound to
//! the snapshot there, so register state at the target is identical no
//! matter which path reached it, and pending forward jumps are patched to
//! land on it.
//!
//! State machine per op:
//! - Idle + op starts a compatible region → Active (fix, preload, fork)
//! - Active + op is a barrier → stay Active (preload, downcount, restore,
//!   patch fixups)
//! - Active + op reaches the region end → Idle (disarm, unfix, flush), then
//!   immediately retry the Idle transition for the same op

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, trace};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use gekko_ppc::{state, BlockAnalysis, BranchDirection, BranchInfo, RegSet};

use crate::backend::x64::emitter::{state_slot, Emitter, FixupBranch, SCRATCH_EXTRA};
use crate::regcache::{
    BankPolicy, FlushMode, ForkGuard, FprCache, FprPolicy, GprCache, GprPolicy, IgnoreDiscarded,
    RegCacheError,
};

/// Combined register footprint of a set of branches.
#[derive(Debug, Clone, Copy, Default)]
struct RegsUsed {
    regs_in: RegSet,
    regs_out: RegSet,
    fregs_in: RegSet,
    fregs_out: RegSet,
}

impl RegsUsed {
    fn from_branch(bi: &BranchInfo) -> Self {
        RegsUsed::default().combine(bi)
    }

    fn combine(&self, bi: &BranchInfo) -> Self {
        RegsUsed {
            regs_in: self.regs_in | bi.regs_in,
            regs_out: self.regs_out | bi.regs_out,
            fregs_in: self.fregs_in | bi.fregs_in,
            fregs_out: self.fregs_out | bi.fregs_out,
        }
    }

    fn gprs(&self) -> RegSet {
        self.regs_in | self.regs_out
    }

    fn fprs(&self) -> RegSet {
        self.fregs_in | self.fregs_out
    }
}

/// How the emitter should treat a branch instruction inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSite {
    /// Not part of an active region; emit the normal block-exit path.
    NotOptimized,
    /// Optimized forward branch: emit a conditional jump with a fixup and
    /// register it via `record_forward_fixup`.
    Forward,
    /// Optimized backward branch: jump to this already-emitted host offset.
    Backward(usize),
}

/// An active fork region.
struct Region<'rc> {
    /// Op index the region ends at.
    ends_at: usize,
    /// Op indices of the branch instructions folded into the region.
    branch_sources: SmallVec<[usize; 4]>,
    regs: RegsUsed,
    /// Pending forward jumps by source op index.
    forward_fixups: FxHashMap<usize, FixupBranch>,
    /// Host offsets of emitted backward-branch targets by target op index.
    backward_targets: FxHashMap<usize, usize>,
    gpr_guard: ForkGuard<'rc, GprPolicy>,
    fpr_guard: ForkGuard<'rc, FprPolicy>,
}

/// Drives fork regions over both register banks while the recompiler walks
/// the block.
pub struct InBlockBranches<'rc> {
    gpr: &'rc GprCache,
    fpr: &'rc FprCache,
    emitter: Rc<RefCell<Emitter>>,
    block: Rc<BlockAnalysis>,
    /// Cycles accumulated since the last downcount subtraction.
    downcount_amount: Cell<u32>,
    region: Option<Region<'rc>>,
}

impl<'rc> InBlockBranches<'rc> {
    pub fn new(
        gpr: &'rc GprCache,
        fpr: &'rc FprCache,
        emitter: Rc<RefCell<Emitter>>,
        block: Rc<BlockAnalysis>,
    ) -> Self {
        InBlockBranches {
            gpr,
            fpr,
            emitter,
            block,
            downcount_amount: Cell::new(0),
            region: None,
        }
    }

    /// Is a fork region active?
    pub fn is_active(&self) -> bool {
        self.region.is_some()
    }

    /// Credit an instruction's cycles to the pending downcount.
    pub fn accumulate_cycles(&self, cycles: u32) {
        self.downcount_amount
            .set(self.downcount_amount.get() + cycles);
    }

    /// Cycles not yet subtracted from the downcount.
    pub fn pending_downcount(&self) -> u32 {
        self.downcount_amount.get()
    }

    /// Emit the block-exit downcount subtraction for all remaining cycles.
    pub fn flush_downcount(&self) {
        let amount = self.downcount_amount.get();
        self.emitter
            .borrow_mut()
            .sub32_mem_imm(state_slot(state::DOWNCOUNT_OFFSET), amount);
        self.downcount_amount.set(0);
    }

    /// Advance the coordinator to `op_index`. Handles barriers, region ends,
    /// and region starts; returns whether a region is active for this op.
    pub fn prepare_op(&mut self, op_index: usize) -> Result<bool, RegCacheError> {
        if self.region.is_some() {
            self.handle_barriers(op_index)?;
            let ends_at = self.region.as_ref().map(|r| r.ends_at).unwrap_or(0);
            if op_index >= ends_at {
                debug_assert_eq!(op_index, ends_at, "overshot the fork region end");
                self.end_region();
                let (gpr_in_use, fpr_in_use) = {
                    let op = &self.block.ops[op_index];
                    (op.gpr_in_use, op.fpr_in_use)
                };
                self.gpr
                    .flush(!gpr_in_use, FlushMode::Full, IgnoreDiscarded::Yes)?;
                self.fpr
                    .flush(!fpr_in_use, FlushMode::Full, IgnoreDiscarded::Yes)?;
                // Another region may begin exactly where this one ended.
                return self.prepare_op(op_index);
            }
            return Ok(true);
        }

        let block = Rc::clone(&self.block);
        let op = &block.ops[op_index];
        if op.branch_to.is_none() && !op.is_branch_target {
            return Ok(false);
        }

        // The branch infos are sorted by start index; pick the first branch
        // that starts here and grow a maximal compatible set from it.
        let Some(first_pos) = block
            .branch_infos
            .iter()
            .position(|bi| bi.direction != BranchDirection::Outside && bi.start_index() == op_index)
        else {
            return Ok(false);
        };
        let first = &block.branch_infos[first_pos];
        let mut regs = RegsUsed::from_branch(first);
        if !self.fits(&regs) {
            return Ok(false);
        }
        let mut ends_at = first.end_index();
        let mut should_flush = first.contains_flush_and_continue;
        let mut sources: SmallVec<[usize; 4]> = SmallVec::new();
        sources.push(first.source_index);

        for bi in &block.branch_infos[first_pos + 1..] {
            // Only branches overlapping the current run can join.
            if bi.start_index() >= ends_at {
                break;
            }
            if bi.direction == BranchDirection::Outside {
                continue;
            }
            let candidate = regs.combine(bi);
            if self.fits(&candidate) {
                regs = candidate;
                sources.push(bi.source_index);
                ends_at = ends_at.max(bi.end_index());
                should_flush |= bi.contains_flush_and_continue;
            }
        }
        for op in &block.ops[op_index..ends_at] {
            should_flush |= op.fallback_to_interpreter;
        }

        debug!(
            "fork region at op {}..{} ({} branches, gprs {:?}, fprs {:?})",
            op_index,
            ends_at,
            sources.len(),
            regs.gprs(),
            regs.fprs()
        );

        if should_flush {
            self.gpr
                .flush(!regs.gprs(), FlushMode::Full, IgnoreDiscarded::No)?;
            self.fpr
                .flush(!regs.fprs(), FlushMode::Full, IgnoreDiscarded::No)?;
        }
        self.force_preload(&regs)?;
        self.gpr.fix_host_registers(regs.gprs());
        self.fpr.fix_host_registers(regs.fprs());

        let gpr: &'rc GprCache = self.gpr;
        let fpr: &'rc FprCache = self.fpr;
        self.region = Some(Region {
            ends_at,
            branch_sources: sources,
            regs,
            forward_fixups: FxHashMap::default(),
            backward_targets: FxHashMap::default(),
            gpr_guard: gpr.fork(),
            fpr_guard: fpr.fork(),
        });

        // The entry op may itself be a barrier (backward-branch target).
        self.handle_barriers(op_index)?;
        Ok(true)
    }

    /// Classify a branch instruction inside the walk. For optimized forward
    /// branches the caller emits a conditional jump and registers its fixup;
    /// for backward ones it jumps to the returned host offset.
    pub fn branch_site(&mut self, op_index: usize) -> Result<BranchSite, RegCacheError> {
        // Merged instructions can be skipped by the main walk, so regions
        // that start at a branch are opened here as well.
        if !self.prepare_op(op_index)? {
            return Ok(BranchSite::NotOptimized);
        }
        let optimized = self
            .region
            .as_ref()
            .is_some_and(|r| r.branch_sources.contains(&op_index));
        if !optimized {
            return Ok(BranchSite::NotOptimized);
        }

        let regs = match self.region.as_ref() {
            Some(region) => region.regs,
            None => return Ok(BranchSite::NotOptimized),
        };
        self.force_preload(&regs)?;

        let block = Rc::clone(&self.block);
        let Some(bi) = block
            .branch_infos
            .iter()
            .find(|bi| bi.source_index == op_index)
        else {
            return Ok(BranchSite::NotOptimized);
        };
        match bi.direction {
            BranchDirection::Outside => Ok(BranchSite::NotOptimized),
            BranchDirection::Forward => Ok(BranchSite::Forward),
            BranchDirection::Backward => {
                let target = self
                    .region
                    .as_ref()
                    .and_then(|r| r.backward_targets.get(&bi.target_index).copied());
                match target {
                    Some(offset) => Ok(BranchSite::Backward(offset)),
                    None => Ok(BranchSite::NotOptimized),
                }
            }
        }
    }

    /// Register the fixup of an optimized forward branch; the matching
    /// barrier patches it.
    pub fn record_forward_fixup(&mut self, source_index: usize, fixup: FixupBranch) {
        if let Some(region) = self.region.as_mut() {
            region.forward_fixups.insert(source_index, fixup);
        }
    }

    /// Tear down any region still active; for regions ending exactly at the
    /// block boundary.
    pub fn finish(&mut self) {
        self.end_region();
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn fits(&self, regs: &RegsUsed) -> bool {
        regs.gprs().count() as usize <= self.gpr.policy().max_preloadable_registers()
            && regs.fprs().count() as usize <= self.fpr.policy().max_preloadable_registers()
    }

    /// Bind the whole region footprint, holding the extra scratch register
    /// out of the way while doing so.
    fn force_preload(&self, regs: &RegsUsed) -> Result<(), RegCacheError> {
        let scratch_guard = self.gpr.scratch_at(SCRATCH_EXTRA)?;
        self.gpr.preload_for_branch_region(regs.gprs())?;
        self.fpr.preload_for_branch_region(regs.fprs())?;
        drop(scratch_guard);
        Ok(())
    }

    /// Handle every barrier landing on this op: re-establish the entry
    /// state, subtract the cycles spent since the previous barrier, and
    /// resolve the branches targeting it.
    fn handle_barriers(&mut self, op_index: usize) -> Result<(), RegCacheError> {
        let block = Rc::clone(&self.block);
        let (regs, sites) = {
            let Some(region) = self.region.as_ref() else {
                return Ok(());
            };
            let sites: Vec<(usize, BranchDirection, usize)> = block
                .branch_infos
                .iter()
                .filter(|bi| {
                    bi.target_index == op_index && region.branch_sources.contains(&bi.source_index)
                })
                .map(|bi| (bi.source_index, bi.direction, bi.target_index))
                .collect();
            (region.regs, sites)
        };
        if sites.is_empty() {
            return Ok(());
        }

        trace!("barrier at op {}", op_index);
        self.force_preload(&regs)?;
        self.emit_downcount_update(op_index);
        if let Some(region) = self.region.as_ref() {
            region.gpr_guard.restore();
            region.fpr_guard.restore();
        }
        // The restore rewound the dirty bits; values written on some path
        // into this barrier still have to reach memory at block exit.
        self.gpr.force_dirty(regs.regs_out);
        self.fpr.force_dirty(regs.fregs_out);

        for (source, direction, target) in sites {
            match direction {
                BranchDirection::Forward => {
                    let fixup = self
                        .region
                        .as_mut()
                        .and_then(|r| r.forward_fixups.remove(&source));
                    if let Some(fixup) = fixup {
                        self.emitter.borrow_mut().set_jump_target(fixup);
                    }
                }
                BranchDirection::Backward => {
                    let position = self.emitter.borrow().position();
                    if let Some(region) = self.region.as_mut() {
                        region.backward_targets.insert(target, position);
                    }
                }
                BranchDirection::Outside => {}
            }
        }
        Ok(())
    }

    /// One SUB covering the cycles consumed since the previous barrier or
    /// region entry, leaving the barrier op's own cycles pending.
    fn emit_downcount_update(&self, op_index: usize) {
        let cycles = self.block.ops[op_index].cycles;
        let amount = self.downcount_amount.get().saturating_sub(cycles);
        self.emitter
            .borrow_mut()
            .sub32_mem_imm(state_slot(state::DOWNCOUNT_OFFSET), amount);
        self.downcount_amount.set(cycles);
    }

    fn end_region(&mut self) {
        if let Some(mut region) = self.region.take() {
            // The final barrier already restored the snapshot and re-dirtied
            // the live-out registers; a restore here would lose that.
            region.gpr_guard.disarm();
            region.fpr_guard.disarm();
            drop(region);
            self.gpr.unfix_host_registers();
            self.fpr.unfix_host_registers();
            trace!("fork region ended");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regcache::RegCache;
    use gekko_ppc::{CodeOp, ConstantPropagation};

    fn make_block(num_ops: usize, branch_infos: Vec<BranchInfo>) -> BlockAnalysis {
        let mut ops = vec![CodeOp::default(); num_ops];
        for op in &mut ops {
            op.cycles = 1;
        }
        for bi in &branch_infos {
            ops[bi.source_index].branch_to = Some(bi.branch_to);
            if bi.direction != BranchDirection::Outside {
                ops[bi.target_index].is_branch_target = true;
            }
        }
        BlockAnalysis { ops, branch_infos }
    }

    fn forward_branch(source: usize, target: usize, regs_in: RegSet, regs_out: RegSet) -> BranchInfo {
        BranchInfo {
            address: 0x8000_0000 + 4 * source as u32,
            branch_to: 0x8000_0000 + 4 * target as u32,
            source_index: source,
            target_index: target,
            direction: BranchDirection::Forward,
            regs_in,
            regs_out,
            fregs_in: RegSet::EMPTY,
            fregs_out: RegSet::EMPTY,
            contains_flush_and_continue: false,
        }
    }

    struct Harness {
        gpr: GprCache,
        fpr: FprCache,
        emitter: Rc<RefCell<Emitter>>,
        block: Rc<BlockAnalysis>,
    }

    impl Harness {
        fn new(block: BlockAnalysis) -> Self {
            let emitter = Rc::new(RefCell::new(Emitter::new()));
            let gpr = RegCache::new(GprPolicy::new(ConstantPropagation::new()));
            let fpr = RegCache::new(FprPolicy::new());
            let block = Rc::new(block);
            gpr.start();
            fpr.start();
            gpr.set_emitter(emitter.clone());
            fpr.set_emitter(emitter.clone());
            gpr.set_block(block.clone());
            fpr.set_block(block.clone());
            Harness {
                gpr,
                fpr,
                emitter,
                block,
            }
        }

        fn coordinator(&self) -> InBlockBranches<'_> {
            InBlockBranches::new(&self.gpr, &self.fpr, self.emitter.clone(), self.block.clone())
        }
    }

    #[test]
    fn test_plain_ops_stay_idle() {
        let h = Harness::new(make_block(4, vec![]));
        let mut ib = h.coordinator();
        for i in 0..4 {
            ib.accumulate_cycles(1);
            assert!(!ib.prepare_op(i).unwrap());
            assert!(!ib.is_active());
        }
    }

    #[test]
    fn test_forward_region_lifecycle() {
        let regs = RegSet::singleton(3) | RegSet::singleton(4);
        let h = Harness::new(make_block(6, vec![forward_branch(1, 4, regs, RegSet::EMPTY)]));
        let mut ib = h.coordinator();

        ib.accumulate_cycles(1);
        assert!(!ib.prepare_op(0).unwrap());

        ib.accumulate_cycles(1);
        assert!(ib.prepare_op(1).unwrap());
        assert!(ib.is_active());
        // The footprint was preloaded and pinned.
        assert!(h.gpr.is_bound(3));
        assert!(h.gpr.is_bound(4));

        // The branch instruction is an optimized forward branch.
        assert_eq!(ib.branch_site(1).unwrap(), BranchSite::Forward);
        let jcc_pos = h.emitter.borrow().position();
        let fixup = h.emitter.borrow_mut().jcc(crate::backend::x64::emitter::Cond::E);
        ib.record_forward_fixup(1, fixup);

        ib.accumulate_cycles(1);
        assert!(ib.prepare_op(2).unwrap());
        ib.accumulate_cycles(1);
        assert!(ib.prepare_op(3).unwrap());

        // Op 4 is the barrier and the region end: fixup patched, region
        // closed, caches still sane.
        ib.accumulate_cycles(1);
        assert!(!ib.prepare_op(4).unwrap());
        assert!(!ib.is_active());
        assert!(h.gpr.sanity_check());
        assert!(h.fpr.sanity_check());

        // The patched rel32 jumps forward to the barrier, not to zero.
        let code = h.emitter.borrow().code().to_vec();
        let rel = i32::from_le_bytes(code[jcc_pos + 2..jcc_pos + 6].try_into().unwrap());
        assert!(rel > 0);
        assert_eq!(jcc_pos + 6 + rel as usize, code.len());
    }

    #[test]
    fn test_region_restores_binding_at_barrier() {
        let regs = RegSet::singleton(3);
        let h = Harness::new(make_block(6, vec![forward_branch(1, 4, regs, RegSet::EMPTY)]));
        let mut ib = h.coordinator();

        ib.accumulate_cycles(1);
        ib.prepare_op(0).unwrap();
        ib.accumulate_cycles(1);
        assert!(ib.prepare_op(1).unwrap());

        let xr = h.gpr.host_reg(3).unwrap();

        // Mid-region the register picks up a new binding state; the barrier
        // rewinds it.
        ib.accumulate_cycles(1);
        ib.prepare_op(2).unwrap();
        ib.accumulate_cycles(1);
        ib.prepare_op(3).unwrap();
        ib.accumulate_cycles(1);
        ib.prepare_op(4).unwrap();

        // After the region, flushes put everything back into memory.
        assert_eq!(h.gpr.registers_revertable(), RegSet::EMPTY);
        assert!(!h.gpr.is_bound(3) || h.gpr.host_reg(3).unwrap() == xr);
    }

    #[test]
    fn test_downcount_covers_cycles_between_barriers() {
        let regs = RegSet::singleton(3);
        let h = Harness::new(make_block(6, vec![forward_branch(1, 4, regs, RegSet::EMPTY)]));
        let mut ib = h.coordinator();

        for i in 0..5 {
            ib.accumulate_cycles(1);
            ib.prepare_op(i).unwrap();
        }
        // Five cycles accumulated; the barrier at op 4 subtracts all but the
        // barrier op's own cycle.
        assert_eq!(ib.pending_downcount(), 1);
    }

    #[test]
    fn test_oversized_footprint_is_rejected() {
        // More GPRs than the bank can preload: the region must not start.
        let big = RegSet::from_bits(0x0000_3FFF); // 14 registers
        let h = Harness::new(make_block(6, vec![forward_branch(1, 4, big, RegSet::EMPTY)]));
        let mut ib = h.coordinator();

        ib.accumulate_cycles(1);
        ib.prepare_op(0).unwrap();
        ib.accumulate_cycles(1);
        assert!(!ib.prepare_op(1).unwrap());
        assert!(!ib.is_active());
        assert_eq!(ib.branch_site(1).unwrap(), BranchSite::NotOptimized);
    }
}
