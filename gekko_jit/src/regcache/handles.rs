//! Scoped register handles.
//!
//! Emission code declares its intent by taking handles, realizes them once
//! all operands for an instruction are known, then reads the concrete
//! operands. Construction takes a reentrant lock on the underlying register;
//! dropping the handle releases it, and when the last handle on a register
//! drops, its accumulated constraints reset.
//!
//! Handles are move-only resources: there is no way to clone one, so a lock
//! can never be released twice.

use std::mem;

use crate::backend::x64::operand::Operand;

use super::error::RegCacheError;
use super::{BankPolicy, CacheTables, RegCache};

/// Anything that can participate in a batch realization.
pub trait Realize {
    fn realize_handle(&self) -> Result<(), RegCacheError>;
}

/// Realize a whole instruction's handles together, so every operand's lock
/// is visible to the spill heuristic before any binding decision is made.
pub fn realize_all(handles: &[&dyn Realize]) -> Result<(), RegCacheError> {
    for handle in handles {
        handle.realize_handle()?;
    }
    Ok(())
}

// =============================================================================
// Operand handle
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum OperandSlot<R> {
    /// Released or moved-from.
    Empty,
    /// A concrete host register (either raw, or inherited from an exclusive
    /// handle together with its lock).
    Xreg(R),
    /// A bare immediate, no cache involvement.
    Imm(u32),
    /// A guest register managed by the cache.
    Preg(usize),
}

/// A handle denoting a bound host register, an immediate literal, or a
/// memory operand, decided at realization time.
pub struct OperandHandle<'rc, P: BankPolicy> {
    cache: Option<&'rc RegCache<P>>,
    slot: OperandSlot<P::Reg>,
}

impl<'rc, P: BankPolicy> OperandHandle<'rc, P> {
    /// A free-standing immediate operand.
    pub fn imm32(value: u32) -> Self {
        OperandHandle {
            cache: None,
            slot: OperandSlot::Imm(value),
        }
    }

    /// A raw host register the cache does not manage.
    pub fn from_raw_xreg(xr: P::Reg) -> Self {
        OperandHandle {
            cache: None,
            slot: OperandSlot::Xreg(xr),
        }
    }

    pub(crate) fn from_preg(cache: &'rc RegCache<P>, preg: usize) -> Self {
        cache.lock(preg);
        OperandHandle {
            cache: Some(cache),
            slot: OperandSlot::Preg(preg),
        }
    }

    /// Commit the register to a concrete location, emitting any required
    /// load or spill.
    pub fn realize(&self) -> Result<(), RegCacheError> {
        match self.slot {
            OperandSlot::Preg(preg) => self.cache().realize(preg),
            _ => Ok(()),
        }
    }

    /// The concrete operand. Fails until `realize` has been called.
    pub fn location(&self) -> Result<Operand<P::Reg>, RegCacheError> {
        match self.slot {
            OperandSlot::Preg(preg) => {
                let rc = self.cache();
                if !rc.is_realized(preg) {
                    return Err(RegCacheError::UnrealizedHandle { preg });
                }
                rc.current_location(preg)
            }
            OperandSlot::Xreg(xr) => Ok(Operand::Reg(xr)),
            OperandSlot::Imm(v) => Ok(Operand::Imm32(v)),
            OperandSlot::Empty => unreachable!("use of a released operand handle"),
        }
    }

    /// The host register, if the realized location is one.
    pub fn host_reg(&self) -> Result<Option<P::Reg>, RegCacheError> {
        Ok(self.location()?.reg())
    }

    /// Does the operand carry an immediate value?
    pub fn is_imm(&self) -> bool {
        match self.slot {
            OperandSlot::Imm(_) => true,
            OperandSlot::Preg(preg) => self.cache().is_imm(preg),
            _ => false,
        }
    }

    /// The immediate value, if there is one.
    pub fn imm_value(&self) -> Option<u32> {
        match self.slot {
            OperandSlot::Imm(v) => Some(v),
            OperandSlot::Preg(preg) => self.cache().imm32(preg),
            _ => None,
        }
    }

    /// The immediate value sign-extended, if there is one.
    pub fn simm_value(&self) -> Option<i32> {
        self.imm_value().map(|v| v as i32)
    }

    /// Is the operand a known zero?
    pub fn is_zero(&self) -> bool {
        self.imm_value() == Some(0)
    }

    /// Release the lock early, leaving the handle inert.
    pub fn release(&mut self) {
        match self.slot {
            OperandSlot::Preg(preg) => self.cache().unlock(preg),
            OperandSlot::Xreg(xr) => {
                // With a cache this came from an exclusive handle; without
                // one it was a raw register and holds no lock.
                if let Some(rc) = self.cache {
                    rc.unlock_x(xr);
                }
            }
            _ => {}
        }
        self.slot = OperandSlot::Empty;
        self.cache = None;
    }

    fn cache(&self) -> &'rc RegCache<P> {
        match self.cache {
            Some(rc) => rc,
            None => unreachable!("cache-managed handle without a cache"),
        }
    }
}

impl<'rc, P: BankPolicy> Drop for OperandHandle<'rc, P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<'rc, P: BankPolicy> Realize for OperandHandle<'rc, P> {
    fn realize_handle(&self) -> Result<(), RegCacheError> {
        self.realize()
    }
}

impl<'rc, P: BankPolicy> From<ExclusiveHandle<'rc, P>> for OperandHandle<'rc, P> {
    /// Widen an exclusive handle into an operand handle, transferring the
    /// lock.
    fn from(mut ex: ExclusiveHandle<'rc, P>) -> Self {
        let cache = ex.cache.take();
        let slot = match mem::replace(&mut ex.slot, ExclusiveSlot::Empty) {
            ExclusiveSlot::Preg(preg) => OperandSlot::Preg(preg),
            ExclusiveSlot::Xreg(xr) => OperandSlot::Xreg(xr),
            ExclusiveSlot::Empty => OperandSlot::Empty,
        };
        // `ex` drops with an empty slot, so the lock moves rather than
        // being released.
        OperandHandle { cache, slot }
    }
}

// =============================================================================
// Exclusive handle
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum ExclusiveSlot<R> {
    Empty,
    /// A locked scratch host register.
    Xreg(R),
    /// A guest register that will realize as a bound host register.
    Preg(usize),
}

/// A handle that always denotes a concrete host register.
pub struct ExclusiveHandle<'rc, P: BankPolicy> {
    cache: Option<&'rc RegCache<P>>,
    slot: ExclusiveSlot<P::Reg>,
}

impl<'rc, P: BankPolicy> ExclusiveHandle<'rc, P> {
    pub(crate) fn from_preg(cache: &'rc RegCache<P>, preg: usize) -> Self {
        cache.lock(preg);
        ExclusiveHandle {
            cache: Some(cache),
            slot: ExclusiveSlot::Preg(preg),
        }
    }

    pub(crate) fn from_xreg(cache: &'rc RegCache<P>, xr: P::Reg) -> Self {
        // The host-side lock was taken by the scratch path.
        ExclusiveHandle {
            cache: Some(cache),
            slot: ExclusiveSlot::Xreg(xr),
        }
    }

    /// Commit the register to its host register, emitting any required load
    /// or spill.
    pub fn realize(&self) -> Result<(), RegCacheError> {
        match self.slot {
            ExclusiveSlot::Preg(preg) => self.cache().realize(preg),
            _ => Ok(()),
        }
    }

    /// The concrete host register. Fails until `realize` has been called.
    pub fn host_reg(&self) -> Result<P::Reg, RegCacheError> {
        match self.slot {
            ExclusiveSlot::Preg(preg) => {
                let rc = self.cache();
                if !rc.is_realized(preg) {
                    return Err(RegCacheError::UnrealizedHandle { preg });
                }
                rc.host_reg(preg)
            }
            ExclusiveSlot::Xreg(xr) => Ok(xr),
            ExclusiveSlot::Empty => unreachable!("use of a released exclusive handle"),
        }
    }

    /// The register as an instruction operand.
    pub fn operand(&self) -> Result<Operand<P::Reg>, RegCacheError> {
        Ok(Operand::Reg(self.host_reg()?))
    }

    /// Release the lock early, leaving the handle inert.
    pub fn release(&mut self) {
        match self.slot {
            ExclusiveSlot::Preg(preg) => self.cache().unlock(preg),
            ExclusiveSlot::Xreg(xr) => self.cache().unlock_x(xr),
            ExclusiveSlot::Empty => {}
        }
        self.slot = ExclusiveSlot::Empty;
        self.cache = None;
    }

    fn cache(&self) -> &'rc RegCache<P> {
        match self.cache {
            Some(rc) => rc,
            None => unreachable!("exclusive handle without a cache"),
        }
    }
}

impl<'rc, P: BankPolicy> Drop for ExclusiveHandle<'rc, P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<'rc, P: BankPolicy> Realize for ExclusiveHandle<'rc, P> {
    fn realize_handle(&self) -> Result<(), RegCacheError> {
        self.realize()
    }
}

// =============================================================================
// Fork guard
// =============================================================================

/// Snapshot of the cache tables taken at the head of a fork region.
///
/// `restore` rewinds the tables to the snapshot (used at every barrier);
/// dropping the guard performs a final restore unless it was disarmed.
pub struct ForkGuard<'rc, P: BankPolicy> {
    cache: &'rc RegCache<P>,
    snapshot: Option<CacheTables<P::Reg>>,
}

impl<'rc, P: BankPolicy> ForkGuard<'rc, P> {
    pub(crate) fn new(cache: &'rc RegCache<P>, snapshot: CacheTables<P::Reg>) -> Self {
        ForkGuard {
            cache,
            snapshot: Some(snapshot),
        }
    }

    /// Rewind the cache tables to the snapshot, keeping the guard armed for
    /// further barriers.
    pub fn restore(&self) {
        if let Some(snapshot) = &self.snapshot {
            self.cache.restore_tables(snapshot);
        }
    }

    /// Restore once and release the snapshot.
    pub fn end_fork(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.cache.restore_tables(&snapshot);
        }
    }

    /// Release the snapshot without restoring; used at region exit after the
    /// final barrier has already restored and re-dirtied live-out registers.
    pub fn disarm(&mut self) {
        self.snapshot = None;
    }

    /// Whether the guard still holds its snapshot.
    pub fn is_armed(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl<'rc, P: BankPolicy> Drop for ForkGuard<'rc, P> {
    fn drop(&mut self) {
        self.end_fork();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regcache::{AccessMode, GprPolicy, RegCache};
    use gekko_ppc::ConstantPropagation;

    fn cache() -> RegCache<GprPolicy> {
        let rc = RegCache::new(GprPolicy::new(ConstantPropagation::new()));
        rc.start();
        rc
    }

    #[test]
    fn test_location_before_realize_fails() {
        let rc = cache();
        let h = rc.use_reg(3, AccessMode::Read).unwrap();
        assert_eq!(
            h.location().unwrap_err(),
            RegCacheError::UnrealizedHandle { preg: 3 }
        );
        h.realize().unwrap();
        assert!(h.location().is_ok());
    }

    #[test]
    fn test_drop_releases_lock_and_constraint() {
        let rc = cache();
        {
            let _h = rc.use_reg(4, AccessMode::Read).unwrap();
            assert!(!rc.is_all_unlocked());
        }
        assert!(rc.is_all_unlocked());
    }

    #[test]
    fn test_multiple_handles_same_register() {
        let rc = cache();
        let a = rc.use_reg(5, AccessMode::Read).unwrap();
        let b = rc.use_reg(5, AccessMode::Read).unwrap();
        a.realize().unwrap();
        // Second realize is a no-op; both see the same location.
        b.realize().unwrap();
        assert_eq!(
            a.location().unwrap().reg(),
            b.location().unwrap().reg()
        );
        drop(a);
        assert!(!rc.is_all_unlocked());
        drop(b);
        assert!(rc.is_all_unlocked());
    }

    #[test]
    fn test_second_bind_upgrades_memory_realization() {
        let rc = cache();
        let a = rc.use_reg(6, AccessMode::Read).unwrap();
        a.realize().unwrap();
        assert!(matches!(
            a.location().unwrap(),
            crate::backend::x64::operand::Operand::Mem(_)
        ));

        // A bind joining after a memory realization upgrades to a binding.
        let b = rc.bind(6, AccessMode::Read).unwrap();
        b.realize().unwrap();
        assert!(rc.is_bound(6));
        assert!(a.location().unwrap().is_reg());
        assert_eq!(a.location().unwrap().reg(), Some(b.host_reg().unwrap()));
    }

    #[test]
    fn test_exclusive_to_operand_keeps_lock() {
        let rc = cache();
        let ex = rc.bind(7, AccessMode::Write).unwrap();
        ex.realize().unwrap();
        let op: OperandHandle<'_, GprPolicy> = ex.into();
        assert!(op.location().unwrap().is_reg());
        assert!(!rc.is_all_unlocked());
        drop(op);
        assert!(rc.is_all_unlocked());
    }

    #[test]
    fn test_batch_realize() {
        let rc = cache();
        let a = rc.use_reg(1, AccessMode::Read).unwrap();
        let b = rc.bind(2, AccessMode::Write).unwrap();
        realize_all(&[&a, &b]).unwrap();
        assert!(a.location().is_ok());
        assert!(b.host_reg().is_ok());
    }

    #[test]
    fn test_free_standing_imm_handle() {
        let rc = cache();
        let h: OperandHandle<'_, GprPolicy> = OperandHandle::imm32(0);
        assert!(h.is_zero());
        assert!(h.is_imm());
        assert_eq!(h.simm_value(), Some(0));
        h.location().unwrap();
        drop(h);
        drop(rc);
    }

    #[test]
    fn test_fork_guard_restores_on_drop() {
        let rc = cache();
        let snapshot_free = rc.num_free_registers();
        {
            let guard = rc.fork();
            let h = rc.bind(3, AccessMode::Write).unwrap();
            h.realize().unwrap();
            drop(h);
            assert_eq!(rc.num_free_registers(), snapshot_free - 1);
            drop(guard);
        }
        assert_eq!(rc.num_free_registers(), snapshot_free);
        assert!(!rc.is_bound(3));
    }
}
