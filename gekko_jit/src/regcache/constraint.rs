//! Constraint accumulator.
//!
//! Each guest register owns one `Constraint` record that grows while handles
//! referencing it are alive and resets when the last handle drops. The
//! record answers two questions at realization time: what accesses the
//! instruction performs (read/write) and which locations are acceptable
//! (bound host register, immediate, memory). Flags only ever transition
//! false→true while locked.

use crate::regcache::error::RegCacheError;

/// How the instruction accesses the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

/// Where the register ended up when it was realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RealizedLoc {
    #[default]
    Invalid,
    Bound,
    Imm,
    Mem,
}

/// Location shapes a handle can demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintLoc {
    Bound,
    BoundOrImm,
    BoundOrMem,
    Any,
}

/// Accumulated realization plan for one guest register.
#[derive(Debug, Clone, Copy, Default)]
pub struct Constraint {
    realized: RealizedLoc,
    write: bool,
    read: bool,
    kill_imm: bool,
    kill_mem: bool,
    revertable: bool,
}

impl Constraint {
    #[inline]
    pub fn is_realized(&self) -> bool {
        self.realized != RealizedLoc::Invalid
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.is_realized()
            || self.write
            || self.read
            || self.kill_imm
            || self.kill_mem
            || self.revertable
    }

    #[inline]
    pub fn should_load(&self) -> bool {
        self.read
    }

    #[inline]
    pub fn should_dirty(&self) -> bool {
        self.write
    }

    #[inline]
    pub fn should_be_revertable(&self) -> bool {
        self.revertable
    }

    #[inline]
    pub fn should_kill_immediate(&self) -> bool {
        self.kill_imm
    }

    #[inline]
    pub fn should_kill_memory(&self) -> bool {
        self.kill_mem
    }

    #[inline]
    pub fn realized_loc(&self) -> RealizedLoc {
        self.realized
    }

    /// Stamp the location the register was realized at.
    pub fn set_realized(&mut self, loc: RealizedLoc) {
        debug_assert!(loc != RealizedLoc::Invalid);
        self.realized = loc;
    }

    pub fn add_use(&mut self, preg: usize, mode: AccessMode) -> Result<(), RegCacheError> {
        self.add(preg, mode, ConstraintLoc::Any, false)
    }

    pub fn add_use_no_imm(&mut self, preg: usize, mode: AccessMode) -> Result<(), RegCacheError> {
        self.add(preg, mode, ConstraintLoc::BoundOrMem, false)
    }

    pub fn add_bind_or_imm(&mut self, preg: usize, mode: AccessMode) -> Result<(), RegCacheError> {
        self.add(preg, mode, ConstraintLoc::BoundOrImm, false)
    }

    pub fn add_bind(&mut self, preg: usize, mode: AccessMode) -> Result<(), RegCacheError> {
        self.add(preg, mode, ConstraintLoc::Bound, false)
    }

    pub fn add_revertable_bind(
        &mut self,
        preg: usize,
        mode: AccessMode,
    ) -> Result<(), RegCacheError> {
        self.add(preg, mode, ConstraintLoc::Bound, true)
    }

    fn add(
        &mut self,
        preg: usize,
        mode: AccessMode,
        loc: ConstraintLoc,
        should_revertable: bool,
    ) -> Result<(), RegCacheError> {
        if self.is_realized() {
            if self.is_compatible(mode, loc, should_revertable) {
                return Ok(());
            }
            // A location-only mismatch can be repaired: un-stamp the record
            // and let the next realization upgrade the register (e.g. a
            // bind joining a register previously realized in memory).
            // Access-mode or transaction mismatches cannot.
            if self.is_mode_compatible(mode) && self.revertable == should_revertable {
                self.realized = RealizedLoc::Invalid;
            } else {
                return Err(RegCacheError::ConstraintConflict { preg });
            }
        }

        if should_revertable {
            self.revertable = true;
        }

        match loc {
            ConstraintLoc::Bound => {
                self.kill_imm = true;
                self.kill_mem = true;
            }
            ConstraintLoc::BoundOrImm => self.kill_mem = true,
            ConstraintLoc::BoundOrMem => self.kill_imm = true,
            ConstraintLoc::Any => {}
        }

        match mode {
            AccessMode::Read => self.read = true,
            AccessMode::Write => self.write = true,
            AccessMode::ReadWrite => {
                self.read = true;
                self.write = true;
            }
        }

        Ok(())
    }

    fn is_mode_compatible(&self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.read,
            AccessMode::Write => self.write,
            AccessMode::ReadWrite => self.read && self.write,
        }
    }

    fn is_compatible(&self, mode: AccessMode, loc: ConstraintLoc, should_revertable: bool) -> bool {
        if should_revertable && !self.revertable {
            return false;
        }

        let loc_compatible = match loc {
            ConstraintLoc::Bound => self.realized == RealizedLoc::Bound,
            ConstraintLoc::BoundOrImm => {
                self.realized == RealizedLoc::Bound || self.realized == RealizedLoc::Imm
            }
            ConstraintLoc::BoundOrMem => {
                self.realized == RealizedLoc::Bound || self.realized == RealizedLoc::Mem
            }
            ConstraintLoc::Any => true,
        };

        loc_compatible && self.is_mode_compatible(mode)
    }
}

// =============================================================================
// Tests
// =============================================================================
