//! Register cache error taxonomy.
//!
//! Every variant is a recompiler bug, not a guest-visible condition: the
//! caller's only sensible reaction is to abort the block compilation and let
//! the block cache fall back to the interpreter.

use gekko_ppc::RegSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegCacheError {
    /// A handle was taken with constraints incompatible with what an earlier
    /// handle already realized for the same register.
    #[error("conflicting constraints for guest register {preg}")]
    ConstraintConflict { preg: usize },

    /// A handle's operand was read before `realize` committed it to a
    /// location.
    #[error("handle for guest register {preg} used before realization")]
    UnrealizedHandle { preg: usize },

    /// Binding would give two guest registers the same host register.
    #[error("host register {xreg} is already bound")]
    DoubleBind { xreg: u8 },

    /// Flush, discard, or scratch takeover hit a register still locked by a
    /// live handle (or pinned to its host register).
    #[error("operation on locked guest registers {0:?}")]
    LockedDuringFlush(RegSet),

    /// Flush or discard hit a register with a transaction in progress.
    #[error("transaction in progress on guest registers {0:?}")]
    RevertableDuringFlush(RegSet),

    /// Reset of registers still bound to host registers.
    #[error("reset of bound guest registers {0:?} (did you mean to flush?)")]
    ResetOfBoundRegister(RegSet),

    /// Every allocatable host register is pinned down by live handles.
    #[error("out of host registers")]
    OutOfRegisters,

    /// A guest register has no live location at all (discarded) where one
    /// was required.
    #[error("guest register {preg} has no live location")]
    MissingLocation { preg: usize },
}
