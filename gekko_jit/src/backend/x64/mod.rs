//! x86_64 backend: register definitions, operands, and the byte emitter.

pub mod emitter;
pub mod operand;
pub mod registers;

pub use emitter::{Cond, Emitter, FixupBranch};
pub use operand::{MemOperand, Operand};
pub use registers::{Gpr, HostReg, Xmm};
