//! Guest-side types for the Gekko dynamic recompiler.
//!
//! This crate holds everything the register allocator consumes from the
//! PowerPC side of the world:
//! - `RegSet`: a 32-entry register bitset used for both guest and host sets
//! - the analyzed instruction stream (`CodeOp`, `BranchInfo`, `BlockAnalysis`)
//! - the constant-propagation snapshot for the GPR bank
//! - the in-memory PowerPC state-block layout

pub mod analysis;
pub mod bitset;
pub mod constprop;
pub mod state;

pub use analysis::{BlockAnalysis, BranchDirection, BranchInfo, CodeOp};
pub use bitset::RegSet;
pub use constprop::ConstantPropagation;
