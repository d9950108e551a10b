//! x86_64 backend of the Gekko dynamic recompiler.
//!
//! Translates analyzed PowerPC basic blocks into host machine code one
//! instruction at a time. This crate provides:
//! - a byte-level x64 emitter with forward-branch fixups (`backend`)
//! - the per-block register cache: scoped operand handles, a cost-driven
//!   spill heuristic, revertable bindings for faultable loads, and
//!   fork/restore snapshots for in-block branches (`regcache`)
//! - the in-block branch coordinator that drives fork regions (`inblock`)

pub mod backend;
pub mod inblock;
pub mod regcache;

pub use backend::x64::emitter::Emitter;
pub use regcache::{AccessMode, FlushMode, FprCache, GprCache, RegCacheError};
