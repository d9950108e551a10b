//! Host code generation backends.
//!
//! Only x86_64 exists today; the module split leaves room for an AArch64
//! port without disturbing the register cache.

pub mod x64;
