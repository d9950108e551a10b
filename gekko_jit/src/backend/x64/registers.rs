//! x64 register definitions.
//!
//! General-purpose and XMM registers with their hardware encodings. The
//! encoding bits map directly onto the instruction format: bits 0-2 go into
//! ModR/M or an opcode extension, bit 3 into a REX prefix.

use std::fmt;

/// Common surface of the two host register banks.
///
/// The register cache is generic over the bank; this trait is all it needs
/// to know about a host register.
pub trait HostReg: Copy + Eq + fmt::Debug + fmt::Display {
    /// Hardware encoding (0-15).
    fn encoding(self) -> u8;

    /// Convert from an encoding value if valid.
    fn from_encoding(enc: u8) -> Option<Self>;
}

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// x64 general-purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// Get bits 0-2 for ModR/M encoding.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Get bit 3 for the REX prefix.
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        (self as u8) >= 8
    }

    /// RSP and R12 have encoding 0b100, which collides with the SIB escape
    /// when used as a base register.
    #[inline(always)]
    pub const fn needs_sib_as_base(self) -> bool {
        self.low_bits() == 4
    }

    /// RBP and R13 have encoding 0b101, which means [disp32] in mod=00, so
    /// they always need an explicit displacement.
    #[inline(always)]
    pub const fn needs_displacement(self) -> bool {
        self.low_bits() == 5
    }

    const fn name_64(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

impl HostReg for Gpr {
    #[inline(always)]
    fn encoding(self) -> u8 {
        self as u8
    }

    #[inline]
    fn from_encoding(enc: u8) -> Option<Gpr> {
        match enc {
            0 => Some(Gpr::Rax),
            1 => Some(Gpr::Rcx),
            2 => Some(Gpr::Rdx),
            3 => Some(Gpr::Rbx),
            4 => Some(Gpr::Rsp),
            5 => Some(Gpr::Rbp),
            6 => Some(Gpr::Rsi),
            7 => Some(Gpr::Rdi),
            8 => Some(Gpr::R8),
            9 => Some(Gpr::R9),
            10 => Some(Gpr::R10),
            11 => Some(Gpr::R11),
            12 => Some(Gpr::R12),
            13 => Some(Gpr::R13),
            14 => Some(Gpr::R14),
            15 => Some(Gpr::R15),
            _ => None,
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name_64())
    }
}

// =============================================================================
// XMM Registers
// =============================================================================

/// x64 XMM register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    /// Get bits 0-2 for ModR/M encoding.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Get bit 3 for the REX prefix.
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        (self as u8) >= 8
    }
}

impl HostReg for Xmm {
    #[inline(always)]
    fn encoding(self) -> u8 {
        self as u8
    }

    #[inline]
    fn from_encoding(enc: u8) -> Option<Xmm> {
        match enc {
            0 => Some(Xmm::Xmm0),
            1 => Some(Xmm::Xmm1),
            2 => Some(Xmm::Xmm2),
            3 => Some(Xmm::Xmm3),
            4 => Some(Xmm::Xmm4),
            5 => Some(Xmm::Xmm5),
            6 => Some(Xmm::Xmm6),
            7 => Some(Xmm::Xmm7),
            8 => Some(Xmm::Xmm8),
            9 => Some(Xmm::Xmm9),
            10 => Some(Xmm::Xmm10),
            11 => Some(Xmm::Xmm11),
            12 => Some(Xmm::Xmm12),
            13 => Some(Xmm::Xmm13),
            14 => Some(Xmm::Xmm14),
            15 => Some(Xmm::Xmm15),
            _ => None,
        }
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.encoding())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpr_encoding() {
        assert_eq!(Gpr::Rax.encoding(), 0);
        assert_eq!(Gpr::R8.encoding(), 8);
        assert_eq!(Gpr::R15.encoding(), 15);
        assert_eq!(Gpr::from_encoding(12), Some(Gpr::R12));
        assert_eq!(Gpr::from_encoding(16), None);
    }

    #[test]
    fn test_gpr_low_high_bits() {
        assert_eq!(Gpr::R8.low_bits(), 0);
        assert!(Gpr::R8.high_bit());
        assert_eq!(Gpr::R15.low_bits(), 7);
        assert!(!Gpr::Rdi.high_bit());
    }

    #[test]
    fn test_gpr_encoding_quirks() {
        assert!(Gpr::Rsp.needs_sib_as_base());
        assert!(Gpr::R12.needs_sib_as_base());
        assert!(Gpr::Rbp.needs_displacement());
        assert!(Gpr::R13.needs_displacement());
        assert!(!Gpr::Rax.needs_sib_as_base());
        assert!(!Gpr::Rax.needs_displacement());
    }

    #[test]
    fn test_xmm_encoding() {
        assert_eq!(Xmm::Xmm0.encoding(), 0);
        assert_eq!(Xmm::Xmm8.encoding(), 8);
        assert!(Xmm::Xmm8.high_bit());
        assert_eq!(Xmm::from_encoding(6), Some(Xmm::Xmm6));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Gpr::R12), "r12");
        assert_eq!(format!("{}", Xmm::Xmm10), "xmm10");
    }
}
