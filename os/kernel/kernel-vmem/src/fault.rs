//! # Page-Fault Error Code
//!
//! The CPU pushes a 32-bit error code with every page fault (`#PF`, vector 14).
//! Only the low five bits carry information on i386.

use bitfield_struct::bitfield;
use core::fmt;

/// Decoded `#PF` error code.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    /// Bit 0: `1`: protection violation on a present page; `0`: page not present.
    pub protection_violation: bool,

    /// Bit 1: the access was a write.
    pub write: bool,

    /// Bit 2: the access came from user mode (CPL 3).
    pub user: bool,

    /// Bit 3: a reserved bit was set in a paging entry.
    pub reserved_bit: bool,

    /// Bit 4: the access was an instruction fetch.
    pub instruction_fetch: bool,

    #[bits(27)]
    __: u32,
}

impl fmt::Display for PageFaultErrorCode {
    /// Renders the flag list of the fault banner, e.g.
    /// `non_present_page action=write kernel-mode`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.protection_violation() {
            "protection_violation"
        } else {
            "non_present_page"
        })?;
        f.write_str(if self.write() {
            " action=write"
        } else {
            " action=read"
        })?;
        f.write_str(if self.user() {
            " user-mode"
        } else {
            " kernel-mode"
        })?;
        if self.reserved_bit() {
            f.write_str(" reserved_bits_trampled")?;
        }
        if self.instruction_fetch() {
            f.write_str(" int_fetch")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_low_bits() {
        let code = PageFaultErrorCode::from_bits(0b1_0110);
        assert!(!code.protection_violation());
        assert!(code.write());
        assert!(code.user());
        assert!(!code.reserved_bit());
        assert!(code.instruction_fetch());
    }

    #[test]
    fn ignores_high_bits() {
        let code = PageFaultErrorCode::from_bits(0xFFFF_FFE1);
        assert!(code.protection_violation());
        assert!(!code.write());
    }

    #[test]
    fn banner_flags() {
        let code = PageFaultErrorCode::from_bits(0b0010);
        assert_eq!(code.to_string(), "non_present_page action=write kernel-mode");

        let code = PageFaultErrorCode::from_bits(0b1_1101);
        assert_eq!(
            code.to_string(),
            "protection_violation action=read user-mode reserved_bits_trampled int_fetch"
        );
    }
}
