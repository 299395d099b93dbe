//! # Trap Adapters
//!
//! Thin translations from the architectural fault state to a
//! [`FaultContext`]. The assembly entry stubs read the registers and call one
//! of these with the raw values; nothing here touches hardware.
//!
//! | Architecture | Cause | Address |
//! |:-------------|:------|:--------|
//! | x86-64 | `#PF` error code | `CR2` |
//! | arm64 | `ESR_EL1` | `FAR_EL1` |
//! | riscv64 | `scause` | `stval` |

use crate::fault::{Access, FaultContext};
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl PageFaultErrorCode {
    #[must_use]
    pub const fn access(&self) -> Access {
        if self.instruction_fetch() {
            Access::Execute
        } else if self.write() {
            Access::Write
        } else {
            Access::Read
        }
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped yet)"
        } else if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// Build a fault context from a `#PF` error code and `CR2`.
#[must_use]
pub const fn x86_64_fault(error_code: u64, cr2: u64) -> FaultContext {
    let code = PageFaultErrorCode::from_bits(error_code);
    FaultContext {
        vaddr: VirtualAddress::new(cr2),
        access: code.access(),
        present: code.present(),
    }
}

/// `ESR_EL1` layout for data and instruction aborts.
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct EsrEl1 {
    /// Fault status code (DFSC / IFSC).
    #[bits(6)]
    pub fsc: u8,
    /// Write not Read (data aborts only).
    pub wnr: bool,
    #[bits(18)]
    __: u32,
    /// Instruction length.
    pub il: bool,
    /// Exception class.
    #[bits(6)]
    pub ec: u8,
    #[bits(32)]
    __: u32,
}

impl EsrEl1 {
    /// Instruction abort from a lower exception level.
    pub const EC_IABT_LOWER: u8 = 0x20;
    /// Instruction abort taken without a change in exception level.
    pub const EC_IABT_CURRENT: u8 = 0x21;
    /// Data abort from a lower exception level.
    pub const EC_DABT_LOWER: u8 = 0x24;
    /// Data abort taken without a change in exception level.
    pub const EC_DABT_CURRENT: u8 = 0x25;

    /// Whether the status code reports a permission fault (`0b0011LL`).
    #[must_use]
    pub const fn is_permission_fault(&self) -> bool {
        self.fsc() & 0b11_1100 == 0b00_1100
    }
}

/// Build a fault context from `ESR_EL1` and `FAR_EL1`.
///
/// Returns `None` if the exception is not an instruction or data abort.
#[must_use]
pub const fn aarch64_fault(esr: u64, far: u64) -> Option<FaultContext> {
    let esr = EsrEl1::from_bits(esr);
    let access = match esr.ec() {
        EsrEl1::EC_IABT_LOWER | EsrEl1::EC_IABT_CURRENT => Access::Execute,
        EsrEl1::EC_DABT_LOWER | EsrEl1::EC_DABT_CURRENT => {
            if esr.wnr() {
                Access::Write
            } else {
                Access::Read
            }
        }
        _ => return None,
    };
    Some(FaultContext {
        vaddr: VirtualAddress::new(far),
        access,
        present: esr.is_permission_fault(),
    })
}

/// `scause` value of an instruction page fault.
pub const SCAUSE_INSTRUCTION_PAGE_FAULT: u64 = 12;
/// `scause` value of a load page fault.
pub const SCAUSE_LOAD_PAGE_FAULT: u64 = 13;
/// `scause` value of a store/AMO page fault.
pub const SCAUSE_STORE_PAGE_FAULT: u64 = 15;

/// Build a fault context from `scause` and `stval`.
///
/// riscv does not tell invalid from forbidden, so the context is always
/// reported as not present; the handler walks the table to find out.
/// Returns `None` for causes other than page faults.
#[must_use]
pub const fn riscv64_fault(scause: u64, stval: u64) -> Option<FaultContext> {
    let access = match scause {
        SCAUSE_INSTRUCTION_PAGE_FAULT => Access::Execute,
        SCAUSE_LOAD_PAGE_FAULT => Access::Read,
        SCAUSE_STORE_PAGE_FAULT => Access::Write,
        _ => return None,
    };
    Some(FaultContext::new(VirtualAddress::new(stval), access))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_error_codes() {
        let ctx = x86_64_fault(0b00010, 0xdead_b000);
        assert_eq!(ctx.access, Access::Write);
        assert!(!ctx.present);
        assert_eq!(ctx.vaddr.as_u64(), 0xdead_b000);

        let ctx = x86_64_fault(0b10101, 0x1000);
        assert_eq!(ctx.access, Access::Execute);
        assert!(ctx.present);

        assert_eq!(x86_64_fault(0, 0).access, Access::Read);
    }

    #[test]
    fn x86_explanations() {
        let code = PageFaultErrorCode::new().with_present(true).with_write(true);
        assert_eq!(code.explain(), "Write access to protected page");
        assert_eq!(
            PageFaultErrorCode::new().explain(),
            "Non-present page (page not mapped yet)"
        );
    }

    #[test]
    fn arm64_aborts() {
        // Data abort, current EL, write, translation fault level 3.
        let esr = EsrEl1::new()
            .with_ec(EsrEl1::EC_DABT_CURRENT)
            .with_wnr(true)
            .with_fsc(0b00_0111);
        let ctx = aarch64_fault(esr.into_bits(), 0x4000).unwrap();
        assert_eq!(ctx.access, Access::Write);
        assert!(!ctx.present);

        // Instruction abort, permission fault level 3.
        let esr = EsrEl1::new()
            .with_ec(EsrEl1::EC_IABT_LOWER)
            .with_fsc(0b00_1111);
        let ctx = aarch64_fault(esr.into_bits(), 0x5000).unwrap();
        assert_eq!(ctx.access, Access::Execute);
        assert!(ctx.present);

        // SVC is not an abort.
        let svc = EsrEl1::new().with_ec(0x15);
        assert!(aarch64_fault(svc.into_bits(), 0).is_none());
    }

    #[test]
    fn arm64_field_positions() {
        let esr = EsrEl1::from_bits((0x25 << 26) | (1 << 6) | 0b00_0111);
        assert_eq!(esr.ec(), 0x25);
        assert!(esr.wnr());
        assert_eq!(esr.fsc(), 0b00_0111);
    }

    #[test]
    fn riscv_causes() {
        assert_eq!(
            riscv64_fault(SCAUSE_STORE_PAGE_FAULT, 0x8000).map(|c| c.access),
            Some(Access::Write)
        );
        assert_eq!(
            riscv64_fault(SCAUSE_LOAD_PAGE_FAULT, 0x8000).map(|c| c.present),
            Some(false)
        );
        assert_eq!(
            riscv64_fault(SCAUSE_INSTRUCTION_PAGE_FAULT, 0).map(|c| c.access),
            Some(Access::Execute)
        );
        assert!(riscv64_fault(2, 0).is_none());
    }
}
