//! # Memory Subsystem Configuration and Boot Interface
//!
//! This crate is the single source of truth for the constants that shape the
//! virtual-memory subsystem, and for the data structures platform bring-up
//! hands over to it.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! Compile-time configuration of the address-space layout:
//! * **VMA Window**: where the VMA manager places mappings without a fixed address
//! * **Direct Map**: the offset at which all physical memory is reachable
//! * **Stacks**: guard-page counts and default stack size
//!
//! ### Boot Information ([`boot`])
//! The platform-to-kernel handoff of physical memory:
//! * **Memory Regions**: `#[repr(C)]` descriptors of free RAM, the kernel image,
//!   the initrd, reserved firmware ranges and device windows
//! * **Region Flags**: permission and "already mapped" hints as a bitfield
//!
//! ## Virtual Memory Layout
//!
//! The layout fits inside the lower half of a 39-bit address space, so the
//! same constants are valid for x86-64 (48-bit), arm64 (48-bit) and riscv64
//! Sv39 (39-bit) without per-architecture branching:
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Boot identity maps / unused   │
//! DEFAULT_VMA_BASE      ├─────────────────────────────────┤ 0x0000_0010_0000_0000
//!                       │                                 │
//!                       │   VMA window (first-fit area)   │
//!                       │                                 │
//! DEFAULT_VMA_END       ├─────────────────────────────────┤ 0x0000_0040_0000_0000
//!                       │   Unused lower half             │
//!                       └─────────────────────────────────┘
//!
//! HHDM_BASE (upper half, sign-extended; architecture specific)
//! ```
//!
//! ## Configuration Management
//!
//! All layout values are `const` and checked with compile-time assertions,
//! so an inconsistent configuration fails the build instead of the boot.
//! Runtime overrides are expressed by the VMA manager's own configuration
//! struct, which defaults to these values.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
