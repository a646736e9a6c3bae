//! # Kernel Memory Configuration and Boot Interface
//!
//! This crate is the single source of truth for the memory subsystem's
//! layout constants and tunables, and for the boot memory map handed over
//! by the loader.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! * **Page geometry**: page size and entries per table
//! * **Higher half**: the direct-map (HHDM) fallback offset and the first
//!   root-table index shared by all address spaces
//! * **Paging policy**: swap slot count, resident-page ceiling and the
//!   synthetic victim sequence
//! * **Runtime configuration**: [`MemoryConfig`](memory::MemoryConfig)
//!
//! ### Boot Memory Map ([`boot`])
//! * `(base, length, kind)` regions; only usable ones seed the frame allocator
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐  PML4[0..256]
//!                       │         User Space              │  per address space
//! LAST_USERSPACE_ADDRESS├─────────────────────────────────┤ 0x0000_7fff_ffff_ffff
//!                       │   non-canonical hole            │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │   Higher Half Direct Mapping    │  PML4[256..512]
//!                       │   Kernel text & data            │  shared by value
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All layout values are `const` and checked by compile-time assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
