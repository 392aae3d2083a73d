//! # irqc-hal
//!
//! Physical register drivers for the RISC-V Advanced Interrupt Architecture:
//! the APLIC-style direct-delivery register bank ([`pctrl`]) and, when the
//! `msi` feature is enabled, the IMSIC-style message-signalled extension
//! ([`msi_ext`]).
//!
//! This crate only wraps volatile MMIO/CSR access and the bookkeeping that
//! hardware itself defines (bitmaps, target words, claim registers). Policy
//! — which source gets bound to which vhart, shadow-state emulation, and
//! cross-CPU delivery — lives one layer up in `irqc-core`.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod csr;
pub mod error;
pub mod pctrl;

#[cfg(feature = "msi")]
pub mod msi_ext;

pub use error::{HalError, HalResult};
