//! # irqc-core
//!
//! Policy layer of the interrupt virtualization subsystem: the controller
//! facade ([`irqc`]), the per-VM virtual interrupt controller ([`vctrl`]),
//! and cross-CPU line dispatch ([`line`]). Physical register access lives
//! one layer down in `irqc-hal`; this crate owns shadow state, emulation
//! semantics, and the cross-hart message bus ([`msg`]) LINE uses to forward
//! a recompute request to whichever hart is actually running a vhart.
//!
//! Collaborators this crate depends on but does not own — VM/vCPU
//! lifecycle, address-space mapping, the MMIO-trap dispatcher, and the
//! upper interrupt dispatcher — are modeled by the [`platform::Platform`]
//! trait, implemented by the surrounding hypervisor.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod error;
pub mod irqc;
pub mod line;
pub mod msg;
pub mod platform;
pub mod vctrl;

pub use error::{IrqcError, IrqcResult};
pub use platform::{DispatchOutcome, Platform, PhartId, RegAccess, VhartId, VmId};
