//! Shared result and error types for the controller facade, VCTRL and LINE.

/// Result type used throughout this crate.
pub type IrqcResult<T> = Result<T, IrqcError>;

/// Errors raised by the controller facade, VCTRL and LINE.
///
/// Guest-initiated mistakes (out-of-range identities, bad hart indices) are
/// not represented here — those are sanitised in place per the emulation
/// rules rather than surfaced as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqcError {
    /// A required build-time option was missing or contradictory
    /// (no base address, overlapping ranges, too many harts).
    InvalidConfig,
    /// The MSI reservation bitmap has no free event IDs left.
    MsiExhausted,
    /// A VM attempted to register MMIO regions before another VM
    /// subsystem dependency was ready, or a lookup found no such VM.
    NotFound,
    /// The underlying physical driver has not been initialized.
    HalNotReady,
}

impl From<irqc_hal::HalError> for IrqcError {
    fn from(e: irqc_hal::HalError) -> Self {
        match e {
            irqc_hal::HalError::NotInitialized => IrqcError::HalNotReady,
            irqc_hal::HalError::InvalidConfig => IrqcError::InvalidConfig,
            irqc_hal::HalError::OutOfRange => IrqcError::InvalidConfig,
            irqc_hal::HalError::MsiExhausted => IrqcError::MsiExhausted,
        }
    }
}
