//! Error types returned by the physical register drivers.

/// Errors raised by [`crate::pctrl`] and [`crate::msi_ext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The driver was used before [`crate::pctrl::init`] completed.
    NotInitialized,
    /// A configuration value was out of the range the platform allows.
    InvalidConfig,
    /// A source/hart/event identity fell outside the configured bounds.
    OutOfRange,
    /// The MSI reservation bitmap has no free event IDs left.
    MsiExhausted,
}

/// Result type used throughout the HAL.
pub type HalResult<T> = Result<T, HalError>;
