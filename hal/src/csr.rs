//! Supervisor CSR access trait.
//!
//! The IMSIC interrupt file is reached through `siselect`/`sireg`-style
//! indirect CSR windows rather than MMIO. The exact CSR sequence is a
//! platform/architecture concern outside this crate's scope; callers
//! supply an implementation of [`ImsicCsr`] bound to the running hart.

/// Indirect CSR access to one hart's IMSIC interrupt file.
pub trait ImsicCsr {
    /// Read 64 bits of the enable (`eie`) bitmap at word index `word`.
    fn read_eie(&self, word: usize) -> u64;
    /// Write 64 bits of the enable (`eie`) bitmap at word index `word`.
    fn write_eie(&self, word: usize, value: u64);
    /// Read 64 bits of the pending (`eip`) bitmap at word index `word`.
    fn read_eip(&self, word: usize) -> u64;
    /// Write 64 bits of the pending (`eip`) bitmap at word index `word`.
    fn write_eip(&self, word: usize, value: u64);
    /// Read the top-external-pending-interrupt CSR.
    fn read_topei(&self) -> u16;
    /// Write the top-external-pending-interrupt CSR (0 clears the claim).
    fn write_topei(&self, value: u16);
    /// Enable or disable external-interrupt delivery for this hart.
    fn set_delivery(&self, enabled: bool);
}
