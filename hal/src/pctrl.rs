//! Physical register bank driver (PCTRL).
//!
//! A thin, volatile-access wrapper around one APLIC domain: the global
//! config/source/pending/enable/target page plus one per-hart IDC block.
//! Register offsets follow the packed layout of the physical device; see
//! the module-level constants below for the exact map.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Once;

use crate::error::{HalError, HalResult};

/// Highest legal source identity (source 0 is reserved for "no interrupt").
pub const MAX_SOURCES: usize = 1024;
/// Upper bound on the number of per-hart IDC blocks a single domain supports.
pub const MAX_HARTS: usize = 256;

const DOMAINCFG_OFFSET: usize = 0x0000;
const SOURCECFG_OFFSET: usize = 0x0004;
const SETIP_OFFSET: usize = 0x1C00;
const SETIPNUM_OFFSET: usize = 0x1CDC;
const IN_CLRIP_OFFSET: usize = 0x1D00;
const CLRIPNUM_OFFSET: usize = 0x1DDC;
const SETIE_OFFSET: usize = 0x1E00;
const SETIENUM_OFFSET: usize = 0x1EDC;
const CLRIE_OFFSET: usize = 0x1F00;
const CLRIENUM_OFFSET: usize = 0x1FDC;
const GENMSI_OFFSET: usize = 0x3000;
const TARGET_OFFSET: usize = 0x3004;

/// Offset of the per-hart IDC block array, relative to the domain base.
pub const IDC_BASE_OFFSET: usize = 0x4000;
/// Size in bytes of one per-hart IDC block.
pub const IDC_BLOCK_SIZE: usize = 32;

const IDC_IDELIVERY_OFFSET: usize = 0x00;
const IDC_IFORCE_OFFSET: usize = 0x04;
const IDC_ITHRESHOLD_OFFSET: usize = 0x08;
const IDC_TOPI_OFFSET: usize = 0x10;
const IDC_CLAIMI_OFFSET: usize = 0x14;

const DOMAINCFG_DM: u32 = 1 << 2;
const DOMAINCFG_IE: u32 = 1 << 8;
const DOMAINCFG_RO80: u32 = 0x80 << 24;

const TARGET_HART_SHIFT: u32 = 18;
const TARGET_HART_MASK: u32 = 0x3FFF;
const TARGET_GUEST_SHIFT: u32 = 12;
const TARGET_GUEST_MASK: u32 = 0x3F;
const TARGET_PRIO_MASK: u32 = 0xFF;
const TARGET_EVENT_MASK: u32 = 0x7FF;

const SOURCECFG_SM_MASK: u32 = 0x7;

/// A source's configuration mode, as seen by hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SourceMode {
    /// Source delivers nothing; pending/enable/target are meaningless.
    Inactive    = 0x0,
    /// Source is configured but its edge/level gateway is not virtualized.
    Detached    = 0x1,
    /// Rising-edge triggered.
    EdgeRising  = 0x4,
    /// Falling-edge triggered.
    EdgeFalling = 0x5,
    /// Level-high triggered.
    LevelHigh   = 0x6,
    /// Level-low triggered.
    LevelLow    = 0x7,
}

impl SourceMode {
    /// Decode a raw sourcecfg mode field, collapsing reserved codes (2, 3)
    /// to `Inactive` per the architectural intent.
    pub fn from_raw(bits: u32) -> Self {
        match bits & SOURCECFG_SM_MASK {
            0x0 => SourceMode::Inactive,
            0x1 => SourceMode::Detached,
            0x4 => SourceMode::EdgeRising,
            0x5 => SourceMode::EdgeFalling,
            0x6 => SourceMode::LevelHigh,
            0x7 => SourceMode::LevelLow,
            _ => SourceMode::Inactive,
        }
    }
}

/// Handle to one APLIC domain's physical register file.
///
/// `base` is the already-mapped virtual address of the global page; the
/// per-hart IDC blocks live at `base + IDC_BASE_OFFSET + hart * IDC_BLOCK_SIZE`.
#[derive(Debug, Clone, Copy)]
pub struct Pctrl {
    base: usize,
    source_count: usize,
    hart_count: usize,
}

static PCTRL: Once<Pctrl> = Once::new();

/// Statistics updated opportunistically; not load-bearing for correctness.
static CLAIMS_SERVICED: AtomicU32 = AtomicU32::new(0);

impl Pctrl {
    const fn new(base: usize, source_count: usize, hart_count: usize) -> Self {
        Self { base, source_count, hart_count }
    }

    /// Return the handle installed by [`init`].
    ///
    /// # Panics
    /// Panics if called before [`init`] — this is a program error, not a
    /// runtime condition guests can trigger.
    pub fn current() -> Self {
        *PCTRL.get().expect("pctrl: used before init()")
    }

    fn reg(&self, offset: usize) -> *mut u32 {
        (self.base + offset) as *mut u32
    }

    fn idc_offset(&self, hart: usize, offset: usize) -> usize {
        debug_assert!(hart < self.hart_count, "hart index out of range");
        IDC_BASE_OFFSET + hart * IDC_BLOCK_SIZE + offset
    }

    fn read(&self, offset: usize) -> u32 {
        let value = unsafe { core::ptr::read_volatile(self.reg(offset)) };
        log::trace!("pctrl: read 0x{offset:04x} = 0x{value:08x}");
        value
    }

    fn write(&self, offset: usize, value: u32) {
        log::trace!("pctrl: write 0x{offset:04x} = 0x{value:08x}");
        unsafe { core::ptr::write_volatile(self.reg(offset), value) }
    }

    // -- domaincfg ----------------------------------------------------

    /// Read the domain config word, OR'd with the read-only 0x80 field.
    pub fn get_domaincfg(&self) -> u32 {
        self.read(DOMAINCFG_OFFSET) | DOMAINCFG_RO80
    }

    /// Write the domain config word (enable + delivery-mode bits only).
    pub fn set_domaincfg(&self, ie: bool, msi_mode: bool) {
        let mut word = 0u32;
        if ie {
            word |= DOMAINCFG_IE;
        }
        if msi_mode {
            word |= DOMAINCFG_DM;
        }
        self.write(DOMAINCFG_OFFSET, word);
    }

    /// Whether the domain is currently in MSI-delivery mode.
    pub fn msi_mode(&self) -> bool {
        self.read(DOMAINCFG_OFFSET) & DOMAINCFG_DM != 0
    }

    // -- sourcecfg ------------------------------------------------------

    fn sourcecfg_addr(&self, id: usize) -> usize {
        debug_assert!(id > 0 && id < self.source_count, "source id out of range");
        SOURCECFG_OFFSET + (id - 1) * 4
    }

    /// Write a source's raw mode word, masking to the legal mode bits.
    pub fn set_source_mode(&self, id: usize, mode: SourceMode) {
        self.write(self.sourcecfg_addr(id), mode as u32 & SOURCECFG_SM_MASK);
    }

    /// Read back a source's mode as accepted by hardware.
    pub fn get_source_mode(&self, id: usize) -> SourceMode {
        SourceMode::from_raw(self.read(self.sourcecfg_addr(id)))
    }

    // -- pending ----------------------------------------------------------

    /// Set a single source pending via the "set pending by number" register.
    pub fn set_pending(&self, id: usize) {
        debug_assert!(id > 0 && id < self.source_count);
        self.write(SETIPNUM_OFFSET, id as u32);
    }

    /// Clear a single source pending via the "clear pending by number" register.
    pub fn clear_pending(&self, id: usize) {
        debug_assert!(id > 0 && id < self.source_count);
        self.write(CLRIPNUM_OFFSET, id as u32);
    }

    /// Read whether a single source is currently pending.
    pub fn pending(&self, id: usize) -> bool {
        debug_assert!(id > 0 && id < self.source_count);
        let word = id / 32;
        let bit = id % 32;
        (self.read(SETIP_OFFSET + word * 4) >> bit) & 1 != 0
    }

    /// Read the 32-bit pending word covering sources `[word*32 .. word*32+32)`.
    pub fn pending_mask(&self, word: usize) -> u32 {
        self.read(SETIP_OFFSET + word * 4)
    }

    /// Read the rectified-input mirror of a source's pending state.
    ///
    /// Two bao variants disagree on whether this reflects the rectified
    /// gateway input or the current pending mirror; this driver returns
    /// the current pending mirror (fixed choice, see DESIGN.md).
    pub fn in_clrip(&self, id: usize) -> bool {
        debug_assert!(id > 0 && id < self.source_count);
        let word = id / 32;
        let bit = id % 32;
        (self.read(IN_CLRIP_OFFSET + word * 4) >> bit) & 1 != 0
    }

    // -- enable -------------------------------------------------------------

    /// Enable a single source via the "set enable by number" register.
    pub fn set_enable(&self, id: usize) {
        debug_assert!(id > 0 && id < self.source_count);
        self.write(SETIENUM_OFFSET, id as u32);
    }

    /// Disable a single source via the "clear enable by number" register.
    pub fn clear_enable(&self, id: usize) {
        debug_assert!(id > 0 && id < self.source_count);
        self.write(CLRIENUM_OFFSET, id as u32);
    }

    /// Read whether a single source is currently enabled.
    pub fn enabled(&self, id: usize) -> bool {
        debug_assert!(id > 0 && id < self.source_count);
        let word = id / 32;
        let bit = id % 32;
        (self.read(SETIE_OFFSET + word * 4) >> bit) & 1 != 0
    }

    /// Read the 32-bit enable word covering sources `[word*32 .. word*32+32)`.
    pub fn enable_mask(&self, word: usize) -> u32 {
        self.read(SETIE_OFFSET + word * 4)
    }

    // -- target -------------------------------------------------------------

    fn target_addr(&self, id: usize) -> usize {
        debug_assert!(id > 0 && id < self.source_count);
        TARGET_OFFSET + (id - 1) * 4
    }

    /// Read a source's raw target word.
    pub fn get_target(&self, id: usize) -> u32 {
        self.read(self.target_addr(id))
    }

    /// Set the hart index field of a source's target word without
    /// disturbing the priority/event/guest fields.
    pub fn set_target_hart(&self, id: usize, hart: usize) {
        let addr = self.target_addr(id);
        let mut word = self.read(addr);
        word &= !(TARGET_HART_MASK << TARGET_HART_SHIFT);
        word |= (hart as u32 & TARGET_HART_MASK) << TARGET_HART_SHIFT;
        self.write(addr, word);
    }

    /// Set the priority field (direct mode only) of a source's target word.
    pub fn set_target_priority(&self, id: usize, prio: u8) {
        let addr = self.target_addr(id);
        let mut word = self.read(addr);
        word &= !TARGET_PRIO_MASK;
        word |= prio as u32 & TARGET_PRIO_MASK;
        self.write(addr, word);
    }

    /// Set the MSI event-ID field (MSI mode only) of a source's target word.
    pub fn set_target_event(&self, id: usize, event_id: u16) {
        let addr = self.target_addr(id);
        let mut word = self.read(addr);
        word &= !TARGET_EVENT_MASK;
        word |= event_id as u32 & TARGET_EVENT_MASK;
        self.write(addr, word);
    }

    /// Set the guest-file-index field (MSI mode only) of a source's target word.
    pub fn set_target_guest(&self, id: usize, guest: u8) {
        let addr = self.target_addr(id);
        let mut word = self.read(addr);
        word &= !(TARGET_GUEST_MASK << TARGET_GUEST_SHIFT);
        word |= (guest as u32 & TARGET_GUEST_MASK) << TARGET_GUEST_SHIFT;
        self.write(addr, word);
    }

    // -- per-hart IDC ---------------------------------------------------

    /// Initialize this hart's IDC block: threshold = 0 (allow all
    /// priorities), clear `iforce`, enable `ideliver`.
    pub fn cpu_init(&self, hart: usize) {
        self.write(self.idc_offset(hart, IDC_ITHRESHOLD_OFFSET), 0);
        self.set_force(hart, false);
        self.write(self.idc_offset(hart, IDC_IDELIVERY_OFFSET), 1);
    }

    /// Set or clear `iforce` for a hart (test/spurious-interrupt hook).
    pub fn set_force(&self, hart: usize, force: bool) {
        self.write(self.idc_offset(hart, IDC_IFORCE_OFFSET), force as u32);
    }

    /// Set the claim-priority threshold for a hart.
    pub fn set_threshold(&self, hart: usize, threshold: u8) {
        self.write(self.idc_offset(hart, IDC_ITHRESHOLD_OFFSET), threshold as u32);
    }

    /// Read the current `topi` snapshot without the claim side effect.
    pub fn topi(&self, hart: usize) -> u32 {
        self.read(self.idc_offset(hart, IDC_TOPI_OFFSET))
    }

    /// Atomically claim the highest-priority ready interrupt for `hart`.
    ///
    /// Returns the 10-bit source identity, or 0 if none is ready. Reading
    /// this register clears the corresponding source's pending bit.
    pub fn claim(&self, hart: usize) -> u32 {
        let raw = self.read(self.idc_offset(hart, IDC_CLAIMI_OFFSET));
        if raw != 0 {
            CLAIMS_SERVICED.fetch_add(1, Ordering::Relaxed);
        }
        raw >> 16
    }

    // -- generate-MSI (MSI mode only) ------------------------------------

    /// Write the `genmsi` register to request a domain-level MSI (e.g. for
    /// IPI-style hypervisor-generated events in MSI mode).
    pub fn generate_msi(&self, hart: usize, guest: u8) {
        let word = ((hart as u32) << TARGET_HART_SHIFT) | ((guest as u32) << TARGET_GUEST_SHIFT);
        self.write(GENMSI_OFFSET, word);
    }
}

/// Map the global domain and per-hart pages, zero the domain config and all
/// pending/enable words, install a default target for every configured
/// source, then re-enable delivery.
///
/// `virt_base` must already be mapped (the caller performs the external
/// `map_device` call and the memory fence before invoking this).
///
/// # Safety
/// The caller must ensure `virt_base` maps exactly one domain page followed
/// by `hart_count` IDC blocks, and that this function runs once, on the
/// master hart, before any other hart touches the device.
pub unsafe fn init(virt_base: usize, source_count: usize, hart_count: usize, msi_mode: bool) -> HalResult<()> {
    if source_count == 0 || source_count > MAX_SOURCES || hart_count == 0 || hart_count > MAX_HARTS {
        return Err(HalError::InvalidConfig);
    }

    let pctrl = Pctrl::new(virt_base, source_count, hart_count);
    pctrl.set_domaincfg(false, msi_mode);

    for word in 0..(source_count / 32 + 1) {
        pctrl.write(SETIE_OFFSET + word * 4, 0);
        pctrl.write(SETIP_OFFSET + word * 4, 0);
    }

    for id in 1..source_count {
        pctrl.set_source_mode(id, SourceMode::Inactive);
        if msi_mode {
            pctrl.set_target_event(id, id as u16);
        } else {
            pctrl.set_target_priority(id, 1);
        }
    }

    pctrl.set_domaincfg(true, msi_mode);
    PCTRL.call_once(|| pctrl);
    Ok(())
}

/// Return the installed [`Pctrl`] handle, or `NotInitialized` if [`init`]
/// has not yet run on this domain.
pub fn get() -> HalResult<Pctrl> {
    PCTRL.get().copied().ok_or(HalError::NotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_mode_collapses_reserved_codes() {
        assert_eq!(SourceMode::from_raw(2), SourceMode::Inactive);
        assert_eq!(SourceMode::from_raw(3), SourceMode::Inactive);
        assert_eq!(SourceMode::from_raw(4), SourceMode::EdgeRising);
        assert_eq!(SourceMode::from_raw(7), SourceMode::LevelLow);
    }

    #[test]
    fn source_mode_masks_extra_bits() {
        assert_eq!(SourceMode::from_raw(0x104), SourceMode::EdgeRising);
    }
}
