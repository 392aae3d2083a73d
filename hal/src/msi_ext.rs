//! Message-signalled extension driver (MSI-EXT).
//!
//! Models a per-hart IMSIC interrupt file: an enable/pending bitmap reached
//! through supervisor CSRs, plus a per-hart "set external interrupt number"
//! MMIO register that lets any hart inject an event into another hart's
//! file. Compiled in only when the platform delivers interrupts as
//! messages instead of wired signals (`mode ∈ {msi, dual}`).

use spin::{Mutex, Once};

use crate::error::{HalError, HalResult};

/// Largest legal MSI event identity (0 is reserved: "no interrupt").
pub const MAX_EVENTS: usize = 2048;
const WORDS: usize = MAX_EVENTS / 64;

const SETEIPNUM_OFFSET: usize = 0x00;

/// Handle to one hart's mapped interrupt-file page.
#[derive(Debug, Clone, Copy)]
pub struct MsiFile {
    base: usize,
    files_per_hart: usize,
    page_size: usize,
}

/// Sentinel stored in [`MsiExtState::bindings`] for an event with no
/// recorded physical source.
const UNBOUND: u16 = 0;

struct MsiExtState {
    file: MsiFile,
    reservations: Mutex<[u64; WORDS]>,
    /// `msi_id -> phys_source`, populated by [`bind`].
    bindings: Mutex<[u16; MAX_EVENTS]>,
}

static MSI_EXT: Once<MsiExtState> = Once::new();

impl MsiFile {
    fn file_base(&self, hart: usize) -> usize {
        self.base + hart * self.page_size * self.files_per_hart
    }

    fn seteipnum_addr(&self, hart: usize) -> *mut u32 {
        (self.file_base(hart) + SETEIPNUM_OFFSET) as *mut u32
    }

    /// Inject `event_id` into `target_hart`'s interrupt file.
    pub fn send_msi(&self, target_hart: usize, event_id: u16) {
        log::trace!("msi_ext: send event {event_id} to hart {target_hart}");
        unsafe { core::ptr::write_volatile(self.seteipnum_addr(target_hart), event_id as u32) };
    }

    /// Enable delivery of `event_id` for the calling hart (CSR read-modify-write).
    ///
    /// The CSR accesses themselves are an external collaborator
    /// (`core::platform::Csr`); this method is the policy that decides
    /// *which* bit to touch.
    pub fn enable(&self, csr: &dyn crate::csr::ImsicCsr, event_id: u16) {
        log::trace!("msi_ext: enable event {event_id}");
        let word = event_id as usize / 64;
        let bit = event_id as usize % 64;
        let current = csr.read_eie(word);
        csr.write_eie(word, current | (1 << bit));
    }

    /// Disable delivery of every vector for the calling hart.
    pub fn disable_all(&self, csr: &dyn crate::csr::ImsicCsr) {
        for word in 0..WORDS {
            csr.write_eie(word, 0);
        }
    }

    /// Clear the pending bit for `event_id` on the calling hart.
    pub fn clear_pending(&self, csr: &dyn crate::csr::ImsicCsr, event_id: u16) {
        let word = event_id as usize / 64;
        let bit = event_id as usize % 64;
        let current = csr.read_eip(word);
        csr.write_eip(word, current & !(1 << bit));
    }

    /// Read whether `event_id` is pending on the calling hart.
    pub fn pending(&self, csr: &dyn crate::csr::ImsicCsr, event_id: u16) -> bool {
        let word = event_id as usize / 64;
        let bit = event_id as usize % 64;
        (csr.read_eip(word) >> bit) & 1 != 0
    }

    /// Read the top-external-pending CSR; returns 0 if none. Writing 0 back
    /// clears the claimed vector.
    pub fn claim(&self, csr: &dyn crate::csr::ImsicCsr) -> u16 {
        let id = csr.read_topei();
        if id != 0 {
            log::trace!("msi_ext: claimed event {id}");
            csr.write_topei(0);
        }
        id
    }
}

/// Map this hart's interrupt file and bring delivery to a known state:
/// disable every vector, enable delivery, clear the enable-all threshold.
///
/// # Safety
/// Must run once per hart, after the MSI file page has been mapped.
pub unsafe fn init(base: usize, hart_id: usize, files_per_hart: usize, page_size: usize, csr: &dyn crate::csr::ImsicCsr) {
    let file = MsiFile { base, files_per_hart, page_size };
    file.disable_all(csr);
    csr.set_delivery(true);
    MSI_EXT.call_once(|| MsiExtState {
        file,
        reservations: Mutex::new([0u64; WORDS]),
        bindings: Mutex::new([UNBOUND; MAX_EVENTS]),
    });
}

/// Return the installed [`MsiFile`] handle.
pub fn get() -> HalResult<MsiFile> {
    MSI_EXT.get().map(|s| s.file).ok_or(HalError::NotInitialized)
}

/// Allocate the smallest free MSI event ID (>= 1).
pub fn reserve() -> HalResult<u16> {
    let state = MSI_EXT.get().ok_or(HalError::NotInitialized)?;
    let mut bitmap = state.reservations.lock();
    for (word_idx, word) in bitmap.iter_mut().enumerate() {
        if *word != u64::MAX {
            let bit = word.trailing_ones() as usize;
            let id = word_idx * 64 + bit;
            if id == 0 {
                *word |= 1; // skip reserved id 0 and retry this word
                continue;
            }
            if id >= MAX_EVENTS {
                break;
            }
            *word |= 1 << bit;
            return Ok(id as u16);
        }
    }
    Err(HalError::MsiExhausted)
}

/// Reserve a specific MSI event ID rather than letting [`reserve`] pick the
/// smallest free one, for callers with a platform-fixed event assignment.
pub fn reserve_msi(event_id: u16) -> HalResult<u16> {
    let state = MSI_EXT.get().ok_or(HalError::NotInitialized)?;
    if event_id == 0 || event_id as usize >= MAX_EVENTS {
        return Err(HalError::OutOfRange);
    }
    let mut bitmap = state.reservations.lock();
    let word = event_id as usize / 64;
    let bit = event_id as usize % 64;
    if bitmap[word] & (1 << bit) != 0 {
        return Err(HalError::InvalidConfig);
    }
    bitmap[word] |= 1 << bit;
    Ok(event_id)
}

/// Release a previously reserved event ID and forget any source it was
/// bound to.
pub fn release(event_id: u16) -> HalResult<()> {
    let state = MSI_EXT.get().ok_or(HalError::NotInitialized)?;
    let mut bitmap = state.reservations.lock();
    let word = event_id as usize / 64;
    let bit = event_id as usize % 64;
    bitmap[word] &= !(1 << bit);
    drop(bitmap);
    if (event_id as usize) < MAX_EVENTS {
        state.bindings.lock()[event_id as usize] = UNBOUND;
    }
    Ok(())
}

/// Associate a reserved MSI event with the physical interrupt source PCTRL
/// steers into it, so a later [`resolve`] can translate a claimed event back
/// to the source it represents.
pub fn bind(msi_id: u16, phys_source: usize) -> HalResult<()> {
    let state = MSI_EXT.get().ok_or(HalError::NotInitialized)?;
    if msi_id == 0 || msi_id as usize >= MAX_EVENTS {
        return Err(HalError::OutOfRange);
    }
    if phys_source == 0 || phys_source > u16::MAX as usize {
        return Err(HalError::OutOfRange);
    }
    log::debug!("msi_ext: bind event {msi_id} -> source {phys_source}");
    state.bindings.lock()[msi_id as usize] = phys_source as u16;
    Ok(())
}

/// Resolve a previously bound MSI event back to its physical source, or
/// `None` if `msi_id` is unbound.
pub fn resolve(msi_id: u16) -> HalResult<Option<usize>> {
    let state = MSI_EXT.get().ok_or(HalError::NotInitialized)?;
    if msi_id == 0 || msi_id as usize >= MAX_EVENTS {
        return Err(HalError::OutOfRange);
    }
    let source = state.bindings.lock()[msi_id as usize];
    Ok(if source == UNBOUND { None } else { Some(source as usize) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_base_scales_with_hart_index() {
        let f = MsiFile { base: 0x1000_0000, files_per_hart: 2, page_size: 0x1000 };
        assert_eq!(f.file_base(0), 0x1000_0000);
        assert_eq!(f.file_base(1), 0x1000_2000);
        assert_eq!(f.file_base(3), 0x1000_6000);
    }

    struct FakeCsr;
    impl crate::csr::ImsicCsr for FakeCsr {
        fn read_eie(&self, _word: usize) -> u64 {
            0
        }
        fn write_eie(&self, _word: usize, _value: u64) {}
        fn read_eip(&self, _word: usize) -> u64 {
            0
        }
        fn write_eip(&self, _word: usize, _value: u64) {}
        fn read_topei(&self) -> u16 {
            0
        }
        fn write_topei(&self, _value: u16) {}
        fn set_delivery(&self, _enabled: bool) {}
    }

    #[test]
    fn bind_resolve_round_trip() {
        let csr = FakeCsr;
        unsafe { init(0x2000_0000, 0, 1, 0x1000, &csr) };
        let event = reserve().unwrap();
        bind(event, 42).unwrap();
        assert_eq!(resolve(event).unwrap(), Some(42));
        release(event).unwrap();
        assert_eq!(resolve(event).unwrap(), None);
    }

    #[test]
    fn reserve_msi_rejects_an_id_already_taken() {
        let csr = FakeCsr;
        unsafe { init(0x2000_0000, 0, 1, 0x1000, &csr) };
        let id = reserve_msi(500).unwrap();
        assert_eq!(id, 500);
        assert!(matches!(reserve_msi(500), Err(HalError::InvalidConfig)));
        release(500).unwrap();
    }
}
