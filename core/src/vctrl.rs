//! Virtual interrupt controller (VCTRL).
//!
//! Gives each VM the illusion of owning a controller identical in register
//! layout to the physical one. Guest accesses land in [`domain_access`] /
//! [`idc_access`], which update the per-VM shadow under [`VctrlVm::shadow`]
//! and, for hardware-bound sources, mirror the write to the physical
//! register bank before calling back into [`crate::line`].

use alloc::vec::Vec;

use spin::Mutex;

use irqc_hal::pctrl::{Pctrl, SourceMode};

use crate::line;
use crate::platform::{Platform, RegAccess, VhartId, VmId};

/// Tag handed to `add_emulated_region` for the domain page.
pub const DOMAIN_HANDLER_TAG: u32 = 1;
/// Tag handed to `add_emulated_region` for the IDC pages.
pub const IDC_HANDLER_TAG: u32 = 2;

pub(crate) mod regs {
    pub const DOMAINCFG: usize = 0x0000;
    pub const SOURCECFG: usize = 0x0004;
    pub const SETIP: usize = 0x1C00;
    pub const SETIPNUM: usize = 0x1CDC;
    pub const IN_CLRIP: usize = 0x1D00;
    pub const CLRIPNUM: usize = 0x1DDC;
    pub const SETIE: usize = 0x1E00;
    pub const SETIENUM: usize = 0x1EDC;
    pub const CLRIE: usize = 0x1F00;
    pub const CLRIENUM: usize = 0x1FDC;
    pub const TARGET: usize = 0x3004;

    pub const IDC_IDELIVERY: usize = 0x00;
    pub const IDC_IFORCE: usize = 0x04;
    pub const IDC_ITHRESHOLD: usize = 0x08;
    pub const IDC_TOPI: usize = 0x10;
    pub const IDC_CLAIMI: usize = 0x14;

    pub const DOMAINCFG_IE: u32 = 1 << 8;
    pub const DOMAINCFG_DM: u32 = 1 << 2;
    pub const DOMAINCFG_RO80: u32 = 0x80 << 24;

    pub const SOURCECFG_DELEGATE: u32 = 1 << 10;
    pub const SOURCECFG_SM_MASK: u32 = 0x7;

    pub const TARGET_HART_SHIFT: u32 = 18;
    pub const TARGET_HART_MASK: u32 = 0x3FFF;
    pub const TARGET_GUEST_SHIFT: u32 = 12;
    pub const TARGET_GUEST_MASK: u32 = 0x3F;
    pub const TARGET_PRIO_MASK: u32 = 0xFF;
    pub const TARGET_EVENT_MASK: u32 = 0x7FF;
}

/// A source's target, as seen by the guest: always a *virtual* hart index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Target {
    /// Virtual hart index this source is routed to.
    pub vhart: u32,
    /// Direct-mode priority (meaningless in MSI mode).
    pub priority: u8,
    /// MSI-mode event ID (meaningless in direct mode).
    pub event: u16,
    /// MSI-mode guest-file index.
    pub guest: u8,
}

impl Target {
    fn decode(word: u32) -> Self {
        Self {
            vhart: (word >> regs::TARGET_HART_SHIFT) & regs::TARGET_HART_MASK,
            priority: (word & regs::TARGET_PRIO_MASK) as u8,
            event: (word & regs::TARGET_EVENT_MASK) as u16,
            guest: ((word >> regs::TARGET_GUEST_SHIFT) & regs::TARGET_GUEST_MASK) as u8,
        }
    }

    fn encode(&self) -> u32 {
        ((self.vhart & regs::TARGET_HART_MASK) << regs::TARGET_HART_SHIFT)
            | (((self.guest as u32) & regs::TARGET_GUEST_MASK) << regs::TARGET_GUEST_SHIFT)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Source {
    mode: Option<SourceMode>, // None == Inactive, mirrors hal::pctrl::SourceMode otherwise
    ip: bool,
    ie: bool,
    active: bool,
    hw: bool,
    target: Target,
}

#[derive(Debug, Clone, Copy, Default)]
struct VhartState {
    ideliver: bool,
    iforce: bool,
    ithreshold: u8,
    topi_claimi: u32,
}

/// Per-VM shadow register file, serialised by [`VctrlVm`]'s exclusive lock.
pub struct VmShadow {
    sources: Vec<Source>, // index 0 unused, len == source_count
    vharts: Vec<VhartState>,
    domaincfg_ie: bool,
    msi_mode: bool,
    hypervisor_reserved_priority: u8,
}

impl VmShadow {
    fn new(source_count: usize, vhart_count: usize, msi_mode: bool, hypervisor_reserved_priority: u8) -> Self {
        Self {
            sources: alloc::vec![Source::default(); source_count],
            vharts: alloc::vec![VhartState::default(); vhart_count],
            domaincfg_ie: true,
            msi_mode,
            hypervisor_reserved_priority,
        }
    }

    /// Read-only view used by [`crate::line`] to scan candidates.
    pub(crate) fn source_targets_enabled_pending(&self) -> impl Iterator<Item = (usize, &Target, u8)> + '_ {
        self.sources.iter().enumerate().filter(|(_, s)| s.ip && s.ie).map(|(i, s)| {
            let prio = if self.msi_mode { 0 } else { s.target.priority };
            (i, &s.target, prio)
        })
    }

    pub(crate) fn vhart(&self, vhart: VhartId) -> VhartState {
        self.vharts[vhart.0]
    }

    pub(crate) fn domaincfg_enabled(&self) -> bool {
        self.domaincfg_ie
    }

    pub(crate) fn set_topi_claimi(&mut self, vhart: VhartId, value: u32) {
        self.vharts[vhart.0].topi_claimi = value;
    }
}

/// One VM's VCTRL state: identity, shadow, and the static sizing the VM was
/// created with.
pub struct VctrlVm {
    pub id: VmId,
    pub source_count: usize,
    pub vhart_count: usize,
    shadow: Mutex<VmShadow>,
}

impl VctrlVm {
    /// `init(vm, platform_desc)`: size the shadow and register the two
    /// emulated regions (domain page + one IDC page per configured vCPU)
    /// with the MMIO-trap dispatcher.
    pub fn init(
        id: VmId,
        platform: &dyn Platform,
        source_count: usize,
        vhart_count: usize,
        domain_va: usize,
        idc_va: usize,
        msi_mode: bool,
        hypervisor_reserved_priority: u8,
    ) -> Self {
        platform.add_emulated_region(id, domain_va, 0x4000, DOMAIN_HANDLER_TAG);
        platform.add_emulated_region(id, idc_va, vhart_count * 32, IDC_HANDLER_TAG);
        Self {
            id,
            source_count,
            vhart_count,
            shadow: Mutex::new(VmShadow::new(source_count, vhart_count, msi_mode, hypervisor_reserved_priority)),
        }
    }

    /// Mark `id` as hardware-bound: subsequent guest writes mirror to PCTRL.
    pub fn bind_hw(&self, id: usize) {
        let mut shadow = self.shadow.lock();
        shadow.sources[id].hw = true;
    }

    /// Inject a pending interrupt into the shadow and recompute the line,
    /// as the hypervisor would for a purely-virtual (non guest-initiated)
    /// event, e.g. when a physical source it owns fires.
    pub fn inject(&self, platform: &dyn Platform, pctrl: Option<&Pctrl>, id: usize) {
        let target_vhart;
        {
            let mut shadow = self.shadow.lock();
            let source = &mut shadow.sources[id];
            if !source.active || source.ip {
                return;
            }
            source.ip = true;
            target_vhart = VhartId(source.target.vhart as usize);
        }
        let _ = pctrl;
        line::update_single(self, platform, target_vhart);
    }

    pub(crate) fn with_shadow<R>(&self, f: impl FnOnce(&mut VmShadow) -> R) -> R {
        f(&mut self.shadow.lock())
    }
}

fn pend(shadow: &mut VmShadow, pctrl: Option<&Pctrl>, id: usize) -> Option<VhartId> {
    if id == 0 || id >= shadow.sources.len() || !shadow.sources[id].active {
        return None;
    }
    let source = &mut shadow.sources[id];
    if source.hw {
        if let Some(p) = pctrl {
            p.set_pending(id);
            source.ip = p.pending(id);
        }
    } else {
        source.ip = true;
    }
    Some(VhartId(source.target.vhart as usize))
}

fn unpend(shadow: &mut VmShadow, pctrl: Option<&Pctrl>, id: usize) -> Option<VhartId> {
    if id == 0 || id >= shadow.sources.len() {
        return None;
    }
    let source = &mut shadow.sources[id];
    if source.hw {
        if let Some(p) = pctrl {
            p.clear_pending(id);
            source.ip = p.pending(id);
        }
    } else {
        source.ip = false;
    }
    Some(VhartId(source.target.vhart as usize))
}

fn set_enable(shadow: &mut VmShadow, pctrl: Option<&Pctrl>, id: usize, en: bool) -> Option<VhartId> {
    if id == 0 || id >= shadow.sources.len() || !shadow.sources[id].active {
        return None;
    }
    let source = &mut shadow.sources[id];
    source.ie = en;
    if source.hw {
        if let Some(p) = pctrl {
            if en {
                p.set_enable(id);
            } else {
                p.clear_enable(id);
            }
        }
    }
    Some(VhartId(source.target.vhart as usize))
}

fn apply_sourcecfg_write(shadow: &mut VmShadow, pctrl: Option<&Pctrl>, id: usize, raw: u32) -> VhartId {
    let source = &mut shadow.sources[id];
    let old_vhart = VhartId(source.target.vhart as usize);

    let sanitized = if raw & regs::SOURCECFG_DELEGATE != 0 {
        None
    } else {
        let mode = SourceMode::from_raw(raw & regs::SOURCECFG_SM_MASK);
        Some(match mode {
            SourceMode::LevelHigh => {
                log::warn!("vctrl: source {id} level-high sourcecfg coerced to edge-rising");
                SourceMode::EdgeRising
            },
            SourceMode::LevelLow => {
                log::warn!("vctrl: source {id} level-low sourcecfg coerced to edge-falling");
                SourceMode::EdgeFalling
            },
            other => other,
        })
    };

    // Hardware-bound sources always mirror the sanitized value to PCTRL and
    // read back what it accepted, whichever branch (delegate or coerced
    // mode) produced it — an unmirrored delegate leaves the physical source
    // raising interrupts the shadow believes are inactive.
    if source.hw {
        if let Some(p) = pctrl {
            p.set_source_mode(id, sanitized.unwrap_or(SourceMode::Inactive));
            source.mode = match p.get_source_mode(id) {
                SourceMode::Inactive => None,
                m => Some(m),
            };
        } else {
            source.mode = sanitized;
        }
    } else {
        source.mode = sanitized;
    }

    match source.mode {
        None => {
            log::debug!("vctrl: source {id} deactivated");
            source.active = false;
            source.ip = false;
            source.ie = false;
            source.target = Target::default();
        },
        Some(_) => {
            log::debug!("vctrl: source {id} activated");
            source.active = true;
        },
    }

    old_vhart
}

/// Service a guest access to the domain page (`domaincfg`, `sourcecfg[]`,
/// pending/enable bitmaps, `target[]`). Returns the value a read should
/// yield; ignored for writes.
pub fn domain_access(vm: &VctrlVm, platform: &dyn Platform, pctrl: Option<&Pctrl>, access: RegAccess) -> u32 {
    if access.offset == regs::DOMAINCFG {
        return vm.with_shadow(|shadow| {
            if access.is_read {
                let mut word = if shadow.domaincfg_ie { regs::DOMAINCFG_IE } else { 0 };
                if shadow.msi_mode {
                    word |= regs::DOMAINCFG_DM;
                }
                word | regs::DOMAINCFG_RO80
            } else {
                shadow.domaincfg_ie = access.write_value & regs::DOMAINCFG_IE != 0;
                0
            }
        });
    }

    if access.offset >= regs::SOURCECFG && access.offset < regs::SETIP {
        let id = (access.offset - regs::SOURCECFG) / 4 + 1;
        if access.is_read {
            return vm.with_shadow(|shadow| {
                if id >= shadow.sources.len() {
                    return 0;
                }
                match shadow.sources[id].mode {
                    None => 0,
                    Some(m) => m as u32,
                }
            });
        }
        let old_vhart = vm.with_shadow(|shadow| {
            if id >= shadow.sources.len() {
                return None;
            }
            Some(apply_sourcecfg_write(shadow, pctrl, id, access.write_value))
        });
        if let Some(vhart) = old_vhart {
            line::update_single(vm, platform, vhart);
        }
        return 0;
    }

    if access.offset == regs::SETIPNUM {
        if !access.is_read {
            let id = access.write_value as usize;
            let target = vm.with_shadow(|shadow| pend(shadow, pctrl, id));
            if let Some(vhart) = target {
                line::update_single(vm, platform, vhart);
            }
        }
        return 0;
    }

    if access.offset == regs::CLRIPNUM {
        if !access.is_read {
            let id = access.write_value as usize;
            let target = vm.with_shadow(|shadow| unpend(shadow, pctrl, id));
            if let Some(vhart) = target {
                line::update_single(vm, platform, vhart);
            }
        }
        return 0;
    }

    if access.offset == regs::SETIENUM {
        if !access.is_read {
            let id = access.write_value as usize;
            let target = vm.with_shadow(|shadow| set_enable(shadow, pctrl, id, true));
            if let Some(vhart) = target {
                line::update_single(vm, platform, vhart);
            }
        }
        return 0;
    }

    if access.offset == regs::CLRIENUM {
        if !access.is_read {
            let id = access.write_value as usize;
            let target = vm.with_shadow(|shadow| set_enable(shadow, pctrl, id, false));
            if let Some(vhart) = target {
                line::update_single(vm, platform, vhart);
            }
        }
        return 0;
    }

    if access.offset >= regs::SETIP && access.offset < regs::SETIPNUM {
        let word = (access.offset - regs::SETIP) / 4;
        return vm.with_shadow(|shadow| read_bitmap_word(shadow, word, |s| s.ip));
    }

    if access.offset >= regs::IN_CLRIP && access.offset < regs::CLRIPNUM {
        let word = (access.offset - regs::IN_CLRIP) / 4;
        // Fixed choice for the ambiguous source behavior: return the
        // current pending mirror, not the rectified gateway input.
        return vm.with_shadow(|shadow| read_bitmap_word(shadow, word, |s| s.ip));
    }

    if access.offset >= regs::SETIE && access.offset < regs::SETIENUM {
        let word = (access.offset - regs::SETIE) / 4;
        return vm.with_shadow(|shadow| read_bitmap_word(shadow, word, |s| s.ie));
    }

    if access.offset >= regs::TARGET {
        let id = (access.offset - regs::TARGET) / 4 + 1;
        if access.is_read {
            return vm.with_shadow(|shadow| {
                if id >= shadow.sources.len() { 0 } else { shadow.sources[id].target.encode() }
            });
        }
        let result = vm.with_shadow(|shadow| {
            if id >= shadow.sources.len() {
                return None;
            }
            Some(apply_target_write_bound(vm.id, platform, shadow, pctrl, id, access.write_value))
        });
        if let Some((old_vhart, new_vhart)) = result {
            line::update_single(vm, platform, old_vhart);
            if new_vhart != old_vhart {
                line::update_single(vm, platform, new_vhart);
            }
        }
        return 0;
    }

    0
}

fn read_bitmap_word(shadow: &VmShadow, word: usize, pick: impl Fn(&Source) -> bool) -> u32 {
    let base = word * 32;
    let mut out = 0u32;
    for bit in 0..32 {
        let id = base + bit;
        if id != 0 && id < shadow.sources.len() && pick(&shadow.sources[id]) {
            out |= 1 << bit;
        }
    }
    out
}

fn apply_target_write_bound(
    vm_id: VmId,
    platform: &dyn Platform,
    shadow: &mut VmShadow,
    pctrl: Option<&Pctrl>,
    id: usize,
    raw: u32,
) -> (VhartId, VhartId) {
    let mut decoded = Target::decode(raw);

    if platform.translate_to_pcpu(vm_id, VhartId(decoded.vhart as usize)).is_none() {
        decoded.vhart = 0;
    }

    if shadow.msi_mode {
        decoded.event &= regs::TARGET_EVENT_MASK as u16;
        decoded.guest = 1;
    } else if decoded.priority == 0 {
        decoded.priority = 1;
    }

    let source = &mut shadow.sources[id];
    let old_vhart = VhartId(source.target.vhart as usize);
    source.target = decoded;
    let new_vhart = VhartId(decoded.vhart as usize);

    if source.hw {
        if let (Some(p), Some(phart)) = (pctrl, platform.translate_to_pcpu(vm_id, new_vhart)) {
            p.set_target_hart(id, phart.0);
            if shadow.msi_mode {
                p.set_target_event(id, decoded.event);
                p.set_target_guest(id, decoded.guest);
            } else {
                p.set_target_priority(id, decoded.priority);
            }
        }
    }

    (old_vhart, new_vhart)
}

/// Service a guest access to one vhart's IDC page (`idelivery`, `iforce`,
/// `ithreshold`, `topi`, `claimi`).
pub fn idc_access(vm: &VctrlVm, platform: &dyn Platform, pctrl: Option<&Pctrl>, vhart: VhartId, access: RegAccess) -> u32 {
    match access.offset {
        regs::IDC_IDELIVERY => {
            if access.is_read {
                vm.with_shadow(|s| s.vharts[vhart.0].ideliver as u32)
            } else {
                vm.with_shadow(|s| s.vharts[vhart.0].ideliver = access.write_value != 0);
                line::update_single(vm, platform, vhart);
                0
            }
        },
        regs::IDC_IFORCE => {
            if access.is_read {
                vm.with_shadow(|s| s.vharts[vhart.0].iforce as u32)
            } else {
                vm.with_shadow(|s| s.vharts[vhart.0].iforce = access.write_value != 0);
                line::update_single(vm, platform, vhart);
                0
            }
        },
        regs::IDC_ITHRESHOLD => {
            if access.is_read {
                vm.with_shadow(|s| s.vharts[vhart.0].ithreshold as u32)
            } else {
                vm.with_shadow(|s| s.vharts[vhart.0].ithreshold = access.write_value as u8);
                line::update_single(vm, platform, vhart);
                0
            }
        },
        regs::IDC_TOPI => vm.with_shadow(|s| s.vharts[vhart.0].topi_claimi),
        regs::IDC_CLAIMI => claim(vm, platform, pctrl, vhart),
        _ => 0,
    }
}

fn claim(vm: &VctrlVm, platform: &dyn Platform, pctrl: Option<&Pctrl>, vhart: VhartId) -> u32 {
    let (value, id, hw) = vm.with_shadow(|shadow| {
        let value = shadow.vharts[vhart.0].topi_claimi;
        let id = (value >> 16) as usize;
        let mut hw = false;
        if id != 0 && id < shadow.sources.len() {
            shadow.sources[id].ip = false;
            hw = shadow.sources[id].hw;
        }
        (value, id, hw)
    });

    // Only a hardware-bound source's claim corresponds to a real physical
    // candidate; `Pctrl::claim` takes no id and claims whatever this hart's
    // own highest-priority physical source is, which is unrelated to a
    // purely-virtual source just claimed in the shadow.
    if id != 0 && hw {
        if let (Some(p), Some(phart)) = (pctrl, platform.translate_to_pcpu(vm.id, vhart)) {
            p.claim(phart.0);
        }
    }

    line::update_single(vm, platform, vhart);
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPlatform;
    impl Platform for NoopPlatform {
        unsafe fn map_device(&self, _phys: usize, _n_pages: usize) -> usize {
            0
        }
        fn add_emulated_region(&self, _vm: VmId, _va_base: usize, _size: usize, _tag: u32) {}
        fn translate_to_pcpu(&self, _vm: VmId, vhart: VhartId) -> Option<crate::platform::PhartId> {
            Some(crate::platform::PhartId(vhart.0))
        }
        fn translate_to_vhart(&self, _vm: VmId, phart: crate::platform::PhartId) -> Option<VhartId> {
            Some(VhartId(phart.0))
        }
        fn interrupts_handle(&self, _id: u32) -> crate::platform::DispatchOutcome {
            crate::platform::DispatchOutcome { handled_by_hyp: false, passed_to_guest: true }
        }
        fn vcpu_readreg(&self, _vm: VmId, _vhart: VhartId, _reg: u32) -> u64 {
            0
        }
        fn vcpu_writereg(&self, _vm: VmId, _vhart: VhartId, _reg: u32, _value: u64) {}
        fn set_external_pending(&self, _vm: VmId, _vhart: VhartId, _pending: bool) {}
        fn firmware_send_ipi(&self, _target: crate::platform::PhartId) {}
        fn current_phart(&self) -> Option<crate::platform::PhartId> {
            Some(crate::platform::PhartId(0))
        }
    }

    fn source_word(offset_from_sourcecfg_base: usize) -> usize {
        regs::SOURCECFG + offset_from_sourcecfg_base * 4
    }

    #[test]
    fn inactive_wipe_clears_ip_ie_target() {
        let platform = NoopPlatform;
        let vm = VctrlVm::init(VmId(0), &platform, 16, 4, 0x1000, 0x2000, false, 1);

        domain_access(&vm, &platform, None, RegAccess { offset: source_word(8), width: 4, is_read: false, write_value: 0x4 });
        domain_access(&vm, &platform, None, RegAccess { offset: regs::TARGET + 8 * 4, width: 4, is_read: false, write_value: 1 << regs::TARGET_HART_SHIFT | 1 });
        domain_access(&vm, &platform, None, RegAccess { offset: regs::SETIENUM, width: 4, is_read: false, write_value: 9 });
        domain_access(&vm, &platform, None, RegAccess { offset: regs::SETIPNUM, width: 4, is_read: false, write_value: 9 });

        domain_access(&vm, &platform, None, RegAccess { offset: source_word(8), width: 4, is_read: false, write_value: 0 });

        vm.with_shadow(|shadow| {
            assert!(!shadow.sources[9].ip);
            assert!(!shadow.sources[9].ie);
            assert!(!shadow.sources[9].active);
            assert_eq!(shadow.sources[9].target, Target::default());
        });
    }

    #[test]
    fn claim_reads_zero_after_first_read() {
        let platform = NoopPlatform;
        let vm = VctrlVm::init(VmId(0), &platform, 16, 4, 0x1000, 0x2000, false, 1);

        domain_access(&vm, &platform, None, RegAccess { offset: source_word(6), width: 4, is_read: false, write_value: 0x4 });
        domain_access(&vm, &platform, None, RegAccess { offset: regs::TARGET + 6 * 4, width: 4, is_read: false, write_value: (0u32 << regs::TARGET_HART_SHIFT) | 2 });
        domain_access(&vm, &platform, None, RegAccess { offset: regs::SETIENUM, width: 4, is_read: false, write_value: 7 });
        domain_access(&vm, &platform, None, RegAccess { offset: regs::SETIPNUM, width: 4, is_read: false, write_value: 7 });

        let first = idc_access(&vm, &platform, None, VhartId(0), RegAccess { offset: regs::IDC_CLAIMI, width: 4, is_read: true, write_value: 0 });
        assert_eq!(first, (7 << 16) | 2);

        let second = idc_access(&vm, &platform, None, VhartId(0), RegAccess { offset: regs::IDC_CLAIMI, width: 4, is_read: true, write_value: 0 });
        assert_eq!(second, 0);
    }
}
