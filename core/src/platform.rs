//! Trait boundary to the collaborators this crate depends on but does not
//! own: VM/vCPU lifecycle, address-space mapping, the MMIO-trap dispatcher,
//! and the upper interrupt dispatcher. Everything in here is implemented by
//! the surrounding hypervisor, not by this crate.

/// Opaque handle to a VM, owned and interpreted by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(pub usize);

/// A virtual hart index, 0-based, scoped to one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VhartId(pub usize);

/// A physical hart index, global to the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhartId(pub usize);

/// Outcome of handing a claimed identity to the upper interrupt dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// The hypervisor fully serviced the interrupt; PCTRL/MSI-EXT should
    /// be re-acknowledged without forwarding anything to a guest.
    pub handled_by_hyp: bool,
    /// The identity was (or will be) delivered to a guest.
    pub passed_to_guest: bool,
}

/// A virtual register field targeted by an emulated MMIO access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegAccess {
    /// Byte offset within the emulated region.
    pub offset: usize,
    /// Access width in bytes (4, per the architectural register width).
    pub width: usize,
    /// `true` for a guest read, `false` for a guest write.
    pub is_read: bool,
    /// Value carried by a write access; ignored for reads.
    pub write_value: u32,
}

/// Everything VCTRL and LINE need from the surrounding hypervisor.
///
/// Implementations own the VM/vCPU objects; this crate only ever holds a
/// [`VmId`]/[`VhartId`] and asks the platform to resolve or mutate state on
/// its behalf, per the "no owning pointer back into the VM" redesign note.
pub trait Platform {
    /// Map `n_pages` starting at `phys` into the hypervisor's own address
    /// space and return the virtual base.
    ///
    /// # Safety
    /// `phys` must be a valid, exclusively-owned device range.
    unsafe fn map_device(&self, phys: usize, n_pages: usize) -> usize;

    /// Register an emulated memory-mapped region so that guest accesses to
    /// `[va_base, va_base + size)` are delivered back to this crate's
    /// domain/IDC handlers instead of faulting.
    fn add_emulated_region(&self, vm: VmId, va_base: usize, size: usize, handler_tag: u32);

    /// Translate a VM-relative vhart index to the physical hart currently
    /// hosting it, or `None` if the index is out of range for this VM.
    fn translate_to_pcpu(&self, vm: VmId, vhart: VhartId) -> Option<PhartId>;

    /// Inverse of [`Platform::translate_to_pcpu`]: which vhart of `vm` (if
    /// any) the given physical hart is currently hosting.
    fn translate_to_vhart(&self, vm: VmId, phart: PhartId) -> Option<VhartId>;

    /// Hand a claimed identity to the hypervisor's upper dispatcher.
    fn interrupts_handle(&self, id: u32) -> DispatchOutcome;

    /// Read a vCPU general register, for servicing an emulated access whose
    /// value comes from guest register state (not used by the register
    /// classes in this subsystem directly, but required by the trap
    /// dispatcher's calling convention).
    fn vcpu_readreg(&self, vm: VmId, vhart: VhartId, reg: u32) -> u64;

    /// Write a vCPU general register.
    fn vcpu_writereg(&self, vm: VmId, vhart: VhartId, reg: u32, value: u64);

    /// Assert or de-assert the guest-visible external-interrupt line on the
    /// physical hart currently running `vhart` of `vm` (the hvip-equivalent
    /// bit LINE computes).
    fn set_external_pending(&self, vm: VmId, vhart: VhartId, pending: bool);

    /// Platform-firmware supervisor-software-interrupt IPI, used by IRQC in
    /// wired mode to wake a remote hart (e.g. an SBI `sbi_send_ipi` call).
    fn firmware_send_ipi(&self, target: PhartId);

    /// The physical hart executing this call, resolved at the entry point
    /// of interrupt-mode code rather than fetched through an ambient
    /// global getter.
    fn current_phart(&self) -> Option<PhartId>;

    /// Memory fence ensuring prior stores are visible before any MMIO
    /// access; required once after mapping the controller pages.
    fn fence_sync(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}
