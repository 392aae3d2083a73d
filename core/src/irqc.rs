//! Controller facade (IRQC).
//!
//! Single entry point the rest of the hypervisor calls instead of reaching
//! into PCTRL or MSI-EXT directly. Which physical mechanism actually moves
//! bits is a build-time choice captured by [`Mode`]; everything above this
//! module only ever sees virtual interrupt identities.

use alloc::collections::BTreeMap;

use spin::{Mutex, Once};

use irqc_hal::pctrl::SourceMode;

use crate::error::{IrqcError, IrqcResult};
use crate::platform::{PhartId, Platform};
use crate::vctrl::VctrlVm;

/// Highest source identity routed straight through PCTRL.
pub const N_WIRE_MAX: u32 = 1023;
/// Virtual-ID offset at which MSI event identities begin.
pub const MSI_BASE: u32 = 1024;
/// Reserved identity for the software (IPI) interrupt.
pub const SOFT_INT_ID: u32 = 2048;
/// Reserved identity for the timer interrupt.
pub const TIMR_INT_ID: u32 = 2049;

/// Priority PCTRL reserves for hypervisor-owned wired sources (highest,
/// i.e. numerically smallest non-zero value).
const HYP_RESERVED_PRIORITY: u8 = 1;

/// Which virtual-ID range an identity falls into.
enum Route {
    Wire(usize),
    Msi(u16),
    Soft,
    Timer,
    OutOfRange,
}

fn route(id: u32) -> Route {
    if id == SOFT_INT_ID {
        Route::Soft
    } else if id == TIMR_INT_ID {
        Route::Timer
    } else if id >= MSI_BASE {
        Route::Msi((id - MSI_BASE) as u16)
    } else if id > 0 && id <= N_WIRE_MAX {
        Route::Wire(id as usize)
    } else {
        Route::OutOfRange
    }
}

/// Which physical mechanism this boot selected.
///
/// `Legacy` reuses the same PCTRL primitives as `Wired`: this crate does
/// not model the true PLIC register layout (no IDC blocks, no per-hart
/// claim array) since, for the operations this facade exposes, claim and
/// enable over a single global page behave the same either way. See
/// DESIGN.md for the tradeoff this simplification makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Direct/wired mode: PCTRL delivers to a hart's own IDC block.
    Wired,
    /// MSI mode: PCTRL steers sources into MSI-EXT event files.
    Msi,
    /// Legacy wired-only controller, no delegation/IDC features used.
    Legacy,
}

static MODE: Once<Mode> = Once::new();
static MSI_BINDINGS: Mutex<BTreeMap<usize, u16>> = Mutex::new(BTreeMap::new());

fn mode() -> IrqcResult<Mode> {
    MODE.get().copied().ok_or(IrqcError::HalNotReady)
}

/// Global, once-per-boot init: bring up PCTRL and record which [`Mode`]
/// this boot selected. MSI-EXT, if selected, is brought up per-hart by
/// [`init_cpu`] since the interrupt file is hart-local.
///
/// # Safety
/// See [`irqc_hal::pctrl::init`]; must run once, before any other hart
/// touches the controller.
pub unsafe fn init_global(domain_base: usize, source_count: usize, hart_count: usize, selected: Mode) -> IrqcResult<()> {
    unsafe { irqc_hal::pctrl::init(domain_base, source_count, hart_count, selected == Mode::Msi)? };
    MODE.call_once(|| selected);
    Ok(())
}

/// Per-hart init: bring PCTRL's IDC block to a known state, and in `msi`
/// builds running in [`Mode::Msi`], map and reset this hart's interrupt
/// file.
#[cfg_attr(not(feature = "msi"), allow(unused_variables))]
pub unsafe fn init_cpu(
    hart: usize,
    imsic_base: usize,
    files_per_hart: usize,
    page_size: usize,
    csr: Option<&dyn irqc_hal::csr::ImsicCsr>,
) -> IrqcResult<()> {
    let pctrl = irqc_hal::pctrl::get()?;
    pctrl.cpu_init(hart);

    #[cfg(feature = "msi")]
    if mode()? == Mode::Msi {
        let csr = csr.ok_or_else(|| {
            log::error!("irqc: init_cpu on hart {hart} in msi mode with no CSR handle");
            IrqcError::InvalidConfig
        })?;
        unsafe { irqc_hal::msi_ext::init(imsic_base, hart, files_per_hart, page_size, csr) };
    }
    #[cfg(not(feature = "msi"))]
    let _ = csr;

    Ok(())
}

/// Send an inter-processor interrupt. In wired/legacy mode this is a
/// platform firmware IPI; in MSI mode it is a message-signalled write into
/// the target hart's interrupt file.
pub fn send_ipi(platform: &dyn Platform, target: PhartId, ipi_id: u32) -> IrqcResult<()> {
    match mode()? {
        Mode::Msi => {
            #[cfg(feature = "msi")]
            {
                let file = irqc_hal::msi_ext::get()?;
                file.send_msi(target.0, (ipi_id - MSI_BASE) as u16);
                return Ok(());
            }
            #[cfg(not(feature = "msi"))]
            {
                let _ = ipi_id;
                platform.firmware_send_ipi(target);
                Ok(())
            }
        },
        Mode::Wired | Mode::Legacy => {
            platform.firmware_send_ipi(target);
            Ok(())
        },
    }
}

/// Configure (or tear down) delivery of wired identity `id` to the calling
/// hart. `hart` is threaded explicitly rather than fetched from an ambient
/// global, per this crate's no-owning-global convention.
pub fn config(id: usize, enable: bool, hart: usize, csr: Option<&dyn irqc_hal::csr::ImsicCsr>) -> IrqcResult<()> {
    let pctrl = irqc_hal::pctrl::get()?;
    let m = mode()?;

    if enable {
        pctrl.set_source_mode(id, SourceMode::EdgeRising);
        pctrl.set_target_hart(id, hart);

        if m == Mode::Msi {
            #[cfg(feature = "msi")]
            {
                let event = match irqc_hal::msi_ext::reserve() {
                    Ok(event) => event,
                    Err(e) => {
                        log::error!("irqc: MSI event space exhausted configuring source {id}");
                        return Err(e.into());
                    },
                };
                irqc_hal::msi_ext::bind(event, id)?;
                MSI_BINDINGS.lock().insert(id, event);
                if let Some(csr) = csr {
                    let file = irqc_hal::msi_ext::get()?;
                    file.enable(csr, event);
                }
                pctrl.set_target_event(id, event);
                pctrl.set_target_guest(id, 0);
                pctrl.set_enable(id);
                return Ok(());
            }
            #[cfg(not(feature = "msi"))]
            unreachable!("Mode::Msi requires the msi feature");
        }

        let _ = csr;
        pctrl.set_target_priority(id, HYP_RESERVED_PRIORITY);
        pctrl.set_enable(id);
    } else {
        pctrl.clear_enable(id);

        if m == Mode::Msi {
            #[cfg(feature = "msi")]
            if let Some(event) = MSI_BINDINGS.lock().remove(&id) {
                let _ = irqc_hal::msi_ext::release(event);
            }
        }

        pctrl.set_source_mode(id, SourceMode::Inactive);
    }
    Ok(())
}

/// Drain every ready identity for the calling hart, handing each to the
/// upper dispatcher, re-acknowledging any it claims for itself.
pub fn handle(platform: &dyn Platform, hart: usize, csr: Option<&dyn irqc_hal::csr::ImsicCsr>) -> IrqcResult<()> {
    let m = mode()?;

    loop {
        let id: u32 = match m {
            Mode::Wired | Mode::Legacy => irqc_hal::pctrl::get()?.claim(hart),
            Mode::Msi => {
                #[cfg(feature = "msi")]
                {
                    let Some(csr) = csr else { break };
                    irqc_hal::msi_ext::get()?.claim(csr) as u32
                }
                #[cfg(not(feature = "msi"))]
                {
                    let _ = csr;
                    break;
                }
            },
        };
        if id == 0 {
            break;
        }

        let outcome = platform.interrupts_handle(id);
        if outcome.handled_by_hyp {
            // Claim already dropped the pending bit; nothing further to do.
            continue;
        }
    }
    Ok(())
}

/// Whether wired identity `id` is currently pending.
pub fn pending(id: u32) -> IrqcResult<bool> {
    match route(id) {
        Route::Wire(id) => Ok(irqc_hal::pctrl::get()?.pending(id)),
        _ => Ok(false),
    }
}

/// Clear a pending wired identity outright (used by reset/teardown paths,
/// not the ordinary claim flow).
pub fn clear(id: u32) -> IrqcResult<()> {
    if let Route::Wire(id) = route(id) {
        irqc_hal::pctrl::get()?.clear_pending(id);
    }
    Ok(())
}

/// Mark `id` hardware-bound for `vm`'s VCTRL shadow, so subsequent guest
/// writes to that source mirror to PCTRL.
pub fn bind_vm_hw(vm: &VctrlVm, id: usize) -> IrqcResult<()> {
    let _ = mode()?;
    vm.bind_hw(id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_classifies_ranges() {
        assert!(matches!(route(1), Route::Wire(1)));
        assert!(matches!(route(N_WIRE_MAX), Route::Wire(n) if n as u32 == N_WIRE_MAX));
        assert!(matches!(route(MSI_BASE), Route::Msi(0)));
        assert!(matches!(route(SOFT_INT_ID), Route::Soft));
        assert!(matches!(route(TIMR_INT_ID), Route::Timer));
        assert!(matches!(route(0), Route::OutOfRange));
    }
}
