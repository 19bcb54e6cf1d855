//! Interrupt controller virtualization.
//!
//! The controller variant is probed once at enable time and used through the
//! [`IrqChip`] trait object afterwards. The functions of this module hold the
//! variant-independent parts: the physical interrupt loop, pending-queue
//! injection and guest SGI routing.

use alloc::boxed::Box;
use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};

use crate::addr::HostPhysAddr;
use crate::cell::Cell;
use crate::config::{MemoryRegion, PlatformConfig};
use crate::consts::{SGI_CPU_OFF, SGI_INJECT};
use crate::hal::HvHal;
use crate::mmio::{AccessWidth, MmioAccess, MmioResult};
use crate::percpu::{CpuMask, PerCpu, PerCpuTable};
use crate::stats::CpuStat;

mod gic_common;
mod gic_v2;
mod gic_v3;
pub mod pending;

pub use gic_v2::GicV2;
pub use gic_v3::GicV3;
use pending::PendingIrq;

/// First interrupt id reported for a spurious acknowledge.
pub const SPURIOUS_IRQ: u32 = 1020;
/// Interrupt id field of an acknowledge value.
pub const IAR_IRQ_MASK: u32 = 0x3ff;

/// Architecture version of the interrupt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GicVersion {
    V2 = 2,
    V3 = 3,
}

/// A physical software-generated interrupt to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sgi {
    /// Logical CPU ids.
    pub targets: CpuMask,
    pub id: u32,
}

/// Target selection of a guest-issued SGI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgiRouting {
    /// The CPUs whose target encoding is set in the target list.
    List,
    /// Every CPU of the cell except the sender.
    AllButSelf,
    /// Only the sender.
    SelfOnly,
}

/// An SGI the guest asked for, with targets in the controller's guest-visible
/// encoding (interface bits on v2, affinity-0 bits on v3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSgi {
    pub routing: SgiRouting,
    pub targets: u64,
    pub id: u32,
}

/// Reasons a list register could not take an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectError {
    /// All list registers are occupied.
    Busy,
    /// The interrupt is already in a list register.
    Duplicate,
}

/// The CPU and cell an interrupt controller access is made on behalf of.
pub struct IrqContext<'a> {
    pub cpu: &'a PerCpu,
    pub cell: &'a Cell,
    pub cpus: &'a PerCpuTable,
}

/// Operations every interrupt controller variant provides.
///
/// Methods without a CPU parameter act on the calling physical CPU.
pub trait IrqChip: Send + Sync {
    fn version(&self) -> GicVersion;

    /// One-time global initialization, run before any CPU enters.
    fn init(&self) -> AxResult;

    /// Takes over the CPU interface of the calling CPU.
    fn cpu_init(&self, cpu: &PerCpu) -> AxResult;

    /// Clears the virtual interface state of the calling CPU. With
    /// `root_shutdown`, the physical interface is handed back to the host.
    fn cpu_reset(&self, cpu: &PerCpu, root_shutdown: bool);

    /// Routes the lines of `cell` to its first CPU.
    fn cell_init(&self, cell: &Cell);

    /// Disables the lines of a dying cell and routes them to `root`.
    fn cell_exit(&self, cell: &Cell, root: &Cell);

    /// Extra stage-2 mappings every cell gets.
    fn cell_regions(&self) -> Vec<MemoryRegion>;

    /// Register frames the hypervisor maps for itself.
    fn device_regions(&self) -> Vec<MemoryRegion>;

    /// Whether `[start, start + size)` touches a frame that must trap.
    fn overlaps_trapped(&self, start: HostPhysAddr, size: usize) -> bool;

    fn send_sgi(&self, sgi: &Sgi);

    /// Acknowledges the highest priority pending interrupt and returns the raw
    /// acknowledge value.
    fn acknowledge(&self) -> u32;

    /// Places `irq` into a free list register of the calling CPU.
    fn inject_irq(&self, cpu: &PerCpu, irq: &PendingIrq) -> Result<(), InjectError>;

    /// Drops the running priority of an acknowledged interrupt, and
    /// deactivates it when `deactivate` is set.
    fn eoi_irq(&self, raw: u32, deactivate: bool);

    /// Requests a maintenance interrupt once list registers become free.
    fn enable_underflow(&self);

    fn clear_underflow(&self);

    fn maintenance_irq(&self) -> u32;

    /// The guest-visible target encoding of logical CPU `cpu`.
    fn target_mask(&self, cpu: usize) -> u64;

    /// Emulates a trapped access to a controller frame.
    fn mmio_access(&self, ctx: &IrqContext, access: &mut MmioAccess) -> MmioResult;
}

const PIDR2_ARCH_SHIFT: u32 = 4;
const AMBA_CIDR: u32 = 0xb105_f00d;

/// Offsets of the component id registers in a v2 (4 KiB) and a v3 (64 KiB)
/// distributor frame.
const ID_BLOCKS: [(usize, usize); 2] = [(0x0ff0, 0x0fe8), (0xfff0, 0xffe8)];

/// Reads the component id of the distributor and selects the variant.
pub fn probe<H: HvHal>(platform: &PlatformConfig) -> AxResult<Box<dyn IrqChip>> {
    let base = platform.gicd_base.as_usize();
    let read_id = |offset: usize| {
        (0..4).fold(0u32, |id, i| {
            let byte = H::mmio_read(HostPhysAddr::from(base + offset + 4 * i), AccessWidth::Dword);
            id | ((byte as u32 & 0xff) << (8 * i))
        })
    };

    let arch = ID_BLOCKS.iter().find_map(|&(cidr, pidr2)| {
        (read_id(cidr) == AMBA_CIDR).then(|| {
            let pidr2 = H::mmio_read(HostPhysAddr::from(base + pidr2), AccessWidth::Dword);
            (pidr2 >> PIDR2_ARCH_SHIFT) & 0xf
        })
    });
    let (version, arch) = match arch {
        Some(arch @ (1 | 2)) => (GicVersion::V2, arch),
        Some(arch @ (3 | 4)) => (GicVersion::V3, arch),
        Some(arch) => {
            warn!("unsupported GIC architecture revision {}", arch);
            return ax_err!(NotFound, "no supported interrupt controller");
        }
        None => return ax_err!(NotFound, "no interrupt controller at the distributor base"),
    };
    if platform.gic_version.is_some_and(|hint| hint != version) {
        return ax_err!(InvalidInput, "interrupt controller version does not match the platform");
    }
    info!("GIC: {:?} (architecture revision {})", version, arch);

    Ok(match version {
        GicVersion::V2 => Box::new(GicV2::<H>::new(platform)),
        GicVersion::V3 => Box::new(GicV3::<H>::new(platform, arch == 4)),
    })
}

/// Moves as many queued interrupts of the calling CPU as possible into list
/// registers. Arms the underflow notification if some stay queued.
pub fn inject_pending(chip: &dyn IrqChip, cpu: &PerCpu) {
    let mut queue = cpu.pending.lock();
    let mut busy = false;
    queue.drain_ordered(|irq| match chip.inject_irq(cpu, irq) {
        Ok(()) => true,
        Err(InjectError::Duplicate) => {
            trace!("IRQ {} already in a list register", irq.virt_id);
            true
        }
        Err(InjectError::Busy) => {
            busy = true;
            false
        }
    });
    if busy {
        chip.enable_underflow();
    }
}

/// Queues `irq` for `target`. Returns `false` if its queue is full.
fn queue_irq(target: &PerCpu, irq: PendingIrq) -> bool {
    match target.pending.lock().insert(irq) {
        Ok(_) => true,
        Err(_) => {
            warn!("CPU {}: pending queue full, IRQ {} dropped", target.id(), irq.virt_id);
            false
        }
    }
}

/// Drains the physical interrupts of the calling CPU.
///
/// Returns `true` if another CPU asked this CPU to park.
pub fn handle_irq(chip: &dyn IrqChip, ctx: &IrqContext) -> bool {
    let cpu = ctx.cpu;
    let mut park = false;
    loop {
        let raw = chip.acknowledge();
        let irq = raw & IAR_IRQ_MASK;
        if irq >= SPURIOUS_IRQ {
            break;
        }

        if irq == SGI_INJECT {
            chip.eoi_irq(raw, true);
            inject_pending(chip, cpu);
        } else if irq == SGI_CPU_OFF {
            cpu.stats().inc(CpuStat::VmexitsManagement);
            chip.eoi_irq(raw, true);
            park = true;
        } else if irq == chip.maintenance_irq() {
            cpu.stats().inc(CpuStat::VmexitsMaintenance);
            chip.clear_underflow();
            chip.eoi_irq(raw, true);
            inject_pending(chip, cpu);
        } else {
            cpu.stats().inc(CpuStat::VmexitsVirq);
            // The guest's EOI deactivates hardware-backed interrupts.
            let queued = queue_irq(cpu, PendingIrq::hw(irq));
            chip.eoi_irq(raw, !queued);
            inject_pending(chip, cpu);
        }
    }
    park
}

/// Delivers an SGI a guest issued to the CPUs of its own cell.
pub fn handle_guest_sgi(chip: &dyn IrqChip, ctx: &IrqContext, sgi: &GuestSgi) {
    let this = ctx.cpu.id();
    ctx.cpu.stats().inc(CpuStat::VmexitsVsgi);

    let mut local = false;
    let mut remote = CpuMask::empty();
    for target in ctx.cpus.select(ctx.cell.cpu_set()) {
        let cpu = target.id();
        let selected = match sgi.routing {
            SgiRouting::List => sgi.targets & chip.target_mask(cpu) != 0,
            SgiRouting::AllButSelf => cpu != this,
            SgiRouting::SelfOnly => cpu == this,
        };
        if !selected || !queue_irq(target, PendingIrq::sgi(sgi.id, this)) {
            continue;
        }
        if cpu == this {
            local = true;
        } else {
            remote.insert(cpu);
        }
    }

    if local {
        inject_pending(chip, ctx.cpu);
    }
    if !remote.is_empty() {
        chip.send_sgi(&Sgi {
            targets: remote,
            id: SGI_INJECT,
        });
    }
}

/// Decodes a guest write to `ICC_SGI1R_EL1`.
///
/// Only affinity level 0 is modelled: the cell's CPUs are expected to sit in
/// one cluster, with affinity 0 equal to the logical CPU id.
pub fn decode_sgi1r(value: u64) -> GuestSgi {
    const IRM: u64 = 1 << 40;
    let routing = if value & IRM != 0 {
        SgiRouting::AllButSelf
    } else {
        SgiRouting::List
    };
    GuestSgi {
        routing,
        targets: value & 0xffff,
        id: ((value >> 24) & 0xf) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_sgi1r() {
        let sgi = decode_sgi1r((3 << 24) | 0b0110);
        assert_eq!(
            sgi,
            GuestSgi {
                routing: SgiRouting::List,
                targets: 0b0110,
                id: 3
            }
        );
        let sgi = decode_sgi1r((1 << 40) | (15 << 24));
        assert_eq!(sgi.routing, SgiRouting::AllButSelf);
        assert_eq!(sgi.id, 15);
    }
}
