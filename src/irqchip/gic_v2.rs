use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use axerrno::{ax_err, AxResult};

use super::gic_common::*;
use super::pending::{IrqSource, PendingIrq};
use super::{handle_guest_sgi, GicVersion, GuestSgi, InjectError, IrqChip, IrqContext, Sgi, SgiRouting};
use crate::addr::HostPhysAddr;
use crate::cell::Cell;
use crate::config::{MemFlags, MemoryRegion, PlatformConfig};
use crate::consts::{FIRST_SPI, MAX_CPUS, SGI_CPU_OFF, SGI_INJECT};
use crate::hal::HvHal;
use crate::mmio::{AccessWidth, MmioAccess, MmioResult};
use crate::percpu::PerCpu;

const GICD_SIZE: usize = 0x1000;
const GICC_SIZE: usize = 0x2000;
const GICH_SIZE: usize = 0x2000;

const GICC_CTLR: usize = 0x0000;
const GICC_PMR: usize = 0x0004;
const GICC_IAR: usize = 0x000c;
const GICC_EOIR: usize = 0x0010;
const GICC_DIR: usize = 0x1000;

const GICC_CTLR_GRPEN: u64 = 0b11;
const GICC_CTLR_EOIMODE: u64 = 1 << 9;
const GICC_PMR_DEFAULT: u64 = 0xf0;

const GICH_HCR: usize = 0x0000;
const GICH_VTR: usize = 0x0004;
const GICH_VMCR: usize = 0x0008;
const GICH_ELSR0: usize = 0x0030;
const GICH_ELSR1: usize = 0x0034;
const GICH_APR: usize = 0x00f0;
const GICH_LR: usize = 0x0100;

const GICH_HCR_EN: u64 = 1 << 0;
const GICH_HCR_UIE: u64 = 1 << 1;
const GICH_VMCR_PMR_SHIFT: u64 = 27;

const LR_VIRT_MASK: u64 = 0x3ff;
const LR_PHYS_SHIFT: u64 = 10;
const LR_CPUID_MASK: u64 = 0x7 << LR_PHYS_SHIFT;
const LR_EOI: u64 = 1 << 19;
const LR_PENDING: u64 = 1 << 28;
const LR_HW: u64 = 1 << 31;

const SGIR_TARGETS_SHIFT: u64 = 16;
const SGIR_FILTER_SHIFT: u64 = 24;

/// GICv2: memory-mapped CPU interface and hypervisor interface.
pub struct GicV2<H: HvHal> {
    dist: Distributor<H>,
    gicc_base: HostPhysAddr,
    gich_base: HostPhysAddr,
    gicv_base: HostPhysAddr,
    maintenance_irq: u32,
    /// CPU interface bit of each logical CPU.
    itf_map: [AtomicU8; MAX_CPUS],
    num_lrs: AtomicUsize,
}

impl<H: HvHal> GicV2<H> {
    pub fn new(platform: &PlatformConfig) -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const NO_ITF: AtomicU8 = AtomicU8::new(0);
        Self {
            dist: Distributor::new(platform.gicd_base, GICD_SIZE),
            gicc_base: platform.gicc_base,
            gich_base: platform.gich_base,
            gicv_base: platform.gicv_base,
            maintenance_irq: platform.maintenance_irq,
            itf_map: [NO_ITF; MAX_CPUS],
            num_lrs: AtomicUsize::new(0),
        }
    }

    fn gicc_read(&self, offset: usize) -> u64 {
        H::mmio_read(HostPhysAddr::from(self.gicc_base.as_usize() + offset), AccessWidth::Dword)
    }

    fn gicc_write(&self, offset: usize, val: u64) {
        H::mmio_write(HostPhysAddr::from(self.gicc_base.as_usize() + offset), AccessWidth::Dword, val);
    }

    fn gich_read(&self, offset: usize) -> u64 {
        H::mmio_read(HostPhysAddr::from(self.gich_base.as_usize() + offset), AccessWidth::Dword)
    }

    fn gich_write(&self, offset: usize, val: u64) {
        H::mmio_write(HostPhysAddr::from(self.gich_base.as_usize() + offset), AccessWidth::Dword, val);
    }

    fn itf_of(&self, cpu: usize) -> u8 {
        self.itf_map.get(cpu).map_or(0, |itf| itf.load(Ordering::Acquire))
    }

    fn num_lrs(&self) -> usize {
        self.num_lrs.load(Ordering::Acquire)
    }

    fn clear_lrs(&self) {
        for lr in 0..self.num_lrs() {
            self.gich_write(GICH_LR + lr * 4, 0);
        }
        self.gich_write(GICH_APR, 0);
    }

    /// Private interrupts the hypervisor keeps for itself.
    fn hyp_private_mask(&self) -> u64 {
        (1 << SGI_INJECT) | (1 << SGI_CPU_OFF) | (1 << self.maintenance_irq)
    }

    fn route_spi(&self, irq: usize, cpu: usize) {
        self.dist.write(GICD_ITARGETSR + irq, AccessWidth::Byte, self.itf_of(cpu) as u64);
    }

    fn handle_itargetsr(&self, ctx: &IrqContext, offset: usize, access: &mut MmioAccess) -> MmioResult {
        if !matches!(access.width, AccessWidth::Byte | AccessWidth::Dword) {
            return ignore(access);
        }
        let first = offset - GICD_ITARGETSR;
        let mask = line_mask(ctx.cell, first, 8, access.width);
        if access.is_write {
            let allowed = ctx
                .cell
                .cpu_set()
                .iter()
                .fold(0u64, |itfs, cpu| itfs | self.itf_of(cpu) as u64);
            for i in 0..access.width.size() {
                let irq = first + i;
                if irq < FIRST_SPI || (mask >> (8 * i)) & 0xff == 0 {
                    continue;
                }
                let targets = (access.value >> (8 * i)) & 0xff;
                if targets & !allowed != 0 {
                    warn!(
                        "cell {}: routing IRQ {} to interfaces {:#x} outside the cell",
                        ctx.cell.id(),
                        irq,
                        targets
                    );
                    return MmioResult::Forbidden;
                }
            }
        }
        self.dist.masked_rmw(offset, access, mask);
        MmioResult::Handled
    }

    fn handle_sgir(&self, ctx: &IrqContext, access: &mut MmioAccess) -> MmioResult {
        if !access.is_write || access.width != AccessWidth::Dword {
            return ignore(access);
        }
        let val = access.value;
        let routing = match (val >> SGIR_FILTER_SHIFT) & 0b11 {
            0 => SgiRouting::List,
            1 => SgiRouting::AllButSelf,
            2 => SgiRouting::SelfOnly,
            _ => return MmioResult::Handled,
        };
        let sgi = GuestSgi {
            routing,
            targets: (val >> SGIR_TARGETS_SHIFT) & 0xff,
            id: (val & 0xf) as u32,
        };
        handle_guest_sgi(self, ctx, &sgi);
        MmioResult::Handled
    }
}

impl<H: HvHal> IrqChip for GicV2<H> {
    fn version(&self) -> GicVersion {
        GicVersion::V2
    }

    fn init(&self) -> AxResult {
        let typer = self.dist.read(GICD_TYPER, AccessWidth::Dword);
        debug!("GICv2: {} interrupt lines", ((typer & 0x1f) + 1) * 32);
        Ok(())
    }

    fn cpu_init(&self, cpu: &PerCpu) -> AxResult {
        // The first byte of the banked ITARGETSR0 names the reading interface.
        let itf = self.dist.read(GICD_ITARGETSR, AccessWidth::Dword) as u8;
        if itf.count_ones() != 1 {
            return ax_err!(BadState, "cannot identify the CPU interface");
        }
        self.itf_map[cpu.id()].store(itf, Ordering::Release);

        self.dist.write(GICD_ISENABLER, AccessWidth::Dword, self.hyp_private_mask());

        // Carry the host's interface configuration over to the virtual one.
        let ctlr = self.gicc_read(GICC_CTLR);
        let pmr = self.gicc_read(GICC_PMR);
        self.gich_write(GICH_VMCR, ((pmr >> 3) << GICH_VMCR_PMR_SHIFT) | (ctlr & GICC_CTLR_GRPEN));
        self.gicc_write(GICC_CTLR, GICC_CTLR_GRPEN | GICC_CTLR_EOIMODE);
        self.gicc_write(GICC_PMR, GICC_PMR_DEFAULT);

        let vtr = self.gich_read(GICH_VTR);
        self.num_lrs.store((vtr & 0x3f) as usize + 1, Ordering::Release);
        self.clear_lrs();
        self.gich_write(GICH_HCR, GICH_HCR_EN);
        trace!("GICv2: CPU {} uses interface {:#x}", cpu.id(), itf);
        Ok(())
    }

    fn cpu_reset(&self, cpu: &PerCpu, root_shutdown: bool) {
        self.clear_lrs();
        cpu.pending.lock().clear();
        let guest_private = 0xffff_ffff & !self.hyp_private_mask();
        self.dist.write(GICD_ICACTIVER, AccessWidth::Dword, guest_private);

        if root_shutdown {
            let vmcr = self.gich_read(GICH_VMCR);
            self.gicc_write(GICC_CTLR, vmcr & GICC_CTLR_GRPEN);
            self.gicc_write(GICC_PMR, ((vmcr >> GICH_VMCR_PMR_SHIFT) & 0x1f) << 3);
            self.gich_write(GICH_HCR, 0);
        } else {
            self.dist.write(GICD_ICENABLER, AccessWidth::Dword, guest_private & 0xffff_0000);
            self.gich_write(GICH_VMCR, 0);
            self.gich_write(GICH_HCR, GICH_HCR_EN);
        }
    }

    fn cell_init(&self, cell: &Cell) {
        let Some(first) = cell.cpu_set().first() else {
            return;
        };
        for irq in cell.irq_lines().iter().filter(|&irq| irq >= FIRST_SPI) {
            if !cell.is_root() {
                self.dist.set_enabled(irq, false);
            }
            self.route_spi(irq, first);
        }
    }

    fn cell_exit(&self, cell: &Cell, root: &Cell) {
        let first = root.cpu_set().first().unwrap_or(0);
        for irq in cell.irq_lines().iter().filter(|&irq| irq >= FIRST_SPI) {
            self.dist.set_enabled(irq, false);
            self.route_spi(irq, first);
        }
    }

    fn cell_regions(&self) -> Vec<MemoryRegion> {
        vec![MemoryRegion::new(
            self.gicv_base.as_usize(),
            self.gicc_base.as_usize(),
            GICC_SIZE,
            MemFlags::READ | MemFlags::WRITE | MemFlags::DMA,
        )]
    }

    fn device_regions(&self) -> Vec<MemoryRegion> {
        let flags = MemFlags::READ | MemFlags::WRITE | MemFlags::DMA;
        [
            (self.dist.base(), GICD_SIZE),
            (self.gicc_base, GICC_SIZE),
            (self.gich_base, GICH_SIZE),
        ]
        .iter()
        .map(|&(base, size)| MemoryRegion::new(base.as_usize(), base.as_usize(), size, flags))
        .collect()
    }

    fn overlaps_trapped(&self, start: HostPhysAddr, size: usize) -> bool {
        let end = start.as_usize() + size;
        [
            (self.dist.base(), GICD_SIZE),
            (self.gicc_base, GICC_SIZE),
            (self.gich_base, GICH_SIZE),
        ]
        .iter()
        .any(|&(base, len)| start.as_usize() < base.as_usize() + len && base.as_usize() < end)
    }

    fn send_sgi(&self, sgi: &Sgi) {
        let itfs = sgi
            .targets
            .iter()
            .fold(0u64, |itfs, cpu| itfs | self.itf_of(cpu) as u64);
        if itfs == 0 {
            return;
        }
        self.dist.write(
            GICD_SGIR,
            AccessWidth::Dword,
            (itfs << SGIR_TARGETS_SHIFT) | (sgi.id as u64 & 0xf),
        );
    }

    fn acknowledge(&self) -> u32 {
        self.gicc_read(GICC_IAR) as u32
    }

    fn inject_irq(&self, _cpu: &PerCpu, irq: &PendingIrq) -> Result<(), InjectError> {
        let elsr = self.gich_read(GICH_ELSR0) | (self.gich_read(GICH_ELSR1) << 32);
        let source = match irq.source {
            IrqSource::Sgi { src_cpu } => {
                (self.itf_of(src_cpu).trailing_zeros() as u64 & 0x7) << LR_PHYS_SHIFT
            }
            IrqSource::Hardware { .. } => 0,
        };

        let mut free = None;
        for lr in 0..self.num_lrs() {
            if elsr & (1 << lr) != 0 {
                free.get_or_insert(lr);
                continue;
            }
            let val = self.gich_read(GICH_LR + lr * 4);
            let same_source = irq.is_hw() || val & LR_CPUID_MASK == source;
            if val & LR_VIRT_MASK == irq.virt_id as u64 && same_source {
                return Err(InjectError::Duplicate);
            }
        }
        let lr = free.ok_or(InjectError::Busy)?;

        let mut val = (irq.virt_id as u64 & LR_VIRT_MASK) | LR_PENDING;
        match irq.source {
            IrqSource::Hardware { phys_id } => {
                val |= LR_HW | ((phys_id as u64 & LR_VIRT_MASK) << LR_PHYS_SHIFT);
            }
            IrqSource::Sgi { .. } => {
                val |= source;
                if irq.maintenance {
                    val |= LR_EOI;
                }
            }
        }
        self.gich_write(GICH_LR + lr * 4, val);
        Ok(())
    }

    fn eoi_irq(&self, raw: u32, deactivate: bool) {
        self.gicc_write(GICC_EOIR, raw as u64);
        if deactivate {
            self.gicc_write(GICC_DIR, raw as u64);
        }
    }

    fn enable_underflow(&self) {
        let hcr = self.gich_read(GICH_HCR);
        self.gich_write(GICH_HCR, hcr | GICH_HCR_UIE);
    }

    fn clear_underflow(&self) {
        let hcr = self.gich_read(GICH_HCR);
        self.gich_write(GICH_HCR, hcr & !GICH_HCR_UIE);
    }

    fn maintenance_irq(&self) -> u32 {
        self.maintenance_irq
    }

    fn target_mask(&self, cpu: usize) -> u64 {
        self.itf_of(cpu) as u64
    }

    fn mmio_access(&self, ctx: &IrqContext, access: &mut MmioAccess) -> MmioResult {
        let Some(offset) = self.dist.offset_of(access.addr) else {
            return MmioResult::Unhandled;
        };
        match offset {
            GICD_ITARGETSR..GICD_ICFGR => self.handle_itargetsr(ctx, offset, access),
            GICD_SGIR => self.handle_sgir(ctx, access),
            _ => self.dist.handle_common(ctx.cell, offset, access),
        }
    }
}
