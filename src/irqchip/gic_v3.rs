use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::{ax_err, AxResult};

use super::gic_common::*;
use super::pending::{IrqSource, PendingIrq};
use super::{GicVersion, InjectError, IrqChip, IrqContext, Sgi};
use crate::addr::HostPhysAddr;
use crate::cell::Cell;
use crate::config::{MemFlags, MemoryRegion, PlatformConfig};
use crate::consts::{FIRST_SPI, MAX_CPUS, MAX_IRQS, SGI_CPU_OFF, SGI_INJECT};
use crate::hal::{HvHal, SysReg};
use crate::mmio::{AccessWidth, MmioAccess, MmioResult};
use crate::percpu::PerCpu;

const GICD_SIZE: usize = 0x1_0000;
const GICD_IROUTER_END: usize = GICD_IROUTER + 8 * MAX_IRQS;
const IROUTER_IRM: u64 = 1 << 31;
const IROUTER_AFF0_MASK: u64 = 0xff;

const GICR_STRIDE: usize = 0x2_0000;
const GICR_STRIDE_V4: usize = 0x4_0000;
const GICR_TYPER: usize = 0x0008;
const GICR_TYPER_LAST: u64 = 1 << 4;
const GICR_TYPER_AFF_SHIFT: u64 = 32;
const GICR_SGI_FRAME: usize = 0x1_0000;
const GICR_ISENABLER0: usize = GICR_SGI_FRAME + 0x0100;
const GICR_ICENABLER0: usize = GICR_SGI_FRAME + 0x0180;
const GICR_ICACTIVER0: usize = GICR_SGI_FRAME + 0x0380;

const ICC_CTLR_EOIMODE: u64 = 1 << 1;
const ICC_PMR_DEFAULT: u64 = 0xf0;

const ICH_HCR_EN: u64 = 1 << 0;
const ICH_HCR_UIE: u64 = 1 << 1;
const ICH_VMCR_VENG1: u64 = 1 << 1;
const ICH_VMCR_VPMR_SHIFT: u64 = 24;

const LR_VIRT_MASK: u64 = 0xffff_ffff;
const LR_PHYS_SHIFT: u64 = 32;
const LR_EOI: u64 = 1 << 41;
const LR_GROUP1: u64 = 1 << 60;
const LR_HW: u64 = 1 << 61;
const LR_PENDING: u64 = 1 << 62;

const SGI1R_INTID_SHIFT: u64 = 24;

/// GICv3: system-register CPU interface and per-CPU redistributors.
pub struct GicV3<H: HvHal> {
    dist: Distributor<H>,
    gicr_base: HostPhysAddr,
    gicr_size: usize,
    gicr_stride: usize,
    maintenance_irq: u32,
    /// Redistributor frame of each logical CPU, 0 until the CPU entered.
    redist: [AtomicUsize; MAX_CPUS],
    num_lrs: AtomicUsize,
}

impl<H: HvHal> GicV3<H> {
    pub fn new(platform: &PlatformConfig, v4: bool) -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const NO_FRAME: AtomicUsize = AtomicUsize::new(0);
        Self {
            dist: Distributor::new(platform.gicd_base, GICD_SIZE),
            gicr_base: platform.gicr_base,
            gicr_size: platform.gicr_size,
            gicr_stride: if v4 { GICR_STRIDE_V4 } else { GICR_STRIDE },
            maintenance_irq: platform.maintenance_irq,
            redist: [NO_FRAME; MAX_CPUS],
            num_lrs: AtomicUsize::new(0),
        }
    }

    fn redist_of(&self, cpu: usize) -> Option<usize> {
        self.redist
            .get(cpu)
            .map(|frame| frame.load(Ordering::Acquire))
            .filter(|&frame| frame != 0)
    }

    fn redist_read(&self, frame: usize, offset: usize, width: AccessWidth) -> u64 {
        H::mmio_read(HostPhysAddr::from(frame + offset), width)
    }

    fn redist_write(&self, frame: usize, offset: usize, val: u64) {
        H::mmio_write(HostPhysAddr::from(frame + offset), AccessWidth::Dword, val);
    }

    /// Walks the redistributor frames until the one of `cpu`.
    fn find_redist(&self, cpu: usize) -> Option<usize> {
        let end = self.gicr_base.as_usize() + self.gicr_size;
        let mut frame = self.gicr_base.as_usize();
        while frame + self.gicr_stride <= end {
            let typer = self.redist_read(frame, GICR_TYPER, AccessWidth::Qword);
            if ((typer >> GICR_TYPER_AFF_SHIFT) & 0xff) as usize == cpu {
                return Some(frame);
            }
            if typer & GICR_TYPER_LAST != 0 {
                break;
            }
            frame += self.gicr_stride;
        }
        None
    }

    fn num_lrs(&self) -> usize {
        self.num_lrs.load(Ordering::Acquire)
    }

    fn clear_lrs(&self) {
        for lr in 0..self.num_lrs() {
            H::write_sysreg(SysReg::IchLrEl2(lr), 0);
        }
        H::write_sysreg(SysReg::IchAp1rEl2(0), 0);
    }

    fn hyp_private_mask(&self) -> u64 {
        (1 << SGI_INJECT) | (1 << SGI_CPU_OFF) | (1 << self.maintenance_irq)
    }

    fn route_spi(&self, irq: usize, cpu: usize) {
        self.dist
            .write(GICD_IROUTER + 8 * irq, AccessWidth::Qword, cpu as u64 & IROUTER_AFF0_MASK);
    }

    fn gicr_contains(&self, addr: usize) -> bool {
        let base = self.gicr_base.as_usize();
        (base..base + self.gicr_size).contains(&addr)
    }

    fn handle_irouter(&self, ctx: &IrqContext, offset: usize, access: &mut MmioAccess) -> MmioResult {
        let irq = (offset - GICD_IROUTER) / 8;
        let upper_half = (offset - GICD_IROUTER) % 8 != 0;
        if upper_half
            || irq < FIRST_SPI
            || !ctx.cell.owns_irq(irq)
            || !matches!(access.width, AccessWidth::Dword | AccessWidth::Qword)
        {
            return ignore(access);
        }
        if !access.is_write {
            access.value = self.dist.read(offset, access.width);
            return MmioResult::Handled;
        }

        let cpu = (access.value & IROUTER_AFF0_MASK) as usize;
        if access.value & IROUTER_IRM != 0 || !ctx.cell.cpu_set().contains(cpu) {
            warn!(
                "cell {}: routing IRQ {} with {:#x} outside the cell",
                ctx.cell.id(),
                irq,
                access.value
            );
            return MmioResult::Forbidden;
        }
        self.dist.write(offset, access.width, access.value & IROUTER_AFF0_MASK);
        MmioResult::Handled
    }

    /// Redistributor frames: a cell reaches only the frames of its own CPUs,
    /// and sees the last of them flagged as the last frame.
    fn handle_redist(&self, ctx: &IrqContext, access: &mut MmioAccess) -> MmioResult {
        let base = self.gicr_base.as_usize();
        let frame = base + (access.addr - base) / self.gicr_stride * self.gicr_stride;
        let owner = (0..MAX_CPUS).find(|&cpu| self.redist_of(cpu) == Some(frame));
        let Some(cpu) = owner.filter(|&cpu| ctx.cell.cpu_set().contains(cpu)) else {
            warn!("cell {}: access to foreign redistributor at {:#x}", ctx.cell.id(), frame);
            return MmioResult::Forbidden;
        };

        let offset = access.addr - frame;
        if offset == GICR_TYPER || offset == GICR_TYPER + 4 {
            if access.is_write {
                return MmioResult::Handled;
            }
            let mut typer = self.redist_read(frame, GICR_TYPER, AccessWidth::Qword) & !GICR_TYPER_LAST;
            if ctx.cell.cpu_set().last() == Some(cpu) {
                typer |= GICR_TYPER_LAST;
            }
            let shift = 8 * (offset - GICR_TYPER);
            access.value = (typer >> shift) & access.width.mask();
            return MmioResult::Handled;
        }
        access.passthrough::<H>();
        MmioResult::Handled
    }
}

impl<H: HvHal> IrqChip for GicV3<H> {
    fn version(&self) -> GicVersion {
        GicVersion::V3
    }

    fn init(&self) -> AxResult {
        if self.gicr_size < self.gicr_stride {
            return ax_err!(InvalidInput, "redistributor region too small");
        }
        let typer = self.dist.read(GICD_TYPER, AccessWidth::Dword);
        debug!("GICv3: {} interrupt lines", ((typer & 0x1f) + 1) * 32);
        Ok(())
    }

    fn cpu_init(&self, cpu: &PerCpu) -> AxResult {
        let Some(frame) = self.find_redist(cpu.id()) else {
            return ax_err!(NotFound, "no redistributor for this CPU");
        };
        self.redist[cpu.id()].store(frame, Ordering::Release);
        self.redist_write(frame, GICR_ISENABLER0, self.hyp_private_mask());

        let ctlr = H::read_sysreg(SysReg::IccCtlrEl1);
        let pmr = H::read_sysreg(SysReg::IccPmrEl1);
        let grpen = H::read_sysreg(SysReg::IccIgrpen1El1);
        let vmcr = ((pmr & 0xff) << ICH_VMCR_VPMR_SHIFT) | if grpen & 1 != 0 { ICH_VMCR_VENG1 } else { 0 };
        H::write_sysreg(SysReg::IchVmcrEl2, vmcr);
        H::write_sysreg(SysReg::IccCtlrEl1, ctlr | ICC_CTLR_EOIMODE);
        H::write_sysreg(SysReg::IccPmrEl1, ICC_PMR_DEFAULT);
        H::write_sysreg(SysReg::IccIgrpen1El1, 1);

        let vtr = H::read_sysreg(SysReg::IchVtrEl2);
        self.num_lrs.store((vtr & 0xf) as usize + 1, Ordering::Release);
        self.clear_lrs();
        H::write_sysreg(SysReg::IchHcrEl2, ICH_HCR_EN);
        trace!("GICv3: CPU {} uses redistributor {:#x}", cpu.id(), frame);
        Ok(())
    }

    fn cpu_reset(&self, cpu: &PerCpu, root_shutdown: bool) {
        self.clear_lrs();
        cpu.pending.lock().clear();
        let guest_private = 0xffff_ffff & !self.hyp_private_mask();
        if let Some(frame) = self.redist_of(cpu.id()) {
            self.redist_write(frame, GICR_ICACTIVER0, guest_private);
            if !root_shutdown {
                self.redist_write(frame, GICR_ICENABLER0, guest_private & 0xffff_0000);
            }
        }

        if root_shutdown {
            let vmcr = H::read_sysreg(SysReg::IchVmcrEl2);
            let ctlr = H::read_sysreg(SysReg::IccCtlrEl1);
            H::write_sysreg(SysReg::IccCtlrEl1, ctlr & !ICC_CTLR_EOIMODE);
            H::write_sysreg(SysReg::IccPmrEl1, (vmcr >> ICH_VMCR_VPMR_SHIFT) & 0xff);
            H::write_sysreg(SysReg::IccIgrpen1El1, (vmcr & ICH_VMCR_VENG1) >> 1);
            H::write_sysreg(SysReg::IchHcrEl2, 0);
        } else {
            H::write_sysreg(SysReg::IchVmcrEl2, 0);
            H::write_sysreg(SysReg::IchHcrEl2, ICH_HCR_EN);
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
        Vec::new()
    }

    fn device_regions(&self) -> Vec<MemoryRegion> {
        let flags = MemFlags::READ | MemFlags::WRITE | MemFlags::DMA;
        let gicd = self.dist.base().as_usize();
        let gicr = self.gicr_base.as_usize();
        vec![
            MemoryRegion::new(gicd, gicd, GICD_SIZE, flags),
            MemoryRegion::new(gicr, gicr, self.gicr_size, flags),
        ]
    }

    fn overlaps_trapped(&self, start: HostPhysAddr, size: usize) -> bool {
        let (start, end) = (start.as_usize(), start.as_usize() + size);
        let gicd = self.dist.base().as_usize();
        let gicr = self.gicr_base.as_usize();
        (start < gicd + GICD_SIZE && gicd < end) || (start < gicr + self.gicr_size && gicr < end)
    }

    fn send_sgi(&self, sgi: &Sgi) {
        let targets = sgi.targets.bits() & 0xffff;
        if targets == 0 {
            return;
        }
        H::write_sysreg(
            SysReg::IccSgi1rEl1,
            targets | ((sgi.id as u64 & 0xf) << SGI1R_INTID_SHIFT),
        );
    }

    fn acknowledge(&self) -> u32 {
        H::read_sysreg(SysReg::IccIar1El1) as u32
    }

    fn inject_irq(&self, _cpu: &PerCpu, irq: &PendingIrq) -> Result<(), InjectError> {
        let elsr = H::read_sysreg(SysReg::IchElsrEl2);
        let mut free = None;
        for lr in 0..self.num_lrs() {
            if elsr & (1 << lr) != 0 {
                free.get_or_insert(lr);
                continue;
            }
            if H::read_sysreg(SysReg::IchLrEl2(lr)) & LR_VIRT_MASK == irq.virt_id as u64 {
                return Err(InjectError::Duplicate);
            }
        }
        let lr = free.ok_or(InjectError::Busy)?;

        let mut val = irq.virt_id as u64 | LR_GROUP1 | LR_PENDING;
        match irq.source {
            IrqSource::Hardware { phys_id } => val |= LR_HW | ((phys_id as u64) << LR_PHYS_SHIFT),
            IrqSource::Sgi { .. } if irq.maintenance => val |= LR_EOI,
            IrqSource::Sgi { .. } => {}
        }
        H::write_sysreg(SysReg::IchLrEl2(lr), val);
        Ok(())
    }

    fn eoi_irq(&self, raw: u32, deactivate: bool) {
        H::write_sysreg(SysReg::IccEoir1El1, raw as u64);
        if deactivate {
            H::write_sysreg(SysReg::IccDirEl1, raw as u64);
        }
    }

    fn enable_underflow(&self) {
        let hcr = H::read_sysreg(SysReg::IchHcrEl2);
        H::write_sysreg(SysReg::IchHcrEl2, hcr | ICH_HCR_UIE);
    }

    fn clear_underflow(&self) {
        let hcr = H::read_sysreg(SysReg::IchHcrEl2);
        H::write_sysreg(SysReg::IchHcrEl2, hcr & !ICH_HCR_UIE);
    }

    fn maintenance_irq(&self) -> u32 {
        self.maintenance_irq
    }

    fn target_mask(&self, cpu: usize) -> u64 {
        if cpu < 16 {
            1 << cpu
        } else {
            0
        }
    }

    fn mmio_access(&self, ctx: &IrqContext, access: &mut MmioAccess) -> MmioResult {
        if let Some(offset) = self.dist.offset_of(access.addr) {
            return match offset {
                GICD_IROUTER..GICD_IROUTER_END => self.handle_irouter(ctx, offset, access),
                _ => self.dist.handle_common(ctx.cell, offset, access),
            };
        }
        if self.gicr_contains(access.addr) {
            return self.handle_redist(ctx, access);
        }
        MmioResult::Unhandled
    }
}
