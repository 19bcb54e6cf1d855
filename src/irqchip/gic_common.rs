//! Distributor register filtering shared by both controller variants.

use core::marker::PhantomData;

use spin::Mutex;

use crate::addr::HostPhysAddr;
use crate::cell::Cell;
use crate::consts::FIRST_SPI;
use crate::hal::HvHal;
use crate::mmio::{AccessWidth, MmioAccess, MmioResult};

pub const GICD_CTLR: usize = 0x0000;
pub const GICD_TYPER: usize = 0x0004;
pub const GICD_IIDR: usize = 0x0008;
pub const GICD_IGROUPR: usize = 0x0080;
pub const GICD_ISENABLER: usize = 0x0100;
pub const GICD_ICENABLER: usize = 0x0180;
pub const GICD_ICACTIVER: usize = 0x0380;
pub const GICD_IPRIORITYR: usize = 0x0400;
pub const GICD_ITARGETSR: usize = 0x0800;
pub const GICD_ICFGR: usize = 0x0c00;
pub const GICD_SGIR: usize = 0x0f00;
pub const GICD_IROUTER: usize = 0x6000;

/// Size of the component and peripheral id block at the end of a frame.
const ID_BLOCK_SIZE: usize = 0x30;

/// The distributor of either variant, with the lock serializing
/// read-modify-write updates of registers shared between cells.
pub struct Distributor<H: HvHal> {
    base: HostPhysAddr,
    size: usize,
    rmw_lock: Mutex<()>,
    _hal: PhantomData<fn() -> H>,
}

impl<H: HvHal> Distributor<H> {
    pub const fn new(base: HostPhysAddr, size: usize) -> Self {
        Self {
            base,
            size,
            rmw_lock: Mutex::new(()),
            _hal: PhantomData,
        }
    }

    pub const fn base(&self) -> HostPhysAddr {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Offset of `addr` in the distributor frame.
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base.as_usize())?;
        (offset < self.size).then_some(offset)
    }

    pub fn read(&self, offset: usize, width: AccessWidth) -> u64 {
        H::mmio_read(HostPhysAddr::from(self.base.as_usize() + offset), width)
    }

    pub fn write(&self, offset: usize, width: AccessWidth, val: u64) {
        H::mmio_write(HostPhysAddr::from(self.base.as_usize() + offset), width, val);
    }

    pub fn set_enabled(&self, irq: usize, enabled: bool) {
        let reg = if enabled { GICD_ISENABLER } else { GICD_ICENABLER };
        self.write(reg + irq / 32 * 4, AccessWidth::Dword, 1 << (irq % 32));
    }

    /// Merges the bits of `access` selected by `mask` into the register,
    /// or returns the masked register on reads.
    pub fn masked_rmw(&self, offset: usize, access: &mut MmioAccess, mask: u64) {
        if access.is_write {
            let _guard = self.rmw_lock.lock();
            let cur = self.read(offset, access.width);
            self.write(offset, access.width, (cur & !mask) | (access.value & mask));
        } else {
            access.value = self.read(offset, access.width) & mask;
        }
    }

    /// Handles the registers laid out the same way on both variants.
    pub fn handle_common(&self, cell: &Cell, offset: usize, access: &mut MmioAccess) -> MmioResult {
        let width = access.width;
        match offset {
            GICD_ISENABLER..GICD_IPRIORITYR => {
                if access.width != AccessWidth::Dword {
                    return ignore(access);
                }
                let first = (offset % 0x80) * 8;
                let mask = line_mask(cell, first, 1, access.width);
                // Set/clear registers: a write has no effect on zero bits.
                if access.is_write {
                    access.value &= mask;
                    if access.value != 0 {
                        self.write(offset, access.width, access.value);
                    }
                } else {
                    access.value = self.read(offset, access.width) & mask;
                }
                MmioResult::Handled
            }
            GICD_IGROUPR..GICD_ISENABLER => self.handle_bitfield(cell, offset, access, GICD_IGROUPR, 1),
            GICD_IPRIORITYR..GICD_ITARGETSR => {
                self.handle_bitfield(cell, offset, access, GICD_IPRIORITYR, 8)
            }
            GICD_ICFGR..GICD_SGIR => self.handle_bitfield(cell, offset, access, GICD_ICFGR, 2),
            GICD_CTLR | GICD_TYPER | GICD_IIDR => read_only(access, || self.read(offset, width)),
            _ if offset >= self.size - ID_BLOCK_SIZE => read_only(access, || self.read(offset, width)),
            _ => ignore(access),
        }
    }

    /// Registers with a `bits`-wide field per line, starting at `reg_base`.
    fn handle_bitfield(
        &self,
        cell: &Cell,
        offset: usize,
        access: &mut MmioAccess,
        reg_base: usize,
        bits: usize,
    ) -> MmioResult {
        let byte_ok = bits == 8 && access.width == AccessWidth::Byte;
        if access.width != AccessWidth::Dword && !byte_ok {
            return ignore(access);
        }
        let first = (offset - reg_base) * 8 / bits;
        let mask = line_mask(cell, first, bits, access.width);
        self.masked_rmw(offset, access, mask);
        MmioResult::Handled
    }
}

/// The bits of an access of `width` covering lines from `first` on, with
/// `bits` per line, that `cell` may see. Private lines are always visible.
pub fn line_mask(cell: &Cell, first: usize, bits: usize, width: AccessWidth) -> u64 {
    let lines = width.size() * 8 / bits;
    let field = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    (0..lines)
        .filter(|&i| {
            let irq = first + i;
            irq < FIRST_SPI || cell.owns_irq(irq)
        })
        .fold(0, |mask, i| mask | (field << (i * bits)))
}

/// Reads as zero, ignores writes.
pub fn ignore(access: &mut MmioAccess) -> MmioResult {
    if !access.is_write {
        access.value = 0;
    }
    MmioResult::Handled
}

/// Reads through `read`, ignores writes.
pub fn read_only(access: &mut MmioAccess, read: impl FnOnce() -> u64) -> MmioResult {
    if !access.is_write {
        access.value = read() & access.width.mask();
    }
    MmioResult::Handled
}
