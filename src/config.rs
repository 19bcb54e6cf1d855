//! System and cell configuration descriptors.
//!
//! The loader hands the hypervisor packed, little-endian blobs. They are
//! decoded once into owned [`SystemConfig`] / [`CellConfig`] values; nothing
//! else in the crate touches the packed layout.

use alloc::{string::String, vec::Vec};
use core::mem::size_of;

use axerrno::{ax_err, ax_err_type, AxResult};
use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::addr::{GuestPhysAddr, HostPhysAddr};
use crate::consts::{CELL_NAME_LEN, FIRST_SPI, MAX_CELL_CONFIG_SIZE, MAX_CPUS, MAX_IRQS, PAGE_SIZE};
use crate::irqchip::GicVersion;
use crate::percpu::CpuMask;

pub const SYSTEM_SIGNATURE: [u8; 6] = *b"AXSYST";
pub const CELL_SIGNATURE: [u8; 6] = *b"AXCELL";
pub const CONFIG_REVISION: u16 = 1;

bitflags! {
    /// Access and type flags of a memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Device memory (MMIO) rather than normal memory.
        const DMA = 1 << 3;
        /// The region maps the cell's communication page instead of its
        /// physical start.
        const COMM_REGION = 1 << 5;
        /// The loader may write images into the region.
        const LOADABLE = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct MemoryRegionDesc {
    pub phys_start: u64,
    pub virt_start: u64,
    pub size: u64,
    pub flags: u64,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct IrqChipDesc {
    pub address: u64,
    pub pin_base: u32,
    pub pin_bitmap: [u32; 4],
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct PioRegionDesc {
    pub base: u16,
    pub length: u16,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct PciDeviceDesc {
    pub dev_type: u8,
    pub iommu: u8,
    pub domain: u16,
    pub bdf: u16,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct CellDesc {
    pub signature: [u8; 6],
    pub revision: u16,
    pub name: [u8; CELL_NAME_LEN],
    pub flags: u32,
    pub cpu_set_size: u32,
    pub num_memory_regions: u32,
    pub num_irqchips: u32,
    pub num_pio_regions: u32,
    pub num_pci_devices: u32,
    pub cpu_reset_address: u64,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct PlatformDesc {
    /// 0 lets the hypervisor probe the distributor.
    pub gic_version: u8,
    /// 0 for PSCI, 1 for a spin-table mailbox.
    pub smp_type: u8,
    pub reserved: [u8; 2],
    pub maintenance_irq: u32,
    pub gicd_base: u64,
    pub gicc_base: u64,
    pub gich_base: u64,
    pub gicv_base: u64,
    pub gicr_base: u64,
    pub gicr_size: u64,
    pub smp_mailbox: u64,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct SystemDesc {
    pub signature: [u8; 6],
    pub revision: u16,
    pub flags: u32,
    pub hypervisor_memory: MemoryRegionDesc,
    pub config_memory: MemoryRegionDesc,
    pub platform: PlatformDesc,
    pub root_cell: CellDesc,
}

/// A contiguous guest-physical to physical mapping of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub phys_start: HostPhysAddr,
    pub virt_start: GuestPhysAddr,
    pub size: usize,
    pub flags: MemFlags,
}

impl MemoryRegion {
    pub fn new(phys_start: usize, virt_start: usize, size: usize, flags: MemFlags) -> Self {
        Self {
            phys_start: HostPhysAddr::from(phys_start),
            virt_start: GuestPhysAddr::from(virt_start),
            size,
            flags,
        }
    }

    pub fn phys_end(&self) -> usize {
        self.phys_start.as_usize() + self.size
    }

    pub fn virt_end(&self) -> usize {
        self.virt_start.as_usize() + self.size
    }

    pub fn contains_virt(&self, addr: usize) -> bool {
        (self.virt_start.as_usize()..self.virt_end()).contains(&addr)
    }

    /// The physical sub-range shared with `other`, if any.
    pub fn phys_overlap(&self, other: &MemoryRegion) -> Option<(usize, usize)> {
        let start = self.phys_start.as_usize().max(other.phys_start.as_usize());
        let end = self.phys_end().min(other.phys_end());
        (start < end).then(|| (start, end - start))
    }

    /// Rejects regions whose physical or guest range wraps the address space.
    pub fn check_bounds(&self) -> AxResult {
        let phys = self.phys_start.as_usize().checked_add(self.size);
        let virt = self.virt_start.as_usize().checked_add(self.size);
        if phys.is_none() || virt.is_none() {
            return ax_err!(InvalidInput, "memory region wraps the address space");
        }
        Ok(())
    }

    fn from_desc(desc: &MemoryRegionDesc) -> AxResult<Self> {
        let flags = MemFlags::from_bits(desc.flags)
            .ok_or_else(|| ax_err_type!(InvalidInput, "unknown memory region flags"))?;
        Ok(Self::new(
            desc.phys_start as usize,
            desc.virt_start as usize,
            desc.size as usize,
            flags,
        ))
    }

    fn to_desc(self) -> MemoryRegionDesc {
        MemoryRegionDesc {
            phys_start: self.phys_start.as_usize() as u64,
            virt_start: self.virt_start.as_usize() as u64,
            size: self.size as u64,
            flags: self.flags.bits(),
        }
    }
}

/// Interrupt lines of one interrupt controller assigned to a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqChipConfig {
    /// Distributor base this entry refers to.
    pub address: HostPhysAddr,
    /// Line number of bit 0 of `pin_bitmap`.
    pub pin_base: u32,
    pub pin_bitmap: [u32; 4],
}

impl IrqChipConfig {
    /// Iterates over the lines set in the bitmap.
    pub fn lines(&self) -> impl Iterator<Item = usize> + '_ {
        let base = self.pin_base as usize;
        (0..128).filter_map(move |bit| {
            (self.pin_bitmap[bit / 32] & (1 << (bit % 32)) != 0).then_some(base + bit)
        })
    }
}

/// A port I/O range. Carried for completeness; ARM cells have no port space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioRegion {
    pub base: u16,
    pub length: u16,
}

/// A PCI device assigned to a cell. Carried, not yet acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDevice {
    pub dev_type: u8,
    pub iommu: u8,
    pub domain: u16,
    pub bdf: u16,
}

/// Owned form of a cell descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellConfig {
    pub name: String,
    pub flags: u32,
    pub cpu_set: CpuMask,
    pub cpu_reset_address: GuestPhysAddr,
    pub mem_regions: Vec<MemoryRegion>,
    pub irqchips: Vec<IrqChipConfig>,
    pub pio_regions: Vec<PioRegion>,
    pub pci_devices: Vec<PciDevice>,
}

fn read_array<T: FromBytes>(rest: &mut &[u8], count: usize) -> AxResult<Vec<T>> {
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let (item, tail) = T::read_from_prefix(*rest)
            .map_err(|_| ax_err_type!(InvalidData, "truncated descriptor array"))?;
        items.push(item);
        *rest = tail;
    }
    Ok(items)
}

impl CellDesc {
    /// Size of the descriptor plus its trailing arrays.
    pub fn total_size(&self) -> usize {
        let cpu_set_size = self.cpu_set_size as usize;
        let regions = self.num_memory_regions as usize;
        let irqchips = self.num_irqchips as usize;
        let pio = self.num_pio_regions as usize;
        let pci = self.num_pci_devices as usize;
        size_of::<CellDesc>()
            .saturating_add(cpu_set_size)
            .saturating_add(regions.saturating_mul(size_of::<MemoryRegionDesc>()))
            .saturating_add(irqchips.saturating_mul(size_of::<IrqChipDesc>()))
            .saturating_add(pio.saturating_mul(size_of::<PioRegionDesc>()))
            .saturating_add(pci.saturating_mul(size_of::<PciDeviceDesc>()))
    }
}

impl CellConfig {
    /// Decodes a serialized cell configuration.
    pub fn parse(blob: &[u8]) -> AxResult<Self> {
        let (desc, rest) = CellDesc::read_from_prefix(blob)
            .map_err(|_| ax_err_type!(InvalidData, "truncated cell descriptor"))?;
        let size = desc.total_size();
        if size > MAX_CELL_CONFIG_SIZE {
            return ax_err!(InvalidInput, "cell configuration too large");
        }
        if blob.len() < size {
            return ax_err!(InvalidData, "cell configuration shorter than announced");
        }
        Self::from_desc(&desc, rest)
    }

    fn from_desc(desc: &CellDesc, mut rest: &[u8]) -> AxResult<Self> {
        if desc.signature != CELL_SIGNATURE {
            return ax_err!(InvalidData, "bad cell descriptor signature");
        }
        let revision = desc.revision;
        if revision != CONFIG_REVISION {
            return ax_err!(InvalidData, "unsupported cell descriptor revision");
        }

        let name_bytes = desc.name;
        let name_len = name_bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ax_err_type!(InvalidInput, "cell name is not terminated"))?;
        let name = core::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| ax_err_type!(InvalidData, "cell name is not UTF-8"))?;

        let cpu_set_size = desc.cpu_set_size as usize;
        if cpu_set_size > MAX_CPUS / 8 {
            return ax_err!(InvalidInput, "CPU set larger than the supported CPU count");
        }
        if rest.len() < cpu_set_size {
            return ax_err!(InvalidData, "truncated CPU set");
        }
        let (cpu_bytes, tail) = rest.split_at(cpu_set_size);
        rest = tail;
        let cpu_bits = cpu_bytes
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (8 * i)));

        let mem_regions = read_array::<MemoryRegionDesc>(&mut rest, desc.num_memory_regions as usize)?
            .iter()
            .map(MemoryRegion::from_desc)
            .collect::<AxResult<Vec<_>>>()?;
        let irqchips = read_array::<IrqChipDesc>(&mut rest, desc.num_irqchips as usize)?
            .into_iter()
            .map(|d| IrqChipConfig {
                address: HostPhysAddr::from(d.address as usize),
                pin_base: d.pin_base,
                pin_bitmap: d.pin_bitmap,
            })
            .collect();
        let pio_regions = read_array::<PioRegionDesc>(&mut rest, desc.num_pio_regions as usize)?
            .into_iter()
            .map(|d| PioRegion {
                base: d.base,
                length: d.length,
            })
            .collect();
        let pci_devices = read_array::<PciDeviceDesc>(&mut rest, desc.num_pci_devices as usize)?
            .into_iter()
            .map(|d| PciDevice {
                dev_type: d.dev_type,
                iommu: d.iommu,
                domain: d.domain,
                bdf: d.bdf,
            })
            .collect();

        let config = Self {
            name: String::from(name),
            flags: desc.flags,
            cpu_set: CpuMask::from_bits(cpu_bits),
            cpu_reset_address: GuestPhysAddr::from(desc.cpu_reset_address as usize),
            mem_regions,
            irqchips,
            pio_regions,
            pci_devices,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the properties a configuration must have on its own, before it
    /// is compared against the live system.
    pub fn validate(&self) -> AxResult {
        if self.name.is_empty() || self.name.len() >= CELL_NAME_LEN {
            return ax_err!(InvalidInput, "invalid cell name length");
        }
        if self.cpu_set.is_empty() {
            return ax_err!(InvalidInput, "cell without CPUs");
        }

        let mut comm_regions = 0;
        for (i, region) in self.mem_regions.iter().enumerate() {
            if region.size == 0
                || region.size % PAGE_SIZE != 0
                || region.phys_start.as_usize() % PAGE_SIZE != 0
                || region.virt_start.as_usize() % PAGE_SIZE != 0
            {
                return ax_err!(InvalidInput, "memory region not page aligned");
            }
            region.check_bounds()?;
            if region.flags.contains(MemFlags::COMM_REGION) {
                comm_regions += 1;
                if region.size != PAGE_SIZE {
                    return ax_err!(InvalidInput, "comm region must span exactly one page");
                }
            }
            let overlaps = self.mem_regions[..i].iter().any(|other| {
                region.virt_start.as_usize() < other.virt_end()
                    && other.virt_start.as_usize() < region.virt_end()
            });
            if overlaps {
                return ax_err!(InvalidInput, "overlapping guest memory regions");
            }
        }
        if comm_regions > 1 {
            return ax_err!(InvalidInput, "more than one comm region");
        }

        for chip in self.irqchips.iter() {
            let base = chip.pin_base as usize;
            if base % 32 != 0 {
                return ax_err!(InvalidInput, "interrupt pin base not aligned to 32");
            }
            if let Some(line) = chip.lines().find(|&l| l < FIRST_SPI || l >= MAX_IRQS) {
                warn!("interrupt line {} cannot be assigned to a cell", line);
                return ax_err!(InvalidInput, "interrupt line not assignable");
            }
        }
        Ok(())
    }

    /// Serializes the configuration back into its packed form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(self.to_desc().as_bytes());
        self.append_arrays(&mut blob);
        blob
    }

    fn to_desc(&self) -> CellDesc {
        let mut name = [0u8; CELL_NAME_LEN];
        let len = self.name.len().min(CELL_NAME_LEN - 1);
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        CellDesc {
            signature: CELL_SIGNATURE,
            revision: CONFIG_REVISION,
            name,
            flags: self.flags,
            cpu_set_size: 8,
            num_memory_regions: self.mem_regions.len() as u32,
            num_irqchips: self.irqchips.len() as u32,
            num_pio_regions: self.pio_regions.len() as u32,
            num_pci_devices: self.pci_devices.len() as u32,
            cpu_reset_address: self.cpu_reset_address.as_usize() as u64,
        }
    }

    fn append_arrays(&self, blob: &mut Vec<u8>) {
        blob.extend_from_slice(&self.cpu_set.bits().to_le_bytes());
        for region in self.mem_regions.iter() {
            blob.extend_from_slice(region.to_desc().as_bytes());
        }
        for chip in self.irqchips.iter() {
            let desc = IrqChipDesc {
                address: chip.address.as_usize() as u64,
                pin_base: chip.pin_base,
                pin_bitmap: chip.pin_bitmap,
            };
            blob.extend_from_slice(desc.as_bytes());
        }
        for pio in self.pio_regions.iter() {
            let desc = PioRegionDesc {
                base: pio.base,
                length: pio.length,
            };
            blob.extend_from_slice(desc.as_bytes());
        }
        for dev in self.pci_devices.iter() {
            let desc = PciDeviceDesc {
                dev_type: dev.dev_type,
                iommu: dev.iommu,
                domain: dev.domain,
                bdf: dev.bdf,
            };
            blob.extend_from_slice(desc.as_bytes());
        }
    }

    /// The region covering guest-physical address `addr`.
    pub fn region_at(&self, addr: usize) -> Option<&MemoryRegion> {
        self.mem_regions.iter().find(|r| r.contains_virt(addr))
    }
}

/// How secondary CPUs are started by the root OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpKind {
    /// Through PSCI firmware calls.
    Psci,
    /// Through a spin-table mailbox at the given address.
    SpinTable { mailbox: GuestPhysAddr },
}

/// Platform description of the interrupt controller and the SMP protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Expected controller version; `None` accepts whatever the probe finds.
    pub gic_version: Option<GicVersion>,
    pub smp: SmpKind,
    pub maintenance_irq: u32,
    pub gicd_base: HostPhysAddr,
    pub gicc_base: HostPhysAddr,
    pub gich_base: HostPhysAddr,
    pub gicv_base: HostPhysAddr,
    pub gicr_base: HostPhysAddr,
    pub gicr_size: usize,
}

impl PlatformConfig {
    fn from_desc(desc: &PlatformDesc) -> AxResult<Self> {
        let gic_version = match desc.gic_version {
            0 => None,
            2 => Some(GicVersion::V2),
            3 => Some(GicVersion::V3),
            _ => return ax_err!(InvalidInput, "unknown GIC version"),
        };
        let smp = match desc.smp_type {
            0 => SmpKind::Psci,
            1 => SmpKind::SpinTable {
                mailbox: GuestPhysAddr::from(desc.smp_mailbox as usize),
            },
            _ => return ax_err!(InvalidInput, "unknown SMP type"),
        };
        Ok(Self {
            gic_version,
            smp,
            maintenance_irq: desc.maintenance_irq,
            gicd_base: HostPhysAddr::from(desc.gicd_base as usize),
            gicc_base: HostPhysAddr::from(desc.gicc_base as usize),
            gich_base: HostPhysAddr::from(desc.gich_base as usize),
            gicv_base: HostPhysAddr::from(desc.gicv_base as usize),
            gicr_base: HostPhysAddr::from(desc.gicr_base as usize),
            gicr_size: desc.gicr_size as usize,
        })
    }

    fn to_desc(self) -> PlatformDesc {
        let (smp_type, smp_mailbox) = match self.smp {
            SmpKind::Psci => (0, 0),
            SmpKind::SpinTable { mailbox } => (1, mailbox.as_usize() as u64),
        };
        PlatformDesc {
            gic_version: self.gic_version.map_or(0, |v| v as u8),
            smp_type,
            reserved: [0; 2],
            maintenance_irq: self.maintenance_irq,
            gicd_base: self.gicd_base.as_usize() as u64,
            gicc_base: self.gicc_base.as_usize() as u64,
            gich_base: self.gich_base.as_usize() as u64,
            gicv_base: self.gicv_base.as_usize() as u64,
            gicr_base: self.gicr_base.as_usize() as u64,
            gicr_size: self.gicr_size as u64,
            smp_mailbox,
        }
    }
}

/// Owned form of the system configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    pub flags: u32,
    /// Memory reserved for the hypervisor image, per-CPU data and page pool.
    pub hypervisor_memory: MemoryRegion,
    /// Optional storage holding the configuration itself.
    pub config_memory: Option<MemoryRegion>,
    pub platform: PlatformConfig,
    pub root_cell: CellConfig,
}

impl SystemConfig {
    /// Decodes the serialized system configuration.
    pub fn parse(blob: &[u8]) -> AxResult<Self> {
        let (desc, rest) = SystemDesc::read_from_prefix(blob)
            .map_err(|_| ax_err_type!(InvalidData, "truncated system descriptor"))?;
        if desc.signature != SYSTEM_SIGNATURE {
            return ax_err!(InvalidData, "bad system descriptor signature");
        }
        let revision = desc.revision;
        if revision != CONFIG_REVISION {
            return ax_err!(InvalidData, "unsupported system descriptor revision");
        }
        let root_desc = desc.root_cell;
        if rest.len() + size_of::<CellDesc>() < root_desc.total_size() {
            return ax_err!(InvalidData, "root cell arrays truncated");
        }

        let hypervisor_memory = MemoryRegion::from_desc(&desc.hypervisor_memory)?;
        if hypervisor_memory.size == 0 || hypervisor_memory.phys_start.as_usize() % PAGE_SIZE != 0 {
            return ax_err!(InvalidInput, "invalid hypervisor memory");
        }
        hypervisor_memory.check_bounds()?;
        let config_memory_desc = desc.config_memory;
        let config_memory = if config_memory_desc.size == 0 {
            None
        } else {
            let region = MemoryRegion::from_desc(&config_memory_desc)?;
            region.check_bounds()?;
            Some(region)
        };

        let root_cell = CellConfig::from_desc(&root_desc, rest)?;
        for region in root_cell.mem_regions.iter() {
            if region.phys_overlap(&hypervisor_memory).is_some() {
                return ax_err!(InvalidInput, "root cell maps hypervisor memory");
            }
        }

        Ok(Self {
            flags: desc.flags,
            hypervisor_memory,
            config_memory,
            platform: PlatformConfig::from_desc(&desc.platform)?,
            root_cell,
        })
    }

    /// Serializes the configuration back into its packed form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let desc = SystemDesc {
            signature: SYSTEM_SIGNATURE,
            revision: CONFIG_REVISION,
            flags: self.flags,
            hypervisor_memory: self.hypervisor_memory.to_desc(),
            config_memory: self.config_memory.map(|m| m.to_desc()).unwrap_or_default(),
            platform: self.platform.to_desc(),
            root_cell: self.root_cell.to_desc(),
        };
        let mut blob = Vec::new();
        blob.extend_from_slice(desc.as_bytes());
        self.root_cell.append_arrays(&mut blob);
        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_cell() -> CellConfig {
        CellConfig {
            name: String::from("uart-demo"),
            flags: 0,
            cpu_set: CpuMask::from_bits(0b1000),
            cpu_reset_address: GuestPhysAddr::from(0),
            mem_regions: vec![
                MemoryRegion::new(0x7bfe_0000, 0, 0x1_0000, MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE | MemFlags::LOADABLE),
                MemoryRegion::new(0, 0x8000_0000, PAGE_SIZE, MemFlags::READ | MemFlags::WRITE | MemFlags::COMM_REGION),
            ],
            irqchips: vec![IrqChipConfig {
                address: HostPhysAddr::from(0x2c00_1000),
                pin_base: 32,
                pin_bitmap: [0, 1 << 5, 0, 0],
            }],
            pio_regions: vec![],
            pci_devices: vec![PciDevice {
                dev_type: 1,
                iommu: 0,
                domain: 0,
                bdf: 0x08,
            }],
        }
    }

    #[test]
    fn test_cell_config_encode_decode() {
        let cell = demo_cell();
        let blob = cell.to_bytes();
        assert_eq!(blob.len(), cell.to_desc().total_size());
        let parsed = CellConfig::parse(&blob).unwrap();
        assert_eq!(parsed, cell);
        assert_eq!(parsed.irqchips[0].lines().collect::<Vec<_>>(), vec![69]);
    }

    #[test]
    fn test_truncated_config_rejected() {
        let blob = demo_cell().to_bytes();
        assert_eq!(
            CellConfig::parse(&blob[..blob.len() - 1]),
            Err(axerrno::AxError::InvalidData)
        );
        assert_eq!(CellConfig::parse(&blob[..10]), Err(axerrno::AxError::InvalidData));
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut blob = demo_cell().to_bytes();
        blob[0] = b'X';
        assert_eq!(CellConfig::parse(&blob), Err(axerrno::AxError::InvalidData));
    }

    #[test]
    fn test_oversized_config_rejected() {
        let mut desc = demo_cell().to_desc();
        desc.num_memory_regions = 0x10_0000;
        let blob = desc.as_bytes().to_vec();
        assert_eq!(CellConfig::parse(&blob), Err(axerrno::AxError::InvalidInput));
    }

    #[test]
    fn test_validate_rejects_bad_regions() {
        let mut cell = demo_cell();
        cell.mem_regions[0].size = 0x1234;
        assert_eq!(cell.validate(), Err(axerrno::AxError::InvalidInput));

        let mut cell = demo_cell();
        cell.mem_regions[1].virt_start = GuestPhysAddr::from(0x8000);
        assert_eq!(cell.validate(), Err(axerrno::AxError::InvalidInput));

        let mut cell = demo_cell();
        cell.mem_regions[1].size = 2 * PAGE_SIZE;
        assert_eq!(cell.validate(), Err(axerrno::AxError::InvalidInput));

        let mut cell = demo_cell();
        cell.cpu_set = CpuMask::empty();
        assert_eq!(cell.validate(), Err(axerrno::AxError::InvalidInput));

        let mut cell = demo_cell();
        cell.irqchips[0].pin_base = 0;
        cell.irqchips[0].pin_bitmap = [1 << 27, 0, 0, 0];
        assert_eq!(cell.validate(), Err(axerrno::AxError::InvalidInput));
    }

    #[test]
    fn test_phys_overlap() {
        let low = MemoryRegion::new(0x1000, 0, 0x2000, MemFlags::READ);
        let high = MemoryRegion::new(0x8000, 0, 0x1000, MemFlags::READ);
        assert_eq!(low.phys_overlap(&high), None);
        assert_eq!(high.phys_overlap(&low), None);

        let adjacent = MemoryRegion::new(0x3000, 0, 0x1000, MemFlags::READ);
        assert_eq!(low.phys_overlap(&adjacent), None);

        let inner = MemoryRegion::new(0x2000, 0, 0x4000, MemFlags::READ);
        assert_eq!(low.phys_overlap(&inner), Some((0x2000, 0x1000)));
        assert_eq!(inner.phys_overlap(&low), Some((0x2000, 0x1000)));
    }

    #[test]
    fn test_validate_rejects_wrapping_regions() {
        let mut cell = demo_cell();
        cell.mem_regions[0].phys_start = HostPhysAddr::from(0xffff_ffff_ffff_f000);
        cell.mem_regions[0].size = 0x2000;
        assert_eq!(cell.validate(), Err(axerrno::AxError::InvalidInput));

        let mut cell = demo_cell();
        cell.mem_regions[0].virt_start = GuestPhysAddr::from(0xffff_ffff_ffff_f000);
        cell.mem_regions[0].size = 0x2000;
        assert_eq!(cell.validate(), Err(axerrno::AxError::InvalidInput));

        let region = MemoryRegion::new(0xffff_ffff_ffff_f000, 0, 0x1000, MemFlags::READ);
        assert_eq!(region.check_bounds(), Ok(()));
    }

    #[test]
    fn test_unknown_region_flags_rejected() {
        let cell = demo_cell();
        let mut blob = cell.to_bytes();
        // flags word of the first memory region
        let offset = size_of::<CellDesc>() + 8 + 24;
        blob[offset + 7] = 0x80;
        assert_eq!(CellConfig::parse(&blob), Err(axerrno::AxError::InvalidInput));
    }

    #[test]
    fn test_system_config_encode_decode() {
        let system = SystemConfig {
            flags: 0,
            hypervisor_memory: MemoryRegion::new(0xfc00_0000, 0xfc00_0000, 0x400_0000, MemFlags::empty()),
            config_memory: None,
            platform: PlatformConfig {
                gic_version: Some(GicVersion::V2),
                smp: SmpKind::SpinTable {
                    mailbox: GuestPhysAddr::from(0x1c01_0030),
                },
                maintenance_irq: 25,
                gicd_base: HostPhysAddr::from(0x2c00_1000),
                gicc_base: HostPhysAddr::from(0x2c00_2000),
                gich_base: HostPhysAddr::from(0x2c00_4000),
                gicv_base: HostPhysAddr::from(0x2c00_6000),
                gicr_base: HostPhysAddr::from(0),
                gicr_size: 0,
            },
            root_cell: CellConfig {
                name: String::from("root"),
                cpu_set: CpuMask::from_bits(0xf),
                mem_regions: vec![MemoryRegion::new(
                    0x8000_0000,
                    0x8000_0000,
                    0x1000_0000,
                    MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE,
                )],
                pci_devices: vec![],
                ..demo_cell()
            },
        };
        let parsed = SystemConfig::parse(&system.to_bytes()).unwrap();
        assert_eq!(parsed, system);

        let mut bad = system.clone();
        bad.root_cell.mem_regions[0] =
            MemoryRegion::new(0xfc00_0000, 0xfc00_0000, 0x1000, MemFlags::READ);
        assert_eq!(
            SystemConfig::parse(&bad.to_bytes()),
            Err(axerrno::AxError::InvalidInput)
        );
    }
}
