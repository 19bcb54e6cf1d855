use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use axerrno::{ax_err, AxResult};
use spin::Mutex;
use zerocopy::{Immutable, IntoBytes, KnownLayout};

use crate::addr::{GuestPhysAddr, HostPhysAddr};
use crate::config::{CellConfig, MemFlags, MemoryRegion};
use crate::consts::MAX_IRQS;
use crate::hal::HvHal;
use crate::mm::{PagePool, PageTable, Stage2};
use crate::percpu::CpuMask;

/// Id of the root cell.
pub const ROOT_CELL_ID: u32 = 0;

/// Cell state as reported to the management interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CellState {
    /// All CPUs run the cell's guest.
    Running = 0,
    /// The cell runs, but at least one of its CPUs failed.
    RunningDegraded = 1,
    /// Created or loadable, not running.
    ShutDown = 2,
    /// Every CPU of the cell failed.
    Failed = 3,
}

impl CellState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => CellState::Running,
            1 => CellState::RunningDegraded,
            2 => CellState::ShutDown,
            _ => CellState::Failed,
        }
    }
}

/// Ownership bitmap of interrupt lines.
pub struct IrqLineSet {
    words: [AtomicU32; MAX_IRQS / 32],
}

impl IrqLineSet {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            words: [ZERO; MAX_IRQS / 32],
        }
    }

    pub fn contains(&self, irq: usize) -> bool {
        irq < MAX_IRQS && self.words[irq / 32].load(Ordering::Acquire) & (1 << (irq % 32)) != 0
    }

    pub fn insert(&self, irq: usize) {
        if irq < MAX_IRQS {
            self.words[irq / 32].fetch_or(1 << (irq % 32), Ordering::AcqRel);
        }
    }

    pub fn remove(&self, irq: usize) {
        if irq < MAX_IRQS {
            self.words[irq / 32].fetch_and(!(1 << (irq % 32)), Ordering::AcqRel);
        }
    }

    /// Ownership bits of lines `32 * index` to `32 * index + 31`.
    pub fn word(&self, index: usize) -> u32 {
        self.words
            .get(index)
            .map_or(0, |word| word.load(Ordering::Acquire))
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_IRQS).filter(move |&irq| self.contains(irq))
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}

impl Default for IrqLineSet {
    fn default() -> Self {
        Self::new()
    }
}

pub const COMM_SIGNATURE: [u8; 6] = *b"AXCOMM";
pub const COMM_REVISION: u16 = 1;

/// Header of the communication page shared between the hypervisor and a
/// cell's guest.
#[derive(Debug, Clone, Copy, Default, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct CommRegionHeader {
    pub signature: [u8; 6],
    pub revision: u16,
    pub cell_id: u32,
    pub cell_state: u32,
}

const COMM_STATE_OFFSET: usize = core::mem::offset_of!(CommRegionHeader, cell_state);

/// One partition of the machine.
pub struct Cell {
    id: u32,
    config: CellConfig,
    cpu_set: AtomicU64,
    irq_lines: IrqLineSet,
    state: AtomicU32,
    loadable: AtomicBool,
    /// Stage-2 translation of the cell.
    pub(crate) mm: Mutex<PageTable<Stage2>>,
    comm_page: HostPhysAddr,
    /// Last value the cell wrote to the spin-table mailbox.
    smp_mailbox: AtomicU64,
}

impl Cell {
    /// Builds a cell with its stage-2 table, comm page and every configured
    /// region mapped, plus the interrupt-controller regions in `irqchip_regions`.
    ///
    /// The cell starts with no CPUs, owns the lines its configuration lists for
    /// the distributor at `gicd_base`, and is [`CellState::ShutDown`]. On error
    /// every page taken from the pool is returned.
    pub fn new(
        id: u32,
        config: CellConfig,
        irqchip_regions: &[MemoryRegion],
        gicd_base: HostPhysAddr,
        pool: &mut PagePool,
    ) -> AxResult<Self> {
        let mut mm = PageTable::<Stage2>::new(pool)?;
        let comm_page = match pool.alloc() {
            Ok(page) => page,
            Err(err) => {
                mm.destroy(pool);
                return Err(err);
            }
        };

        let cell = Self {
            id,
            config,
            cpu_set: AtomicU64::new(0),
            irq_lines: IrqLineSet::new(),
            state: AtomicU32::new(CellState::ShutDown as u32),
            loadable: AtomicBool::new(false),
            mm: Mutex::new(mm),
            comm_page,
            smp_mailbox: AtomicU64::new(0),
        };
        if let Err(err) = cell.map_regions(irqchip_regions, pool) {
            cell.release(pool);
            return Err(err);
        }

        for chip in cell.config.irqchips.iter().filter(|c| c.address == gicd_base) {
            chip.lines().for_each(|irq| cell.irq_lines.insert(irq));
        }
        debug!(
            "cell {} \"{}\": {} regions, {} interrupt lines",
            id,
            cell.config.name,
            cell.config.mem_regions.len(),
            cell.irq_lines.count()
        );
        Ok(cell)
    }

    fn map_regions(&self, irqchip_regions: &[MemoryRegion], pool: &mut PagePool) -> AxResult {
        let mut mm = self.mm.lock();
        let regions = self.config.mem_regions.iter().chain(irqchip_regions.iter());
        for (done, region) in regions.enumerate() {
            let target = self.region_target(region);
            let result = mm.map(
                pool,
                region.virt_start.as_usize(),
                target,
                region.size,
                region.flags,
            );
            if let Err(err) = result {
                warn!("cell {}: cannot map {:?}: {:?}", self.id, region, err);
                let mapped = self.config.mem_regions.iter().chain(irqchip_regions.iter());
                for prev in mapped.take(done) {
                    mm.unmap(pool, prev.virt_start.as_usize(), prev.size)?;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// The physical target of `region`, with the comm page substituted for
    /// comm regions.
    fn region_target(&self, region: &MemoryRegion) -> HostPhysAddr {
        if region.flags.contains(MemFlags::COMM_REGION) {
            self.comm_page
        } else {
            region.phys_start
        }
    }

    /// Returns the translation tables and the comm page to the pool.
    pub(crate) fn release(&self, pool: &mut PagePool) {
        self.mm.lock().destroy(pool);
        pool.free(self.comm_page);
    }

    pub const fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    pub const fn is_root(&self) -> bool {
        self.id == ROOT_CELL_ID
    }

    pub fn cpu_set(&self) -> CpuMask {
        CpuMask::from_bits(self.cpu_set.load(Ordering::Acquire))
    }

    pub(crate) fn add_cpu(&self, cpu: usize) {
        let mut mask = CpuMask::empty();
        mask.insert(cpu);
        self.cpu_set.fetch_or(mask.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_cpu(&self, cpu: usize) {
        let mut mask = CpuMask::empty();
        mask.insert(cpu);
        self.cpu_set.fetch_and(!mask.bits(), Ordering::AcqRel);
    }

    pub fn irq_lines(&self) -> &IrqLineSet {
        &self.irq_lines
    }

    pub fn owns_irq(&self, irq: usize) -> bool {
        self.irq_lines.contains(irq)
    }

    pub fn state(&self) -> CellState {
        CellState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Updates the state and mirrors it into the comm page.
    pub(crate) fn set_state<H: HvHal>(&self, state: CellState) {
        self.state.store(state as u32, Ordering::Release);
        let addr = HostPhysAddr::from(self.comm_page.as_usize() + COMM_STATE_OFFSET);
        if let Err(err) = H::write_phys(addr, &(state as u32).to_le_bytes()) {
            warn!("cell {}: cannot update comm page: {:?}", self.id, err);
        }
    }

    /// Writes the comm page header.
    pub(crate) fn init_comm_page<H: HvHal>(&self) -> AxResult {
        let header = CommRegionHeader {
            signature: COMM_SIGNATURE,
            revision: COMM_REVISION,
            cell_id: self.id,
            cell_state: self.state() as u32,
        };
        H::write_phys(self.comm_page, header.as_bytes())
    }

    pub fn comm_page(&self) -> HostPhysAddr {
        self.comm_page
    }

    pub fn is_loadable(&self) -> bool {
        self.loadable.load(Ordering::Acquire)
    }

    pub(crate) fn set_loadable(&self, loadable: bool) {
        self.loadable.store(loadable, Ordering::Release);
    }

    pub fn mailbox(&self) -> u64 {
        self.smp_mailbox.load(Ordering::Acquire)
    }

    pub(crate) fn set_mailbox(&self, value: u64) {
        self.smp_mailbox.store(value, Ordering::Release);
    }

    /// Translates a guest-physical address of this cell.
    pub fn translate(&self, pool: &PagePool, gpa: GuestPhysAddr) -> Option<(HostPhysAddr, MemFlags)> {
        self.mm.lock().translate(pool, gpa.as_usize())
    }

    /// Finds the region of this cell whose guest range holds
    /// `[gpa, gpa + size)` entirely.
    pub fn region_covering(&self, gpa: GuestPhysAddr, size: usize) -> Option<&MemoryRegion> {
        let start = gpa.as_usize();
        let end = start.checked_add(size)?;
        self.config
            .mem_regions
            .iter()
            .find(|r| r.virt_start.as_usize() <= start && end <= r.virt_end())
    }

    /// The parts of this cell's regions that are backed by the same physical
    /// memory as the regions of `other`, in this cell's guest address space
    /// and with this cell's flags. Comm regions never share memory.
    pub fn shared_ranges(&self, other: &CellConfig) -> Vec<MemoryRegion> {
        let mine = self
            .config
            .mem_regions
            .iter()
            .filter(|r| !r.flags.contains(MemFlags::COMM_REGION));
        let mut shared = Vec::new();
        for region in mine {
            let theirs = other
                .mem_regions
                .iter()
                .filter(|r| !r.flags.contains(MemFlags::COMM_REGION));
            for foreign in theirs {
                if let Some((start, size)) = region.phys_overlap(foreign) {
                    let offset = start - region.phys_start.as_usize();
                    shared.push(MemoryRegion::new(
                        start,
                        region.virt_start.as_usize() + offset,
                        size,
                        region.flags,
                    ));
                }
            }
        }
        shared
    }

    /// Unmaps `ranges` from the cell.
    pub(crate) fn unmap_ranges(&self, ranges: &[MemoryRegion], pool: &mut PagePool) -> AxResult {
        let mut mm = self.mm.lock();
        for range in ranges {
            mm.unmap(pool, range.virt_start.as_usize(), range.size)?;
        }
        Ok(())
    }

    /// Maps `ranges` into the cell again.
    pub(crate) fn map_ranges(&self, ranges: &[MemoryRegion], pool: &mut PagePool) -> AxResult {
        let mut mm = self.mm.lock();
        for range in ranges {
            mm.map(
                pool,
                range.virt_start.as_usize(),
                range.phys_start,
                range.size,
                range.flags,
            )?;
        }
        Ok(())
    }
}

/// Checks that a loader image fits a region that accepts images.
pub fn check_load_target(region: Option<&MemoryRegion>) -> AxResult<&MemoryRegion> {
    let Some(region) = region else {
        return ax_err!(InvalidInput, "image outside the cell's memory");
    };
    if !region.flags.contains(MemFlags::WRITE | MemFlags::LOADABLE)
        || region.flags.contains(MemFlags::COMM_REGION)
    {
        return ax_err!(PermissionDenied, "image target region is not loadable");
    }
    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IrqChipConfig;
    use crate::consts::PAGE_SIZE;
    use crate::mm::test_pool;
    use alloc::string::String;
    use axerrno::AxError;

    const GICD: usize = 0x2c00_1000;

    fn config() -> CellConfig {
        CellConfig {
            name: String::from("linux-demo"),
            flags: 0,
            cpu_set: CpuMask::from_bits(0b1100),
            cpu_reset_address: GuestPhysAddr::from(0),
            mem_regions: vec![
                MemoryRegion::new(
                    0x7000_0000,
                    0,
                    0x20_0000,
                    MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE | MemFlags::LOADABLE,
                ),
                MemoryRegion::new(0x1c09_0000, 0x1c09_0000, 0x1000, MemFlags::READ | MemFlags::WRITE | MemFlags::DMA),
                MemoryRegion::new(0, 0x8000_0000, PAGE_SIZE, MemFlags::READ | MemFlags::WRITE | MemFlags::COMM_REGION),
            ],
            irqchips: vec![
                IrqChipConfig {
                    address: HostPhysAddr::from(GICD),
                    pin_base: 32,
                    pin_bitmap: [1 << 5, 0, 0, 1 << 31],
                },
                IrqChipConfig {
                    address: HostPhysAddr::from(0x3000_0000),
                    pin_base: 32,
                    pin_bitmap: [1, 0, 0, 0],
                },
            ],
            pio_regions: vec![],
            pci_devices: vec![],
        }
    }

    #[test]
    fn test_new_cell_maps_regions() {
        let mut pool = test_pool(32);
        let cell = Cell::new(3, config(), &[], HostPhysAddr::from(GICD), &mut pool).unwrap();
        assert_eq!(cell.state(), CellState::ShutDown);
        assert!(cell.cpu_set().is_empty());

        let (pa, flags) = cell.translate(&pool, GuestPhysAddr::from(0x1234)).unwrap();
        assert_eq!(pa.as_usize(), 0x7000_1234);
        assert!(flags.contains(MemFlags::EXECUTE));
        let (pa, _) = cell.translate(&pool, GuestPhysAddr::from(0x8000_0010)).unwrap();
        assert_eq!(pa.as_usize(), cell.comm_page().as_usize() + 0x10);
        assert!(cell.translate(&pool, GuestPhysAddr::from(0x20_0000)).is_none());

        // Only the lines of the distributor the cell is configured against.
        assert_eq!(cell.irq_lines().iter().collect::<Vec<_>>(), vec![37, 159]);
        assert_eq!(cell.irq_lines().word(1), 1 << 5);
    }

    #[test]
    fn test_release_returns_all_pages() {
        let mut pool = test_pool(32);
        let cell = Cell::new(1, config(), &[], HostPhysAddr::from(GICD), &mut pool).unwrap();
        assert!(pool.used() > 2);
        cell.release(&mut pool);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn test_new_cell_rolls_back_on_exhaustion() {
        for pages in 1..7 {
            let mut pool = test_pool(pages);
            let result = Cell::new(1, config(), &[], HostPhysAddr::from(GICD), &mut pool);
            assert_eq!(result.err(), Some(AxError::NoMemory));
            assert_eq!(pool.used(), 0, "pages leaked with a pool of {}", pages);
        }
    }

    #[test]
    fn test_shared_ranges() {
        let mut pool = test_pool(32);
        let mut root_config = config();
        root_config.mem_regions = vec![MemoryRegion::new(
            0x6000_0000,
            0x6000_0000,
            0x2000_0000,
            MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE,
        )];
        let root = Cell::new(0, root_config, &[], HostPhysAddr::from(GICD), &mut pool).unwrap();

        let shared = root.shared_ranges(&config());
        assert_eq!(
            shared,
            vec![MemoryRegion::new(
                0x7000_0000,
                0x7000_0000,
                0x20_0000,
                MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE
            )]
        );
        root.unmap_ranges(&shared, &mut pool).unwrap();
        assert!(root.translate(&pool, GuestPhysAddr::from(0x7000_0000)).is_none());
        assert!(root.translate(&pool, GuestPhysAddr::from(0x6fff_f000)).is_some());
        root.map_ranges(&shared, &mut pool).unwrap();
        assert!(root.translate(&pool, GuestPhysAddr::from(0x7010_0000)).is_some());
    }

    #[test]
    fn test_load_target_checks() {
        let config = config();
        assert_eq!(check_load_target(None).err(), Some(AxError::InvalidInput));
        assert_eq!(
            check_load_target(config.mem_regions.get(1)).err(),
            Some(AxError::PermissionDenied)
        );
        assert!(check_load_target(config.mem_regions.first()).is_ok());
    }
}
