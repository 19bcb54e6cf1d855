//! The hypervisor context and the cell lifecycle.
//!
//! Every lifecycle operation runs on a CPU of the root cell under the
//! management lock. Before resources change hands, the CPUs involved are
//! parked through the stop handshake: the requester sets the stop flag and
//! sends [`SGI_CPU_OFF`], the target acknowledges from its interrupt handler
//! and spins until [`Hypervisor::cpu_must_wait`] turns false. The steady-state
//! exit path never takes the management lock.

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axerrno::{ax_err, ax_err_type, AxResult};
use spin::{Mutex, MutexGuard};

use crate::addr::{GuestPhysAddr, HostPhysAddr};
use crate::cell::{check_load_target, Cell, CellState, ROOT_CELL_ID};
use crate::config::{CellConfig, MemFlags, SmpKind, SystemConfig};
use crate::consts::{MAX_CELL_ID, PAGE_SIZE, PARK_RETRY_BUDGET, SGI_CPU_OFF};
use crate::exit::{ExitAction, GuestRegs};
use crate::hal::HvHal;
use crate::irqchip::{self, IrqChip, Sgi};
use crate::logging;
use crate::mm::{Frame, HypStage1, PagePool, PageTable};
use crate::percpu::{CpuMask, CpuState, PerCpu, PerCpuTable};
use crate::stats::CpuStat;

/// `SPSR_EL2` for entering a cell: EL1h with all exceptions masked.
pub const RESET_SPSR: u64 = 0x3c5;

/// An image the loader copies into a cell.
#[derive(Debug, Clone, Copy)]
pub struct LoadImage<'a> {
    pub data: &'a [u8],
    /// Guest-physical address of the first byte in the target cell.
    pub target: GuestPhysAddr,
}

/// Snapshot of a cell for the management interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellInfo {
    pub id: u32,
    pub name: String,
    pub state: CellState,
    pub cpus: CpuMask,
    pub failed_cpus: CpuMask,
}

/// The hypervisor context: configuration, page pool, interrupt controller,
/// per-CPU records and the live cells.
pub struct Hypervisor<H: HvHal> {
    pub(crate) config: SystemConfig,
    pub(crate) pool: Mutex<PagePool>,
    /// Stage-1 table of the hypervisor itself.
    hv_mm: Mutex<PageTable<HypStage1>>,
    pub(crate) chip: Box<dyn IrqChip>,
    pub(crate) cpus: PerCpuTable,
    /// Live cells, the root cell included. Doubles as the management lock.
    cells: Mutex<Vec<Arc<Cell>>>,
    pub(crate) root: Arc<Cell>,
    enabled: AtomicBool,
    /// CPUs that went through [`Hypervisor::cpu_entry`].
    entered: AtomicU64,
    _hal: PhantomData<fn() -> H>,
}

impl<H: HvHal> Hypervisor<H> {
    /// Sets the hypervisor up from the system configuration blob.
    ///
    /// `frames` becomes the page pool, with the first frame at physical
    /// address `pool_base`. The root cell is built but owns no CPU until the
    /// CPUs call [`Hypervisor::cpu_entry`].
    pub fn new(config_blob: &[u8], frames: &'static mut [Frame], pool_base: HostPhysAddr) -> AxResult<Self> {
        logging::init(H::console_write, H::current_cpu_id, logging::default_level());
        let config = SystemConfig::parse(config_blob)?;
        if !H::has_virtualization() {
            return ax_err!(Unsupported, "virtualization extensions not available");
        }

        let mut pool = PagePool::new(frames, pool_base);
        let chip = irqchip::probe::<H>(&config.platform)?;

        let mut hv_mm = PageTable::<HypStage1>::new(&mut pool)?;
        let hv_mem = &config.hypervisor_memory;
        hv_mm.map(
            &mut pool,
            hv_mem.phys_start.as_usize(),
            hv_mem.phys_start,
            hv_mem.size,
            MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE,
        )?;
        for region in chip.device_regions() {
            hv_mm.map(
                &mut pool,
                region.phys_start.as_usize(),
                region.phys_start,
                region.size,
                region.flags,
            )?;
        }

        let root_config = config.root_cell.clone();
        for region in root_config.mem_regions.iter() {
            if chip.overlaps_trapped(region.phys_start, region.size)
                || chip.overlaps_trapped(HostPhysAddr::from(region.virt_start.as_usize()), region.size)
            {
                warn!("root cell region {:?} covers the interrupt controller", region);
                return ax_err!(InvalidInput, "root cell maps interrupt controller registers");
            }
        }
        let cpu_count = root_config.cpu_set.last().map_or(0, |last| last + 1);
        let root = Cell::new(
            ROOT_CELL_ID,
            root_config,
            &chip.cell_regions(),
            config.platform.gicd_base,
            &mut pool,
        )?;
        trap_mailbox(&config, &root, &mut pool)?;
        chip.init()?;

        info!(
            "hypervisor set up: {} CPUs, page pool {} pages ({} used)",
            cpu_count,
            pool.size(),
            pool.used()
        );
        let root = Arc::new(root);
        Ok(Self {
            config,
            pool: Mutex::new(pool),
            hv_mm: Mutex::new(hv_mm),
            chip,
            cpus: PerCpuTable::new(cpu_count),
            cells: Mutex::new(vec![root.clone()]),
            root,
            enabled: AtomicBool::new(false),
            entered: AtomicU64::new(0),
            _hal: PhantomData,
        })
    }

    /// Takes CPU `cpu_id` into the root cell. Each CPU of the root cell calls
    /// it once, on itself; the hypervisor is enabled after the last one.
    pub fn cpu_entry(&self, cpu_id: usize, host_regs: &GuestRegs) -> AxResult {
        if !self.root.config().cpu_set.contains(cpu_id) {
            return ax_err!(InvalidInput, "CPU is not part of the root cell");
        }
        let cpu = self.cpu(cpu_id)?;
        cpu.init(host_regs)?;
        cpu.with_state_transition(CpuState::Offline, CpuState::Running, || {
            self.chip.cpu_init(cpu)?;
            cpu.set_cell(Some(self.root.clone()));
            self.root.add_cpu(cpu_id);
            activate_cell::<H>(&self.root);
            Ok(())
        })?;
        debug!("CPU {} entered the root cell", cpu_id);

        let mut mask = CpuMask::empty();
        mask.insert(cpu_id);
        let entered = self.entered.fetch_or(mask.bits(), Ordering::AcqRel) | mask.bits();
        if entered == self.root.config().cpu_set.bits() {
            self.chip.cell_init(&self.root);
            self.root.set_state::<H>(CellState::Running);
            self.enabled.store(true, Ordering::Release);
            info!("hypervisor enabled, root cell \"{}\" running", self.root.name());
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn root_cell(&self) -> &Arc<Cell> {
        &self.root
    }

    pub fn irqchip(&self) -> &dyn IrqChip {
        &*self.chip
    }

    pub fn cpus(&self) -> &PerCpuTable {
        &self.cpus
    }

    /// Physical address of the hypervisor's own stage-1 table.
    pub fn hv_page_table_root(&self) -> HostPhysAddr {
        self.hv_mm.lock().root()
    }

    pub(crate) fn cpu(&self, cpu_id: usize) -> AxResult<&PerCpu> {
        self.cpus
            .get(cpu_id)
            .ok_or_else(|| ax_err_type!(InvalidInput, "no such CPU"))
    }

    /// Checks that `caller` may run a management operation.
    fn management_cpu(&self, caller: usize) -> AxResult<&PerCpu> {
        if !self.is_enabled() {
            return ax_err!(BadState, "hypervisor is not enabled");
        }
        let cpu = self.cpu(caller)?;
        if !self.root.cpu_set().contains(caller) {
            return ax_err!(PermissionDenied, "management call from outside the root cell");
        }
        Ok(cpu)
    }

    /// Takes the management lock. A busy lock is reported instead of waited
    /// for: the holder may be about to park the caller.
    fn lifecycle(&self) -> AxResult<MutexGuard<'_, Vec<Arc<Cell>>>> {
        self.cells
            .try_lock()
            .ok_or_else(|| ax_err_type!(ResourceBusy, "another management operation is running"))
    }

    fn find_cell(cells: &[Arc<Cell>], id: u32) -> AxResult<Arc<Cell>> {
        if id == ROOT_CELL_ID {
            return ax_err!(InvalidInput, "the root cell cannot be managed");
        }
        cells
            .iter()
            .find(|cell| cell.id() == id)
            .cloned()
            .ok_or_else(|| ax_err_type!(NotFound, "no such cell"))
    }

    /// Creates a cell from a serialized configuration. The new cell owns its
    /// CPUs, memory and interrupt lines, and is [`CellState::ShutDown`].
    pub fn create_cell(&self, caller: usize, config_blob: &[u8]) -> AxResult<u32> {
        let config = CellConfig::parse(config_blob)?;
        self.create_cell_with(caller, config)
    }

    /// Creates a cell from a decoded configuration.
    pub fn create_cell_with(&self, caller: usize, config: CellConfig) -> AxResult<u32> {
        self.management_cpu(caller)?;
        let mut cells = self.lifecycle()?;
        self.check_new_cell(caller, &cells, &config)?;
        let id = (1..=MAX_CELL_ID)
            .find(|id| cells.iter().all(|cell| cell.id() != *id))
            .ok_or_else(|| ax_err_type!(NoMemory, "cell ids exhausted"))?;

        let parked = self.park_cpus(caller, self.root.cpu_set())?;
        let cell = match self.build_cell(id, config) {
            Ok(cell) => Arc::new(cell),
            Err(err) => {
                self.resume_cpus(parked);
                return Err(err);
            }
        };

        for cpu in self.cpus.select(cell.config().cpu_set) {
            self.root.remove_cpu(cpu.id());
            cell.add_cpu(cpu.id());
            cpu.set_cell(Some(cell.clone()));
            cpu.set_awaiting_entry(false);
            cpu.stats().reset();
        }
        for irq in cell.irq_lines().iter() {
            self.root.irq_lines().remove(irq);
        }
        self.chip.cell_init(&cell);
        cells.push(cell.clone());
        self.config_commit(caller, &self.root);

        // The CPUs of the new cell stay parked until it is started.
        self.resume_cpus(parked.difference(cell.cpu_set()));
        info!(
            "created cell {} \"{}\" on CPUs {:?}",
            id,
            cell.name(),
            cell.cpu_set()
        );
        Ok(id)
    }

    /// Checks a new cell against the live system. Runs before anything is
    /// changed.
    fn check_new_cell(&self, caller: usize, cells: &[Arc<Cell>], config: &CellConfig) -> AxResult {
        config.validate()?;
        if cells.iter().any(|cell| cell.name() == config.name) {
            return ax_err!(AlreadyExists, "cell name already in use");
        }
        if !config.cpu_set.is_subset(self.root.cpu_set()) {
            return ax_err!(ResourceBusy, "CPU not owned by the root cell");
        }
        if config.cpu_set.contains(caller) {
            return ax_err!(ResourceBusy, "the calling CPU cannot be handed over");
        }
        if self.cpus.select(config.cpu_set).any(|cpu| cpu.is_failed()) {
            return ax_err!(BadState, "CPU failed");
        }

        let gicd = self.config.platform.gicd_base;
        for chip in config.irqchips.iter().filter(|chip| chip.address == gicd) {
            if let Some(irq) = chip.lines().find(|&irq| !self.root.owns_irq(irq)) {
                warn!("interrupt line {} is not owned by the root cell", irq);
                return ax_err!(ResourceBusy, "interrupt line not owned by the root cell");
            }
        }

        let others = cells.iter().filter(|cell| !cell.is_root());
        let foreign: Vec<_> = others
            .flat_map(|cell| cell.config().mem_regions.iter())
            .filter(|region| !region.flags.contains(MemFlags::COMM_REGION))
            .collect();
        let own = config
            .mem_regions
            .iter()
            .filter(|region| !region.flags.contains(MemFlags::COMM_REGION));
        for region in own {
            if foreign.iter().any(|other| region.phys_overlap(other).is_some()) {
                warn!("region {:?} overlaps another cell", region);
                return ax_err!(ResourceBusy, "memory region used by another cell");
            }
            if region.phys_overlap(&self.config.hypervisor_memory).is_some() {
                return ax_err!(InvalidInput, "memory region overlaps the hypervisor");
            }
        }
        for region in config.mem_regions.iter() {
            let virt = HostPhysAddr::from(region.virt_start.as_usize());
            let phys_trapped = !region.flags.contains(MemFlags::COMM_REGION)
                && self.chip.overlaps_trapped(region.phys_start, region.size);
            if phys_trapped || self.chip.overlaps_trapped(virt, region.size) {
                warn!("region {:?} covers interrupt controller registers", region);
                return ax_err!(InvalidInput, "memory region covers the interrupt controller");
            }
        }
        Ok(())
    }

    /// Builds the tables of a new cell and cedes its memory from the root
    /// cell. Undoes everything on error.
    fn build_cell(&self, id: u32, config: CellConfig) -> AxResult<Cell> {
        let mut pool = self.pool.lock();
        let cell = Cell::new(
            id,
            config,
            &self.chip.cell_regions(),
            self.config.platform.gicd_base,
            &mut pool,
        )?;
        let shared = self.root.shared_ranges(cell.config());
        let result = trap_mailbox(&self.config, &cell, &mut pool)
            .and_then(|_| cell.init_comm_page::<H>())
            .and_then(|_| self.root.unmap_ranges(&shared, &mut pool));
        if let Err(err) = result {
            if let Err(remap) = self.root.map_ranges(&shared, &mut pool) {
                error!("cannot restore root cell memory: {:?}", remap);
            }
            cell.release(&mut pool);
            return Err(err);
        }
        Ok(cell)
    }

    /// Marks the cell loadable: its CPUs are parked and its state is reset to
    /// [`CellState::ShutDown`] until it is started again.
    pub fn set_loadable(&self, caller: usize, id: u32) -> AxResult {
        self.management_cpu(caller)?;
        let cells = self.lifecycle()?;
        let cell = Self::find_cell(&cells, id)?;
        self.park_cpus(caller, cell.cpu_set())?;
        cell.set_state::<H>(CellState::ShutDown);
        cell.set_loadable(true);
        debug!("cell {} is loadable", id);
        Ok(())
    }

    /// Copies `images` into the memory of a loadable cell. Nothing is copied
    /// unless every image fits a writable, loadable region.
    pub fn cell_load(&self, caller: usize, id: u32, images: &[LoadImage]) -> AxResult {
        self.management_cpu(caller)?;
        let cells = self.lifecycle()?;
        let cell = Self::find_cell(&cells, id)?;
        if !cell.is_loadable() {
            return ax_err!(BadState, "cell is not loadable");
        }

        let mut targets = Vec::with_capacity(images.len());
        for image in images {
            let region = check_load_target(cell.region_covering(image.target, image.data.len()))?;
            let offset = image.target.as_usize() - region.virt_start.as_usize();
            targets.push(HostPhysAddr::from(region.phys_start.as_usize() + offset));
        }
        for (image, target) in images.iter().zip(targets) {
            H::write_phys(target, image.data)?;
            debug!(
                "cell {}: loaded {:#x} bytes at {:#x}",
                id,
                image.data.len(),
                image.target.as_usize()
            );
        }
        Ok(())
    }

    /// Resets every CPU of the cell into its guest at the configured reset
    /// address.
    pub fn start_cell(&self, caller: usize, id: u32) -> AxResult {
        self.management_cpu(caller)?;
        let cells = self.lifecycle()?;
        let cell = Self::find_cell(&cells, id)?;
        self.park_cpus(caller, cell.cpu_set())?;

        let loadable = cell
            .config()
            .mem_regions
            .iter()
            .filter(|region| region.flags.contains(MemFlags::LOADABLE));
        for region in loadable {
            H::flush_dcache_range(region.phys_start, region.size);
        }
        cell.set_loadable(false);
        cell.set_state::<H>(CellState::Running);

        for cpu in self.cpus.select(cell.cpu_set()).filter(|cpu| !cpu.is_failed()) {
            cpu.stats().reset();
            let _guard = cpu.control_lock();
            cpu.set_awaiting_entry(false);
            cpu.set_reset_pending(true);
            cpu.request_stop(false);
        }
        H::send_event();
        info!("started cell {} \"{}\"", id, cell.name());
        Ok(())
    }

    /// Destroys a cell and hands its CPUs, memory and interrupt lines back to
    /// the root cell. The returned CPUs stay off until the root cell starts
    /// them again.
    pub fn destroy_cell(&self, caller: usize, id: u32) -> AxResult {
        self.management_cpu(caller)?;
        let mut cells = self.lifecycle()?;
        let cell = Self::find_cell(&cells, id)?;
        let parked = self.park_cpus(caller, cell.cpu_set().union(self.root.cpu_set()))?;

        let returned = self.teardown_cell(&cell);
        cells.retain(|other| other.id() != id);
        self.config_commit(caller, &self.root);
        self.resume_cpus(parked.difference(returned));
        info!("destroyed cell {} \"{}\"", id, cell.name());
        Ok(())
    }

    /// Returns the resources of a parked cell to the root cell. Returns the
    /// CPUs handed back.
    fn teardown_cell(&self, cell: &Arc<Cell>) -> CpuMask {
        self.chip.cell_exit(cell, &self.root);
        let returned = cell.cpu_set();
        for cpu in self.cpus.select(returned) {
            cell.remove_cpu(cpu.id());
            self.root.add_cpu(cpu.id());
            cpu.set_cell(Some(self.root.clone()));
            cpu.pending.lock().clear();
            if cpu.is_failed() {
                continue;
            }
            let _guard = cpu.control_lock();
            cpu.set_reset_pending(false);
            cpu.set_awaiting_entry(true);
            cpu.request_stop(false);
        }
        for irq in cell.irq_lines().iter() {
            self.root.irq_lines().insert(irq);
        }

        let shared = self.root.shared_ranges(cell.config());
        let mut pool = self.pool.lock();
        cell.release(&mut pool);
        if let Err(err) = self.root.map_ranges(&shared, &mut pool) {
            error!("cannot hand memory of cell {} back: {:?}", cell.id(), err);
        }
        cell.set_state::<H>(CellState::ShutDown);
        returned
    }

    /// Shuts the hypervisor down: destroys every non-root cell and makes each
    /// CPU leave hypervisor mode when it is released. The caller leaves on
    /// return from the hypercall.
    pub fn disable(&self, caller: usize) -> AxResult {
        self.management_cpu(caller)?;
        let mut cells = self.lifecycle()?;
        let all = self.cpus.iter().fold(CpuMask::empty(), |mut mask, cpu| {
            mask.insert(cpu.id());
            mask
        });
        self.park_cpus(caller, all)?;

        for cell in cells.iter().filter(|cell| !cell.is_root()) {
            self.teardown_cell(cell);
        }
        cells.retain(|cell| cell.is_root());
        self.enabled.store(false, Ordering::Release);
        self.root.set_state::<H>(CellState::ShutDown);

        // Freed frames keep their contents: the CPUs still leaving run on
        // these tables, and a disabled hypervisor allocates nothing.
        {
            let mut pool = self.pool.lock();
            self.root.release(&mut pool);
            self.hv_mm.lock().destroy(&mut pool);
            debug!("page pool released, {} pages still in use", pool.used());
        }

        for cpu in self.cpus.iter().filter(|cpu| !cpu.is_failed()) {
            let _guard = cpu.control_lock();
            cpu.set_shutdown(true);
            cpu.request_stop(false);
        }
        H::send_event();
        info!("hypervisor disabled");
        Ok(())
    }

    /// Stops the CPUs in `mask`, except `caller` and failed CPUs, and waits
    /// for each to acknowledge.
    ///
    /// Returns the CPUs this call stopped; CPUs that were held already are
    /// left out. If a CPU misses its deadline it is marked failed, the other
    /// CPUs are let go again and the call fails.
    pub(crate) fn park_cpus(&self, caller: usize, mask: CpuMask) -> AxResult<CpuMask> {
        let mut requested = CpuMask::empty();
        let mut signal = CpuMask::empty();
        let targets = self
            .cpus
            .select(mask)
            .filter(|cpu| cpu.id() != caller && !cpu.is_failed());
        for cpu in targets {
            let _guard = cpu.control_lock();
            if cpu.stop_requested() {
                continue;
            }
            cpu.request_stop(true);
            requested.insert(cpu.id());
            if !cpu.is_stopped() {
                signal.insert(cpu.id());
            }
        }
        if signal.is_empty() {
            return Ok(requested);
        }

        self.chip.send_sgi(&Sgi {
            targets: signal,
            id: SGI_CPU_OFF,
        });
        for cpu in self.cpus.select(signal) {
            if !wait_stopped::<H>(cpu) {
                error!("CPU {} did not park within its deadline", cpu.id());
                self.fail_cpu(cpu);
                let mut others = requested;
                others.remove(cpu.id());
                self.resume_cpus(others);
                return ax_err!(BadState, "CPU failed to park");
            }
        }
        trace!("parked CPUs {:?}", requested);
        Ok(requested)
    }

    /// Lets the CPUs in `mask` leave their wait loop.
    pub(crate) fn resume_cpus(&self, mask: CpuMask) {
        if mask.is_empty() {
            return;
        }
        for cpu in self.cpus.select(mask) {
            let _guard = cpu.control_lock();
            cpu.request_stop(false);
        }
        H::send_event();
    }

    /// Marks `cpu` failed and degrades its cell.
    pub(crate) fn fail_cpu(&self, cpu: &PerCpu) {
        cpu.mark_failed();
        let Some(cell) = cpu.cell() else {
            return;
        };
        let alive = self.cpus.select(cell.cpu_set()).any(|cpu| !cpu.is_failed());
        let state = match (alive, cell.state()) {
            (false, _) => CellState::Failed,
            (true, CellState::ShutDown) => CellState::ShutDown,
            (true, _) => CellState::RunningDegraded,
        };
        warn!("CPU {} failed, cell {} is now {:?}", cpu.id(), cell.id(), state);
        cell.set_state::<H>(state);
    }

    /// Publishes a change of the stage-2 tables of `cell`: the other CPUs of
    /// the cell flush their TLB before they enter the guest again, the
    /// caller flushes right away.
    fn config_commit(&self, caller: usize, cell: &Cell) {
        for cpu in self.cpus.select(cell.cpu_set()) {
            if cpu.id() == caller {
                H::flush_tlb_local();
            } else {
                cpu.mark_pages_dirty();
            }
        }
    }

    /// Whether CPU `cpu_id` has to stay in its wait loop.
    pub fn cpu_must_wait(&self, cpu_id: usize) -> bool {
        self.cpus.get(cpu_id).is_some_and(|cpu| {
            let _guard = cpu.control_lock();
            must_wait(cpu)
        })
    }

    /// Parks the calling CPU after it acknowledged a stop request or switched
    /// itself off.
    pub(crate) fn park_self(&self, cpu: &PerCpu, switch_off: bool) -> ExitAction {
        let _guard = cpu.control_lock();
        if switch_off {
            cpu.set_awaiting_entry(true);
        }
        cpu.set_stopped(true);
        cpu.set_state(CpuState::Parked);
        ExitAction::Park
    }

    /// Called by a parked CPU once [`Hypervisor::cpu_must_wait`] returned
    /// false. Decides how the CPU continues and prepares `regs` for it.
    pub fn cpu_release(&self, cpu_id: usize, regs: &mut GuestRegs) -> ExitAction {
        let Some(cpu) = self.cpus.get(cpu_id) else {
            return ExitAction::Halt;
        };
        {
            let _guard = cpu.control_lock();
            if must_wait(cpu) {
                return ExitAction::Park;
            }
            cpu.set_stopped(false);
        }

        if cpu.is_shutting_down() {
            return self.shutdown_cpu(cpu);
        }
        let Some(cell) = cpu.cell() else {
            return ExitAction::Halt;
        };
        if cpu.take_reset_pending() {
            return self.reset_cpu(cpu, &cell, cell.config().cpu_reset_address, regs);
        }
        if cpu.is_awaiting_entry() {
            if let Some(entry) = cpu.posted_entry() {
                cpu.set_awaiting_entry(false);
                return self.reset_cpu(cpu, &cell, entry, regs);
            }
        }
        self.enter_guest(cpu)
    }

    /// Finishes an exit that returns to the guest.
    pub(crate) fn enter_guest(&self, cpu: &PerCpu) -> ExitAction {
        if cpu.take_pages_dirty() {
            H::flush_tlb_local();
        }
        cpu.set_state(CpuState::Running);
        ExitAction::Resume
    }

    /// Enters the cell of `cpu` at `entry` with an empty register file.
    fn reset_cpu(&self, cpu: &PerCpu, cell: &Cell, entry: GuestPhysAddr, regs: &mut GuestRegs) -> ExitAction {
        self.chip.cpu_reset(cpu, false);
        activate_cell::<H>(cell);
        cpu.take_pages_dirty();
        *regs = GuestRegs {
            pc: entry.as_usize() as u64,
            spsr: RESET_SPSR,
            ..GuestRegs::default()
        };
        cpu.set_state(CpuState::Running);
        debug!("CPU {} enters cell {} at {:#x}", cpu.id(), cell.id(), entry.as_usize());
        ExitAction::Reset { entry }
    }

    /// Hands the calling CPU back to the host.
    pub(crate) fn shutdown_cpu(&self, cpu: &PerCpu) -> ExitAction {
        self.chip.cpu_reset(cpu, true);
        H::deactivate_stage2();
        cpu.set_state(CpuState::Offline);
        if cpu.is_awaiting_entry() && cpu.posted_entry().is_none() {
            // The host considers this CPU off.
            return ExitAction::Halt;
        }
        ExitAction::ReturnToHost
    }

    pub fn pool_size(&self) -> usize {
        self.pool.lock().size()
    }

    pub fn pool_used(&self) -> usize {
        self.pool.lock().used()
    }

    /// Number of live cells, the root cell included.
    pub fn num_cells(&self) -> AxResult<usize> {
        Ok(self.lifecycle()?.len())
    }

    /// Ids of the live cells.
    pub fn cell_ids(&self) -> AxResult<Vec<u32>> {
        Ok(self.lifecycle()?.iter().map(|cell| cell.id()).collect())
    }

    pub fn cell_state(&self, id: u32) -> AxResult<CellState> {
        let cells = self.lifecycle()?;
        cells
            .iter()
            .find(|cell| cell.id() == id)
            .map(|cell| cell.state())
            .ok_or_else(|| ax_err_type!(NotFound, "no such cell"))
    }

    pub fn cell_info(&self, id: u32) -> AxResult<CellInfo> {
        let cells = self.lifecycle()?;
        let cell = cells
            .iter()
            .find(|cell| cell.id() == id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such cell"))?;
        let failed_cpus = self
            .cpus
            .select(cell.cpu_set())
            .filter(|cpu| cpu.is_failed())
            .fold(CpuMask::empty(), |mut mask, cpu| {
                mask.insert(cpu.id());
                mask
            });
        Ok(CellInfo {
            id,
            name: String::from(cell.name()),
            state: cell.state(),
            cpus: cell.cpu_set(),
            failed_cpus,
        })
    }

    pub fn cpu_state(&self, cpu_id: usize) -> AxResult<CpuState> {
        Ok(self.cpu(cpu_id)?.state())
    }

    pub fn cpu_stat(&self, cpu_id: usize, stat: CpuStat) -> AxResult<u32> {
        Ok(self.cpu(cpu_id)?.stats().get(stat))
    }
}

/// Installs the stage-2 table of `cell` on the calling CPU.
fn activate_cell<H: HvHal>(cell: &Cell) {
    H::activate_stage2(cell.mm.lock().root(), cell.id() as u16);
    H::flush_tlb_local();
}

fn must_wait(cpu: &PerCpu) -> bool {
    cpu.stop_requested()
        || (cpu.is_awaiting_entry() && cpu.posted_entry().is_none() && !cpu.is_shutting_down())
}

fn wait_stopped<H: HvHal>(cpu: &PerCpu) -> bool {
    for _ in 0..PARK_RETRY_BUDGET {
        if cpu.is_stopped() {
            return true;
        }
        H::cpu_relax();
    }
    cpu.is_stopped()
}

/// Removes the spin-table mailbox page from the stage-2 tables of `cell`, so
/// that accesses to it trap.
fn trap_mailbox(config: &SystemConfig, cell: &Cell, pool: &mut PagePool) -> AxResult {
    let SmpKind::SpinTable { mailbox } = config.platform.smp else {
        return Ok(());
    };
    let page = mailbox.as_usize() & !(PAGE_SIZE - 1);
    cell.mm.lock().unmap(pool, page, PAGE_SIZE)
}
