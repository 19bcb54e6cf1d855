use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use axerrno::{ax_err, AxResult};
use spin::{Mutex, MutexGuard};

use crate::addr::{GuestPhysAddr, HostVirtAddr};
use crate::cell::Cell;
use crate::consts::{MAX_CPUS, PERCPU_STACK_SIZE};
use crate::exit::GuestRegs;
use crate::irqchip::pending::PendingQueue;
use crate::stats::CpuStats;

/// A set of physical CPUs, one bit per CPU id.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    pub fn insert(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.0 |= 1 << cpu;
        }
    }

    pub fn remove(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.0 &= !(1 << cpu);
        }
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_subset(self, other: CpuMask) -> bool {
        self.0 & !other.0 == 0
    }

    pub const fn union(self, other: CpuMask) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: CpuMask) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn first(self) -> Option<usize> {
        (!self.is_empty()).then(|| self.0.trailing_zeros() as usize)
    }

    pub fn last(self) -> Option<usize> {
        (!self.is_empty()).then(|| 63 - self.0.leading_zeros() as usize)
    }

    /// Iterates over the CPU ids in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(cpu)
        })
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

/// Execution state of a physical CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    /// The CPU has not entered the hypervisor yet.
    Offline = 0,
    /// The CPU executes its cell's guest.
    Running = 1,
    /// The CPU spins in the hypervisor and may be reassigned.
    Parked = 2,
    /// The CPU is being reconfigured.
    Transitioning = 3,
    /// The CPU was stopped after a fatal fault or a missed park deadline.
    Failed = 4,
}

impl CpuState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => CpuState::Offline,
            1 => CpuState::Running,
            2 => CpuState::Parked,
            3 => CpuState::Transitioning,
            _ => CpuState::Failed,
        }
    }
}

#[repr(C, align(16))]
struct HvStack([u8; PERCPU_STACK_SIZE]);

/// Value of [`PerCpu::entry`] when no start address was posted.
const NO_ENTRY: u64 = u64::MAX;

/// The hypervisor's record of one physical CPU.
///
/// All fields use interior mutability: the owning CPU, a CPU running a
/// lifecycle operation and an interrupt handler can all look at the same
/// record. The cell reference only changes while the CPU is stopped.
pub struct PerCpu {
    cpu_id: usize,
    state: AtomicU8,
    /// Stack used while the CPU runs hypervisor code.
    stack: UnsafeCell<HvStack>,
    /// Register file of the host at the time the CPU entered the hypervisor.
    host_regs: Mutex<GuestRegs>,
    cell: Mutex<Option<Arc<Cell>>>,
    pub(crate) pending: Mutex<PendingQueue>,
    stats: CpuStats,
    /// Another CPU asked this CPU to stop.
    stop_requested: AtomicBool,
    /// This CPU acknowledged a stop request and spins.
    stopped: AtomicBool,
    /// Stage-2 mappings changed; flush before entering the guest.
    pages_dirty: AtomicBool,
    /// Leave the hypervisor when released.
    shutdown: AtomicBool,
    /// Reset into the guest when released.
    reset_pending: AtomicBool,
    /// The CPU is off from its cell's point of view and waits for a start
    /// address (PSCI CPU_ON or spin-table mailbox).
    awaiting_entry: AtomicBool,
    entry: AtomicU64,
    failed: AtomicBool,
    /// Orders stop requests against the CPU leaving its wait loop.
    control_lock: Mutex<()>,
}

// SAFETY: the stack is only ever touched through the raw pointer handed to the
// architecture glue of the owning CPU. Every other field is `Sync`.
unsafe impl Sync for PerCpu {}

impl PerCpu {
    pub fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            state: AtomicU8::new(CpuState::Offline as u8),
            stack: UnsafeCell::new(HvStack([0; PERCPU_STACK_SIZE])),
            host_regs: Mutex::new(GuestRegs::default()),
            cell: Mutex::new(None),
            pending: Mutex::new(PendingQueue::new()),
            stats: CpuStats::new(),
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            pages_dirty: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            reset_pending: AtomicBool::new(false),
            awaiting_entry: AtomicBool::new(false),
            entry: AtomicU64::new(NO_ENTRY),
            failed: AtomicBool::new(false),
            control_lock: Mutex::new(()),
        }
    }

    /// Get the id of the CPU.
    pub const fn id(&self) -> usize {
        self.cpu_id
    }

    /// Initialize the record when the CPU first enters the hypervisor.
    pub fn init(&self, host_regs: &GuestRegs) -> AxResult {
        if self.state() != CpuState::Offline {
            return ax_err!(BadState, "per-CPU state is already initialized");
        }
        *self.host_regs.lock() = *host_regs;
        self.stats.reset();
        self.pending.lock().clear();
        self.failed.store(false, Ordering::Release);
        self.shutdown.store(false, Ordering::Release);
        Ok(())
    }

    /// Top of the hypervisor stack of this CPU.
    pub fn stack_top(&self) -> HostVirtAddr {
        HostVirtAddr::from(self.stack.get() as usize + PERCPU_STACK_SIZE)
    }

    /// The register snapshot taken when the CPU entered the hypervisor.
    pub fn host_regs(&self) -> GuestRegs {
        *self.host_regs.lock()
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: CpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Transition the state of the CPU. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: CpuState, to: CpuState) -> AxResult {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .or_else(|cur| {
                ax_err!(
                    BadState,
                    format!(
                        "CPU {} state is not {:?}, but {:?}",
                        self.cpu_id,
                        from,
                        CpuState::from_raw(cur)
                    )
                )
            })
    }

    /// Execute a block with the state of the CPU transitioned from `from` to `to`.
    ///
    /// The CPU is [`CpuState::Transitioning`] while the block runs. It ends up
    /// [`CpuState::Failed`] if the block returns an error.
    pub fn with_state_transition<F, T>(&self, from: CpuState, to: CpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        self.transition_state(from, CpuState::Transitioning)?;
        let result = f();
        match result {
            Ok(_) => self.set_state(to),
            Err(_) => self.mark_failed(),
        }
        result
    }

    /// The cell this CPU currently belongs to.
    pub fn cell(&self) -> Option<Arc<Cell>> {
        self.cell.lock().clone()
    }

    pub(crate) fn set_cell(&self, cell: Option<Arc<Cell>>) {
        *self.cell.lock() = cell;
    }

    pub fn stats(&self) -> &CpuStats {
        &self.stats
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
        self.set_state(CpuState::Failed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self, stop: bool) {
        self.stop_requested.store(stop, Ordering::Release);
    }

    pub(crate) fn control_lock(&self) -> MutexGuard<'_, ()> {
        self.control_lock.lock()
    }

    pub(crate) fn mark_pages_dirty(&self) {
        self.pages_dirty.store(true, Ordering::Release);
    }

    /// Clears and returns the "cell pages dirty" flag.
    pub(crate) fn take_pages_dirty(&self) -> bool {
        self.pages_dirty.swap(false, Ordering::AcqRel)
    }

    pub fn pages_dirty(&self) -> bool {
        self.pages_dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_shutdown(&self, shutdown: bool) {
        self.shutdown.store(shutdown, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn set_reset_pending(&self, reset: bool) {
        self.reset_pending.store(reset, Ordering::Release);
    }

    pub(crate) fn take_reset_pending(&self) -> bool {
        self.reset_pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_awaiting_entry(&self, awaiting: bool) {
        if awaiting {
            self.entry.store(NO_ENTRY, Ordering::Release);
        }
        self.awaiting_entry.store(awaiting, Ordering::Release);
    }

    /// Whether the CPU is off and waits for a start address.
    pub fn is_awaiting_entry(&self) -> bool {
        self.awaiting_entry.load(Ordering::Acquire)
    }

    pub(crate) fn post_entry(&self, entry: GuestPhysAddr) {
        self.entry.store(entry.as_usize() as u64, Ordering::Release);
    }

    pub(crate) fn posted_entry(&self) -> Option<GuestPhysAddr> {
        let raw = self.entry.load(Ordering::Acquire);
        (raw != NO_ENTRY).then(|| GuestPhysAddr::from(raw as usize))
    }
}

/// The per-CPU records of every CPU the hypervisor manages.
pub struct PerCpuTable {
    cpus: Box<[PerCpu]>,
}

impl PerCpuTable {
    pub fn new(count: usize) -> Self {
        let cpus: Vec<PerCpu> = (0..count.min(MAX_CPUS)).map(PerCpu::new).collect();
        Self {
            cpus: cpus.into_boxed_slice(),
        }
    }

    pub fn get(&self, cpu_id: usize) -> Option<&PerCpu> {
        self.cpus.get(cpu_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PerCpu> {
        self.cpus.iter()
    }

    /// The records of the CPUs in `mask` that exist.
    pub fn select(&self, mask: CpuMask) -> impl Iterator<Item = &PerCpu> + '_ {
        mask.iter().filter_map(move |cpu| self.get(cpu))
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }
}

#[percpu::def_percpu]
static mut CURRENT_CPU_ID: usize = 0;

/// Get the id of the physical CPU executing the caller.
///
/// Only meaningful after [`set_this_cpu_id`] ran on this CPU, which the
/// architecture entry point does before anything else.
pub fn this_cpu_id() -> usize {
    unsafe { *CURRENT_CPU_ID.current_ref_raw() }
}

/// Record the id of the physical CPU executing the caller.
///
/// # Safety
/// The per-CPU area of the calling CPU must be initialized, and `cpu_id` must
/// be the id of that CPU.
pub unsafe fn set_this_cpu_id(cpu_id: usize) {
    *CURRENT_CPU_ID.current_ref_mut_raw() = cpu_id;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_mask_ops() {
        let mut mask = CpuMask::from_bits(0b1010);
        assert!(mask.contains(1) && mask.contains(3));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(mask.first(), Some(1));
        assert_eq!(mask.last(), Some(3));
        mask.insert(0);
        mask.remove(3);
        assert_eq!(mask.bits(), 0b0011);
        assert!(mask.is_subset(CpuMask::from_bits(0xf)));
        assert!(!CpuMask::from_bits(0x10).is_subset(CpuMask::from_bits(0xf)));
        assert_eq!(CpuMask::empty().first(), None);
        assert!(!mask.contains(MAX_CPUS));
    }

    #[test]
    fn test_state_transition() {
        let cpu = PerCpu::new(2);
        assert_eq!(cpu.state(), CpuState::Offline);
        assert!(cpu.transition_state(CpuState::Running, CpuState::Parked).is_err());
        assert_eq!(cpu.state(), CpuState::Offline);

        let value = cpu
            .with_state_transition(CpuState::Offline, CpuState::Running, || {
                assert_eq!(cpu.state(), CpuState::Transitioning);
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(cpu.state(), CpuState::Running);

        let result: AxResult = cpu.with_state_transition(CpuState::Running, CpuState::Parked, || {
            Err(axerrno::AxError::NoMemory)
        });
        assert!(result.is_err());
        assert_eq!(cpu.state(), CpuState::Failed);
        assert!(cpu.is_failed());
    }

    #[test]
    fn test_init_once() {
        let cpu = PerCpu::new(0);
        let regs = GuestRegs::default();
        cpu.init(&regs).unwrap();
        cpu.set_state(CpuState::Running);
        assert_eq!(cpu.init(&regs), Err(axerrno::AxError::BadState));
    }

    #[test]
    fn test_entry_mailbox() {
        let cpu = PerCpu::new(1);
        cpu.set_awaiting_entry(true);
        assert!(cpu.is_awaiting_entry());
        assert_eq!(cpu.posted_entry(), None);
        cpu.post_entry(GuestPhysAddr::from(0x8000_0000));
        assert_eq!(cpu.posted_entry(), Some(GuestPhysAddr::from(0x8000_0000)));
        assert_eq!(cpu.stack_top().as_usize() % 16, 0);
    }
}
