use core::sync::atomic::{AtomicU32, Ordering};

/// Number of per-CPU exit counters.
pub const NUM_CPU_STATS: usize = 7;

/// Per-CPU exit-reason counters exposed to the management layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CpuStat {
    /// Every exit from guest context.
    VmexitsTotal = 0,
    /// Emulated MMIO accesses.
    VmexitsMmio = 1,
    /// Park requests received from another CPU.
    VmexitsManagement = 2,
    /// Hypercalls and firmware calls.
    VmexitsHypercall = 3,
    /// Maintenance interrupts of the virtual CPU interface.
    VmexitsMaintenance = 4,
    /// Physical interrupts forwarded to the guest.
    VmexitsVirq = 5,
    /// Guest-issued software-generated interrupts.
    VmexitsVsgi = 6,
}

impl CpuStat {
    pub const ALL: [CpuStat; NUM_CPU_STATS] = [
        CpuStat::VmexitsTotal,
        CpuStat::VmexitsMmio,
        CpuStat::VmexitsManagement,
        CpuStat::VmexitsHypercall,
        CpuStat::VmexitsMaintenance,
        CpuStat::VmexitsVirq,
        CpuStat::VmexitsVsgi,
    ];

    /// Looks a counter up by its index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            CpuStat::VmexitsTotal => "vmexits_total",
            CpuStat::VmexitsMmio => "vmexits_mmio",
            CpuStat::VmexitsManagement => "vmexits_management",
            CpuStat::VmexitsHypercall => "vmexits_hypercall",
            CpuStat::VmexitsMaintenance => "vmexits_maintenance",
            CpuStat::VmexitsVirq => "vmexits_virq",
            CpuStat::VmexitsVsgi => "vmexits_vsgi",
        }
    }
}

/// Counter block of one CPU. Only the owning CPU increments it.
pub struct CpuStats {
    counters: [AtomicU32; NUM_CPU_STATS],
}

impl CpuStats {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            counters: [ZERO; NUM_CPU_STATS],
        }
    }

    pub fn inc(&self, stat: CpuStat) {
        self.counters[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, stat: CpuStat) -> u32 {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    /// Returns all counters, indexed like [`CpuStat`].
    pub fn snapshot(&self) -> [u32; NUM_CPU_STATS] {
        let mut out = [0; NUM_CPU_STATS];
        for (slot, counter) in out.iter_mut().zip(self.counters.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        out
    }

    pub fn reset(&self) {
        for counter in self.counters.iter() {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for CpuStats {
    fn default() -> Self {
        Self::new()
    }
}
