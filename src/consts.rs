//! Compile-time limits of the hypervisor core.

pub use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// Maximum number of physical CPUs the per-CPU table can describe.
pub const MAX_CPUS: usize = 64;

/// Number of interrupt lines tracked for ownership (SGIs, PPIs and SPIs).
pub const MAX_IRQS: usize = 1024;

/// First shared peripheral interrupt; lines below it are banked per CPU.
pub const FIRST_SPI: usize = 32;

/// Capacity of each CPU's pending virtual interrupt queue.
pub const MAX_PENDING_IRQS: usize = 128;

/// Size of the hypervisor stack of each CPU.
pub const PERCPU_STACK_SIZE: usize = 4 * PAGE_SIZE;

/// Number of polls a requester spends waiting for a CPU to acknowledge a stop
/// request before the CPU is declared failed.
pub const PARK_RETRY_BUDGET: usize = 100_000;

/// Upper bound of a serialized cell configuration.
pub const MAX_CELL_CONFIG_SIZE: usize = 64 * 1024;

/// Highest cell id. The id doubles as the stage-2 VMID.
pub const MAX_CELL_ID: u32 = 0xff;

/// Length of the fixed name field of a cell descriptor, including the NUL.
pub const CELL_NAME_LEN: usize = 32;

/// Software-generated interrupt asking a CPU to run its pending injection.
pub const SGI_INJECT: u32 = 0;

/// Software-generated interrupt asking a CPU to park itself.
pub const SGI_CPU_OFF: u32 = 1;
