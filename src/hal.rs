use axerrno::AxResult;

use crate::addr::{HostPhysAddr, HostVirtAddr};
use crate::mmio::AccessWidth;

/// System registers the core programs through the HAL.
///
/// Only the registers of the interrupt controller's system-register interface
/// and the EL1 exception state needed to re-inject aborts are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SysReg {
    IccIar1El1,
    IccEoir1El1,
    IccDirEl1,
    IccSgi1rEl1,
    IccCtlrEl1,
    IccPmrEl1,
    IccIgrpen1El1,
    IchHcrEl2,
    IchVtrEl2,
    IchVmcrEl2,
    IchElsrEl2,
    /// List register `n` of the virtual CPU interface.
    IchLrEl2(usize),
    /// Active priorities group 1 register `n`.
    IchAp1rEl2(usize),
    VbarEl1,
    ElrEl1,
    SpsrEl1,
    EsrEl1,
    FarEl1,
}

/// The interfaces which the underlying platform (boot code and architecture
/// glue) must implement.
///
/// All functions act on the physical CPU that calls them.
pub trait HvHal: 'static {
    /// Converts a hypervisor virtual address to a host physical address.
    ///
    /// # Parameters
    ///
    /// * `vaddr` - The virtual address to convert.
    ///
    /// # Returns
    ///
    /// * `HostPhysAddr` - The corresponding physical address.
    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr;

    /// Returns the id of the executing physical CPU.
    fn current_cpu_id() -> usize;

    /// Reads a device register.
    fn mmio_read(paddr: HostPhysAddr, width: AccessWidth) -> u64;

    /// Writes a device register.
    fn mmio_write(paddr: HostPhysAddr, width: AccessWidth, val: u64);

    /// Reads a system register.
    fn read_sysreg(reg: SysReg) -> u64;

    /// Writes a system register.
    fn write_sysreg(reg: SysReg, val: u64);

    /// Copies `src` into physical memory starting at `dst`.
    fn write_phys(dst: HostPhysAddr, src: &[u8]) -> AxResult;

    /// Copies physical memory starting at `src` into `dst`.
    fn read_phys(src: HostPhysAddr, dst: &mut [u8]) -> AxResult;

    /// Installs a stage-2 translation table for the current CPU.
    ///
    /// # Parameters
    ///
    /// * `root` - Physical address of the level-0 table.
    /// * `vmid` - The VMID tagging the TLB entries of this table.
    fn activate_stage2(root: HostPhysAddr, vmid: u16);

    /// Turns stage-2 translation off on the current CPU.
    fn deactivate_stage2();

    /// Invalidates all stage-1 and stage-2 TLB entries of the current VMID.
    fn flush_tlb_local();

    /// Cleans and invalidates the data cache over a physical range.
    fn flush_dcache_range(_paddr: HostPhysAddr, _size: usize) {}

    /// Busy-wait hint used while polling another CPU.
    fn cpu_relax() {
        core::hint::spin_loop();
    }

    /// Wakes CPUs waiting for an event.
    fn send_event() {}

    /// Whether the CPU implements the virtualization extensions.
    fn has_virtualization() -> bool {
        true
    }

    /// Writes a string to the hypervisor console.
    fn console_write(_s: &str) {}
}
