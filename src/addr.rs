//! Address types shared by the page-table engine, the cells and the HAL.

use memory_addr::{def_usize_addr, def_usize_addr_formatter, PhysAddr, VirtAddr};

/// Host virtual address, as seen by the hypervisor itself.
pub type HostVirtAddr = VirtAddr;
/// Host physical address.
pub type HostPhysAddr = PhysAddr;

def_usize_addr! {
    /// Guest physical address (intermediate physical address on ARM).
    pub type GuestPhysAddr;
}

def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}
