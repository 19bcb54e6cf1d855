//! Secondary-CPU start-up protocols: PSCI firmware calls and the spin-table
//! mailbox.
//!
//! A CPU that is off from its cell's point of view waits in the hypervisor
//! with [`PerCpu::is_awaiting_entry`] set. Either protocol ends the wait by
//! posting a start address, after which the CPU resets into its cell there.

use crate::addr::GuestPhysAddr;
use crate::cell::Cell;
use crate::consts::PAGE_SIZE;
use crate::exit::GuestRegs;
use crate::hal::HvHal;
use crate::mmio::{AccessWidth, MmioAccess, MmioResult};
use crate::percpu::{PerCpu, PerCpuTable};

pub const PSCI_VERSION: u32 = 0x8400_0000;
pub const PSCI_CPU_OFF: u32 = 0x8400_0002;
pub const PSCI_CPU_ON_32: u32 = 0x8400_0003;
pub const PSCI_AFFINITY_INFO_32: u32 = 0x8400_0004;
pub const PSCI_CPU_ON_64: u32 = 0xc400_0003;
pub const PSCI_AFFINITY_INFO_64: u32 = 0xc400_0004;

pub const PSCI_SUCCESS: i64 = 0;
pub const PSCI_NOT_SUPPORTED: i64 = -1;
pub const PSCI_INVALID_PARAMETERS: i64 = -2;
pub const PSCI_ALREADY_ON: i64 = -4;

/// Reported PSCI version (0.2).
const PSCI_VERSION_0_2: i64 = 2;

const AFFINITY_ON: i64 = 0;
const AFFINITY_OFF: i64 = 1;

/// Affinity bits above level 0 (aff1, aff2, aff3).
const MPIDR_UPPER_AFF_MASK: u64 = 0xff_00ff_ff00;

/// Whether `fid` lies in the PSCI range of the standard secure service calls.
pub fn is_psci_call(fid: u64) -> bool {
    matches!((fid >> 24) as u32, 0x84 | 0xc4) && fid & 0x00ff_ffe0 == 0
}

/// A decoded PSCI function call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsciCall {
    Version,
    CpuOff,
    CpuOn { target: u64, entry: GuestPhysAddr },
    AffinityInfo { target: u64, level: u64 },
    Unsupported(u32),
}

impl PsciCall {
    /// Decodes the call in `x0` to `x3`. Returns `None` for function ids
    /// outside the PSCI range.
    pub fn decode(regs: &GuestRegs) -> Option<Self> {
        let fid = regs.get(0);
        if !is_psci_call(fid) {
            return None;
        }
        Some(match fid as u32 {
            PSCI_VERSION => PsciCall::Version,
            PSCI_CPU_OFF => PsciCall::CpuOff,
            PSCI_CPU_ON_32 | PSCI_CPU_ON_64 => PsciCall::CpuOn {
                target: regs.get(1),
                entry: GuestPhysAddr::from(regs.get(2) as usize),
            },
            PSCI_AFFINITY_INFO_32 | PSCI_AFFINITY_INFO_64 => PsciCall::AffinityInfo {
                target: regs.get(1),
                level: regs.get(2),
            },
            fid => PsciCall::Unsupported(fid),
        })
    }
}

/// What the calling CPU does after a PSCI call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsciOutcome {
    /// Return the value in `x0` and continue.
    Return(i64),
    /// The caller switched itself off and waits for a `CPU_ON`.
    Off,
}

/// Resolves a target affinity to a CPU of `cell`.
fn target_cpu<'a>(cpus: &'a PerCpuTable, cell: &Cell, mpidr: u64) -> Option<&'a PerCpu> {
    if mpidr & MPIDR_UPPER_AFF_MASK != 0 {
        return None;
    }
    let id = (mpidr & 0xff) as usize;
    if !cell.cpu_set().contains(id) {
        return None;
    }
    cpus.get(id)
}

/// Emulates `call` issued by `cpu`, a CPU of `cell`.
pub fn handle_psci<H: HvHal>(cpus: &PerCpuTable, cell: &Cell, cpu: &PerCpu, call: PsciCall) -> PsciOutcome {
    match call {
        PsciCall::Version => PsciOutcome::Return(PSCI_VERSION_0_2),
        PsciCall::CpuOff => {
            debug!("cell {}: CPU {} switched off", cell.id(), cpu.id());
            PsciOutcome::Off
        }
        PsciCall::CpuOn { target, entry } => {
            let Some(target) = target_cpu(cpus, cell, target) else {
                return PsciOutcome::Return(PSCI_INVALID_PARAMETERS);
            };
            let _guard = target.control_lock();
            if !target.is_awaiting_entry() || target.posted_entry().is_some() {
                return PsciOutcome::Return(PSCI_ALREADY_ON);
            }
            debug!("cell {}: CPU {} on at {:#x}", cell.id(), target.id(), entry.as_usize());
            target.post_entry(entry);
            H::send_event();
            PsciOutcome::Return(PSCI_SUCCESS)
        }
        PsciCall::AffinityInfo { target, level } => {
            if level != 0 {
                return PsciOutcome::Return(PSCI_INVALID_PARAMETERS);
            }
            match target_cpu(cpus, cell, target) {
                Some(target) if target.is_awaiting_entry() && target.posted_entry().is_none() => {
                    PsciOutcome::Return(AFFINITY_OFF)
                }
                Some(_) => PsciOutcome::Return(AFFINITY_ON),
                None => PsciOutcome::Return(PSCI_INVALID_PARAMETERS),
            }
        }
        PsciCall::Unsupported(fid) => {
            debug!("unsupported PSCI function {:#x}", fid);
            PsciOutcome::Return(PSCI_NOT_SUPPORTED)
        }
    }
}

/// Emulates an access to the trapped spin-table mailbox page of `cell`.
///
/// The mailbox word itself is emulated: a write posts the value as start
/// address to every CPU of the cell that waits for one. The rest of the page
/// is passed through where the cell's configuration covers it.
pub fn mailbox_access<H: HvHal>(
    cpus: &PerCpuTable,
    cell: &Cell,
    mailbox: GuestPhysAddr,
    access: &mut MmioAccess,
) -> MmioResult {
    let page = mailbox.as_usize() & !(PAGE_SIZE - 1);
    if !(page..page + PAGE_SIZE).contains(&access.addr) {
        return MmioResult::Unhandled;
    }
    if access.addr != mailbox.as_usize() {
        return match cell.config().region_at(access.addr) {
            Some(region) if region.phys_start.as_usize() == region.virt_start.as_usize() => {
                access.passthrough::<H>();
                MmioResult::Handled
            }
            _ => MmioResult::Unhandled,
        };
    }
    if !matches!(access.width, AccessWidth::Dword | AccessWidth::Qword) {
        return MmioResult::Forbidden;
    }

    if !access.is_write {
        access.value = cell.mailbox() & access.width.mask();
        return MmioResult::Handled;
    }
    cell.set_mailbox(access.value);
    let entry = GuestPhysAddr::from(access.value as usize);
    for cpu in cpus.select(cell.cpu_set()) {
        let _guard = cpu.control_lock();
        if cpu.is_awaiting_entry() && cpu.posted_entry().is_none() {
            debug!("cell {}: CPU {} released at {:#x}", cell.id(), cpu.id(), access.value);
            cpu.post_entry(entry);
        }
    }
    H::send_event();
    MmioResult::Handled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psci_range() {
        assert!(is_psci_call(PSCI_VERSION as u64));
        assert!(is_psci_call(PSCI_CPU_ON_64 as u64));
        assert!(!is_psci_call(0x8600_0000));
        assert!(!is_psci_call(0x8400_0100));
        assert!(!is_psci_call(5));
    }

    #[test]
    fn test_decode_cpu_on() {
        let mut regs = GuestRegs::default();
        regs.set(0, PSCI_CPU_ON_64 as u64);
        regs.set(1, 2);
        regs.set(2, 0x8008_0000);
        assert_eq!(
            PsciCall::decode(&regs),
            Some(PsciCall::CpuOn {
                target: 2,
                entry: GuestPhysAddr::from(0x8008_0000)
            })
        );
        regs.set(0, 0x8400_000a);
        assert_eq!(PsciCall::decode(&regs), Some(PsciCall::Unsupported(0x8400_000a)));
        regs.set(0, 1);
        assert_eq!(PsciCall::decode(&regs), None);
    }
}
