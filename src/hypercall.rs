//! Hypercall interface of the management driver.
//!
//! The code is passed in `x0`, arguments in `x1` and `x2`; the result (a value
//! or a negative errno) is returned in `x0`.

use core::mem::size_of;

use axerrno::{ax_err, ax_err_type, AxError, AxResult, LinuxError};
use zerocopy::FromBytes;

use crate::addr::GuestPhysAddr;
use crate::cell::Cell;
use crate::config::{CellDesc, MemFlags};
use crate::consts::{MAX_CELL_CONFIG_SIZE, PAGE_SIZE};
use crate::control::Hypervisor;
use crate::exit::{ExitAction, GuestRegs};
use crate::hal::HvHal;
use crate::percpu::PerCpu;
use crate::stats::CpuStat;

pub const HC_DISABLE: u64 = 0;
pub const HC_CELL_CREATE: u64 = 1;
pub const HC_CELL_START: u64 = 2;
pub const HC_CELL_SET_LOADABLE: u64 = 3;
pub const HC_CELL_DESTROY: u64 = 4;
pub const HC_HYPERVISOR_GET_INFO: u64 = 5;
pub const HC_CELL_GET_STATE: u64 = 6;
pub const HC_CPU_GET_INFO: u64 = 7;

pub const HC_INFO_MEM_POOL_SIZE: u64 = 0;
pub const HC_INFO_MEM_POOL_USED: u64 = 1;
pub const HC_INFO_NUM_CELLS: u64 = 4;

pub const CPU_INFO_STATE: u64 = 0;
/// Statistics counter `n` is read with info type `CPU_INFO_STAT_BASE + n`.
pub const CPU_INFO_STAT_BASE: u64 = 1000;

pub const CPU_STATE_RUNNING: i64 = 0;
pub const CPU_STATE_FAILED: i64 = 2;

/// Converts an error into the negative errno returned to the guest.
pub fn error_code(err: AxError) -> i64 {
    errno(LinuxError::from(err))
}

fn errno(err: LinuxError) -> i64 {
    -(err.code() as i64)
}

fn cell_id_arg(arg: u64) -> AxResult<u32> {
    u32::try_from(arg).map_err(|_| ax_err_type!(InvalidInput, "cell id out of range"))
}

impl<H: HvHal> Hypervisor<H> {
    /// Runs the hypercall in `regs` issued by `cpu` of `cell`.
    pub(crate) fn handle_hypercall(&self, cpu: &PerCpu, cell: &Cell, regs: &mut GuestRegs) -> ExitAction {
        let code = regs.get(0);
        let (arg1, arg2) = (regs.get(1), regs.get(2));
        trace!("CPU {}: hypercall {} ({:#x}, {:#x})", cpu.id(), code, arg1, arg2);

        let result = match code {
            HC_HYPERVISOR_GET_INFO => self.hypervisor_info(arg1),
            HC_CELL_GET_STATE => self.query_cell_state(cell, arg1),
            HC_CPU_GET_INFO => self.query_cpu_info(cell, arg1, arg2),
            _ if !cell.is_root() => {
                warn!("cell {}: management hypercall {} refused", cell.id(), code);
                Err(errno(LinuxError::EPERM))
            }
            HC_DISABLE => match self.disable(cpu.id()) {
                Ok(()) => {
                    regs.set(0, 0);
                    return self.shutdown_cpu(cpu);
                }
                Err(err) => Err(error_code(err)),
            },
            HC_CELL_CREATE => self
                .create_cell_from_guest(cpu.id(), GuestPhysAddr::from(arg1 as usize))
                .map(i64::from)
                .map_err(error_code),
            HC_CELL_START => cell_id_arg(arg1)
                .and_then(|id| self.start_cell(cpu.id(), id))
                .map(|()| 0)
                .map_err(error_code),
            HC_CELL_SET_LOADABLE => cell_id_arg(arg1)
                .and_then(|id| self.set_loadable(cpu.id(), id))
                .map(|()| 0)
                .map_err(error_code),
            HC_CELL_DESTROY => cell_id_arg(arg1)
                .and_then(|id| self.destroy_cell(cpu.id(), id))
                .map(|()| 0)
                .map_err(error_code),
            _ => {
                debug!("unknown hypercall {}", code);
                Err(errno(LinuxError::ENOSYS))
            }
        };

        let value = result.unwrap_or_else(|code| code);
        regs.set(0, value as u64);
        self.enter_guest(cpu)
    }

    fn hypervisor_info(&self, kind: u64) -> Result<i64, i64> {
        match kind {
            HC_INFO_MEM_POOL_SIZE => Ok(self.pool_size() as i64),
            HC_INFO_MEM_POOL_USED => Ok(self.pool_used() as i64),
            HC_INFO_NUM_CELLS => self.num_cells().map(|n| n as i64).map_err(error_code),
            _ => Err(errno(LinuxError::EINVAL)),
        }
    }

    /// A cell may ask about itself without the lifecycle lock. Only the root
    /// cell may ask about others.
    fn query_cell_state(&self, cell: &Cell, id: u64) -> Result<i64, i64> {
        let id = cell_id_arg(id).map_err(error_code)?;
        if id == cell.id() {
            return Ok(cell.state() as i64);
        }
        if !cell.is_root() {
            return Err(errno(LinuxError::EPERM));
        }
        self.cell_state(id).map(|state| state as i64).map_err(error_code)
    }

    fn query_cpu_info(&self, cell: &Cell, cpu_id: u64, kind: u64) -> Result<i64, i64> {
        let cpu_id = cpu_id as usize;
        let target = self.cpu(cpu_id).map_err(error_code)?;
        if !cell.is_root() && !cell.cpu_set().contains(cpu_id) {
            return Err(errno(LinuxError::EPERM));
        }
        match kind {
            CPU_INFO_STATE if target.is_failed() => Ok(CPU_STATE_FAILED),
            CPU_INFO_STATE => Ok(CPU_STATE_RUNNING),
            kind => kind
                .checked_sub(CPU_INFO_STAT_BASE)
                .and_then(|index| CpuStat::from_index(index as usize))
                .map(|stat| i64::from(target.stats().get(stat)))
                .ok_or_else(|| errno(LinuxError::EINVAL)),
        }
    }

    /// Creates a cell from a configuration the root guest placed at `gpa`.
    fn create_cell_from_guest(&self, caller: usize, gpa: GuestPhysAddr) -> AxResult<u32> {
        let mut header = [0u8; size_of::<CellDesc>()];
        self.read_root_memory(gpa, &mut header)?;
        let desc = CellDesc::read_from_bytes(&header[..])
            .map_err(|_| ax_err_type!(InvalidData, "truncated cell descriptor"))?;
        let size = desc.total_size();
        if size > MAX_CELL_CONFIG_SIZE {
            return ax_err!(InvalidInput, "cell configuration too large");
        }

        let mut blob = vec![0u8; size];
        self.read_root_memory(gpa, &mut blob)?;
        self.create_cell(caller, &blob)
    }

    /// Copies `buf.len()` bytes from guest-physical address `gpa` of the root
    /// cell, page by page.
    pub(crate) fn read_root_memory(&self, gpa: GuestPhysAddr, buf: &mut [u8]) -> AxResult {
        if gpa.as_usize().checked_add(buf.len()).is_none() {
            return ax_err!(InvalidInput, "configuration wraps the address space");
        }
        let pool = self.pool.lock();
        let mut addr = gpa.as_usize();
        let mut rest = buf;
        while !rest.is_empty() {
            let len = rest.len().min(PAGE_SIZE - addr % PAGE_SIZE);
            let (chunk, tail) = rest.split_at_mut(len);
            let (paddr, flags) = self
                .root
                .translate(&pool, GuestPhysAddr::from(addr))
                .ok_or_else(|| ax_err_type!(InvalidInput, "configuration not in root memory"))?;
            if !flags.contains(MemFlags::READ) {
                return ax_err!(InvalidInput, "configuration not readable");
            }
            H::read_phys(paddr, chunk)?;
            addr += len;
            rest = tail;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(error_code(AxError::InvalidInput), -22);
        assert_eq!(error_code(AxError::NotFound), -2);
        assert_eq!(error_code(AxError::NoMemory), -12);
        assert_eq!(error_code(AxError::AlreadyExists), -17);
        assert_eq!(error_code(AxError::ResourceBusy), -16);
        assert_eq!(errno(LinuxError::EPERM), -1);
    }

    #[test]
    fn test_cell_id_argument() {
        assert_eq!(cell_id_arg(3).ok(), Some(3));
        assert!(cell_id_arg(1 << 32).is_err());
    }
}
