//! Exit dispatch: physical interrupts, guest traps and fatal exits.

use crate::cell::Cell;
use crate::config::SmpKind;
use crate::control::{Hypervisor, RESET_SPSR};
use crate::exit::*;
use crate::hal::{HvHal, SysReg};
use crate::irqchip::{self, GicVersion, IrqContext};
use crate::mmio::{sign_extend, MmioAccess, MmioResult};
use crate::percpu::{this_cpu_id, set_this_cpu_id, PerCpu};
use crate::smp::{self, PsciCall, PsciOutcome, PSCI_NOT_SUPPORTED};
use crate::stats::CpuStat;

/// Exception vector offsets from `VBAR_EL1`.
const VECTOR_CURRENT_EL_SPX_SYNC: u64 = 0x200;
const VECTOR_LOWER_EL_SYNC: u64 = 0x400;

const EC_DABT_LOWER: u64 = 0x24;
const EC_DABT_CURRENT: u64 = 0x25;

/// `SPSR.M[3:0]` of a guest running at EL0.
const SPSR_MODE_MASK: u64 = 0xf;
const SPSR_MODE_EL0T: u64 = 0;

impl<H: HvHal> Hypervisor<H> {
    /// Entry of the boot glue on each CPU of the root cell.
    pub fn arch_entry(&self, cpu_id: usize, host_regs: &GuestRegs) -> axerrno::AxResult {
        // SAFETY: the boot glue set the per-CPU area of this CPU up, and calls
        // this function on CPU `cpu_id`.
        unsafe { set_this_cpu_id(cpu_id) };
        self.cpu_entry(cpu_id, host_regs)
    }

    /// Entry of the exception vector on every exit of the calling CPU.
    pub fn arch_handle_exit(&self, regs: &mut GuestRegs, reason: ExitReason) -> ExitAction {
        self.handle_exit(this_cpu_id(), regs, reason)
    }

    /// Handles an exit of CPU `cpu_id` and tells the glue how to continue.
    pub fn handle_exit(&self, cpu_id: usize, regs: &mut GuestRegs, reason: ExitReason) -> ExitAction {
        let Some(cpu) = self.cpus.get(cpu_id) else {
            error!("exit on unknown CPU {}", cpu_id);
            return ExitAction::Halt;
        };
        let Some(cell) = cpu.cell() else {
            error!("exit on CPU {} outside any cell", cpu_id);
            return ExitAction::Halt;
        };
        cpu.stats().inc(CpuStat::VmexitsTotal);

        match reason {
            ExitReason::Irq => {
                let ctx = IrqContext {
                    cpu,
                    cell: &cell,
                    cpus: &self.cpus,
                };
                if irqchip::handle_irq(&*self.chip, &ctx) && cpu.stop_requested() {
                    return self.park_self(cpu, false);
                }
                self.enter_guest(cpu)
            }
            ExitReason::Trap(info) => self.handle_trap(cpu, &cell, regs, &info),
            reason => self.fatal(cpu, &cell, regs, &reason),
        }
    }

    fn handle_trap(&self, cpu: &PerCpu, cell: &Cell, regs: &mut GuestRegs, info: &TrapInfo) -> ExitAction {
        match ExceptionClass::from_esr(info.esr) {
            ExceptionClass::WfiWfe => {
                skip_instruction(regs, info);
                self.enter_guest(cpu)
            }
            ExceptionClass::Hvc64 => {
                cpu.stats().inc(CpuStat::VmexitsHypercall);
                // The return address already points past the `hvc`.
                if smp::is_psci_call(regs.get(0)) {
                    self.handle_psci(cpu, cell, regs)
                } else {
                    self.handle_hypercall(cpu, cell, regs)
                }
            }
            ExceptionClass::Smc64 => {
                cpu.stats().inc(CpuStat::VmexitsHypercall);
                skip_instruction(regs, info);
                self.handle_psci(cpu, cell, regs)
            }
            ExceptionClass::SysReg => self.handle_sysreg(cpu, cell, regs, info),
            ExceptionClass::DataAbortLower => self.handle_data_abort(cpu, cell, regs, info),
            ExceptionClass::InstrAbortLower | ExceptionClass::Other(_) => {
                self.fatal(cpu, cell, regs, &ExitReason::Trap(*info))
            }
        }
    }

    fn handle_psci(&self, cpu: &PerCpu, cell: &Cell, regs: &mut GuestRegs) -> ExitAction {
        let Some(call) = PsciCall::decode(regs) else {
            regs.set(0, PSCI_NOT_SUPPORTED as u64);
            return self.enter_guest(cpu);
        };
        match smp::handle_psci::<H>(&self.cpus, cell, cpu, call) {
            PsciOutcome::Return(value) => {
                regs.set(0, value as u64);
                self.enter_guest(cpu)
            }
            PsciOutcome::Off => self.park_self(cpu, true),
        }
    }

    fn handle_sysreg(&self, cpu: &PerCpu, cell: &Cell, regs: &mut GuestRegs, info: &TrapInfo) -> ExitAction {
        let access = SysRegAccess::decode(info.esr);
        if access.encoding != SYSREG_ICC_SGI1R_EL1 || access.is_read || self.chip.version() != GicVersion::V3 {
            return self.fatal(cpu, cell, regs, &ExitReason::Trap(*info));
        }
        let sgi = irqchip::decode_sgi1r(regs.get(access.reg));
        let ctx = IrqContext {
            cpu,
            cell,
            cpus: &self.cpus,
        };
        irqchip::handle_guest_sgi(&*self.chip, &ctx, &sgi);
        skip_instruction(regs, info);
        self.enter_guest(cpu)
    }

    fn handle_data_abort(&self, cpu: &PerCpu, cell: &Cell, regs: &mut GuestRegs, info: &TrapInfo) -> ExitAction {
        let mut dabt = match DataAbortKind::decode(info, |reg| regs.get(reg)) {
            DataAbortKind::Mmio(dabt) => dabt,
            DataAbortKind::Reinject => {
                reinject_data_abort::<H>(regs, info);
                return self.enter_guest(cpu);
            }
            DataAbortKind::NoSyndrome => {
                error!("CPU {}: data abort without instruction syndrome", cpu.id());
                return self.fatal(cpu, cell, regs, &ExitReason::Trap(*info));
            }
        };

        cpu.stats().inc(CpuStat::VmexitsMmio);
        match self.mmio_access(cpu, cell, &mut dabt.access) {
            MmioResult::Handled => {}
            result => {
                error!(
                    "cell {}: {:?} {} of {} bytes at {:#x}",
                    cell.id(),
                    result,
                    if dabt.access.is_write { "write" } else { "read" },
                    dabt.access.width.size(),
                    dabt.access.addr
                );
                return self.fatal(cpu, cell, regs, &ExitReason::Trap(*info));
            }
        }

        if !dabt.access.is_write {
            let mut value = dabt.access.value;
            if dabt.sign_extend {
                value = sign_extend(value, dabt.access.width);
            }
            if !dabt.reg_64bit {
                value &= 0xffff_ffff;
            }
            regs.set(dabt.reg, value);
        }
        skip_instruction(regs, info);
        self.enter_guest(cpu)
    }

    /// Offers `access` to the interrupt controller, then to the spin-table
    /// mailbox.
    fn mmio_access(&self, cpu: &PerCpu, cell: &Cell, access: &mut MmioAccess) -> MmioResult {
        let ctx = IrqContext {
            cpu,
            cell,
            cpus: &self.cpus,
        };
        match self.chip.mmio_access(&ctx, access) {
            MmioResult::Unhandled => {}
            result => return result,
        }
        match self.config.platform.smp {
            SmpKind::SpinTable { mailbox } => smp::mailbox_access::<H>(&self.cpus, cell, mailbox, access),
            SmpKind::Psci => MmioResult::Unhandled,
        }
    }

    /// Stops the faulting CPU for good. The rest of the system carries on.
    fn fatal(&self, cpu: &PerCpu, cell: &Cell, regs: &GuestRegs, reason: &ExitReason) -> ExitAction {
        error!(
            "CPU {} of cell {} \"{}\": fatal exit {:?}",
            cpu.id(),
            cell.id(),
            cell.name(),
            reason
        );
        error!("  pc {:#018x} sp {:#018x} spsr {:#010x}", regs.pc, regs.sp, regs.spsr);
        if let ExitReason::Trap(info) | ExitReason::HypDataAbort(info) | ExitReason::HypPrefetchAbort(info) = reason {
            error!(
                "  esr {:#010x} far {:#018x} hpfar {:#018x}",
                info.esr, info.far, info.hpfar
            );
        }
        for (i, pair) in regs.x.chunks(2).enumerate() {
            match pair {
                [a, b] => error!("  x{:<2} {:#018x} x{:<2} {:#018x}", 2 * i, a, 2 * i + 1, b),
                [a] => error!("  x{:<2} {:#018x}", 2 * i, a),
                _ => {}
            }
        }
        {
            let _guard = cpu.control_lock();
            cpu.set_stopped(true);
        }
        self.fail_cpu(cpu);
        ExitAction::Halt
    }
}

fn skip_instruction(regs: &mut GuestRegs, info: &TrapInfo) {
    regs.pc += instruction_len(info.esr);
}

/// Delivers a data abort the guest caused itself to its own vector table.
fn reinject_data_abort<H: HvHal>(regs: &mut GuestRegs, info: &TrapInfo) {
    let from_el0 = regs.spsr & SPSR_MODE_MASK == SPSR_MODE_EL0T;
    let (ec, offset) = if from_el0 {
        (EC_DABT_LOWER, VECTOR_LOWER_EL_SYNC)
    } else {
        (EC_DABT_CURRENT, VECTOR_CURRENT_EL_SPX_SYNC)
    };
    let esr = (ec << ESR_EC_SHIFT) | (info.esr & (ESR_IL | ESR_ISS_MASK));
    H::write_sysreg(SysReg::EsrEl1, esr);
    H::write_sysreg(SysReg::FarEl1, info.far);
    H::write_sysreg(SysReg::ElrEl1, regs.pc);
    H::write_sysreg(SysReg::SpsrEl1, regs.spsr);
    regs.pc = H::read_sysreg(SysReg::VbarEl1) + offset;
    regs.spsr = RESET_SPSR;
    trace!("re-injected data abort at {:#x}", info.far);
}
