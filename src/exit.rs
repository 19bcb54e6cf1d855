use crate::addr::GuestPhysAddr;
use crate::mmio::{AccessWidth, MmioAccess};

/// General-purpose register file of a CPU, saved by the exception vector on
/// every exit from guest context and restored on entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GuestRegs {
    /// `x0` to `x30`.
    pub x: [u64; 31],
    /// Guest stack pointer (`SP_EL1`).
    pub sp: u64,
    /// Return address (`ELR_EL2`).
    pub pc: u64,
    /// Saved program status (`SPSR_EL2`).
    pub spsr: u64,
}

impl GuestRegs {
    /// Reads general-purpose register `index`; register 31 reads as zero.
    pub fn get(&self, index: usize) -> u64 {
        self.x.get(index).copied().unwrap_or(0)
    }

    /// Writes general-purpose register `index`; writes to register 31 are dropped.
    pub fn set(&mut self, index: usize, val: u64) {
        if let Some(reg) = self.x.get_mut(index) {
            *reg = val;
        }
    }
}

/// Syndrome information captured by the exception vector for a trap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapInfo {
    /// `ESR_EL2`.
    pub esr: u64,
    /// `FAR_EL2`, the faulting virtual address.
    pub far: u64,
    /// `HPFAR_EL2`, bits [47:12] of the faulting guest physical address.
    pub hpfar: u64,
}

/// The reason a CPU left guest context (or hypervisor context, for faults
/// taken while the hypervisor itself runs).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A physical interrupt arrived.
    Irq,
    /// A synchronous exception from the guest was routed to the hypervisor.
    Trap(TrapInfo),
    /// The hypervisor executed an undefined instruction.
    Undefined,
    /// A data abort was taken in hypervisor context.
    HypDataAbort(TrapInfo),
    /// A prefetch abort was taken in hypervisor context.
    HypPrefetchAbort(TrapInfo),
    /// An `hvc` was executed in hypervisor context.
    HypHvc,
    /// A fast interrupt arrived. They are not used.
    Fiq,
    /// The exception vector reported an unknown code.
    Unknown(u32),
}

/// What the architecture glue must do with the CPU after an exit was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Return to the guest with the (possibly modified) register file.
    Resume,
    /// Spin while [`crate::Hypervisor::cpu_must_wait`] is true, then call
    /// [`crate::Hypervisor::cpu_release`].
    Park,
    /// Reset the EL1 system state and enter the guest at `entry`. The register
    /// file has been cleared already.
    Reset { entry: GuestPhysAddr },
    /// Leave hypervisor mode and continue in the host with the register file.
    ReturnToHost,
    /// Stop the CPU for good.
    Halt,
}

/// Exception classes of `ESR_EL2` the dispatcher knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    WfiWfe,
    Hvc64,
    Smc64,
    SysReg,
    InstrAbortLower,
    DataAbortLower,
    Other(u8),
}

pub const ESR_EC_SHIFT: u64 = 26;
pub const ESR_IL: u64 = 1 << 25;
pub const ESR_ISS_MASK: u64 = (1 << 25) - 1;

// Data abort ISS fields.
const ISS_ISV: u64 = 1 << 24;
const ISS_SAS_SHIFT: u64 = 22;
const ISS_SSE: u64 = 1 << 21;
const ISS_SRT_SHIFT: u64 = 16;
const ISS_SF: u64 = 1 << 15;
const ISS_EA: u64 = 1 << 9;
const ISS_CM: u64 = 1 << 8;
const ISS_S1PTW: u64 = 1 << 7;
const ISS_WNR: u64 = 1 << 6;

impl ExceptionClass {
    pub fn from_esr(esr: u64) -> Self {
        match ((esr >> ESR_EC_SHIFT) & 0x3f) as u8 {
            0x01 => ExceptionClass::WfiWfe,
            0x16 => ExceptionClass::Hvc64,
            0x17 => ExceptionClass::Smc64,
            0x18 => ExceptionClass::SysReg,
            0x20 => ExceptionClass::InstrAbortLower,
            0x24 => ExceptionClass::DataAbortLower,
            ec => ExceptionClass::Other(ec),
        }
    }
}

/// Length of the trapped instruction.
pub fn instruction_len(esr: u64) -> u64 {
    if esr & ESR_IL != 0 {
        4
    } else {
        2
    }
}

/// A data abort syndrome decoded into an MMIO access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAbort {
    pub access: MmioAccess,
    /// Transfer register.
    pub reg: usize,
    /// Sign-extend the loaded value.
    pub sign_extend: bool,
    /// The destination is a 64-bit register.
    pub reg_64bit: bool,
}

/// Result of decoding a data abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAbortKind {
    /// An emulatable load or store.
    Mmio(DataAbort),
    /// A stage-1 walk, cache maintenance or external abort; it belongs to the
    /// guest.
    Reinject,
    /// No valid instruction syndrome.
    NoSyndrome,
}

impl DataAbortKind {
    pub fn decode(info: &TrapInfo, value_of: impl FnOnce(usize) -> u64) -> Self {
        let iss = info.esr & ESR_ISS_MASK;
        if iss & (ISS_S1PTW | ISS_EA | ISS_CM) != 0 {
            return DataAbortKind::Reinject;
        }
        if iss & ISS_ISV == 0 {
            return DataAbortKind::NoSyndrome;
        }

        let size = 1usize << ((iss >> ISS_SAS_SHIFT) & 0x3);
        let Some(width) = AccessWidth::from_size(size) else {
            return DataAbortKind::NoSyndrome;
        };
        let reg = ((iss >> ISS_SRT_SHIFT) & 0x1f) as usize;
        let addr = ((info.hpfar as usize & !0xf) << 8) | (info.far as usize & 0xfff);
        let access = if iss & ISS_WNR != 0 {
            MmioAccess::write(addr, width, value_of(reg))
        } else {
            MmioAccess::read(addr, width)
        };
        DataAbortKind::Mmio(DataAbort {
            access,
            reg,
            sign_extend: iss & ISS_SSE != 0,
            reg_64bit: iss & ISS_SF != 0,
        })
    }
}

/// A trapped `MSR`/`MRS` (exception class 0x18).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysRegAccess {
    /// op0, op2, op1, CRn and CRm packed as in the ISS.
    pub encoding: u64,
    pub reg: usize,
    pub is_read: bool,
}

/// ISS encoding (op0, op2, op1, CRn, CRm) of `ICC_SGI1R_EL1`.
pub const SYSREG_ICC_SGI1R_EL1: u64 = sysreg_iss(3, 0, 5, 12, 11);

const fn sysreg_iss(op0: u64, op1: u64, op2: u64, crn: u64, crm: u64) -> u64 {
    (op0 << 20) | (op2 << 17) | (op1 << 14) | (crn << 10) | (crm << 1)
}

impl SysRegAccess {
    pub fn decode(esr: u64) -> Self {
        let iss = esr & ESR_ISS_MASK;
        Self {
            encoding: iss & sysreg_iss(3, 7, 7, 0xf, 0xf),
            reg: ((iss >> 5) & 0x1f) as usize,
            is_read: iss & 1 != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dabt_esr(iss: u64) -> u64 {
        (0x24 << ESR_EC_SHIFT) | ESR_IL | iss
    }

    #[test]
    fn test_decode_mmio_write() {
        // str w3, [x0] at IPA 0x2c00_1104
        let info = TrapInfo {
            esr: dabt_esr(ISS_ISV | (2 << ISS_SAS_SHIFT) | (3 << ISS_SRT_SHIFT) | ISS_WNR),
            far: 0xffff_0000_0000_0104,
            hpfar: 0x2c00_1000 >> 8,
        };
        assert_eq!(ExceptionClass::from_esr(info.esr), ExceptionClass::DataAbortLower);
        let kind = DataAbortKind::decode(&info, |reg| {
            assert_eq!(reg, 3);
            0x1_ffff_ffff
        });
        let DataAbortKind::Mmio(dabt) = kind else {
            panic!("expected an MMIO access, got {:?}", kind);
        };
        assert_eq!(dabt.access.addr, 0x2c00_1104);
        assert_eq!(dabt.access.width, AccessWidth::Dword);
        assert!(dabt.access.is_write);
        assert_eq!(dabt.access.value, 0xffff_ffff);
        assert_eq!(instruction_len(info.esr), 4);
    }

    #[test]
    fn test_decode_signed_byte_read() {
        let info = TrapInfo {
            esr: dabt_esr(ISS_ISV | ISS_SSE | ISS_SF | (7 << ISS_SRT_SHIFT)),
            far: 0x3,
            hpfar: 0x1c09_0000 >> 8,
        };
        let DataAbortKind::Mmio(dabt) = DataAbortKind::decode(&info, |_| 0) else {
            panic!("expected an MMIO access");
        };
        assert_eq!(dabt.access.addr, 0x1c09_0003);
        assert_eq!(dabt.access.width, AccessWidth::Byte);
        assert!(!dabt.access.is_write);
        assert!(dabt.sign_extend && dabt.reg_64bit);
        assert_eq!(dabt.reg, 7);
    }

    #[test]
    fn test_decode_abort_without_syndrome() {
        let info = TrapInfo {
            esr: dabt_esr(0),
            ..Default::default()
        };
        assert_eq!(DataAbortKind::decode(&info, |_| 0), DataAbortKind::NoSyndrome);
        let info = TrapInfo {
            esr: dabt_esr(ISS_ISV | ISS_S1PTW),
            ..Default::default()
        };
        assert_eq!(DataAbortKind::decode(&info, |_| 0), DataAbortKind::Reinject);
    }

    #[test]
    fn test_decode_sgi1r_write() {
        let esr = (0x18 << ESR_EC_SHIFT) | ESR_IL | SYSREG_ICC_SGI1R_EL1 | (5 << 5);
        let access = SysRegAccess::decode(esr);
        assert_eq!(access.encoding, SYSREG_ICC_SGI1R_EL1);
        assert_eq!(access.reg, 5);
        assert!(!access.is_read);
    }

    #[test]
    fn test_register_31_is_zero() {
        let mut regs = GuestRegs::default();
        regs.set(31, 5);
        assert_eq!(regs.get(31), 0);
        regs.set(30, 5);
        assert_eq!(regs.get(30), 5);
    }
}
