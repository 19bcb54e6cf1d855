//! Decoded guest MMIO accesses and their emulation outcome.

use crate::addr::HostPhysAddr;
use crate::hal::HvHal;

/// The width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Word,
    /// 32-bit access.
    Dword,
    /// 64-bit access.
    Qword,
}

impl AccessWidth {
    /// Returns the size of the access in bytes.
    pub const fn size(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Dword => 4,
            AccessWidth::Qword => 8,
        }
    }

    pub const fn from_size(size: usize) -> Option<Self> {
        match size {
            1 => Some(AccessWidth::Byte),
            2 => Some(AccessWidth::Word),
            4 => Some(AccessWidth::Dword),
            8 => Some(AccessWidth::Qword),
            _ => None,
        }
    }

    /// Mask covering the bits transferred by an access of this width.
    pub const fn mask(self) -> u64 {
        match self {
            AccessWidth::Qword => u64::MAX,
            _ => (1u64 << (self.size() * 8)) - 1,
        }
    }
}

/// A guest access to an address that is not mapped in its stage-2 tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioAccess {
    /// Guest physical address of the access. Trapped device ranges are
    /// identity-mapped, so it is also the device's physical address.
    pub addr: usize,
    pub width: AccessWidth,
    pub is_write: bool,
    /// Value written, or value to be returned to the guest on reads.
    pub value: u64,
}

impl MmioAccess {
    pub fn read(addr: usize, width: AccessWidth) -> Self {
        Self {
            addr,
            width,
            is_write: false,
            value: 0,
        }
    }

    pub fn write(addr: usize, width: AccessWidth, value: u64) -> Self {
        Self {
            addr,
            width,
            is_write: true,
            value: value & width.mask(),
        }
    }

    /// Forwards the access to the device unchanged.
    pub fn passthrough<H: HvHal>(&mut self) {
        let paddr = HostPhysAddr::from(self.addr);
        if self.is_write {
            H::mmio_write(paddr, self.width, self.value & self.width.mask());
        } else {
            self.value = H::mmio_read(paddr, self.width) & self.width.mask();
        }
    }
}

/// Outcome of an emulation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioResult {
    /// The access was emulated; the guest may continue.
    Handled,
    /// No emulator claims the address.
    Unhandled,
    /// The address is claimed, but the access would break isolation.
    Forbidden,
}

/// Sign-extends a value loaded with an access of `width` to 64 bits.
pub const fn sign_extend(value: u64, width: AccessWidth) -> u64 {
    let bits = (width.size() * 8) as u32;
    if bits == 64 {
        return value;
    }
    let shift = 64 - bits;
    (((value << shift) as i64) >> shift) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0x80, AccessWidth::Byte), 0xffff_ffff_ffff_ff80);
        assert_eq!(sign_extend(0x7f, AccessWidth::Byte), 0x7f);
        assert_eq!(sign_extend(0x8000, AccessWidth::Word), 0xffff_ffff_ffff_8000);
        assert_eq!(sign_extend(0x8000_0000, AccessWidth::Dword), 0xffff_ffff_8000_0000);
        assert_eq!(sign_extend(0x8000_0000_0000_0000, AccessWidth::Qword), 0x8000_0000_0000_0000);
    }

    #[test]
    fn test_write_truncates_to_width() {
        let access = MmioAccess::write(0x1000, AccessWidth::Word, 0x1234_5678);
        assert_eq!(access.value, 0x5678);
        assert_eq!(AccessWidth::from_size(4), Some(AccessWidth::Dword));
        assert_eq!(AccessWidth::from_size(3), None);
    }
}
