use alloc::vec::Vec;

use axerrno::{ax_err_type, AxResult};

use crate::addr::HostPhysAddr;
use crate::consts::PAGE_SIZE;

/// One page of the pool, viewed as a translation table.
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub struct Frame(pub [u64; 512]);

impl Frame {
    pub const ZERO: Frame = Frame([0; 512]);
}

/// Static page pool backing every translation table and comm page.
///
/// The frames are handed over once at enable time and never grow. Frame `i`
/// lives at physical address `base + i * PAGE_SIZE`.
pub struct PagePool {
    frames: &'static mut [Frame],
    base: HostPhysAddr,
    bitmap: Vec<u64>,
    used: usize,
}

impl PagePool {
    pub fn new(frames: &'static mut [Frame], base: HostPhysAddr) -> Self {
        let words = frames.len().div_ceil(64);
        Self {
            frames,
            base,
            bitmap: vec![0; words],
            used: 0,
        }
    }

    /// Total number of pages.
    pub fn size(&self) -> usize {
        self.frames.len()
    }

    /// Number of allocated pages.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn contains(&self, pa: HostPhysAddr) -> bool {
        self.index_of(pa).is_some()
    }

    fn index_of(&self, pa: HostPhysAddr) -> Option<usize> {
        let offset = pa.as_usize().checked_sub(self.base.as_usize())?;
        let index = offset / PAGE_SIZE;
        (offset % PAGE_SIZE == 0 && index < self.frames.len()).then_some(index)
    }

    fn is_allocated(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    /// Allocates a zeroed page.
    pub fn alloc(&mut self) -> AxResult<HostPhysAddr> {
        let index = (0..self.frames.len())
            .find(|&i| !self.is_allocated(i))
            .ok_or_else(|| ax_err_type!(NoMemory, "page pool exhausted"))?;
        self.bitmap[index / 64] |= 1 << (index % 64);
        self.used += 1;
        self.frames[index] = Frame::ZERO;
        Ok(HostPhysAddr::from(self.base.as_usize() + index * PAGE_SIZE))
    }

    pub fn free(&mut self, pa: HostPhysAddr) {
        match self.index_of(pa) {
            Some(index) if self.is_allocated(index) => {
                self.bitmap[index / 64] &= !(1 << (index % 64));
                self.used -= 1;
            }
            _ => warn!("freeing page {:?} not allocated from the pool", pa),
        }
    }

    /// The frame at `pa`, which must have been allocated from this pool.
    pub fn frame(&self, pa: HostPhysAddr) -> Option<&Frame> {
        let index = self.index_of(pa)?;
        self.is_allocated(index).then(|| &self.frames[index])
    }

    pub fn frame_mut(&mut self, pa: HostPhysAddr) -> Option<&mut Frame> {
        let index = self.index_of(pa)?;
        if !self.is_allocated(index) {
            return None;
        }
        Some(&mut self.frames[index])
    }
}

#[cfg(test)]
pub(crate) fn test_pool(pages: usize) -> PagePool {
    use alloc::boxed::Box;
    let frames: &'static mut [Frame] = Box::leak(vec![Frame::ZERO; pages].into_boxed_slice());
    PagePool::new(frames, HostPhysAddr::from(0x4000_0000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut pool = test_pool(3);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!(a.as_usize(), 0x4000_0000);
        assert_eq!(c.as_usize() - b.as_usize(), PAGE_SIZE);
        assert_eq!(pool.alloc(), Err(AxError::NoMemory));
        assert_eq!(pool.used(), 3);

        pool.free(b);
        assert_eq!(pool.used(), 2);
        assert_eq!(pool.alloc(), Ok(b));
    }

    #[test]
    fn test_alloc_returns_zeroed_frame() {
        let mut pool = test_pool(1);
        let pa = pool.alloc().unwrap();
        pool.frame_mut(pa).unwrap().0[7] = 0xdead;
        pool.free(pa);
        assert!(pool.frame(pa).is_none());
        let pa = pool.alloc().unwrap();
        assert_eq!(pool.frame(pa).unwrap().0[7], 0);
    }

    #[test]
    fn test_free_foreign_page_is_ignored() {
        let mut pool = test_pool(2);
        pool.alloc().unwrap();
        pool.free(HostPhysAddr::from(0x1000));
        pool.free(HostPhysAddr::from(0x4000_0800));
        pool.free(HostPhysAddr::from(0x4000_1000));
        assert_eq!(pool.used(), 1);
        assert!(!pool.contains(HostPhysAddr::from(0x4000_2000)));
    }
}
