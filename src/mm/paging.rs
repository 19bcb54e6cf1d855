//! Four-level, 4 KiB-granule translation tables (48-bit input addresses).
//!
//! The same walker serves the stage-2 tables of the cells and the hypervisor's
//! own stage-1 table. The two only differ in how [`MemFlags`] are encoded in a
//! leaf descriptor, which is what [`PageTableFormat`] captures.

use core::marker::PhantomData;

use axerrno::{ax_err, ax_err_type, AxResult};

use crate::addr::HostPhysAddr;
use crate::config::MemFlags;
use crate::consts::PAGE_SIZE;

use super::pool::PagePool;

const ENTRIES_PER_TABLE: usize = 512;
const LEAF_LEVEL: usize = 3;
const INPUT_LIMIT: usize = 1 << 48;

const DESC_VALID: u64 = 1 << 0;
/// Table descriptor at levels 0-2, page descriptor at level 3.
const DESC_TABLE_OR_PAGE: u64 = 0b11;
const DESC_BLOCK: u64 = 0b01;
const DESC_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;
const DESC_ATTR_MASK: u64 = !DESC_ADDR_MASK & !0b11;

const ATTR_AF: u64 = 1 << 10;
const ATTR_SH_INNER: u64 = 0b11 << 8;
const ATTR_XN: u64 = 1 << 54;

/// Encoding of access permissions and memory type in leaf descriptors.
pub trait PageTableFormat {
    fn leaf_attrs(flags: MemFlags) -> u64;
    fn flags_of(desc: u64) -> MemFlags;
}

/// Stage-2 (guest-physical to host-physical) descriptors.
pub struct Stage2;

impl Stage2 {
    const S2AP_R: u64 = 1 << 6;
    const S2AP_W: u64 = 1 << 7;
    const MEMATTR_MASK: u64 = 0b1111 << 2;
    const MEMATTR_NORMAL_WB: u64 = 0b1111 << 2;
    const MEMATTR_DEVICE_NGNRE: u64 = 0b0001 << 2;
}

impl PageTableFormat for Stage2 {
    fn leaf_attrs(flags: MemFlags) -> u64 {
        let mut attrs = ATTR_AF;
        if flags.contains(MemFlags::DMA) {
            attrs |= Self::MEMATTR_DEVICE_NGNRE;
        } else {
            attrs |= Self::MEMATTR_NORMAL_WB | ATTR_SH_INNER;
        }
        if flags.contains(MemFlags::READ) {
            attrs |= Self::S2AP_R;
        }
        if flags.contains(MemFlags::WRITE) {
            attrs |= Self::S2AP_W;
        }
        if !flags.contains(MemFlags::EXECUTE) {
            attrs |= ATTR_XN;
        }
        attrs
    }

    fn flags_of(desc: u64) -> MemFlags {
        let mut flags = MemFlags::empty();
        if desc & Self::S2AP_R != 0 {
            flags |= MemFlags::READ;
        }
        if desc & Self::S2AP_W != 0 {
            flags |= MemFlags::WRITE;
        }
        if desc & ATTR_XN == 0 {
            flags |= MemFlags::EXECUTE;
        }
        if desc & Self::MEMATTR_MASK == Self::MEMATTR_DEVICE_NGNRE {
            flags |= MemFlags::DMA;
        }
        flags
    }
}

/// Stage-1 descriptors of the hypervisor's own address space. `MAIR_EL2`
/// index 0 is normal write-back memory, index 1 is device memory.
pub struct HypStage1;

impl HypStage1 {
    const ATTR_INDX_DEVICE: u64 = 1 << 2;
    const ATTR_INDX_MASK: u64 = 0b111 << 2;
    const AP_RO: u64 = 1 << 7;
}

impl PageTableFormat for HypStage1 {
    fn leaf_attrs(flags: MemFlags) -> u64 {
        let mut attrs = ATTR_AF;
        if flags.contains(MemFlags::DMA) {
            attrs |= Self::ATTR_INDX_DEVICE;
        } else {
            attrs |= ATTR_SH_INNER;
        }
        if !flags.contains(MemFlags::WRITE) {
            attrs |= Self::AP_RO;
        }
        if !flags.contains(MemFlags::EXECUTE) {
            attrs |= ATTR_XN;
        }
        attrs
    }

    fn flags_of(desc: u64) -> MemFlags {
        let mut flags = MemFlags::READ;
        if desc & Self::AP_RO == 0 {
            flags |= MemFlags::WRITE;
        }
        if desc & ATTR_XN == 0 {
            flags |= MemFlags::EXECUTE;
        }
        if desc & Self::ATTR_INDX_MASK == Self::ATTR_INDX_DEVICE {
            flags |= MemFlags::DMA;
        }
        flags
    }
}

const fn level_shift(level: usize) -> usize {
    12 + 9 * (LEAF_LEVEL - level)
}

const fn level_size(level: usize) -> usize {
    1 << level_shift(level)
}

const fn is_table(desc: u64, level: usize) -> bool {
    level < LEAF_LEVEL && desc & 0b11 == DESC_TABLE_OR_PAGE
}

fn desc_addr(desc: u64) -> HostPhysAddr {
    HostPhysAddr::from((desc & DESC_ADDR_MASK) as usize)
}

const fn leaf_desc(paddr: usize, attrs: u64, level: usize) -> u64 {
    let kind = if level == LEAF_LEVEL {
        DESC_TABLE_OR_PAGE
    } else {
        DESC_BLOCK
    };
    (paddr as u64 & DESC_ADDR_MASK) | attrs | kind
}

fn read_entry(pool: &PagePool, table: HostPhysAddr, index: usize) -> AxResult<u64> {
    pool.frame(table)
        .map(|frame| frame.0[index])
        .ok_or_else(|| ax_err_type!(BadState, "translation table not in the page pool"))
}

fn write_entry(pool: &mut PagePool, table: HostPhysAddr, index: usize, desc: u64) -> AxResult {
    let frame = pool
        .frame_mut(table)
        .ok_or_else(|| ax_err_type!(BadState, "translation table not in the page pool"))?;
    frame.0[index] = desc;
    Ok(())
}

fn table_is_empty(pool: &PagePool, table: HostPhysAddr) -> bool {
    pool.frame(table)
        .is_some_and(|frame| frame.0.iter().all(|&desc| desc & DESC_VALID == 0))
}

/// A translation table rooted in a page of the pool.
///
/// The table does not own the pool; every operation borrows it. This lets one
/// pool back the tables of all cells under their own locks.
pub struct PageTable<F: PageTableFormat> {
    root: HostPhysAddr,
    _format: PhantomData<F>,
}

impl<F: PageTableFormat> PageTable<F> {
    pub fn new(pool: &mut PagePool) -> AxResult<Self> {
        Ok(Self {
            root: pool.alloc()?,
            _format: PhantomData,
        })
    }

    /// Physical address of the level-0 table.
    pub const fn root(&self) -> HostPhysAddr {
        self.root
    }

    /// Maps `[start, start + size)` to `[paddr, paddr + size)`.
    ///
    /// Uses the largest block size allowed by the alignment of both ranges.
    /// Existing translations in the range are replaced. If a table page cannot
    /// be allocated, nothing of the range stays mapped.
    pub fn map(
        &mut self,
        pool: &mut PagePool,
        start: usize,
        paddr: HostPhysAddr,
        size: usize,
        flags: MemFlags,
    ) -> AxResult {
        check_range(start, paddr.as_usize(), size)?;
        if size == 0 {
            return Ok(());
        }
        let attrs = F::leaf_attrs(flags);
        if let Err(err) = Self::map_range(pool, self.root, 0, start, paddr.as_usize(), size, attrs) {
            warn!(
                "mapping {:#x}..{:#x} failed: {:?}, rolling back",
                start,
                start + size,
                err
            );
            Self::unmap_range(pool, self.root, 0, start, size)?;
            return Err(err);
        }
        Ok(())
    }

    /// Removes every translation in `[start, start + size)`.
    ///
    /// Blocks straddling the range boundary are split. Table pages that end up
    /// empty are returned to the pool, except the root.
    pub fn unmap(&mut self, pool: &mut PagePool, start: usize, size: usize) -> AxResult {
        check_range(start, 0, size)?;
        if size == 0 {
            return Ok(());
        }
        Self::unmap_range(pool, self.root, 0, start, size)
    }

    /// Looks `addr` up. Returns the physical address and the access flags.
    pub fn translate(&self, pool: &PagePool, addr: usize) -> Option<(HostPhysAddr, MemFlags)> {
        if addr >= INPUT_LIMIT {
            return None;
        }
        let mut table = self.root;
        for level in 0..=LEAF_LEVEL {
            let index = (addr >> level_shift(level)) % ENTRIES_PER_TABLE;
            let desc = read_entry(pool, table, index).ok()?;
            if desc & DESC_VALID == 0 {
                return None;
            }
            if is_table(desc, level) {
                table = desc_addr(desc);
                continue;
            }
            let offset = addr & (level_size(level) - 1);
            let paddr = HostPhysAddr::from(desc_addr(desc).as_usize() + offset);
            return Some((paddr, F::flags_of(desc)));
        }
        None
    }

    /// Number of table pages in use, the root included.
    pub fn table_count(&self, pool: &PagePool) -> usize {
        count_tables(pool, self.root, 0)
    }

    /// Returns every table page, the root included, to the pool. The table
    /// must not be used afterwards.
    pub fn destroy(&mut self, pool: &mut PagePool) {
        free_table(pool, self.root, 0);
    }

    fn map_range(
        pool: &mut PagePool,
        table: HostPhysAddr,
        level: usize,
        mut vaddr: usize,
        mut paddr: usize,
        size: usize,
        attrs: u64,
    ) -> AxResult {
        let end = vaddr + size;
        let block = level_size(level);
        while vaddr < end {
            let index = (vaddr >> level_shift(level)) % ENTRIES_PER_TABLE;
            let entry_start = vaddr & !(block - 1);
            let chunk_end = end.min(entry_start + block);
            let chunk = chunk_end - vaddr;
            let desc = read_entry(pool, table, index)?;

            let fits_leaf = level >= 1 && vaddr == entry_start && chunk == block && paddr % block == 0;
            if fits_leaf {
                write_entry(pool, table, index, leaf_desc(paddr, attrs, level))?;
                if is_table(desc, level) {
                    free_table(pool, desc_addr(desc), level + 1);
                }
            } else {
                let child = Self::child_table(pool, table, index, level, desc)?;
                Self::map_range(pool, child, level + 1, vaddr, paddr, chunk, attrs)?;
            }
            vaddr = chunk_end;
            paddr += chunk;
        }
        Ok(())
    }

    fn unmap_range(
        pool: &mut PagePool,
        table: HostPhysAddr,
        level: usize,
        mut vaddr: usize,
        size: usize,
    ) -> AxResult {
        let end = vaddr + size;
        let block = level_size(level);
        while vaddr < end {
            let index = (vaddr >> level_shift(level)) % ENTRIES_PER_TABLE;
            let entry_start = vaddr & !(block - 1);
            let chunk_end = end.min(entry_start + block);
            let chunk = chunk_end - vaddr;
            let desc = read_entry(pool, table, index)?;

            if desc & DESC_VALID != 0 {
                if !is_table(desc, level) && chunk == block {
                    write_entry(pool, table, index, 0)?;
                } else {
                    let child = Self::child_table(pool, table, index, level, desc)?;
                    Self::unmap_range(pool, child, level + 1, vaddr, chunk)?;
                    if table_is_empty(pool, child) {
                        write_entry(pool, table, index, 0)?;
                        pool.free(child);
                    }
                }
            }
            vaddr = chunk_end;
        }
        Ok(())
    }

    /// Returns the next-level table behind entry `index`, allocating it if the
    /// entry is empty and splitting it if the entry is a block.
    fn child_table(
        pool: &mut PagePool,
        table: HostPhysAddr,
        index: usize,
        level: usize,
        desc: u64,
    ) -> AxResult<HostPhysAddr> {
        if is_table(desc, level) {
            return Ok(desc_addr(desc));
        }
        if level >= LEAF_LEVEL {
            return ax_err!(BadState, "no table below the leaf level");
        }
        let child = pool.alloc()?;
        if desc & DESC_VALID != 0 {
            let base = desc_addr(desc).as_usize();
            let attrs = desc & DESC_ATTR_MASK;
            let step = level_size(level + 1);
            let frame = pool
                .frame_mut(child)
                .ok_or_else(|| ax_err_type!(BadState, "fresh table page vanished"))?;
            for (i, entry) in frame.0.iter_mut().enumerate() {
                *entry = leaf_desc(base + i * step, attrs, level + 1);
            }
        }
        write_entry(pool, table, index, child.as_usize() as u64 | DESC_TABLE_OR_PAGE)?;
        Ok(child)
    }
}

fn check_range(vaddr: usize, paddr: usize, size: usize) -> AxResult {
    if vaddr % PAGE_SIZE != 0 || paddr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
        return ax_err!(InvalidInput, "mapping not page aligned");
    }
    if paddr.checked_add(size).is_none() {
        return ax_err!(InvalidInput, "mapping wraps the physical address space");
    }
    match vaddr.checked_add(size) {
        Some(end) if end <= INPUT_LIMIT => Ok(()),
        _ => ax_err!(InvalidInput, "mapping beyond the input address range"),
    }
}

fn count_tables(pool: &PagePool, table: HostPhysAddr, level: usize) -> usize {
    let Some(frame) = pool.frame(table) else {
        return 0;
    };
    1 + frame
        .0
        .iter()
        .filter(|&&desc| is_table(desc, level))
        .map(|&desc| count_tables(pool, desc_addr(desc), level + 1))
        .sum::<usize>()
}

fn free_table(pool: &mut PagePool, table: HostPhysAddr, level: usize) {
    if level < LEAF_LEVEL {
        let children: alloc::vec::Vec<HostPhysAddr> = match pool.frame(table) {
            Some(frame) => frame
                .0
                .iter()
                .filter(|&&desc| is_table(desc, level))
                .map(|&desc| desc_addr(desc))
                .collect(),
            None => return,
        };
        for child in children {
            free_table(pool, child, level + 1);
        }
    }
    pool.free(table);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pool::test_pool;
    use axerrno::AxError;

    const RW: MemFlags = MemFlags::READ.union(MemFlags::WRITE);
    const MB2: usize = 0x20_0000;
    const GB1: usize = 0x4000_0000;

    #[test]
    fn test_block_sizes() {
        let mut pool = test_pool(16);
        let mut pt = PageTable::<Stage2>::new(&mut pool).unwrap();

        pt.map(&mut pool, GB1, HostPhysAddr::from(2 * GB1), GB1, RW).unwrap();
        assert_eq!(pt.table_count(&pool), 2);

        pt.map(&mut pool, 0x8000_0000 + MB2, HostPhysAddr::from(0x1_0000_0000), MB2, RW).unwrap();
        assert_eq!(pt.table_count(&pool), 3);

        pt.map(&mut pool, 0x9000_0000, HostPhysAddr::from(0x1c09_0000), PAGE_SIZE, RW | MemFlags::DMA)
            .unwrap();
        assert_eq!(pt.table_count(&pool), 4);

        let (pa, flags) = pt.translate(&pool, GB1 + 0x1234).unwrap();
        assert_eq!(pa.as_usize(), 2 * GB1 + 0x1234);
        assert_eq!(flags, RW);
        let (pa, _) = pt.translate(&pool, 0x8000_0000 + MB2 + 0x5_5000).unwrap();
        assert_eq!(pa.as_usize(), 0x1_0005_5000);
        let (pa, flags) = pt.translate(&pool, 0x9000_0010).unwrap();
        assert_eq!(pa.as_usize(), 0x1c09_0010);
        assert_eq!(flags, RW | MemFlags::DMA);
        assert!(pt.translate(&pool, 0x9000_1000).is_none());
    }

    #[test]
    fn test_map_unmap_restores_structure() {
        let mut pool = test_pool(16);
        let mut pt = PageTable::<Stage2>::new(&mut pool).unwrap();
        let before = pool.used();

        let flags = RW | MemFlags::EXECUTE;
        pt.map(&mut pool, 0x7bfe_0000, HostPhysAddr::from(0x7bfe_0000), 0x1_0000, flags).unwrap();
        pt.map(&mut pool, 0x8000_0000, HostPhysAddr::from(0x8000_0000), 3 * MB2 + PAGE_SIZE, flags)
            .unwrap();
        assert!(pt.table_count(&pool) > 1);

        pt.unmap(&mut pool, 0x8000_0000, 3 * MB2 + PAGE_SIZE).unwrap();
        pt.unmap(&mut pool, 0x7bfe_0000, 0x1_0000).unwrap();
        assert_eq!(pt.table_count(&pool), 1);
        assert_eq!(pool.used(), before);
        assert!(pt.translate(&pool, 0x7bfe_0000).is_none());

        // Unmapping an unmapped range is a no-op.
        pt.unmap(&mut pool, 0x7bfe_0000, 0x1_0000).unwrap();
        assert_eq!(pool.used(), before);
    }

    #[test]
    fn test_remap_is_idempotent() {
        let mut pool = test_pool(16);
        let mut pt = PageTable::<Stage2>::new(&mut pool).unwrap();
        pt.map(&mut pool, 0x4000_0000, HostPhysAddr::from(0x4000_0000), MB2 + 0x3000, RW).unwrap();
        let used = pool.used();
        pt.map(&mut pool, 0x4000_0000, HostPhysAddr::from(0x4000_0000), MB2 + 0x3000, RW).unwrap();
        assert_eq!(pool.used(), used);
        assert_eq!(
            pt.translate(&pool, 0x4020_2000).map(|(pa, _)| pa.as_usize()),
            Some(0x4020_2000)
        );
    }

    #[test]
    fn test_partial_unmap_splits_block() {
        let mut pool = test_pool(16);
        let mut pt = PageTable::<Stage2>::new(&mut pool).unwrap();
        pt.map(&mut pool, 0x8000_0000, HostPhysAddr::from(0x8000_0000), MB2, RW).unwrap();
        assert_eq!(pt.table_count(&pool), 3);

        pt.unmap(&mut pool, 0x8000_5000, PAGE_SIZE).unwrap();
        assert_eq!(pt.table_count(&pool), 4);
        assert!(pt.translate(&pool, 0x8000_5000).is_none());
        assert_eq!(
            pt.translate(&pool, 0x8000_4ff8).map(|(pa, f)| (pa.as_usize(), f)),
            Some((0x8000_4ff8, RW))
        );
        assert_eq!(
            pt.translate(&pool, 0x801f_f000).map(|(pa, _)| pa.as_usize()),
            Some(0x801f_f000)
        );

        // Mapping the hole again and then the whole block folds it back.
        pt.map(&mut pool, 0x8000_0000, HostPhysAddr::from(0x8000_0000), MB2, RW).unwrap();
        assert_eq!(pt.table_count(&pool), 3);
    }

    #[test]
    fn test_out_of_memory_leaves_nothing_mapped() {
        // Root plus one more page: a 4 KiB mapping needs three tables below it.
        let mut pool = test_pool(2);
        let mut pt = PageTable::<Stage2>::new(&mut pool).unwrap();
        assert_eq!(
            pt.map(&mut pool, 0x1000, HostPhysAddr::from(0x1000), PAGE_SIZE, RW),
            Err(AxError::NoMemory)
        );
        assert_eq!(pool.used(), 1);
        assert_eq!(pt.table_count(&pool), 1);
        assert!(pt.translate(&pool, 0x1000).is_none());
    }

    #[test]
    fn test_rejects_unaligned_input() {
        let mut pool = test_pool(4);
        let mut pt = PageTable::<Stage2>::new(&mut pool).unwrap();
        assert_eq!(
            pt.map(&mut pool, 0x1800, HostPhysAddr::from(0x1000), PAGE_SIZE, RW),
            Err(AxError::InvalidInput)
        );
        assert_eq!(
            pt.map(&mut pool, 0x1000, HostPhysAddr::from(0x1000), 0x10, RW),
            Err(AxError::InvalidInput)
        );
        assert_eq!(
            pt.map(&mut pool, INPUT_LIMIT - PAGE_SIZE, HostPhysAddr::from(0), 2 * PAGE_SIZE, RW),
            Err(AxError::InvalidInput)
        );
        assert_eq!(
            pt.map(&mut pool, 0x1000, HostPhysAddr::from(usize::MAX - 0xfff), 2 * PAGE_SIZE, RW),
            Err(AxError::InvalidInput)
        );
        assert_eq!(pt.table_count(&pool), 1);
    }

    #[test]
    fn test_destroy_returns_every_page() {
        let mut pool = test_pool(16);
        let mut pt = PageTable::<HypStage1>::new(&mut pool).unwrap();
        pt.map(&mut pool, 0x2c00_0000, HostPhysAddr::from(0x2c00_0000), 0x1_0000, RW | MemFlags::DMA)
            .unwrap();
        let (_, flags) = pt.translate(&pool, 0x2c00_1000).unwrap();
        assert_eq!(flags, RW | MemFlags::DMA);
        pt.destroy(&mut pool);
        assert_eq!(pool.used(), 0);
    }
}
