//! Per-CPU queue of virtual interrupts waiting for a free list register.
//!
//! The queue is a fixed arena of slots linked by index. Entries are kept in
//! ascending slot order, so a walk from the head visits them in the order in
//! which the slots were handed out.

use alloc::vec::Vec;

use axerrno::{ax_err_type, AxResult};

use crate::consts::MAX_PENDING_IRQS;

/// Where a pending interrupt comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    /// A physical line forwarded to the guest. The guest's EOI deactivates
    /// the physical interrupt.
    Hardware { phys_id: u32 },
    /// A software-generated interrupt sent by a CPU of the same cell.
    Sgi { src_cpu: usize },
}

/// A virtual interrupt awaiting delivery to one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingIrq {
    pub virt_id: u32,
    pub source: IrqSource,
    /// Request a maintenance interrupt when the guest completes it.
    pub maintenance: bool,
}

impl PendingIrq {
    pub const fn hw(irq: u32) -> Self {
        Self {
            virt_id: irq,
            source: IrqSource::Hardware { phys_id: irq },
            maintenance: false,
        }
    }

    pub const fn sgi(id: u32, src_cpu: usize) -> Self {
        Self {
            virt_id: id,
            source: IrqSource::Sgi { src_cpu },
            maintenance: false,
        }
    }

    pub const fn is_hw(&self) -> bool {
        matches!(self.source, IrqSource::Hardware { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    irq: Option<PendingIrq>,
    prev: Option<u16>,
    next: Option<u16>,
}

const EMPTY_SLOT: Slot = Slot {
    irq: None,
    prev: None,
    next: None,
};

pub struct PendingQueue {
    slots: Vec<Slot>,
    head: Option<u16>,
    len: usize,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PENDING_IRQS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity <= u16::MAX as usize);
        Self {
            slots: vec![EMPTY_SLOT; capacity],
            head: None,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Queues `irq` in the lowest free slot and returns the slot index.
    pub fn insert(&mut self, irq: PendingIrq) -> AxResult<usize> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.irq.is_none())
            .ok_or_else(|| ax_err_type!(NoMemory, "pending interrupt queue full"))?;

        // Link before the first entry with a higher slot index.
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            if idx as usize > slot {
                break;
            }
            prev = Some(idx);
            cursor = self.slots[idx as usize].next;
        }

        let idx = slot as u16;
        self.slots[slot] = Slot {
            irq: Some(irq),
            prev,
            next: cursor,
        };
        match prev {
            Some(p) => self.slots[p as usize].next = Some(idx),
            None => self.head = Some(idx),
        }
        if let Some(n) = cursor {
            self.slots[n as usize].prev = Some(idx);
        }
        self.len += 1;
        Ok(slot)
    }

    /// Unlinks the entry in `slot`.
    pub fn remove(&mut self, slot: usize) -> Option<PendingIrq> {
        let entry = self.slots.get(slot).copied()?;
        let irq = entry.irq?;
        match entry.prev {
            Some(p) => self.slots[p as usize].next = entry.next,
            None => self.head = entry.next,
        }
        if let Some(n) = entry.next {
            self.slots[n as usize].prev = entry.prev;
        }
        self.slots[slot] = EMPTY_SLOT;
        self.len -= 1;
        Some(irq)
    }

    /// Iterates over the queued interrupts in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingIrq> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let idx = cursor? as usize;
            cursor = self.slots[idx].next;
            self.slots[idx].irq.as_ref()
        })
    }

    /// Walks the queue in slot order and removes every entry `consume`
    /// accepts. The walk stops at the first entry it refuses, which stays
    /// queued. Returns the number of removed entries.
    pub fn drain_ordered<F>(&mut self, mut consume: F) -> usize
    where
        F: FnMut(&PendingIrq) -> bool,
    {
        let mut removed = 0;
        while let Some(idx) = self.head {
            let Some(irq) = self.slots[idx as usize].irq else {
                break;
            };
            if !consume(&irq) {
                break;
            }
            self.remove(idx as usize);
            removed += 1;
        }
        removed
    }

    /// Drops every queued instance of `virt_id`.
    pub fn cancel(&mut self, virt_id: u32) -> usize {
        let mut removed = 0;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            cursor = self.slots[idx as usize].next;
            if self.slots[idx as usize].irq.is_some_and(|irq| irq.virt_id == virt_id) {
                self.remove(idx as usize);
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.slots.fill(EMPTY_SLOT);
        self.head = None;
        self.len = 0;
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    fn ids(queue: &PendingQueue) -> Vec<u32> {
        queue.iter().map(|irq| irq.virt_id).collect()
    }

    #[test]
    fn test_insert_keeps_slot_order() {
        let mut queue = PendingQueue::with_capacity(4);
        assert_eq!(queue.insert(PendingIrq::hw(40)), Ok(0));
        assert_eq!(queue.insert(PendingIrq::hw(41)), Ok(1));
        assert_eq!(queue.insert(PendingIrq::hw(42)), Ok(2));
        assert_eq!(queue.remove(1), Some(PendingIrq::hw(41)));

        // The freed slot is reused and linked back in before slot 2.
        assert_eq!(queue.insert(PendingIrq::sgi(3, 1)), Ok(1));
        assert_eq!(ids(&queue), vec![40, 3, 42]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_insert_beyond_capacity() {
        let mut queue = PendingQueue::with_capacity(2);
        queue.insert(PendingIrq::hw(33)).unwrap();
        queue.insert(PendingIrq::hw(34)).unwrap();
        assert_eq!(queue.insert(PendingIrq::hw(35)), Err(AxError::NoMemory));
        assert_eq!(ids(&queue), vec![33, 34]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drain_in_insertion_order() {
        let mut queue = PendingQueue::new();
        for irq in 32..48 {
            queue.insert(PendingIrq::hw(irq)).unwrap();
        }
        let mut delivered = Vec::new();
        let removed = queue.drain_ordered(|irq| {
            delivered.push(irq.virt_id);
            true
        });
        assert_eq!(removed, 16);
        assert_eq!(delivered, (32..48).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_stops_at_refused_entry() {
        let mut queue = PendingQueue::new();
        for irq in [50, 51, 52] {
            queue.insert(PendingIrq::hw(irq)).unwrap();
        }
        let mut budget = 2;
        let removed = queue.drain_ordered(|_| {
            if budget == 0 {
                return false;
            }
            budget -= 1;
            true
        });
        assert_eq!(removed, 2);
        assert_eq!(ids(&queue), vec![52]);
    }

    #[test]
    fn test_cancel_and_clear() {
        let mut queue = PendingQueue::new();
        queue.insert(PendingIrq::hw(60)).unwrap();
        queue.insert(PendingIrq::sgi(2, 0)).unwrap();
        queue.insert(PendingIrq::hw(60)).unwrap();
        assert_eq!(queue.cancel(60), 2);
        assert_eq!(ids(&queue), vec![2]);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.remove(1), None);
        assert_eq!(queue.insert(PendingIrq::hw(61)), Ok(0));
    }
}
