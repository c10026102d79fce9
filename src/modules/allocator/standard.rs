use std::collections::HashMap;

use log::trace;

use super::{AllocCounters, Allocator};
use crate::error::{MemoryError, Result};
use crate::{Address, BlockId, SharedMemory};

/// Fit policy used when walking the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStrategy {
    /// First free block that fits.
    First,
    /// Smallest free block that fits; first one wins ties.
    Best,
    /// Largest free block that fits; first one wins ties.
    Worst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Free,
    Allocated(BlockId),
}

/// One contiguous range of the backing memory.
///
/// Records live in an index arena with `prev`/`next` as arena handles, so
/// splitting and coalescing are local index surgery rather than pointer
/// chasing.
#[derive(Debug, Clone, Copy)]
struct BlockRecord {
    start: Address,
    size: usize,
    state: BlockState,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Free-list allocator with first-, best- and worst-fit placement.
///
/// The block list is address-ordered and covers `[0, total_size)` without
/// gaps or overlaps. Coalescing is eager, so two free blocks are never
/// adjacent.
pub struct StandardAllocator {
    memory: SharedMemory,
    arena: Vec<BlockRecord>,
    /// Arena slots orphaned by coalescing, recycled before the arena grows.
    spare_slots: Vec<usize>,
    head: usize,
    fit: FitStrategy,
    next_block_id: BlockId,
    by_id: HashMap<BlockId, usize>,
    by_addr: HashMap<Address, usize>,
    requested: HashMap<BlockId, usize>,
    counters: AllocCounters,
}

impl StandardAllocator {
    pub fn new(memory: SharedMemory, fit: FitStrategy) -> Self {
        let total_size = memory.borrow().total_size();
        memory.borrow_mut().update_used(0);
        StandardAllocator {
            memory,
            arena: vec![BlockRecord {
                start: 0,
                size: total_size,
                state: BlockState::Free,
                prev: None,
                next: None,
            }],
            spare_slots: Vec::new(),
            head: 0,
            fit,
            next_block_id: 1,
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
            requested: HashMap::new(),
            counters: AllocCounters::default(),
        }
    }

    pub fn fit_strategy(&self) -> FitStrategy {
        self.fit
    }

    fn find_block(&self, size: usize) -> Option<usize> {
        let mut chosen: Option<usize> = None;
        let mut cursor = Some(self.head);
        while let Some(slot) = cursor {
            let block = &self.arena[slot];
            if block.state == BlockState::Free && block.size >= size {
                match self.fit {
                    FitStrategy::First => return Some(slot),
                    FitStrategy::Best => {
                        if chosen.map_or(true, |c| self.arena[c].size > block.size) {
                            chosen = Some(slot);
                        }
                    }
                    FitStrategy::Worst => {
                        if chosen.map_or(true, |c| self.arena[c].size < block.size) {
                            chosen = Some(slot);
                        }
                    }
                }
            }
            cursor = block.next;
        }
        chosen
    }

    /// Splits `slot` so it is exactly `size` bytes, inserting the remainder
    /// as a free block right after it. A remainder of at most one byte is
    /// absorbed into the allocation instead.
    fn split(&mut self, slot: usize, size: usize) {
        let (start, old_size, next) = {
            let block = &self.arena[slot];
            (block.start, block.size, block.next)
        };
        if old_size <= size + 1 {
            return;
        }

        let rest_slot = self.insert_record(BlockRecord {
            start: start + size as Address,
            size: old_size - size,
            state: BlockState::Free,
            prev: Some(slot),
            next,
        });
        if let Some(n) = next {
            self.arena[n].prev = Some(rest_slot);
        }
        self.arena[slot].next = Some(rest_slot);
        self.arena[slot].size = size;
    }

    /// Merges `slot` with its free neighbors. One neighbor each side is
    /// enough: the adjacency invariant held before this deallocation.
    fn coalesce(&mut self, slot: usize) {
        if let Some(n) = self.arena[slot].next {
            if self.arena[n].state == BlockState::Free {
                self.absorb_next(slot, n);
            }
        }
        if let Some(p) = self.arena[slot].prev {
            if self.arena[p].state == BlockState::Free {
                self.absorb_next(p, slot);
            }
        }
    }

    fn absorb_next(&mut self, keep: usize, gone: usize) {
        let (gone_size, gone_next) = {
            let block = &self.arena[gone];
            (block.size, block.next)
        };
        self.arena[keep].size += gone_size;
        self.arena[keep].next = gone_next;
        if let Some(n) = gone_next {
            self.arena[n].prev = Some(keep);
        }
        self.spare_slots.push(gone);
    }

    fn insert_record(&mut self, record: BlockRecord) -> usize {
        match self.spare_slots.pop() {
            Some(slot) => {
                self.arena[slot] = record;
                slot
            }
            None => {
                self.arena.push(record);
                self.arena.len() - 1
            }
        }
    }

    fn sync_used(&mut self) {
        let mut used = 0;
        let mut cursor = Some(self.head);
        while let Some(slot) = cursor {
            let block = &self.arena[slot];
            if let BlockState::Allocated(_) = block.state {
                used += block.size;
            }
            cursor = block.next;
        }
        self.memory.borrow_mut().update_used(used);
    }

    /// Address-ordered `(start, size, is_free)` walk of the block list.
    #[cfg(test)]
    pub(crate) fn block_layout(&self) -> Vec<(Address, usize, bool)> {
        let mut layout = Vec::new();
        let mut cursor = Some(self.head);
        while let Some(slot) = cursor {
            let block = &self.arena[slot];
            layout.push((block.start, block.size, block.state == BlockState::Free));
            cursor = block.next;
        }
        layout
    }
}

impl Allocator for StandardAllocator {
    fn allocate(&mut self, size: usize) -> Result<BlockId> {
        self.counters.total_allocations += 1;
        if size == 0 {
            self.counters.failed_allocations += 1;
            return Err(MemoryError::ZeroSize);
        }

        let slot = match self.find_block(size) {
            Some(slot) => slot,
            None => {
                self.counters.failed_allocations += 1;
                return Err(MemoryError::OutOfMemory { requested: size });
            }
        };

        self.split(slot, size);

        let id = self.next_block_id;
        self.next_block_id += 1;
        self.arena[slot].state = BlockState::Allocated(id);
        self.by_id.insert(id, slot);
        self.by_addr.insert(self.arena[slot].start, slot);
        self.requested.insert(id, size);
        self.sync_used();

        trace!(
            "allocated block {} ({} bytes at {:#x}, {:?} fit)",
            id,
            self.arena[slot].size,
            self.arena[slot].start,
            self.fit
        );
        Ok(id)
    }

    fn deallocate(&mut self, id: BlockId) -> Result<()> {
        let slot = *self.by_id.get(&id).ok_or(MemoryError::UnknownBlock(id))?;

        self.by_id.remove(&id);
        self.by_addr.remove(&self.arena[slot].start);
        self.requested.remove(&id);
        self.arena[slot].state = BlockState::Free;
        self.coalesce(slot);
        self.sync_used();
        self.counters.total_deallocations += 1;

        trace!("freed block {}", id);
        Ok(())
    }

    fn deallocate_by_addr(&mut self, addr: Address) -> Result<()> {
        let slot = *self
            .by_addr
            .get(&addr)
            .ok_or(MemoryError::UnknownAddress(addr))?;
        match self.arena[slot].state {
            BlockState::Allocated(id) => self.deallocate(id),
            BlockState::Free => Err(MemoryError::UnknownAddress(addr)),
        }
    }

    fn block_address(&self, id: BlockId) -> Result<Address> {
        let slot = *self.by_id.get(&id).ok_or(MemoryError::UnknownBlock(id))?;
        Ok(self.arena[slot].start)
    }

    fn utilization(&self) -> f64 {
        let memory = self.memory.borrow();
        if memory.total_size() == 0 {
            return 0.0;
        }
        100.0 * memory.used_size() as f64 / memory.total_size() as f64
    }

    fn internal_fragmentation(&self) -> f64 {
        let mut served = 0usize;
        let mut requested = 0usize;
        for (id, req) in &self.requested {
            if let Some(&slot) = self.by_id.get(id) {
                served += self.arena[slot].size;
                requested += req;
            }
        }
        if served == 0 {
            return 0.0;
        }
        100.0 * (served - requested) as f64 / served as f64
    }

    fn external_fragmentation(&self) -> f64 {
        let total_free = self.total_free();
        if total_free == 0 {
            return 0.0;
        }
        let largest = self.largest_free_block();
        100.0 * (total_free - largest) as f64 / total_free as f64
    }

    fn total_free(&self) -> usize {
        let mut total = 0;
        let mut cursor = Some(self.head);
        while let Some(slot) = cursor {
            let block = &self.arena[slot];
            if block.state == BlockState::Free {
                total += block.size;
            }
            cursor = block.next;
        }
        total
    }

    fn largest_free_block(&self) -> usize {
        let mut largest = 0;
        let mut cursor = Some(self.head);
        while let Some(slot) = cursor {
            let block = &self.arena[slot];
            if block.state == BlockState::Free && block.size > largest {
                largest = block.size;
            }
            cursor = block.next;
        }
        largest
    }

    fn count_free_blocks(&self) -> usize {
        let mut count = 0;
        let mut cursor = Some(self.head);
        while let Some(slot) = cursor {
            let block = &self.arena[slot];
            if block.state == BlockState::Free {
                count += 1;
            }
            cursor = block.next;
        }
        count
    }

    fn count_allocated_blocks(&self) -> usize {
        self.by_id.len()
    }

    fn counters(&self) -> AllocCounters {
        self.counters
    }
}
