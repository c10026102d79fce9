use std::collections::HashMap;

use log::trace;

use super::{AllocCounters, Allocator};
use crate::error::{MemoryError, Result};
use crate::util::is_power_of_two;
use crate::{Address, BlockId, SharedMemory};

#[derive(Debug, Clone, Copy)]
struct BuddyBlock {
    start: Address,
    size: usize,
}

/// Power-of-two buddy allocator.
///
/// Free blocks sit in per-class lists indexed by `log2(size)`. A block's
/// buddy is always at `start ^ size`, and every block start is a multiple
/// of its size, so coalescing reconstructs the canonical partition without
/// any adjacency scan.
pub struct BuddyAllocator {
    memory: SharedMemory,
    min_block_size: usize,
    max_block_size: usize,
    /// `free_lists[class]` holds start addresses of free blocks of size
    /// `2^class`.
    free_lists: Vec<Vec<Address>>,
    live: HashMap<BlockId, BuddyBlock>,
    by_addr: HashMap<Address, BlockId>,
    requested: HashMap<BlockId, usize>,
    next_block_id: BlockId,
    counters: AllocCounters,
}

impl BuddyAllocator {
    pub fn new(memory: SharedMemory, min_block_size: usize) -> Result<Self> {
        let total_size = memory.borrow().total_size();
        if !is_power_of_two(total_size) {
            return Err(MemoryError::InvalidConfig(format!(
                "memory size {} is not a power of two",
                total_size
            )));
        }
        if !is_power_of_two(min_block_size) {
            return Err(MemoryError::InvalidConfig(format!(
                "minimum block size {} is not a power of two",
                min_block_size
            )));
        }
        if min_block_size > total_size {
            return Err(MemoryError::InvalidConfig(format!(
                "minimum block size {} exceeds memory size {}",
                min_block_size, total_size
            )));
        }

        memory.borrow_mut().update_used(0);
        let max_class = total_size.trailing_zeros() as usize;
        let mut free_lists = vec![Vec::new(); max_class + 1];
        free_lists[max_class].push(0);

        Ok(BuddyAllocator {
            memory,
            min_block_size,
            max_block_size: total_size,
            free_lists,
            live: HashMap::new(),
            by_addr: HashMap::new(),
            requested: HashMap::new(),
            next_block_id: 1,
            counters: AllocCounters::default(),
        })
    }

    pub fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Pops a free block of exactly `size` bytes, splitting a larger block
    /// down if no exact one is free.
    fn take_block(&mut self, size: usize) -> Option<Address> {
        let class = size.trailing_zeros() as usize;
        let from = (class..self.free_lists.len()).find(|&c| !self.free_lists[c].is_empty())?;

        // Split down, keeping the left half and parking the right
        for c in (class + 1..=from).rev() {
            let block = self.free_lists[c].pop()?;
            trace!("buddy split: {:#x} into two blocks of {}", block, 1usize << (c - 1));
            self.free_lists[c - 1].push(block + (1u64 << (c - 1)));
            self.free_lists[c - 1].push(block);
        }
        self.free_lists[class].pop()
    }

    /// Returns a freed block to its class list, merging with its buddy as
    /// far up as the partition allows.
    fn insert_free(&mut self, start: Address, size: usize) {
        let mut start = start;
        let mut class = size.trailing_zeros() as usize;
        let top = self.free_lists.len() - 1;

        while class < top {
            let buddy = start ^ (1u64 << class);
            let list = &mut self.free_lists[class];
            match list.iter().position(|&a| a == buddy) {
                Some(pos) => {
                    // Free buddy found: fuse and try the next class up
                    list.swap_remove(pos);
                    start = start.min(buddy);
                    class += 1;
                    trace!("buddy merge: block of {} at {:#x}", 1usize << class, start);
                }
                None => break,
            }
        }
        self.free_lists[class].push(start);
    }

    fn sync_used(&mut self) {
        let used = self.live.values().map(|b| b.size).sum();
        self.memory.borrow_mut().update_used(used);
    }

    /// Every free block as `(start, size)`, ordered by class.
    #[cfg(test)]
    pub(crate) fn free_blocks(&self) -> Vec<(Address, usize)> {
        let mut blocks = Vec::new();
        for (class, list) in self.free_lists.iter().enumerate() {
            for &start in list {
                blocks.push((start, 1usize << class));
            }
        }
        blocks
    }
}

impl Allocator for BuddyAllocator {
    fn allocate(&mut self, size: usize) -> Result<BlockId> {
        self.counters.total_allocations += 1;
        if size == 0 {
            self.counters.failed_allocations += 1;
            return Err(MemoryError::ZeroSize);
        }

        let target = size.next_power_of_two().max(self.min_block_size);
        if target > self.max_block_size {
            self.counters.failed_allocations += 1;
            return Err(MemoryError::OutOfMemory { requested: size });
        }

        let start = match self.take_block(target) {
            Some(start) => start,
            None => {
                self.counters.failed_allocations += 1;
                return Err(MemoryError::OutOfMemory { requested: size });
            }
        };

        let id = self.next_block_id;
        self.next_block_id += 1;
        self.live.insert(id, BuddyBlock { start, size: target });
        self.by_addr.insert(start, id);
        self.requested.insert(id, size);
        self.sync_used();

        trace!("buddy allocated block {} ({} bytes at {:#x})", id, target, start);
        Ok(id)
    }

    fn deallocate(&mut self, id: BlockId) -> Result<()> {
        let block = self.live.remove(&id).ok_or(MemoryError::UnknownBlock(id))?;
        self.by_addr.remove(&block.start);
        self.requested.remove(&id);

        self.insert_free(block.start, block.size);
        self.sync_used();
        self.counters.total_deallocations += 1;

        trace!("buddy freed block {} ({} bytes at {:#x})", id, block.size, block.start);
        Ok(())
    }

    fn deallocate_by_addr(&mut self, addr: Address) -> Result<()> {
        let id = *self
            .by_addr
            .get(&addr)
            .ok_or(MemoryError::UnknownAddress(addr))?;
        self.deallocate(id)
    }

    fn block_address(&self, id: BlockId) -> Result<Address> {
        self.live
            .get(&id)
            .map(|b| b.start)
            .ok_or(MemoryError::UnknownBlock(id))
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
            if let Some(block) = self.live.get(id) {
                served += block.size;
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
        self.free_lists
            .iter()
            .enumerate()
            .map(|(class, list)| list.len() * (1usize << class))
            .sum()
    }

    fn largest_free_block(&self) -> usize {
        self.free_lists
            .iter()
            .enumerate()
            .rev()
            .find(|(_, list)| !list.is_empty())
            .map(|(class, _)| 1usize << class)
            .unwrap_or(0)
    }

    fn count_free_blocks(&self) -> usize {
        self.free_lists.iter().map(|list| list.len()).sum()
    }

    fn count_allocated_blocks(&self) -> usize {
        self.live.len()
    }

    fn counters(&self) -> AllocCounters {
        self.counters
    }
}
