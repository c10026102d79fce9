mod buddy;
mod standard;

pub use buddy::BuddyAllocator;
pub use standard::{FitStrategy, StandardAllocator};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{Address, BlockId, SharedMemory};

/// Which allocator a system should be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocatorType {
    FirstFit,
    BestFit,
    WorstFit,
    Buddy,
}

impl std::fmt::Display for AllocatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AllocatorType::FirstFit => "First Fit",
            AllocatorType::BestFit => "Best Fit",
            AllocatorType::WorstFit => "Worst Fit",
            AllocatorType::Buddy => "Buddy",
        };
        f.write_str(name)
    }
}

/// Operation counters shared by both allocators.
///
/// A failed `allocate` still counts toward `total_allocations`, so the
/// counters tell the full story of a workload, not just its happy path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocCounters {
    pub total_allocations: u64,
    pub failed_allocations: u64,
    pub total_deallocations: u64,
}

impl AllocCounters {
    /// Successful allocations as a percentage of all attempts.
    pub fn success_rate(&self) -> f64 {
        if self.total_allocations == 0 {
            return 0.0;
        }
        100.0 * (self.total_allocations - self.failed_allocations) as f64
            / self.total_allocations as f64
    }
}

/// Snapshot of an allocator's health for structured reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub counters: AllocCounters,
    pub utilization: f64,
    pub internal_fragmentation: f64,
    pub external_fragmentation: f64,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub largest_free_block: usize,
}

/// The allocator seam.
///
/// Allocators hand out address ranges of the shared backing memory and keep
/// their own bookkeeping; they never read or write the bytes themselves.
pub trait Allocator {
    /// Reserves `size` bytes and returns a fresh block id.
    fn allocate(&mut self, size: usize) -> Result<BlockId>;

    /// Releases a live allocation by id.
    fn deallocate(&mut self, id: BlockId) -> Result<()>;

    /// Releases the live allocation starting exactly at `addr`.
    fn deallocate_by_addr(&mut self, addr: Address) -> Result<()>;

    /// Start address of a live allocation.
    fn block_address(&self, id: BlockId) -> Result<Address>;

    /// Allocated bytes as a percentage of total memory.
    fn utilization(&self) -> f64;

    /// `100 * (served - requested) / served` over live allocations,
    /// `0` when nothing is live.
    fn internal_fragmentation(&self) -> f64;

    /// `100 * (total_free - largest_free) / total_free`, `0` when no
    /// memory is free.
    fn external_fragmentation(&self) -> f64;

    fn total_free(&self) -> usize;
    fn largest_free_block(&self) -> usize;
    fn count_free_blocks(&self) -> usize;
    fn count_allocated_blocks(&self) -> usize;
    fn counters(&self) -> AllocCounters;

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            counters: self.counters(),
            utilization: self.utilization(),
            internal_fragmentation: self.internal_fragmentation(),
            external_fragmentation: self.external_fragmentation(),
            allocated_blocks: self.count_allocated_blocks(),
            free_blocks: self.count_free_blocks(),
            largest_free_block: self.largest_free_block(),
        }
    }
}

/// Tagged union over the concrete allocators so the system can hold
/// whichever one was configured without boxing.
pub enum AnyAllocator {
    Standard(StandardAllocator),
    Buddy(BuddyAllocator),
}

impl AnyAllocator {
    /// Builds the allocator `kind` over `memory`. `buddy_min_block` is only
    /// consulted for [`AllocatorType::Buddy`].
    pub fn build(
        memory: SharedMemory,
        kind: AllocatorType,
        buddy_min_block: usize,
    ) -> Result<Self> {
        Ok(match kind {
            AllocatorType::FirstFit => {
                AnyAllocator::Standard(StandardAllocator::new(memory, FitStrategy::First))
            }
            AllocatorType::BestFit => {
                AnyAllocator::Standard(StandardAllocator::new(memory, FitStrategy::Best))
            }
            AllocatorType::WorstFit => {
                AnyAllocator::Standard(StandardAllocator::new(memory, FitStrategy::Worst))
            }
            AllocatorType::Buddy => {
                AnyAllocator::Buddy(BuddyAllocator::new(memory, buddy_min_block)?)
            }
        })
    }

    pub fn kind(&self) -> AllocatorType {
        match self {
            AnyAllocator::Standard(a) => match a.fit_strategy() {
                FitStrategy::First => AllocatorType::FirstFit,
                FitStrategy::Best => AllocatorType::BestFit,
                FitStrategy::Worst => AllocatorType::WorstFit,
            },
            AnyAllocator::Buddy(_) => AllocatorType::Buddy,
        }
    }
}

macro_rules! forward {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            AnyAllocator::Standard(a) => a.$method($($arg),*),
            AnyAllocator::Buddy(a) => a.$method($($arg),*),
        }
    };
}

impl Allocator for AnyAllocator {
    fn allocate(&mut self, size: usize) -> Result<BlockId> {
        forward!(self, allocate, size)
    }

    fn deallocate(&mut self, id: BlockId) -> Result<()> {
        forward!(self, deallocate, id)
    }

    fn deallocate_by_addr(&mut self, addr: Address) -> Result<()> {
        forward!(self, deallocate_by_addr, addr)
    }

    fn block_address(&self, id: BlockId) -> Result<Address> {
        forward!(self, block_address, id)
    }

    fn utilization(&self) -> f64 {
        forward!(self, utilization)
    }

    fn internal_fragmentation(&self) -> f64 {
        forward!(self, internal_fragmentation)
    }

    fn external_fragmentation(&self) -> f64 {
        forward!(self, external_fragmentation)
    }

    fn total_free(&self) -> usize {
        forward!(self, total_free)
    }

    fn largest_free_block(&self) -> usize {
        forward!(self, largest_free_block)
    }

    fn count_free_blocks(&self) -> usize {
        forward!(self, count_free_blocks)
    }

    fn count_allocated_blocks(&self) -> usize {
        forward!(self, count_allocated_blocks)
    }

    fn counters(&self) -> AllocCounters {
        forward!(self, counters)
    }
}
