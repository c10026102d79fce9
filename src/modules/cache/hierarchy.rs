use log::trace;
use serde::{Deserialize, Serialize};

use super::{CacheLevel, CacheLevelConfig, CachePolicy, CacheStats};
use crate::error::Result;
use crate::{Address, SharedMemory};

/// Geometry of the two levels of a [`CacheHierarchy`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HierarchyConfig {
    pub l1: CacheLevelConfig,
    pub l2: CacheLevelConfig,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        HierarchyConfig {
            l1: CacheLevelConfig::default(),
            l2: CacheLevelConfig {
                num_sets: 16,
                associativity: 4,
                block_size: 64,
                policy: CachePolicy::Lru,
            },
        }
    }
}

/// Combined counters of both levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HierarchyStats {
    pub l1: CacheStats,
    pub l2: CacheStats,
    /// `l1.accesses + l2.accesses`.
    pub total_accesses: u64,
    /// Reads that had to go all the way to the backing store.
    pub memory_accesses: u64,
}

impl HierarchyStats {
    /// Hits at either level over every level access, in `[0, 100]`.
    pub fn overall_hit_ratio(&self) -> f64 {
        if self.total_accesses == 0 {
            return 0.0;
        }
        100.0 * (self.l1.hits + self.l2.hits) as f64 / self.total_accesses as f64
    }
}

/// An L1 in front of an L2, both over the same backing memory.
///
/// Reads are looked up top-down; each level a read misses records that miss
/// when it is refilled. Writes are write-through and only touch levels that
/// already hold the address.
pub struct CacheHierarchy {
    memory: SharedMemory,
    l1: CacheLevel,
    l2: CacheLevel,
    memory_accesses: u64,
}

impl CacheHierarchy {
    pub fn new(memory: SharedMemory, config: HierarchyConfig) -> Result<Self> {
        let l1 = CacheLevel::new(1, config.l1, memory.clone())?;
        let l2 = CacheLevel::new(2, config.l2, memory.clone())?;
        Ok(CacheHierarchy {
            memory,
            l1,
            l2,
            memory_accesses: 0,
        })
    }

    pub fn read(&mut self, addr: Address) -> Result<u8> {
        if self.l1.contains(addr) {
            return self.l1.read(addr);
        }

        if self.l2.contains(addr) {
            let value = self.l2.read(addr)?;
            // refill L1 so the next access hits it
            self.l1.fill(addr)?;
            return Ok(value);
        }

        self.memory_accesses += 1;
        let value = self.memory.borrow().read(addr)?;
        trace!("hierarchy miss: {:#x} served by memory", addr);
        self.l2.fill(addr)?;
        self.l1.fill(addr)?;
        Ok(value)
    }

    pub fn write(&mut self, addr: Address, value: u8) -> Result<()> {
        // write-through: memory first, then any level that holds the block
        self.memory.borrow_mut().write(addr, value)?;
        if self.l1.contains(addr) {
            self.l1.write(addr, value)?;
        }
        if self.l2.contains(addr) {
            self.l2.write(addr, value)?;
        }
        Ok(())
    }

    /// Invalidates both levels. The memory-access counter survives.
    pub fn flush(&mut self) {
        self.l1.flush();
        self.l2.flush();
    }

    pub fn contains_in_l1(&self, addr: Address) -> bool {
        self.l1.contains(addr)
    }

    pub fn contains_in_l2(&self, addr: Address) -> bool {
        self.l2.contains(addr)
    }

    pub fn l1(&self) -> &CacheLevel {
        &self.l1
    }

    pub fn l2(&self) -> &CacheLevel {
        &self.l2
    }

    pub fn stats(&self) -> HierarchyStats {
        let l1 = self.l1.stats();
        let l2 = self.l2.stats();
        HierarchyStats {
            l1,
            l2,
            total_accesses: l1.accesses + l2.accesses,
            memory_accesses: self.memory_accesses,
        }
    }
}
