mod hierarchy;
mod level;

pub use hierarchy::{CacheHierarchy, HierarchyConfig, HierarchyStats};
pub use level::CacheLevel;

use serde::{Deserialize, Serialize};

/// Victim-selection policy within a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    Fifo,
    Lru,
    Lfu,
}

impl std::fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CachePolicy::Fifo => "FIFO",
            CachePolicy::Lru => "LRU",
            CachePolicy::Lfu => "LFU",
        };
        f.write_str(name)
    }
}

/// Geometry and policy of a single cache level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheLevelConfig {
    /// Must be a power of two.
    pub num_sets: usize,
    /// Ways per set, at least 1.
    pub associativity: usize,
    /// Bytes per line, a power of two.
    pub block_size: usize,
    pub policy: CachePolicy,
}

impl Default for CacheLevelConfig {
    fn default() -> Self {
        CacheLevelConfig {
            num_sets: 8,
            associativity: 2,
            block_size: 64,
            policy: CachePolicy::Lru,
        }
    }
}

/// Cumulative access counters of one cache level.
///
/// `accesses = hits + misses` holds after every operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub accesses: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        100.0 * self.hits as f64 / self.accesses as f64
    }

    pub fn miss_ratio(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        100.0 * self.misses as f64 / self.accesses as f64
    }
}
