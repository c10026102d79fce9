mod scenarios;

use crate::modules::cache::{CacheLevelConfig, CachePolicy, HierarchyConfig};
use crate::modules::virtual_memory::{PageReplacementPolicy, VmConfig};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Tiny two-level hierarchy used across the integration tests: a
/// direct-mapped one-set L1 in front of a 4-set 2-way L2, 16-byte blocks.
pub(crate) fn small_hierarchy_config() -> HierarchyConfig {
    HierarchyConfig {
        l1: CacheLevelConfig {
            num_sets: 1,
            associativity: 1,
            block_size: 16,
            policy: CachePolicy::Lru,
        },
        l2: CacheLevelConfig {
            num_sets: 4,
            associativity: 2,
            block_size: 16,
            policy: CachePolicy::Lru,
        },
    }
}

pub(crate) fn small_vm_config(policy: PageReplacementPolicy) -> VmConfig {
    VmConfig {
        num_vpages: 16,
        num_frames: 4,
        page_size: 256,
        policy,
    }
}
