use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::modules::allocator::{
    Allocator, AllocatorStats, AllocatorType, AnyAllocator,
};
use crate::modules::cache::{CacheHierarchy, CacheLevelConfig, HierarchyConfig, HierarchyStats};
use crate::modules::virtual_memory::{VirtualMemory, VmConfig, VmStats};
use crate::{shared_memory, Address, BlockId, SharedMemory};

const MAX_HISTORY: usize = 1000;

/// Where a routed access was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessLevel {
    L1Cache,
    L2Cache,
    Memory,
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AccessLevel::L1Cache => "L1 Cache",
            AccessLevel::L2Cache => "L2 Cache",
            AccessLevel::Memory => "Memory",
        };
        f.write_str(name)
    }
}

/// Outcome of one [`MemorySystem`] read or write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccessOutcome {
    pub value: u8,
    pub level: AccessLevel,
    pub virtual_address: Address,
    pub physical_address: Address,
    pub used_virtual_memory: bool,
    pub page_fault: bool,
}

/// Per-session counters, resettable independently of the subsystems'
/// cumulative statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_accesses: u64,
    pub total_reads: u64,
    pub total_writes: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub memory_accesses: u64,
    pub page_faults: u64,
}

impl SessionStats {
    fn rate(&self, count: u64) -> f64 {
        if self.total_accesses == 0 {
            return 0.0;
        }
        100.0 * count as f64 / self.total_accesses as f64
    }

    pub fn l1_hit_rate(&self) -> f64 {
        self.rate(self.l1_hits)
    }

    pub fn l2_hit_rate(&self) -> f64 {
        self.rate(self.l2_hits)
    }

    pub fn memory_access_rate(&self) -> f64 {
        self.rate(self.memory_accesses)
    }

    pub fn page_fault_rate(&self) -> f64 {
        self.rate(self.page_faults)
    }
}

/// Top-level configuration of a simulator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySystemConfig {
    pub memory_size: usize,
    pub allocator: AllocatorType,
    /// Smallest block the buddy allocator will hand out; ignored by the
    /// standard allocator.
    pub buddy_min_block: usize,
    pub cache: Option<HierarchyConfig>,
    pub vm: Option<VmConfig>,
}

impl Default for MemorySystemConfig {
    fn default() -> Self {
        MemorySystemConfig {
            memory_size: 64 * 1024,
            allocator: AllocatorType::BestFit,
            buddy_min_block: 16,
            cache: Some(HierarchyConfig::default()),
            vm: None,
        }
    }
}

/// Central orchestrator: one shared physical memory, one allocator, and
/// optionally a cache hierarchy and a virtual memory on top of it.
///
/// The subsystems never talk to each other; coherence between them follows
/// from their disciplined use of the one backing store. Reads and writes
/// are routed virtual-memory-first, then through the cache hierarchy.
pub struct MemorySystem {
    memory: SharedMemory,
    allocator: AnyAllocator,
    cache: Option<CacheHierarchy>,
    vm: Option<VirtualMemory>,
    config: MemorySystemConfig,
    session: SessionStats,
    history: VecDeque<AccessOutcome>,
}

impl MemorySystem {
    pub fn new(config: MemorySystemConfig) -> Result<Self> {
        if config.memory_size == 0 {
            return Err(MemoryError::InvalidConfig(
                "memory size must be greater than zero".into(),
            ));
        }

        let memory = shared_memory(config.memory_size);
        let allocator =
            AnyAllocator::build(Rc::clone(&memory), config.allocator, config.buddy_min_block)?;
        let cache = match config.cache {
            Some(c) => Some(CacheHierarchy::new(Rc::clone(&memory), c)?),
            None => None,
        };
        let vm = match config.vm {
            Some(c) => Some(VirtualMemory::new(Rc::clone(&memory), c)?),
            None => None,
        };

        debug!(
            "memory system up: {} bytes, cache {}, vm {}",
            config.memory_size,
            cache.is_some(),
            vm.is_some()
        );
        Ok(MemorySystem {
            memory,
            allocator,
            cache,
            vm,
            config,
            session: SessionStats::default(),
            history: VecDeque::new(),
        })
    }

    /// Reads one byte, translating through the VM and serving through the
    /// cache hierarchy when those subsystems are enabled.
    pub fn read(&mut self, addr: Address) -> Result<AccessOutcome> {
        self.session.total_accesses += 1;
        self.session.total_reads += 1;

        let (paddr, page_fault) = self.translate_if_vm(addr)?;
        let (value, level) = self.routed_read(paddr)?;
        if page_fault {
            self.session.page_faults += 1;
        }

        let outcome = AccessOutcome {
            value,
            level,
            virtual_address: addr,
            physical_address: paddr,
            used_virtual_memory: self.vm.is_some(),
            page_fault,
        };
        self.record(outcome);
        Ok(outcome)
    }

    /// Writes one byte; write-through all the way to the backing store.
    pub fn write(&mut self, addr: Address, value: u8) -> Result<AccessOutcome> {
        self.session.total_accesses += 1;
        self.session.total_writes += 1;

        let (paddr, page_fault) = self.translate_if_vm(addr)?;
        if let Some(vm) = self.vm.as_mut() {
            vm.mark_dirty(addr);
        }
        let level = self.routed_write(paddr, value)?;
        if page_fault {
            self.session.page_faults += 1;
        }

        let outcome = AccessOutcome {
            value,
            level,
            virtual_address: addr,
            physical_address: paddr,
            used_virtual_memory: self.vm.is_some(),
            page_fault,
        };
        self.record(outcome);
        Ok(outcome)
    }

    pub fn allocate(&mut self, size: usize) -> Result<BlockId> {
        self.allocator.allocate(size)
    }

    pub fn deallocate(&mut self, id: BlockId) -> Result<()> {
        self.allocator.deallocate(id)
    }

    pub fn deallocate_by_addr(&mut self, addr: Address) -> Result<()> {
        self.allocator.deallocate_by_addr(addr)
    }

    pub fn block_address(&self, id: BlockId) -> Result<Address> {
        self.allocator.block_address(id)
    }

    /// Swaps the allocator. All prior allocations are forgotten and the
    /// advisory used counter starts over.
    pub fn set_allocator(&mut self, kind: AllocatorType) -> Result<()> {
        self.allocator =
            AnyAllocator::build(Rc::clone(&self.memory), kind, self.config.buddy_min_block)?;
        self.config.allocator = kind;
        debug!("allocator switched to {:?}", kind);
        Ok(())
    }

    pub fn allocator_type(&self) -> AllocatorType {
        self.allocator.kind()
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    /// Rebuilds the cache hierarchy with a new L1 geometry (fresh stats).
    pub fn configure_l1(&mut self, l1: CacheLevelConfig) -> Result<()> {
        let mut cache_config = self.config.cache.unwrap_or_default();
        cache_config.l1 = l1;
        self.configure_cache(cache_config)
    }

    /// Rebuilds the cache hierarchy with a new L2 geometry (fresh stats).
    pub fn configure_l2(&mut self, l2: CacheLevelConfig) -> Result<()> {
        let mut cache_config = self.config.cache.unwrap_or_default();
        cache_config.l2 = l2;
        self.configure_cache(cache_config)
    }

    pub fn configure_cache(&mut self, config: HierarchyConfig) -> Result<()> {
        self.cache = Some(CacheHierarchy::new(Rc::clone(&self.memory), config)?);
        self.config.cache = Some(config);
        Ok(())
    }

    /// Rebuilds the virtual memory subsystem (fresh stats and mappings).
    pub fn configure_vm(&mut self, config: VmConfig) -> Result<()> {
        self.vm = Some(VirtualMemory::new(Rc::clone(&self.memory), config)?);
        self.config.vm = Some(config);
        Ok(())
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn vm_enabled(&self) -> bool {
        self.vm.is_some()
    }

    pub fn cache(&self) -> Option<&CacheHierarchy> {
        self.cache.as_ref()
    }

    pub fn vm(&self) -> Option<&VirtualMemory> {
        self.vm.as_ref()
    }

    pub fn cache_stats(&self) -> Option<HierarchyStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    pub fn vm_stats(&self) -> Option<VmStats> {
        self.vm.as_ref().map(|vm| vm.stats())
    }

    pub fn flush_caches(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.flush();
        }
    }

    pub fn flush_vm(&mut self) {
        if let Some(vm) = self.vm.as_mut() {
            vm.flush();
        }
    }

    pub fn clear_memory(&mut self) {
        self.memory.borrow_mut().clear();
    }

    /// Handle to the shared backing memory.
    pub fn memory(&self) -> SharedMemory {
        Rc::clone(&self.memory)
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session
    }

    pub fn reset_session_stats(&mut self) {
        self.session = SessionStats::default();
        self.history.clear();
    }

    /// The last `count` accesses, oldest first.
    pub fn recent_accesses(&self, count: usize) -> Vec<AccessOutcome> {
        let skip = self.history.len().saturating_sub(count);
        self.history.iter().skip(skip).copied().collect()
    }

    fn translate_if_vm(&mut self, addr: Address) -> Result<(Address, bool)> {
        match self.vm.as_mut() {
            Some(vm) => {
                let faults_before = vm.stats().page_faults;
                let paddr = vm.translate(addr)?;
                Ok((paddr, vm.stats().page_faults > faults_before))
            }
            None => Ok((addr, false)),
        }
    }

    fn routed_read(&mut self, paddr: Address) -> Result<(u8, AccessLevel)> {
        let (value, level) = match self.cache.as_mut() {
            Some(cache) => {
                let before = cache.stats();
                let value = cache.read(paddr)?;
                (value, served_level(before, cache.stats()))
            }
            None => {
                let value = self.memory.borrow().read(paddr)?;
                (value, AccessLevel::Memory)
            }
        };
        self.bump_level_counter(level);
        Ok((value, level))
    }

    fn routed_write(&mut self, paddr: Address, value: u8) -> Result<AccessLevel> {
        let level = match self.cache.as_mut() {
            Some(cache) => {
                let before = cache.stats();
                cache.write(paddr, value)?;
                served_level(before, cache.stats())
            }
            None => {
                self.memory.borrow_mut().write(paddr, value)?;
                AccessLevel::Memory
            }
        };
        self.bump_level_counter(level);
        Ok(level)
    }

    fn bump_level_counter(&mut self, level: AccessLevel) {
        match level {
            AccessLevel::L1Cache => self.session.l1_hits += 1,
            AccessLevel::L2Cache => self.session.l2_hits += 1,
            AccessLevel::Memory => self.session.memory_accesses += 1,
        }
    }

    fn record(&mut self, outcome: AccessOutcome) {
        self.history.push_back(outcome);
        if self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }
}

/// Which level served an access, judged by the hit counters that moved.
fn served_level(before: HierarchyStats, after: HierarchyStats) -> AccessLevel {
    if after.l1.hits > before.l1.hits {
        AccessLevel::L1Cache
    } else if after.l2.hits > before.l2.hits {
        AccessLevel::L2Cache
    } else {
        AccessLevel::Memory
    }
}
