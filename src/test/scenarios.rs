//! Cross-subsystem scenarios: the behaviors that hold the three subsystems
//! together over one shared memory.

use super::{init_logging, small_hierarchy_config, small_vm_config};
use crate::modules::allocator::{Allocator, BuddyAllocator, FitStrategy, StandardAllocator};
use crate::modules::cache::{CacheHierarchy, CacheLevel, CacheLevelConfig, CachePolicy};
use crate::modules::virtual_memory::{PageReplacementPolicy, VirtualMemory};
use crate::shared_memory;

#[test]
fn buddy_addresses_obey_the_xor_rule() {
    init_logging();
    let memory = shared_memory(1024);
    let mut alloc = BuddyAllocator::new(memory, 32).unwrap();

    let a = alloc.allocate(64).unwrap();
    let b = alloc.allocate(64).unwrap();
    let a_addr = alloc.block_address(a).unwrap();
    let b_addr = alloc.block_address(b).unwrap();

    assert_eq!(a_addr % 64, 0);
    assert_eq!(b_addr, a_addr ^ 64);
}

#[test]
fn buddy_coalesce_chain_reassembles_memory() {
    init_logging();
    let memory = shared_memory(1024);
    let mut alloc = BuddyAllocator::new(memory.clone(), 32).unwrap();

    let mut used = vec![memory.borrow().used_size()];
    let ids: Vec<_> = (0..4)
        .map(|_| {
            let id = alloc.allocate(64).unwrap();
            used.push(memory.borrow().used_size());
            id
        })
        .collect();
    for id in ids {
        alloc.deallocate(id).unwrap();
        used.push(memory.borrow().used_size());
    }

    let big = alloc.allocate(256).unwrap();
    used.push(memory.borrow().used_size());

    assert_eq!(used, vec![0, 64, 128, 192, 256, 192, 128, 64, 0, 256]);
    alloc.deallocate(big).unwrap();
}

#[test]
fn lru_cache_evicts_the_stale_way() {
    init_logging();
    let memory = shared_memory(256);
    let config = CacheLevelConfig {
        num_sets: 1,
        associativity: 2,
        block_size: 16,
        policy: CachePolicy::Lru,
    };
    let mut cache = CacheLevel::new(1, config, memory).unwrap();

    cache.read(0).unwrap();
    cache.read(16).unwrap();
    cache.read(0).unwrap();
    let misses_before = cache.stats().misses;
    cache.read(32).unwrap();

    assert_eq!(cache.stats().misses, misses_before + 1);
    assert!(cache.contains(0));
    assert!(!cache.contains(16));
    assert!(cache.contains(32));
}

#[test]
fn hierarchy_write_does_not_allocate() {
    init_logging();
    let memory = shared_memory(256);
    let mut cache = CacheHierarchy::new(memory.clone(), small_hierarchy_config()).unwrap();

    cache.write(200, 123).unwrap();
    let stats = cache.stats();
    assert_eq!(stats.l1.misses, 0);
    assert_eq!(stats.l2.misses, 0);
    assert_eq!(memory.borrow().read(200).unwrap(), 123);

    assert_eq!(cache.read(200).unwrap(), 123);
    let stats = cache.stats();
    assert_eq!(stats.l1.misses, 1);
}

#[test]
fn clock_spares_the_referenced_page() {
    init_logging();
    let memory = shared_memory(1024);
    let mut vm = VirtualMemory::new(
        memory,
        crate::modules::virtual_memory::VmConfig {
            num_vpages: 4,
            num_frames: 3,
            page_size: 256,
            policy: PageReplacementPolicy::Clock,
        },
    )
    .unwrap();

    vm.read(0).unwrap();
    vm.read(256).unwrap();
    vm.read(512).unwrap();
    vm.read(0).unwrap();
    vm.read(768).unwrap();

    assert!(vm.entry(0).unwrap().valid);
    assert!(!vm.entry(1).unwrap().valid);
    assert!(vm.entry(2).unwrap().valid);
    assert!(vm.entry(3).unwrap().valid);
}

#[test]
fn vm_and_cache_agree_through_the_shared_memory() {
    init_logging();
    let memory = shared_memory(4096);
    let mut vm = VirtualMemory::new(
        memory.clone(),
        small_vm_config(PageReplacementPolicy::Lru),
    )
    .unwrap();
    let mut cache = CacheHierarchy::new(memory.clone(), small_hierarchy_config()).unwrap();

    vm.write(1024, 55).unwrap();
    let paddr = vm.translate(1024).unwrap();

    assert_eq!(memory.borrow().read(paddr).unwrap(), 55);
    assert_eq!(cache.read(paddr).unwrap(), 55);
}

#[test]
fn write_through_consistency_survives_a_flush() {
    init_logging();
    let memory = shared_memory(256);
    let mut cache = CacheHierarchy::new(memory.clone(), small_hierarchy_config()).unwrap();

    for addr in [0u64, 16, 32] {
        cache.read(addr).unwrap();
        cache.write(addr, (addr + 1) as u8).unwrap();
    }
    cache.flush();

    for addr in [0u64, 16, 32] {
        assert_eq!(memory.borrow().read(addr).unwrap(), (addr + 1) as u8);
    }
}

#[test]
fn standard_allocator_round_trip_restores_used_size() {
    init_logging();
    let memory = shared_memory(2048);
    let mut alloc = StandardAllocator::new(memory.clone(), FitStrategy::Best);

    let keep = alloc.allocate(300).unwrap();
    let used_before = memory.borrow().used_size();
    let free_before = alloc.total_free();

    let id = alloc.allocate(500).unwrap();
    alloc.deallocate(id).unwrap();

    assert_eq!(memory.borrow().used_size(), used_before);
    assert_eq!(alloc.total_free(), free_before);
    alloc.deallocate(keep).unwrap();
    assert_eq!(memory.borrow().used_size(), 0);
}

#[test]
fn allocator_ignores_bytes_and_io_ignores_allocator() {
    init_logging();
    let memory = shared_memory(1024);
    let mut alloc = StandardAllocator::new(memory.clone(), FitStrategy::First);

    memory.borrow_mut().write(10, 200).unwrap();
    let id = alloc.allocate(64).unwrap();

    // allocation bookkeeping never touches the bytes
    assert_eq!(memory.borrow().read(10).unwrap(), 200);

    // and raw writes never touch the allocator's bookkeeping
    memory.borrow_mut().write(0, 1).unwrap();
    assert_eq!(alloc.block_address(id).unwrap(), 0);
    assert_eq!(memory.borrow().used_size(), 64);
}

#[test]
fn fragmentation_metrics_stay_in_range() {
    init_logging();
    let memory = shared_memory(1024);
    let mut alloc = StandardAllocator::new(memory, FitStrategy::First);

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(alloc.allocate(100).unwrap());
    }
    for id in ids.iter().step_by(2) {
        alloc.deallocate(*id).unwrap();
    }

    for value in [
        alloc.utilization(),
        alloc.internal_fragmentation(),
        alloc.external_fragmentation(),
    ] {
        assert!((0.0..=100.0).contains(&value), "metric out of range: {}", value);
    }
}

#[test]
fn stats_serialize_to_json() {
    init_logging();
    let memory = shared_memory(4096);
    let mut cache = CacheHierarchy::new(memory.clone(), small_hierarchy_config()).unwrap();
    let mut vm = VirtualMemory::new(
        memory.clone(),
        small_vm_config(PageReplacementPolicy::Fifo),
    )
    .unwrap();
    let mut alloc = StandardAllocator::new(memory, FitStrategy::Worst);

    cache.read(0).unwrap();
    vm.read(0).unwrap();
    alloc.allocate(10).unwrap();

    let cache_json = serde_json::to_value(cache.stats()).unwrap();
    assert_eq!(cache_json["memory_accesses"], 1);
    assert_eq!(cache_json["l1"]["misses"], 1);

    let vm_json = serde_json::to_value(vm.stats()).unwrap();
    assert_eq!(vm_json["page_faults"], 1);

    let alloc_json = serde_json::to_value(alloc.stats()).unwrap();
    assert_eq!(alloc_json["counters"]["total_allocations"], 1);
    assert_eq!(alloc_json["allocated_blocks"], 1);
}

#[test]
fn full_pipeline_allocate_then_access_through_the_cache() {
    init_logging();
    let mut system = crate::MemorySystem::new(crate::MemorySystemConfig {
        memory_size: 4096,
        allocator: crate::AllocatorType::FirstFit,
        buddy_min_block: 32,
        cache: Some(small_hierarchy_config()),
        vm: None,
    })
    .unwrap();

    let id = system.allocate(64).unwrap();
    let base = system.block_address(id).unwrap();

    for i in 0..64u64 {
        system.write(base + i, i as u8).unwrap();
    }
    for i in 0..64u64 {
        assert_eq!(system.read(base + i).unwrap().value, i as u8);
    }

    let session = system.session_stats();
    assert_eq!(session.total_writes, 64);
    assert_eq!(session.total_reads, 64);
    assert_eq!(
        session.l1_hits + session.l2_hits + session.memory_accesses,
        session.total_accesses
    );

    // deallocation does not disturb the bytes
    system.deallocate(id).unwrap();
    assert_eq!(system.read(base).unwrap().value, 0);
}

#[test]
fn mixed_policies_and_block_sizes_coexist() {
    init_logging();
    let memory = shared_memory(4096);
    let config = crate::modules::cache::HierarchyConfig {
        l1: CacheLevelConfig {
            num_sets: 4,
            associativity: 1,
            block_size: 16,
            policy: CachePolicy::Fifo,
        },
        l2: CacheLevelConfig {
            num_sets: 8,
            associativity: 2,
            block_size: 32,
            policy: CachePolicy::Lru,
        },
    };
    let mut cache = CacheHierarchy::new(memory.clone(), config).unwrap();

    for i in 0..64u64 {
        memory.borrow_mut().write(i, (i * 3) as u8).unwrap();
    }

    // 0 and 16 share one 32-byte L2 block but use two 16-byte L1 blocks
    assert_eq!(cache.read(0).unwrap(), 0);
    assert!(cache.contains_in_l2(16));
    assert!(!cache.contains_in_l1(16));

    let before = cache.stats();
    assert_eq!(cache.read(16).unwrap(), 48);
    let after = cache.stats();
    assert_eq!(after.l2.hits, before.l2.hits + 1);
    assert_eq!(after.memory_accesses, before.memory_accesses);

    let stats = cache.stats();
    assert_eq!(stats.total_accesses, stats.l1.accesses + stats.l2.accesses);
}

#[test]
fn page_loads_overwrite_allocator_handed_bytes() {
    // the engine promises no content coherence between the page loader and
    // the allocator over the same region; pin down what actually happens
    init_logging();
    let memory = shared_memory(4096);
    let mut alloc = StandardAllocator::new(memory.clone(), FitStrategy::First);
    let mut vm = VirtualMemory::new(
        memory.clone(),
        small_vm_config(PageReplacementPolicy::Lru),
    )
    .unwrap();

    let id = alloc.allocate(16).unwrap();
    let addr = alloc.block_address(id).unwrap();
    memory.borrow_mut().write(addr, 201).unwrap();

    // servicing a fault for vpage 0 fills frame 0, clobbering the byte
    vm.read(0).unwrap();
    assert_eq!(memory.borrow().read(addr).unwrap(), (addr % 256) as u8);
}
