use log::trace;

use super::{CacheLevelConfig, CachePolicy, CacheStats};
use crate::error::{MemoryError, Result};
use crate::util::{is_power_of_two, low_mask};
use crate::{Address, SharedMemory};

/// One way within a set.
#[derive(Debug, Clone)]
struct CacheLine {
    valid: bool,
    tag: Address,
    data: Vec<u8>,
    insertion_order: u64,
    last_access_time: u64,
    access_count: u64,
}

impl CacheLine {
    fn new(block_size: usize) -> Self {
        CacheLine {
            valid: false,
            tag: 0,
            data: vec![0; block_size],
            insertion_order: 0,
            last_access_time: 0,
            access_count: 0,
        }
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.tag = 0;
        self.insertion_order = 0;
        self.last_access_time = 0;
        self.access_count = 0;
    }

    fn record_access(&mut self, now: u64) {
        self.last_access_time = now;
        self.access_count += 1;
    }
}

/// One set-associative cache level over the shared backing memory.
///
/// Addresses decompose as `tag | set_index | offset` with
/// `offset_bits = log2(block_size)` and `index_bits = log2(num_sets)`.
/// Writes are write-through and no-write-allocate: a write to a
/// non-resident block updates the backing store, records a miss and leaves
/// every line untouched.
pub struct CacheLevel {
    level: u8,
    num_sets: usize,
    associativity: usize,
    block_size: usize,
    policy: CachePolicy,
    offset_bits: u32,
    index_bits: u32,
    memory: SharedMemory,
    sets: Vec<Vec<CacheLine>>,
    stats: CacheStats,
    /// Logical clock; ticks on every read and write, never on `contains`.
    global_time: u64,
}

impl CacheLevel {
    pub fn new(level: u8, config: CacheLevelConfig, memory: SharedMemory) -> Result<Self> {
        if !is_power_of_two(config.num_sets) {
            return Err(MemoryError::InvalidConfig(format!(
                "number of sets {} is not a power of two",
                config.num_sets
            )));
        }
        if !is_power_of_two(config.block_size) {
            return Err(MemoryError::InvalidConfig(format!(
                "block size {} is not a power of two",
                config.block_size
            )));
        }
        if config.associativity == 0 {
            return Err(MemoryError::InvalidConfig(
                "associativity must be at least 1".into(),
            ));
        }

        let sets = (0..config.num_sets)
            .map(|_| {
                (0..config.associativity)
                    .map(|_| CacheLine::new(config.block_size))
                    .collect()
            })
            .collect();

        Ok(CacheLevel {
            level,
            num_sets: config.num_sets,
            associativity: config.associativity,
            block_size: config.block_size,
            policy: config.policy,
            offset_bits: config.block_size.trailing_zeros(),
            index_bits: config.num_sets.trailing_zeros(),
            memory,
            sets,
            stats: CacheStats::default(),
            global_time: 0,
        })
    }

    pub fn read(&mut self, addr: Address) -> Result<u8> {
        self.stats.accesses += 1;
        self.global_time += 1;
        let (tag, set_index, offset) = self.parse_address(addr);

        if let Some(way) = self.find_way(set_index, tag) {
            self.stats.hits += 1;
            let now = self.global_time;
            let line = &mut self.sets[set_index][way];
            line.record_access(now);
            return Ok(line.data[offset]);
        }

        self.stats.misses += 1;
        // bounds-check through the backing store before touching the set
        self.memory.borrow().read(addr)?;
        let way = self.select_victim(set_index);
        self.load_block(addr, tag, set_index, way);
        Ok(self.sets[set_index][way].data[offset])
    }

    pub fn write(&mut self, addr: Address, value: u8) -> Result<()> {
        self.stats.accesses += 1;
        self.global_time += 1;
        let (tag, set_index, offset) = self.parse_address(addr);

        // write-through before anything else
        if let Err(e) = self.memory.borrow_mut().write(addr, value) {
            self.stats.misses += 1;
            return Err(e);
        }

        match self.find_way(set_index, tag) {
            Some(way) => {
                self.stats.hits += 1;
                let now = self.global_time;
                let line = &mut self.sets[set_index][way];
                line.data[offset] = value;
                line.record_access(now);
            }
            None => {
                // no-write-allocate: the backing store took the write
                self.stats.misses += 1;
            }
        }
        Ok(())
    }

    /// Refill path used by the hierarchy after a miss at this level.
    ///
    /// Identical to [`CacheLevel::read`]: the demand access missed here, so
    /// the level records the miss and loads the aligned block around `addr`.
    pub(crate) fn fill(&mut self, addr: Address) -> Result<u8> {
        self.read(addr)
    }

    /// Read-only residency probe. Touches no counters and no line metadata.
    pub fn contains(&self, addr: Address) -> bool {
        let (tag, set_index, _) = self.parse_address(addr);
        self.sets[set_index].iter().any(|l| l.valid && l.tag == tag)
    }

    /// Invalidates every line. Cumulative statistics survive.
    pub fn flush(&mut self) {
        for set in &mut self.sets {
            for line in set {
                line.invalidate();
            }
        }
        trace!("L{} flushed", self.level);
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn num_sets(&self) -> usize {
        self.num_sets
    }

    pub fn associativity(&self) -> usize {
        self.associativity
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn parse_address(&self, addr: Address) -> (Address, usize, usize) {
        let offset = (addr & low_mask(self.offset_bits)) as usize;
        let set_index = ((addr >> self.offset_bits) & low_mask(self.index_bits)) as usize;
        let tag = addr >> (self.offset_bits + self.index_bits);
        (tag, set_index, offset)
    }

    fn find_way(&self, set_index: usize, tag: Address) -> Option<usize> {
        self.sets[set_index]
            .iter()
            .position(|l| l.valid && l.tag == tag)
    }

    /// Invalid lines first, then the policy's pick; the lowest way index
    /// wins ties.
    fn select_victim(&self, set_index: usize) -> usize {
        let set = &self.sets[set_index];
        if let Some(way) = set.iter().position(|l| !l.valid) {
            return way;
        }

        let key = |line: &CacheLine| match self.policy {
            CachePolicy::Fifo => line.insertion_order,
            CachePolicy::Lru => line.last_access_time,
            CachePolicy::Lfu => line.access_count,
        };
        let mut victim = 0;
        for way in 1..set.len() {
            if key(&set[way]) < key(&set[victim]) {
                victim = way;
            }
        }
        victim
    }

    fn load_block(&mut self, addr: Address, tag: Address, set_index: usize, way: usize) {
        let block_addr = (addr >> self.offset_bits) << self.offset_bits;
        let now = self.global_time;
        let memory = self.memory.borrow();
        let line = &mut self.sets[set_index][way];

        for i in 0..line.data.len() {
            // blocks at the edge of memory are padded with zeroes
            line.data[i] = memory.read(block_addr + i as Address).unwrap_or(0);
        }
        line.valid = true;
        line.tag = tag;
        line.insertion_order = now;
        line.last_access_time = now;
        line.access_count = 1;

        trace!(
            "L{} fill: block {:#x} -> set {} way {}",
            self.level,
            block_addr,
            set_index,
            way
        );
    }
}
