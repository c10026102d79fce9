use std::collections::VecDeque;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::util::{is_power_of_two, low_mask};
use crate::{Address, SharedMemory};

/// Which page gets evicted when every frame is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageReplacementPolicy {
    Fifo,
    Lru,
    Clock,
}

impl std::fmt::Display for PageReplacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PageReplacementPolicy::Fifo => "FIFO",
            PageReplacementPolicy::Lru => "LRU",
            PageReplacementPolicy::Clock => "Clock",
        };
        f.write_str(name)
    }
}

/// Shape of a virtual address space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VmConfig {
    pub num_vpages: usize,
    /// At most `num_vpages`; `num_frames * page_size` must fit in the
    /// backing memory.
    pub num_frames: usize,
    /// Bytes per page, a power of two.
    pub page_size: usize,
    pub policy: PageReplacementPolicy,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            num_vpages: 64,
            num_frames: 16,
            page_size: 512,
            policy: PageReplacementPolicy::Lru,
        }
    }
}

/// Cumulative translation counters.
///
/// `page_faults + page_hits = total_accesses` holds after every operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStats {
    pub page_faults: u64,
    pub page_hits: u64,
    pub total_accesses: u64,
}

impl VmStats {
    pub fn fault_rate(&self) -> f64 {
        if self.total_accesses == 0 {
            return 0.0;
        }
        100.0 * self.page_faults as f64 / self.total_accesses as f64
    }

    pub fn hit_rate(&self) -> f64 {
        if self.total_accesses == 0 {
            return 0.0;
        }
        100.0 * self.page_hits as f64 / self.total_accesses as f64
    }
}

/// One virtual page's mapping state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageTableEntry {
    pub valid: bool,
    pub frame: usize,
    pub dirty: bool,
    /// Consulted by the Clock hand; set on a translation hit, cleared when
    /// the hand passes over the entry. A freshly loaded page starts with it
    /// clear.
    pub referenced: bool,
    pub load_time: u64,
    pub last_access: u64,
}

impl PageTableEntry {
    fn invalidate(&mut self) {
        *self = PageTableEntry::default();
    }

    fn record_access(&mut self, now: u64) {
        self.referenced = true;
        self.last_access = now;
    }
}

/// Demand-paged virtual memory over the shared backing memory.
///
/// Frames occupy the first `num_frames * page_size` bytes of the backing
/// store. "Disk" is simulated: loading virtual page `p` fills its frame
/// with the deterministic pattern `(p * page_size + i) mod 256`, and a
/// dirty write-back is a no-op because the bytes already live in memory.
pub struct VirtualMemory {
    memory: SharedMemory,
    num_vpages: usize,
    num_frames: usize,
    page_size: usize,
    policy: PageReplacementPolicy,
    offset_bits: u32,
    page_table: Vec<PageTableEntry>,
    frame_allocated: Vec<bool>,
    /// Load order of resident pages; eviction removes by identity so the
    /// queue can never go stale.
    fifo_queue: VecDeque<usize>,
    clock_hand: usize,
    global_time: u64,
    stats: VmStats,
}

impl VirtualMemory {
    pub fn new(memory: SharedMemory, config: VmConfig) -> Result<Self> {
        if !is_power_of_two(config.page_size) {
            return Err(MemoryError::InvalidConfig(format!(
                "page size {} is not a power of two",
                config.page_size
            )));
        }
        if config.num_vpages == 0 {
            return Err(MemoryError::InvalidConfig(
                "number of virtual pages must be > 0".into(),
            ));
        }
        if config.num_frames == 0 {
            return Err(MemoryError::InvalidConfig(
                "number of physical frames must be > 0".into(),
            ));
        }
        if config.num_frames > config.num_vpages {
            return Err(MemoryError::InvalidConfig(format!(
                "{} frames exceed {} virtual pages",
                config.num_frames, config.num_vpages
            )));
        }
        let required = config.num_frames * config.page_size;
        let total = memory.borrow().total_size();
        if required > total {
            return Err(MemoryError::InvalidConfig(format!(
                "{} frames of {} bytes need {} bytes but memory has {}",
                config.num_frames, config.page_size, required, total
            )));
        }

        Ok(VirtualMemory {
            memory,
            num_vpages: config.num_vpages,
            num_frames: config.num_frames,
            page_size: config.page_size,
            policy: config.policy,
            offset_bits: config.page_size.trailing_zeros(),
            page_table: vec![PageTableEntry::default(); config.num_vpages],
            frame_allocated: vec![false; config.num_frames],
            fifo_queue: VecDeque::new(),
            clock_hand: 0,
            global_time: 0,
            stats: VmStats::default(),
        })
    }

    /// Maps a virtual address to a physical one, servicing a page fault if
    /// the page is not resident.
    pub fn translate(&mut self, vaddr: Address) -> Result<Address> {
        let (vpage, offset) = self.parse_address(vaddr);
        if vpage >= self.num_vpages {
            return Err(MemoryError::InvalidAddress { addr: vaddr, vpage });
        }

        self.stats.total_accesses += 1;
        self.global_time += 1;

        if self.page_table[vpage].valid {
            self.stats.page_hits += 1;
            let now = self.global_time;
            let entry = &mut self.page_table[vpage];
            entry.record_access(now);
            let frame = entry.frame;
            return Ok(self.physical_address(frame, offset));
        }

        self.stats.page_faults += 1;
        let frame = self.service_fault(vpage)?;
        Ok(self.physical_address(frame, offset))
    }

    pub fn read(&mut self, vaddr: Address) -> Result<u8> {
        let paddr = self.translate(vaddr)?;
        self.memory.borrow().read(paddr)
    }

    pub fn write(&mut self, vaddr: Address, value: u8) -> Result<()> {
        let paddr = self.translate(vaddr)?;
        let (vpage, _) = self.parse_address(vaddr);
        self.page_table[vpage].dirty = true;
        self.memory.borrow_mut().write(paddr, value)
    }

    /// Invalidates every entry, frees every frame, clears the FIFO queue
    /// and parks the clock hand. Cumulative statistics survive.
    pub fn flush(&mut self) {
        for entry in &mut self.page_table {
            entry.invalidate();
        }
        self.frame_allocated.fill(false);
        self.fifo_queue.clear();
        self.clock_hand = 0;
        debug!("virtual memory flushed");
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    pub fn num_vpages(&self) -> usize {
        self.num_vpages
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn policy(&self) -> PageReplacementPolicy {
        self.policy
    }

    /// Page-table introspection for front-ends and tests.
    pub fn entry(&self, vpage: usize) -> Option<&PageTableEntry> {
        self.page_table.get(vpage)
    }

    pub fn resident_pages(&self) -> usize {
        self.page_table.iter().filter(|e| e.valid).count()
    }

    /// Flags the page backing `vaddr` as dirty, if it is resident.
    pub(crate) fn mark_dirty(&mut self, vaddr: Address) {
        let (vpage, _) = self.parse_address(vaddr);
        if let Some(entry) = self.page_table.get_mut(vpage) {
            if entry.valid {
                entry.dirty = true;
            }
        }
    }

    fn parse_address(&self, vaddr: Address) -> (usize, usize) {
        let offset = (vaddr & low_mask(self.offset_bits)) as usize;
        let vpage = (vaddr >> self.offset_bits) as usize;
        (vpage, offset)
    }

    fn physical_address(&self, frame: usize, offset: usize) -> Address {
        ((frame as Address) << self.offset_bits) | offset as Address
    }

    fn service_fault(&mut self, vpage: usize) -> Result<usize> {
        let frame = match self.lowest_free_frame() {
            Some(frame) => frame,
            None => {
                let victim = self.select_victim();
                self.evict(victim)
            }
        };

        self.frame_allocated[frame] = true;
        self.load_page(vpage, frame)?;

        let now = self.global_time;
        let entry = &mut self.page_table[vpage];
        entry.valid = true;
        entry.frame = frame;
        entry.dirty = false;
        entry.referenced = false;
        entry.load_time = now;
        entry.last_access = now;

        if self.policy == PageReplacementPolicy::Fifo {
            self.fifo_queue.push_back(vpage);
        }

        debug!("page fault: vpage {} -> frame {}", vpage, frame);
        Ok(frame)
    }

    fn lowest_free_frame(&self) -> Option<usize> {
        self.frame_allocated.iter().position(|allocated| !allocated)
    }

    fn select_victim(&mut self) -> usize {
        match self.policy {
            PageReplacementPolicy::Fifo => match self.fifo_queue.front() {
                Some(&vpage) => vpage,
                None => self.first_valid_page(),
            },

            PageReplacementPolicy::Lru => {
                let mut victim = 0;
                let mut min_time = u64::MAX;
                for (vpage, entry) in self.page_table.iter().enumerate() {
                    if entry.valid && entry.last_access < min_time {
                        min_time = entry.last_access;
                        victim = vpage;
                    }
                }
                victim
            }

            PageReplacementPolicy::Clock => {
                // circular scan; referenced pages get a second chance
                let max_scans = self.num_vpages * 2;
                for _ in 0..max_scans {
                    let hand = self.clock_hand;
                    self.clock_hand = (self.clock_hand + 1) % self.num_vpages;

                    let entry = &mut self.page_table[hand];
                    if entry.valid {
                        if !entry.referenced {
                            return hand;
                        }
                        entry.referenced = false;
                    }
                }
                self.first_valid_page()
            }
        }
    }

    fn first_valid_page(&self) -> usize {
        self.page_table
            .iter()
            .position(|entry| entry.valid)
            .unwrap_or(0)
    }

    /// Removes `vpage` from memory and returns the frame it held.
    fn evict(&mut self, vpage: usize) -> usize {
        let entry = self.page_table[vpage];
        debug_assert!(entry.valid);

        if entry.dirty {
            // write-back is a no-op: the bytes already live in the frame
            // and there is no real disk behind the simulator
            trace!("evicting dirty vpage {}", vpage);
        } else {
            trace!("evicting vpage {}", vpage);
        }

        self.frame_allocated[entry.frame] = false;
        self.page_table[vpage].invalidate();

        // drop the evicted page from the FIFO bookkeeping by identity
        if let Some(pos) = self.fifo_queue.iter().position(|&p| p == vpage) {
            self.fifo_queue.remove(pos);
        }

        entry.frame
    }

    fn load_page(&mut self, vpage: usize, frame: usize) -> Result<()> {
        let frame_start = (frame * self.page_size) as Address;
        let mut memory = self.memory.borrow_mut();
        for i in 0..self.page_size {
            let value = ((vpage * self.page_size + i) % 256) as u8;
            memory.write(frame_start + i as Address, value)?;
        }
        Ok(())
    }
}
