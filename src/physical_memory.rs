use log::debug;

use crate::error::{MemoryError, Result};
use crate::Address;

/// Simulated physical memory: a flat, byte-addressable array of fixed size.
///
/// `used_size` is advisory bookkeeping maintained by the active allocator;
/// plain reads and writes never touch it.
pub struct PhysicalMemory {
    data: Vec<u8>,
    used_size: usize,
}

impl PhysicalMemory {
    pub fn new(total_size: usize) -> Self {
        debug!("physical memory initialized: {} bytes", total_size);
        PhysicalMemory {
            data: vec![0; total_size],
            used_size: 0,
        }
    }

    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    pub fn used_size(&self) -> usize {
        self.used_size
    }

    pub fn free_size(&self) -> usize {
        self.data.len() - self.used_size
    }

    pub fn read(&self, addr: Address) -> Result<u8> {
        self.check_range(addr, 1)?;
        Ok(self.data[addr as usize])
    }

    pub fn write(&mut self, addr: Address, value: u8) -> Result<()> {
        self.check_range(addr, 1)?;
        self.data[addr as usize] = value;
        Ok(())
    }

    /// Bulk copy out of memory into `dst`.
    pub fn read_range(&self, addr: Address, dst: &mut [u8]) -> Result<()> {
        self.check_range(addr, dst.len())?;
        let start = addr as usize;
        dst.copy_from_slice(&self.data[start..start + dst.len()]);
        Ok(())
    }

    /// Bulk copy of `src` into memory.
    pub fn write_range(&mut self, addr: Address, src: &[u8]) -> Result<()> {
        self.check_range(addr, src.len())?;
        let start = addr as usize;
        self.data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn is_valid_range(&self, addr: Address, len: usize) -> bool {
        self.check_range(addr, len).is_ok()
    }

    /// Zeroes every byte and resets the advisory used counter.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.used_size = 0;
    }

    /// Called by the active allocator whenever its bookkeeping changes.
    pub fn update_used(&mut self, used: usize) {
        debug_assert!(used <= self.data.len());
        self.used_size = used;
    }

    fn check_range(&self, addr: Address, len: usize) -> Result<()> {
        // overflow-safe `addr + len <= total_size`
        match addr.checked_add(len as u64) {
            Some(end) if end <= self.data.len() as u64 => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                addr,
                total: self.data.len(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_zeroed() {
        let mem = PhysicalMemory::new(256);
        assert_eq!(mem.read(0).unwrap(), 0);
        assert_eq!(mem.read(255).unwrap(), 0);
        assert_eq!(mem.total_size(), 256);
        assert_eq!(mem.used_size(), 0);
        assert_eq!(mem.free_size(), 256);
    }

    #[test]
    fn read_write_roundtrip() {
        let mut mem = PhysicalMemory::new(256);
        mem.write(100, 42).unwrap();
        assert_eq!(mem.read(100).unwrap(), 42);
        mem.write(100, 7).unwrap();
        assert_eq!(mem.read(100).unwrap(), 7);
    }

    #[test]
    fn rejects_out_of_bounds() {
        let mut mem = PhysicalMemory::new(256);
        assert_eq!(
            mem.read(256),
            Err(MemoryError::OutOfBounds { addr: 256, total: 256 })
        );
        assert!(mem.write(1000, 1).is_err());
    }

    #[test]
    fn range_ops() {
        let mut mem = PhysicalMemory::new(64);
        mem.write_range(10, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        mem.read_range(10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        // exactly at the boundary is fine, one past is not
        mem.write_range(60, &[9, 9, 9, 9]).unwrap();
        assert!(mem.write_range(61, &[0; 4]).is_err());
        let mut big = [0u8; 65];
        assert!(mem.read_range(0, &mut big).is_err());
    }

    #[test]
    fn range_check_survives_overflowing_addresses() {
        let mem = PhysicalMemory::new(64);
        assert!(!mem.is_valid_range(u64::MAX, 2));
        assert!(!mem.is_valid_range(u64::MAX - 1, 4));
        assert!(mem.is_valid_range(0, 64));
        assert!(!mem.is_valid_range(0, 65));
    }

    #[test]
    fn clear_resets_bytes_and_used_counter() {
        let mut mem = PhysicalMemory::new(128);
        mem.write(5, 99).unwrap();
        mem.update_used(64);
        assert_eq!(mem.free_size(), 64);

        mem.clear();
        assert_eq!(mem.read(5).unwrap(), 0);
        assert_eq!(mem.used_size(), 0);
        assert_eq!(mem.free_size(), 128);
    }

    #[test]
    fn used_counter_is_advisory() {
        let mut mem = PhysicalMemory::new(128);
        mem.write(0, 1).unwrap();
        mem.read(0).unwrap();
        assert_eq!(mem.used_size(), 0);

        mem.update_used(32);
        assert_eq!(mem.used_size(), 32);
        assert_eq!(mem.free_size(), 96);
    }
}
