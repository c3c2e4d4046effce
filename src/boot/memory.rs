//! Guest physical memory.
//!
//! One contiguous, page-aligned, zero-initialized region starting at guest
//! physical address 0, backed by an anonymous private mmap owned by the
//! host process. The VMM registers it with KVM as memory slot 0; KVM's
//! nested paging then translates guest physical accesses into this region
//! transparently.
//!
//! `vm_memory::GuestMemoryMmap` is the backing abstraction; this wrapper
//! pins the single-region shape and folds access failures into the crate's
//! error taxonomy.

use crate::error::{Result, VmmError};
use vm_memory::{Bytes, GuestAddress, GuestMemory as _, GuestMemoryMmap};

/// Guest physical memory region.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocate `size` bytes of zeroed guest memory at guest physical 0.
    pub fn new(size: u64) -> Result<Self> {
        let inner = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size as usize)])
            .map_err(|e| VmmError::NoMemory(format!("cannot mmap {size:#x} bytes: {e}")))?;

        Ok(Self { inner, size })
    }

    /// Total size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Host virtual address of guest physical 0, for KVM slot registration.
    pub fn host_address(&self) -> Result<u64> {
        self.inner
            .get_host_address(GuestAddress(0))
            .map(|p| p as u64)
            .map_err(|e| VmmError::NoMemory(format!("no host mapping for guest 0: {e}")))
    }

    /// Copy `data` into guest memory at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| VmmError::GMemNotEnough("write beyond end of guest memory"))
    }

    /// Copy guest memory at `addr` into `data`.
    #[allow(dead_code)]
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| VmmError::GMemNotEnough("read beyond end of guest memory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_zeroed() {
        let mem = GuestMemory::new(0x2000).unwrap();
        let mut buf = [0xFFu8; 64];
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn test_write_read_round_trip() {
        let mem = GuestMemory::new(0x2000).unwrap();
        mem.write(0x800, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        mem.read(0x800, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_bounds_access_fails() {
        let mem = GuestMemory::new(0x1000).unwrap();
        assert!(matches!(
            mem.write(0xFFF, &[1, 2]),
            Err(VmmError::GMemNotEnough(_))
        ));
        let mut buf = [0u8; 2];
        assert!(matches!(
            mem.read(0xFFF, &mut buf),
            Err(VmmError::GMemNotEnough(_))
        ));
    }
}
