//! In-memory image with fault injection for tests.

use std::ops::Range;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::reader::{ReadMemory, WriteMemory};
use crate::error::{Error, Result};

/// Image backed by a plain `Vec<u8>` at a fake base address.
///
/// Writes into any range registered with [`MockMemoryBuilder::read_only`]
/// fail with `ProtectionFailure`, which is how page-protection errors are
/// simulated.
pub struct MockMemory {
    base: usize,
    data: RwLock<Vec<u8>>,
    read_only: Vec<Range<usize>>,
    writes: AtomicUsize,
}

pub struct MockMemoryBuilder {
    base: usize,
    data: Vec<u8>,
    read_only: Vec<Range<usize>>,
}

impl Default for MockMemoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMemoryBuilder {
    pub fn new() -> Self {
        Self {
            base: 0x0040_0000,
            data: Vec::new(),
            read_only: Vec::new(),
        }
    }

    pub fn base(mut self, base: usize) -> Self {
        self.base = base;
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Reject writes touching `[start, end)` (absolute addresses).
    pub fn read_only(mut self, range: Range<usize>) -> Self {
        self.read_only.push(range);
        self
    }

    pub fn build(self) -> MockMemory {
        MockMemory {
            base: self.base,
            data: RwLock::new(self.data),
            read_only: self.read_only,
            writes: AtomicUsize::new(0),
        }
    }
}

impl MockMemory {
    pub fn builder() -> MockMemoryBuilder {
        MockMemoryBuilder::new()
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl ReadMemory for MockMemory {
    fn base_address(&self) -> usize {
        self.base
    }

    fn size(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    fn read_bytes(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        self.ensure_contains(address, len)?;
        let data = self.data.read().unwrap();
        let start = address - self.base;
        Ok(data[start..start + len].to_vec())
    }
}

impl WriteMemory for MockMemory {
    fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()> {
        self.ensure_contains(address, bytes.len())?;
        let end = address + bytes.len();
        if self
            .read_only
            .iter()
            .any(|r| address < r.end && end > r.start)
        {
            return Err(Error::ProtectionFailure {
                address,
                message: "page is read-only".to_string(),
            });
        }
        let mut data = self.data.write().unwrap();
        let start = address - self.base;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_range_rejects_overlapping_writes() {
        let mock = MockMemory::builder()
            .base(0x1000)
            .with_data(vec![0; 0x100])
            .read_only(0x1010..0x1020)
            .build();

        assert!(mock.write_u32(0x1000, 1).is_ok());
        assert!(matches!(
            mock.write_u32(0x100E, 1),
            Err(Error::ProtectionFailure { address: 0x100E, .. })
        ));
        assert!(mock.write_u32(0x1020, 7).is_ok());
        assert_eq!(mock.read_u32(0x1020).unwrap(), 7);
        assert_eq!(mock.write_count(), 2);
    }
}
