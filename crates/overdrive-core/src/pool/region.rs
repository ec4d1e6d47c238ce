//! Backing memory for the pool.

use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One contiguous, committed, zero-filled block that never moves.
pub struct PoolRegion {
    base: NonNull<u8>,
    capacity: usize,
}

// SAFETY: the region is a plain block of memory; the allocator partitions it
// with atomics and never hands the same range to two callers.
unsafe impl Send for PoolRegion {}
unsafe impl Sync for PoolRegion {}

impl PoolRegion {
    #[cfg(target_os = "windows")]
    pub fn reserve(capacity: usize) -> Result<Self> {
        use windows::Win32::System::Memory::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc};

        if capacity == 0 {
            return Err(Error::PoolReservation {
                capacity,
                message: "capacity must be non-zero".to_string(),
            });
        }
        // SAFETY: no address requested; the result is checked for null.
        let ptr = unsafe { VirtualAlloc(None, capacity, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
        let base = NonNull::new(ptr as *mut u8).ok_or_else(|| Error::PoolReservation {
            capacity,
            message: windows::core::Error::from_win32().to_string(),
        })?;
        debug!("Reserved {:#x} bytes at {:p}", capacity, base);
        Ok(Self { base, capacity })
    }

    #[cfg(not(target_os = "windows"))]
    pub fn reserve(capacity: usize) -> Result<Self> {
        use std::alloc::alloc_zeroed;

        let layout = Self::layout(capacity)?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or_else(|| Error::PoolReservation {
            capacity,
            message: "system allocator returned null".to_string(),
        })?;
        debug!("Reserved {:#x} bytes at {:p}", capacity, base);
        Ok(Self { base, capacity })
    }

    #[cfg(not(target_os = "windows"))]
    fn layout(capacity: usize) -> Result<std::alloc::Layout> {
        if capacity == 0 {
            return Err(Error::PoolReservation {
                capacity,
                message: "capacity must be non-zero".to_string(),
            });
        }
        std::alloc::Layout::from_size_align(capacity, 0x1000).map_err(|e| Error::PoolReservation {
            capacity,
            message: e.to_string(),
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, address: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        address >= start && address - start < self.capacity
    }
}

impl Drop for PoolRegion {
    #[cfg(target_os = "windows")]
    fn drop(&mut self) {
        use windows::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

        // SAFETY: `base` came from VirtualAlloc and is released exactly once.
        if let Err(e) = unsafe { VirtualFree(self.base.as_ptr().cast(), 0, MEM_RELEASE) } {
            warn!("VirtualFree of pool at {:p} failed: {}", self.base, e);
        }
    }

    #[cfg(not(target_os = "windows"))]
    fn drop(&mut self) {
        match Self::layout(self.capacity) {
            // SAFETY: allocated in `reserve` with this layout.
            Ok(layout) => unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) },
            Err(e) => warn!("Leaking pool at {:p}: {}", self.base, e),
        }
    }
}

impl std::fmt::Debug for PoolRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegion")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .finish()
    }
}
