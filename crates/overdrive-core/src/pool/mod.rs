//! Monotonic bump allocator with per-block headers
//!
//! Blocks are carved from a single [`PoolRegion`] by one atomic add on the
//! used offset, so concurrent callers never receive overlapping ranges and
//! never block. Freed space is not reclaimed. Requests the pool cannot serve
//! go to a [`FallbackAllocator`] without a header, which is how `free` and
//! `usable_size` later tell the two apart.

mod fallback;
mod header;
mod region;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::stats::StatsTracker;

pub use fallback::{
    CrtFallback, CrtFunctions, FallbackAllocator, FreeFn, MallocFn, MsizeFn, ReallocFn,
    TrackedFallback, default_fallback,
};
pub use header::{ALIGNMENT, HEADER_SIZE, POOL_MAGIC, PoolAllocationHeader, block_size};
pub use region::PoolRegion;

/// Peak usage is sampled on every Nth pool allocation.
const PEAK_SAMPLE_INTERVAL: u64 = 16;

const MB: f64 = 1024.0 * 1024.0;

/// Which allocator owns a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Pool,
    Fallback,
}

pub struct PooledAllocator {
    region: PoolRegion,
    /// Can run past capacity when racing allocations overshoot; readers clamp.
    used_offset: AtomicU64,
    served: AtomicU64,
    fallback: Arc<dyn FallbackAllocator>,
    stats: Arc<StatsTracker>,
}

impl PooledAllocator {
    pub fn new(
        capacity: usize,
        fallback: Arc<dyn FallbackAllocator>,
        stats: Arc<StatsTracker>,
    ) -> Result<Self> {
        let region = PoolRegion::reserve(capacity)?;
        info!(
            "Memory pool ready: {:.0} MB at {:p} (fallback: {})",
            capacity as f64 / MB,
            region.base(),
            fallback.name()
        );
        Ok(Self {
            region,
            used_offset: AtomicU64::new(0),
            served: AtomicU64::new(0),
            fallback,
            stats,
        })
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn base_address(&self) -> usize {
        self.region.base() as usize
    }

    pub fn fallback(&self) -> &Arc<dyn FallbackAllocator> {
        &self.fallback
    }

    pub fn stats(&self) -> &Arc<StatsTracker> {
        &self.stats
    }

    /// Bytes handed out so far, including headers and rounding.
    pub fn used_bytes(&self) -> usize {
        let used = self.used_offset.load(Ordering::Relaxed);
        used.min(self.capacity() as u64) as usize
    }

    pub fn remaining_bytes(&self) -> usize {
        self.capacity() - self.used_bytes()
    }

    pub fn usage_mb(&self) -> f64 {
        self.used_bytes() as f64 / MB
    }

    /// # Safety
    ///
    /// Same contract as `malloc`. The returned pointer is 16-byte aligned.
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        let capacity = self.capacity() as u64;
        let Some(block) = block_size(size).map(|b| b as u64).filter(|&b| b <= capacity) else {
            // SAFETY: forwarding the caller's contract.
            return unsafe { self.allocate_fallback(size) };
        };

        if self.used_offset.load(Ordering::Relaxed) + block > capacity {
            // SAFETY: forwarding the caller's contract.
            return unsafe { self.allocate_fallback(size) };
        }

        let offset = self.used_offset.fetch_add(block, Ordering::Relaxed);
        if offset + block > capacity {
            // Lost a race for the tail; the overshoot is abandoned.
            // SAFETY: forwarding the caller's contract.
            return unsafe { self.allocate_fallback(size) };
        }

        let block_start = self.region.base().wrapping_add(offset as usize);
        // SAFETY: `offset + block <= capacity`, the block is exclusively ours
        // after the fetch_add, and block starts are 16-byte aligned.
        unsafe {
            block_start
                .cast::<PoolAllocationHeader>()
                .write(PoolAllocationHeader::new(size));
        }

        self.stats.record_allocation(block as usize);
        let served = self.served.fetch_add(1, Ordering::Relaxed) + 1;
        if served.is_multiple_of(PEAK_SAMPLE_INTERVAL) {
            self.stats.update_peak(self.used_bytes());
        }

        block_start.wrapping_add(HEADER_SIZE)
    }

    unsafe fn allocate_fallback(&self, size: usize) -> *mut u8 {
        self.stats.record_fallback();
        // SAFETY: forwarding the caller's contract.
        let ptr = unsafe { self.fallback.allocate(size) };
        if ptr.is_null() {
            warn!("Fallback allocation of {} bytes failed", size);
        }
        ptr
    }

    /// `calloc`: zeroed storage for `count * size` bytes, or null on overflow.
    ///
    /// # Safety
    ///
    /// Same contract as `calloc`.
    pub unsafe fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            debug!("calloc({}, {}) overflows", count, size);
            return std::ptr::null_mut();
        };
        // SAFETY: forwarding the caller's contract.
        let ptr = unsafe { self.allocate(total) };
        if !ptr.is_null() {
            // SAFETY: `ptr` owns at least `total` bytes.
            unsafe { ptr.write_bytes(0, total) };
            self.stats.record_zeroed();
        }
        ptr
    }

    fn header_of(&self, ptr: *mut u8) -> Option<PoolAllocationHeader> {
        let address = ptr as usize;
        let base = self.base_address();
        let used_end = base + self.used_bytes();
        if address < base + HEADER_SIZE || address > used_end || (address - base) % ALIGNMENT != 0 {
            return None;
        }
        // SAFETY: the header lies within the used part of the pool and is aligned.
        Some(unsafe { ptr.sub(HEADER_SIZE).cast::<PoolAllocationHeader>().read() })
    }

    /// Decide who owns `ptr` without reading outside the pool.
    pub fn classify(&self, ptr: *mut u8) -> Origin {
        match self.header_of(ptr) {
            Some(header) if header.is_valid() => Origin::Pool,
            _ => Origin::Fallback,
        }
    }

    pub fn owns(&self, ptr: *mut u8) -> bool {
        self.classify(ptr) == Origin::Pool
    }

    /// # Safety
    ///
    /// `ptr` must be null, a live pointer from this allocator, or a live pointer
    /// owned by the fallback. It must not be freed twice.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        match self.classify(ptr) {
            Origin::Pool => self.stats.record_free(true),
            Origin::Fallback if self.region.contains(ptr as usize) => {
                // Interior or stale pool pointer: the fallback never owned it.
                self.stats.record_free(false);
                warn!("Ignoring free of unrecognized pool pointer {:p}", ptr);
            }
            Origin::Fallback => {
                self.stats.record_free(false);
                // SAFETY: not a pool pointer, so it belongs to the fallback.
                unsafe { self.fallback.free(ptr) };
            }
        }
    }

    /// `realloc` semantics: null grows from nothing, zero size frees.
    ///
    /// # Safety
    ///
    /// Same as [`free`](Self::free) for `ptr`.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            // SAFETY: forwarding the caller's contract.
            return unsafe { self.allocate(new_size) };
        }
        if new_size == 0 {
            // SAFETY: forwarding the caller's contract.
            unsafe { self.free(ptr) };
            return std::ptr::null_mut();
        }

        self.stats.record_reallocation();
        let Some(header) = self.header_of(ptr).filter(PoolAllocationHeader::is_valid) else {
            if self.region.contains(ptr as usize) {
                warn!("Ignoring realloc of unrecognized pool pointer {:p}", ptr);
                return std::ptr::null_mut();
            }
            // SAFETY: foreign pointer, owned by the fallback.
            return unsafe { self.fallback.reallocate(ptr, new_size) };
        };

        // SAFETY: forwarding the caller's contract.
        let new_ptr = unsafe { self.allocate(new_size) };
        if new_ptr.is_null() {
            return new_ptr;
        }
        let old_size = header.size as usize;
        // SAFETY: both blocks own at least `min(old, new)` bytes and are distinct.
        unsafe { std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size)) };
        self.stats.record_free(true);
        new_ptr
    }

    /// Size the caller asked for, or the fallback's answer for foreign pointers.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or live.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        match self.header_of(ptr) {
            Some(header) if header.is_valid() => header.size as usize,
            _ if self.region.contains(ptr as usize) => 0,
            // SAFETY: foreign pointer, owned by the fallback.
            _ => unsafe { self.fallback.usable_size(ptr) },
        }
    }
}

impl std::fmt::Debug for PooledAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAllocator")
            .field("region", &self.region)
            .field("used", &self.used_bytes())
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn pool(capacity: usize) -> (PooledAllocator, Arc<TrackedFallback>) {
        let fallback = Arc::new(TrackedFallback::new());
        let pool = PooledAllocator::new(capacity, fallback.clone(), Arc::new(StatsTracker::new()))
            .unwrap();
        (pool, fallback)
    }

    #[test]
    fn test_header_holds_magic_and_requested_size() {
        let (pool, _) = pool(MIB);
        unsafe {
            let p = pool.allocate(100);
            assert_eq!(p as usize % ALIGNMENT, 0);
            let header = p.sub(HEADER_SIZE).cast::<PoolAllocationHeader>().read();
            assert_eq!(header.magic, POOL_MAGIC);
            assert_eq!(header.size, 100);
            assert_eq!(pool.usable_size(p), 100);
            assert_eq!(pool.classify(p), Origin::Pool);
        }
        assert_eq!(pool.used_bytes(), block_size(100).unwrap());
    }

    #[test]
    fn test_zero_size_allocations_are_distinct() {
        let (pool, _) = pool(MIB);
        unsafe {
            let a = pool.allocate(0);
            let b = pool.allocate(0);
            assert!(!a.is_null());
            assert_ne!(a, b);
            assert_eq!(pool.usable_size(a), 0);
            assert!(pool.owns(a));
        }
    }

    #[test]
    fn test_exhaustion_falls_back_without_header() {
        let (pool, fallback) = pool(4096);
        unsafe {
            let big = pool.allocate(4000);
            assert!(pool.owns(big));

            let spill = pool.allocate(200);
            assert!(!spill.is_null());
            assert_eq!(pool.classify(spill), Origin::Fallback);
            assert_eq!(pool.usable_size(spill), 200);
            assert_eq!(fallback.live_count(), 1);

            pool.free(spill);
            assert_eq!(fallback.live_count(), 0);
            pool.free(big);
        }
        assert_eq!(pool.stats().fallback_allocations(), 1);
        assert_eq!(pool.stats().frees(), 2);
    }

    #[test]
    fn test_request_larger_than_pool_goes_to_fallback() {
        let (pool, fallback) = pool(4096);
        unsafe {
            let p = pool.allocate(8192);
            assert_eq!(pool.classify(p), Origin::Fallback);
            assert_eq!(pool.used_bytes(), 0);
            pool.free(p);
        }
        assert_eq!(fallback.live_count(), 0);
    }

    #[test]
    fn test_foreign_pointer_never_read_out_of_bounds() {
        let (pool, fallback) = pool(MIB);
        let mut outside = [0u8; 64];
        unsafe {
            // Not from either allocator: the pool must not look behind it
            assert_eq!(pool.classify(outside.as_mut_ptr().add(16)), Origin::Fallback);
            assert_eq!(pool.usable_size(outside.as_mut_ptr().add(16)), 0);
            pool.free(outside.as_mut_ptr().add(16));

            // Inside the pool but past the used offset
            let unused = (pool.base_address() + 4096) as *mut u8;
            assert_eq!(pool.classify(unused), Origin::Fallback);
            pool.free(unused);
        }
        assert_eq!(fallback.unknown_frees(), 1);
    }

    #[test]
    fn test_growing_realloc_preserves_contents() {
        let (pool, _) = pool(MIB);
        unsafe {
            let p = pool.allocate(64);
            for i in 0..64 {
                *p.add(i) = i as u8;
            }
            let q = pool.reallocate(p, 4096);
            assert_ne!(p, q);
            assert_eq!(pool.usable_size(q), 4096);
            for i in 0..64 {
                assert_eq!(*q.add(i), i as u8);
            }

            let r = pool.reallocate(q, 16);
            assert_eq!(*r.add(15), 15);
        }
    }

    #[test]
    fn test_realloc_edge_cases() {
        let (pool, fallback) = pool(MIB);
        unsafe {
            let p = pool.reallocate(std::ptr::null_mut(), 32);
            assert!(pool.owns(p));
            assert!(pool.reallocate(p, 0).is_null());

            let foreign = fallback.allocate(16);
            *foreign = 0x5A;
            let moved = pool.reallocate(foreign, 256);
            assert_eq!(pool.classify(moved), Origin::Fallback);
            assert_eq!(*moved, 0x5A);
            assert_eq!(fallback.usable_size(moved), 256);
            pool.free(moved);
        }
        assert_eq!(fallback.live_count(), 0);
    }

    #[test]
    fn test_allocate_zeroed() {
        let (pool, _) = pool(MIB);
        unsafe {
            let p = pool.allocate_zeroed(16, 8);
            assert!(std::slice::from_raw_parts(p, 128).iter().all(|&b| b == 0));
            assert!(pool.allocate_zeroed(usize::MAX, 2).is_null());
        }
    }

    #[test]
    fn test_concurrent_ranges_are_disjoint() {
        let (pool, _) = pool(4 * MIB);
        let pool = &pool;
        let mut pointers: Vec<(usize, usize)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    s.spawn(move || {
                        (0..200)
                            .map(|i| {
                                let size = 1 + (t * 31 + i * 7) % 700;
                                let p = unsafe { pool.allocate(size) };
                                (p as usize, size)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        pointers.sort_unstable();
        let base = pool.base_address();
        for pair in pointers.windows(2) {
            let (a, a_size) = pair[0];
            let (b, _) = pair[1];
            assert!(a + a_size + HEADER_SIZE <= b, "{:#x} overlaps {:#x}", a, b);
        }
        for &(p, size) in &pointers {
            assert!(p >= base + HEADER_SIZE && p + size <= base + pool.capacity());
        }
        assert_eq!(pool.stats().fallback_allocations(), 0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_large_pool_thousand_megabyte_blocks() {
        let (pool, _) = pool(3072 * MIB);
        let pool = &pool;
        let mut pointers: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..10)
                .map(|_| {
                    s.spawn(move || {
                        (0..100)
                            .map(|_| unsafe { pool.allocate(MIB) } as usize)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let block = block_size(MIB).unwrap();
        assert_eq!(pool.used_bytes(), 1000 * block);
        assert_eq!(pool.stats().fallback_allocations(), 0);

        pointers.sort_unstable();
        pointers.dedup();
        assert_eq!(pointers.len(), 1000);
        assert!(pointers.windows(2).all(|w| w[1] - w[0] >= block));
        assert!(pool.stats().peak_used() <= pool.used_bytes());
    }
}
