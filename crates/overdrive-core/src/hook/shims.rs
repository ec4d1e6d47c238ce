//! C-ABI replacements for the runtime heap functions.
//!
//! Import slots can only point at plain functions, so the shims find the pool
//! through one process-wide slot. A published pool is kept alive for the rest
//! of the process: blocks it served may be freed long after the hooks are gone.

use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::info;

use crate::pool::{
    CrtFallback, CrtFunctions, FallbackAllocator, FreeFn, MallocFn, MsizeFn, PooledAllocator,
    ReallocFn, default_fallback,
};

static PUBLISHED: AtomicPtr<PooledAllocator> = AtomicPtr::new(std::ptr::null_mut());

static ORIGINAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_FREE: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_MSIZE: AtomicUsize = AtomicUsize::new(0);

/// Make `pool` the target of every shim.
///
/// The pool is leaked on purpose: it must outlive every pointer it served.
pub fn publish(pool: Arc<PooledAllocator>) {
    let raw = Arc::into_raw(pool) as *mut PooledAllocator;
    PUBLISHED.store(raw, Ordering::Release);
    info!("Published pool at {:p} to allocation shims", raw);
}

pub fn published() -> Option<&'static PooledAllocator> {
    let raw = PUBLISHED.load(Ordering::Acquire);
    // SAFETY: non-null values come from `Arc::into_raw` and are never released.
    unsafe { raw.as_ref() }
}

pub fn is_published() -> bool {
    !PUBLISHED.load(Ordering::Acquire).is_null()
}

/// Remember the host's own heap functions for use while no pool is published.
pub fn set_originals(functions: CrtFunctions) {
    ORIGINAL_MALLOC.store(functions.malloc as usize, Ordering::Release);
    ORIGINAL_FREE.store(functions.free as usize, Ordering::Release);
    ORIGINAL_REALLOC.store(functions.realloc as usize, Ordering::Release);
    ORIGINAL_MSIZE.store(functions.msize.map_or(0, |f| f as usize), Ordering::Release);
}

fn originals() -> Option<CrtFallback> {
    let msize = ORIGINAL_MSIZE.load(Ordering::Acquire);
    // SAFETY: only `set_originals` writes these, always from real function pointers.
    unsafe {
        CrtFunctions::from_addresses(
            ORIGINAL_MALLOC.load(Ordering::Acquire),
            ORIGINAL_FREE.load(Ordering::Acquire),
            ORIGINAL_REALLOC.load(Ordering::Acquire),
            Some(msize),
        )
    }
    .map(CrtFallback::new)
}

/// The process C runtime, for shims running before any originals are known.
fn last_resort() -> &'static dyn FallbackAllocator {
    static LAST_RESORT: OnceLock<Arc<dyn FallbackAllocator>> = OnceLock::new();
    LAST_RESORT.get_or_init(default_fallback).as_ref()
}

/// Run `f` against whichever allocator currently backs the shims.
fn with_unpooled<R>(f: impl FnOnce(&dyn FallbackAllocator) -> R) -> R {
    match originals() {
        Some(crt) => f(&crt),
        None => f(last_resort()),
    }
}

pub unsafe extern "C" fn overdrive_malloc(size: usize) -> *mut c_void {
    match published() {
        // SAFETY: the host calls this with malloc's contract.
        Some(pool) => unsafe { pool.allocate(size).cast() },
        None => with_unpooled(|a| unsafe { a.allocate(size).cast() }),
    }
}

pub unsafe extern "C" fn overdrive_free(ptr: *mut c_void) {
    match published() {
        // SAFETY: the host calls this with free's contract.
        Some(pool) => unsafe { pool.free(ptr.cast()) },
        None => with_unpooled(|a| unsafe { a.free(ptr.cast()) }),
    }
}

pub unsafe extern "C" fn overdrive_calloc(count: usize, size: usize) -> *mut c_void {
    match published() {
        // SAFETY: the host calls this with calloc's contract.
        Some(pool) => unsafe { pool.allocate_zeroed(count, size).cast() },
        None => {
            let Some(total) = count.checked_mul(size) else {
                return std::ptr::null_mut();
            };
            with_unpooled(|a| unsafe {
                let ptr = a.allocate(total);
                if !ptr.is_null() {
                    ptr.write_bytes(0, total);
                }
                ptr.cast()
            })
        }
    }
}

pub unsafe extern "C" fn overdrive_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match published() {
        // SAFETY: the host calls this with realloc's contract.
        Some(pool) => unsafe { pool.reallocate(ptr.cast(), size).cast() },
        None => with_unpooled(|a| unsafe { a.reallocate(ptr.cast(), size).cast() }),
    }
}

pub unsafe extern "C" fn overdrive_msize(ptr: *mut c_void) -> usize {
    match published() {
        // SAFETY: the host calls this with _msize's contract.
        Some(pool) => unsafe { pool.usable_size(ptr.cast()) },
        None => with_unpooled(|a| unsafe { a.usable_size(ptr.cast()) }),
    }
}

// Keep the aliases in sync with the pool's fallback signatures.
const _: MallocFn = overdrive_malloc;
const _: FreeFn = overdrive_free;
const _: ReallocFn = overdrive_realloc;
const _: MsizeFn = overdrive_msize;

/// Serializes tests that touch the process-wide shim state.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub(crate) fn unpublish() {
    PUBLISHED.store(std::ptr::null_mut(), Ordering::Release);
    for slot in [&ORIGINAL_MALLOC, &ORIGINAL_FREE, &ORIGINAL_REALLOC, &ORIGINAL_MSIZE] {
        slot.store(0, Ordering::Release);
    }
}
