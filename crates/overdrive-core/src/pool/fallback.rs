//! Where traffic goes when the pool cannot serve it.

use std::alloc::{GlobalAlloc, Layout, System};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::header::ALIGNMENT;

/// The allocator that owns every block not served from the pool.
///
/// All methods follow CRT semantics: null in, null out; unknown pointers are
/// the implementation's business.
pub trait FallbackAllocator: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Safety
    ///
    /// Same contract as `malloc`.
    unsafe fn allocate(&self, size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must be null or come from this allocator and not be freed yet.
    unsafe fn free(&self, ptr: *mut u8);

    /// # Safety
    ///
    /// Same contract as `realloc`.
    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must come from this allocator and still be live.
    unsafe fn usable_size(&self, ptr: *mut u8) -> usize;
}

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
pub type MsizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

/// Entry points of a C runtime heap.
#[derive(Debug, Clone, Copy)]
pub struct CrtFunctions {
    pub malloc: MallocFn,
    pub free: FreeFn,
    pub realloc: ReallocFn,
    pub msize: Option<MsizeFn>,
}

impl CrtFunctions {
    /// Build from raw addresses, e.g. import slots captured before hooking.
    ///
    /// # Safety
    ///
    /// Each non-zero address must be the entry point of the matching CRT
    /// function with the C calling convention.
    pub unsafe fn from_addresses(
        malloc: usize,
        free: usize,
        realloc: usize,
        msize: Option<usize>,
    ) -> Option<Self> {
        if malloc == 0 || free == 0 || realloc == 0 {
            return None;
        }
        // SAFETY: upheld by the caller; addresses are non-null.
        unsafe {
            Some(Self {
                malloc: std::mem::transmute::<usize, MallocFn>(malloc),
                free: std::mem::transmute::<usize, FreeFn>(free),
                realloc: std::mem::transmute::<usize, ReallocFn>(realloc),
                msize: msize
                    .filter(|&a| a != 0)
                    .map(|a| std::mem::transmute::<usize, MsizeFn>(a)),
            })
        }
    }
}

/// The host's original C runtime allocator.
#[derive(Debug, Clone, Copy)]
pub struct CrtFallback {
    functions: CrtFunctions,
}

impl CrtFallback {
    pub fn new(functions: CrtFunctions) -> Self {
        Self { functions }
    }

    pub fn functions(&self) -> CrtFunctions {
        self.functions
    }

    /// Look up the runtime heap functions in `ucrtbase.dll`, then `msvcrt.dll`.
    #[cfg(target_os = "windows")]
    pub fn from_runtime() -> crate::error::Result<Self> {
        use windows::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};
        use windows::core::PCSTR;

        use crate::error::Error;

        const RUNTIMES: [&[u8]; 2] = [b"ucrtbase.dll\0", b"msvcrt.dll\0"];

        for runtime in RUNTIMES {
            // SAFETY: NUL-terminated literal.
            let Ok(module) = (unsafe { GetModuleHandleA(PCSTR(runtime.as_ptr())) }) else {
                continue;
            };
            let lookup = |name: &[u8]| -> usize {
                // SAFETY: NUL-terminated literal and a loaded module handle.
                unsafe { GetProcAddress(module, PCSTR(name.as_ptr())) }
                    .map(|f| f as usize)
                    .unwrap_or(0)
            };
            // SAFETY: these exports are the CRT heap functions of a loaded runtime.
            let functions = unsafe {
                CrtFunctions::from_addresses(
                    lookup(b"malloc\0"),
                    lookup(b"free\0"),
                    lookup(b"realloc\0"),
                    Some(lookup(b"_msize\0")),
                )
            };
            if let Some(functions) = functions {
                let name = String::from_utf8_lossy(&runtime[..runtime.len() - 1]).into_owned();
                debug!("Using {} as fallback allocator", name);
                return Ok(Self::new(functions));
            }
        }

        Err(Error::HookTargetNotFound {
            module: "ucrtbase.dll|msvcrt.dll".to_string(),
            function: "malloc".to_string(),
        })
    }

    /// The C library heap this process links against.
    #[cfg(unix)]
    pub fn from_runtime() -> crate::error::Result<Self> {
        unsafe extern "C" {
            fn malloc(size: usize) -> *mut c_void;
            fn free(ptr: *mut c_void);
            fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
            #[cfg_attr(target_vendor = "apple", link_name = "malloc_size")]
            fn malloc_usable_size(ptr: *mut c_void) -> usize;
        }

        debug!("Using libc as fallback allocator");
        Ok(Self::new(CrtFunctions {
            malloc,
            free,
            realloc,
            msize: Some(malloc_usable_size),
        }))
    }
}

/// The process C runtime where one is loaded, otherwise the global allocator.
///
/// Used when the host image's own heap imports cannot be captured.
pub fn default_fallback() -> Arc<dyn FallbackAllocator> {
    #[cfg(any(windows, unix))]
    {
        match CrtFallback::from_runtime() {
            Ok(crt) => return Arc::new(crt),
            Err(e) => warn!("C runtime not found, using global allocator: {}", e),
        }
    }
    Arc::new(TrackedFallback::new())
}

impl FallbackAllocator for CrtFallback {
    fn name(&self) -> &'static str {
        "crt"
    }

    unsafe fn allocate(&self, size: usize) -> *mut u8 {
        // SAFETY: forwarding to the CRT with the caller's contract.
        unsafe { (self.functions.malloc)(size).cast() }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        // SAFETY: forwarding to the CRT with the caller's contract.
        unsafe { (self.functions.free)(ptr.cast()) }
    }

    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: forwarding to the CRT with the caller's contract.
        unsafe { (self.functions.realloc)(ptr.cast(), size).cast() }
    }

    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        match self.functions.msize {
            // SAFETY: forwarding to the CRT with the caller's contract.
            Some(msize) if !ptr.is_null() => unsafe { msize(ptr.cast()) },
            _ => 0,
        }
    }
}

/// System allocator that remembers the layout of every live block.
///
/// Pointers it did not hand out are ignored on free and report a size of 0.
#[derive(Debug, Default)]
pub struct TrackedFallback {
    live: Mutex<HashMap<usize, Layout>>,
    unknown_frees: AtomicU64,
}

impl TrackedFallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    pub fn unknown_frees(&self) -> u64 {
        self.unknown_frees.load(Ordering::Relaxed)
    }

    fn layout_for(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.max(1), ALIGNMENT).ok()
    }

    fn take(&self, ptr: *mut u8) -> Option<Layout> {
        self.live.lock().ok()?.remove(&(ptr as usize))
    }

    fn remember(&self, ptr: *mut u8, layout: Layout) {
        if let Ok(mut live) = self.live.lock() {
            live.insert(ptr as usize, layout);
        }
    }
}

impl FallbackAllocator for TrackedFallback {
    fn name(&self) -> &'static str {
        "system"
    }

    unsafe fn allocate(&self, size: usize) -> *mut u8 {
        let Some(layout) = Self::layout_for(size) else {
            return std::ptr::null_mut();
        };
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            self.remember(ptr, layout);
        }
        ptr
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        match self.take(ptr) {
            // SAFETY: allocated by `System` with this layout.
            Some(layout) => unsafe { System.dealloc(ptr, layout) },
            None => {
                self.unknown_frees.fetch_add(1, Ordering::Relaxed);
                debug!("Ignoring free of unknown pointer {:p}", ptr);
            }
        }
    }

    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            // SAFETY: plain allocation.
            return unsafe { self.allocate(size) };
        }
        let Some(layout) = self.take(ptr) else {
            debug!("Ignoring realloc of unknown pointer {:p}", ptr);
            return std::ptr::null_mut();
        };
        let Some(new_layout) = Self::layout_for(size) else {
            self.remember(ptr, layout);
            return std::ptr::null_mut();
        };
        // SAFETY: `ptr` is live with `layout`; the new size is non-zero.
        let new_ptr = unsafe { System.realloc(ptr, layout, new_layout.size()) };
        if new_ptr.is_null() {
            self.remember(ptr, layout);
        } else {
            self.remember(new_ptr, new_layout);
        }
        new_ptr
    }

    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        self.live
            .lock()
            .ok()
            .and_then(|live| live.get(&(ptr as usize)).map(Layout::size))
            .unwrap_or(0)
    }
}
