use std::alloc::{Layout, alloc_zeroed, dealloc};

use super::protect::protected_write;
use super::reader::{ReadMemory, WriteMemory};
use crate::error::{Error, Result};

const OWNED_ALIGN: usize = 0x1000;

/// A contiguous block of process memory viewed as an image.
///
/// Either owns a page-aligned heap allocation (mapped executables and test
/// images) or borrows memory that lives elsewhere, such as the host module.
pub struct MemoryRegion {
    base: *mut u8,
    size: usize,
    owned: Option<Layout>,
    bound_imports: bool,
}

// SAFETY: the region only hands out copies and performs writes through
// `protected_write`; concurrent access is governed by the callers' phase rules.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Allocate a zero-filled, page-aligned region of `size` bytes.
    pub fn zeroed(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidImage("Region size must be non-zero".to_string()));
        }
        let layout = Layout::from_size_align(size, OWNED_ALIGN)
            .map_err(|e| Error::InvalidImage(format!("Bad region layout: {}", e)))?;
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(Error::InvalidImage(format!(
                "Failed to allocate {} bytes for image",
                size
            )));
        }
        Ok(Self {
            base,
            size,
            owned: Some(layout),
            bound_imports: false,
        })
    }

    /// Allocate a region holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let region = Self::zeroed(bytes.len())?;
        // SAFETY: freshly allocated, exactly `bytes.len()` long.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), region.base, bytes.len());
        }
        Ok(region)
    }

    /// View memory owned by someone else.
    ///
    /// # Safety
    ///
    /// `base..base + size` must stay mapped and readable for the lifetime of the
    /// returned region.
    pub unsafe fn from_raw_parts(base: usize, size: usize) -> Self {
        Self {
            base: base as *mut u8,
            size,
            owned: None,
            bound_imports: false,
        }
    }

    /// Mark the region as an image whose import slots the loader has bound.
    ///
    /// # Safety
    ///
    /// Every non-zero import slot must hold the entry point of the function it
    /// names, with that function's calling convention.
    pub unsafe fn with_bound_imports(mut self) -> Self {
        self.bound_imports = true;
        self
    }

    /// The main executable module of the current process.
    #[cfg(target_os = "windows")]
    pub fn current_module() -> Result<Self> {
        use windows::Win32::System::LibraryLoader::GetModuleHandleW;
        use windows::core::PCWSTR;

        use crate::image::layout::{dos, nt, optional};

        // SAFETY: a null name asks for the process executable.
        let module = unsafe { GetModuleHandleW(PCWSTR::null()) }
            .map_err(|e| Error::InvalidImage(format!("GetModuleHandleW failed: {}", e)))?;
        let base = module.0 as usize;

        // SAFETY: the loader maps at least the header page of every module.
        let headers = unsafe { Self::from_raw_parts(base, 0x1000) };
        let e_lfanew = headers.read_u32(base + dos::E_LFANEW)? as usize;
        let optional_header = base + e_lfanew + nt::OPTIONAL_HEADER;
        let size_of_image = headers.read_u32(optional_header + optional::SIZE_OF_IMAGE)? as usize;

        // SAFETY: SizeOfImage bytes are mapped for as long as the module is loaded,
        // the executable is never unloaded, and the loader bound its imports
        // before any of our code ran.
        Ok(unsafe { Self::from_raw_parts(base, size_of_image).with_bound_imports() })
    }

    pub fn is_owned(&self) -> bool {
        self.owned.is_some()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.base
    }
}

impl ReadMemory for MemoryRegion {
    fn base_address(&self) -> usize {
        self.base as usize
    }

    fn size(&self) -> usize {
        self.size
    }

    fn imports_are_bound(&self) -> bool {
        self.bound_imports
    }

    fn read_bytes(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        self.ensure_contains(address, len)?;
        // SAFETY: bounds checked against the region above.
        let slice = unsafe { std::slice::from_raw_parts(address as *const u8, len) };
        Ok(slice.to_vec())
    }
}

impl WriteMemory for MemoryRegion {
    fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()> {
        self.ensure_contains(address, bytes.len())?;
        // SAFETY: bounds checked; no Rust references into the region are handed out.
        unsafe { protected_write(address, bytes) }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Some(layout) = self.owned.take() {
            // SAFETY: allocated in `zeroed` with this exact layout.
            unsafe { dealloc(self.base, layout) };
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("base", &format_args!("{:#x}", self.base as usize))
            .field("size", &format_args!("{:#x}", self.size))
            .field("owned", &self.is_owned())
            .finish()
    }
}
