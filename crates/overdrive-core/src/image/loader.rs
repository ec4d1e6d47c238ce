//! Map an executable file into an owned region the way the loader would,
//! without running it: headers first, then each section at its RVA.

use std::path::Path;

use tracing::{debug, info};

use super::pe::PeImage;
use crate::error::{Error, Result};
use crate::memory::{MemoryRegion, ReadMemory};

pub fn map_pe_file(bytes: &[u8]) -> Result<MemoryRegion> {
    let file = MemoryRegion::from_bytes(bytes)?;
    let pe = PeImage::parse(&file)?;

    let image_size = pe.size_of_image() as usize;
    if image_size == 0 {
        return Err(Error::InvalidImage("SizeOfImage is zero".to_string()));
    }
    let mapped = MemoryRegion::zeroed(image_size)?;
    let target = mapped.as_ptr() as *mut u8;

    let header_len = (pe.size_of_headers() as usize).min(bytes.len()).min(image_size);
    // SAFETY: both ranges are within their allocations (clamped above).
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), target, header_len) };

    for section in pe.sections() {
        let raw_start = section.raw_offset as usize;
        let virtual_start = section.virtual_address as usize;
        let len = (section.raw_size as usize)
            .min(section.len() as usize)
            .min(bytes.len().saturating_sub(raw_start))
            .min(image_size.saturating_sub(virtual_start));
        if len == 0 {
            debug!("Section {} has no file data", section.name);
            continue;
        }
        // SAFETY: `len` is clamped to both the file and the mapped image.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(raw_start),
                target.add(virtual_start),
                len,
            )
        };
    }

    debug!(
        "Mapped {} sections into {:#x} bytes at {:#x}",
        pe.sections().len(),
        image_size,
        mapped.base_address()
    );
    Ok(mapped)
}

pub fn map_pe_path(path: impl AsRef<Path>) -> Result<MemoryRegion> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let region = map_pe_file(&bytes)?;
    info!("Mapped {} ({} bytes on disk)", path.display(), bytes.len());
    Ok(region)
}
