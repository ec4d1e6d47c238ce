//! Hexdump command implementation.
//!
//! Dumps bytes of the executable as the loader would map them, addressed by
//! RVA so the output lines up with the patch table offsets.

use std::path::Path;

use anyhow::{Context, Result};
use overdrive_core::{ReadMemory, map_pe_path};

use super::hex_utils::format_hexdump;

pub fn run(exe: &Path, rva: u32, size: usize, ascii: bool) -> Result<()> {
    let region = map_pe_path(exe).with_context(|| format!("mapping {}", exe.display()))?;
    let address = region.base_address() + rva as usize;
    let available = region.size().saturating_sub(rva as usize);
    let bytes = region
        .read_bytes(address, size.min(available))
        .with_context(|| format!("RVA 0x{:X} is outside the image", rva))?;

    println!("Hexdump at RVA 0x{:X} ({} bytes):", rva, bytes.len());
    println!();
    for line in format_hexdump(rva, &bytes, ascii) {
        println!("{}", line);
    }
    Ok(())
}
