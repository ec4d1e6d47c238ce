//! Protected writes into live image memory.

use crate::error::Result;

/// Write `bytes` at `address` inside the current process.
///
/// On Windows the target pages are switched to `PAGE_EXECUTE_READWRITE`, the
/// bytes are copied, the previous protection is restored and the instruction
/// cache is flushed for the written range, since the host may be executing the
/// bytes concurrently. Failing to restore protection or flush is logged but does
/// not fail the write.
///
/// # Safety
///
/// `address..address + bytes.len()` must be mapped memory that nothing holds a
/// Rust reference into.
#[cfg(target_os = "windows")]
pub unsafe fn protected_write(address: usize, bytes: &[u8]) -> Result<()> {
    use std::ffi::c_void;

    use tracing::{debug, warn};
    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Memory::{
        PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualProtect,
    };
    use windows::Win32::System::Threading::GetCurrentProcess;

    use crate::error::Error;

    if bytes.is_empty() {
        return Ok(());
    }

    let target = address as *const c_void;
    let mut old_protect = PAGE_PROTECTION_FLAGS(0);

    // SAFETY: the caller guarantees the range is mapped.
    unsafe { VirtualProtect(target, bytes.len(), PAGE_EXECUTE_READWRITE, &mut old_protect) }
        .map_err(|e| Error::ProtectionFailure {
            address,
            message: e.to_string(),
        })?;

    // SAFETY: the range is mapped and now writable; no references alias it.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    }

    let mut restored = PAGE_PROTECTION_FLAGS(0);
    // SAFETY: same range as the first VirtualProtect call.
    if let Err(e) = unsafe { VirtualProtect(target, bytes.len(), old_protect, &mut restored) } {
        warn!(
            "Failed to restore protection {:#x} at {:#x}: {}",
            old_protect.0, address, e
        );
    }

    // SAFETY: flushing a mapped range of the current process.
    if let Err(e) = unsafe { FlushInstructionCache(GetCurrentProcess(), Some(target), bytes.len()) }
    {
        debug!("FlushInstructionCache failed at {:#x}: {}", address, e);
    }

    Ok(())
}

/// Write `bytes` at `address` inside the current process.
///
/// Off Windows the only regions handed to this function are heap-backed
/// synthetic images, which are already writable, so this is a plain copy.
///
/// # Safety
///
/// `address..address + bytes.len()` must be writable memory that nothing holds a
/// Rust reference into.
#[cfg(not(target_os = "windows"))]
pub unsafe fn protected_write(address: usize, bytes: &[u8]) -> Result<()> {
    // SAFETY: upheld by the caller.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    }
    Ok(())
}
