//! Bounded access to a loaded image.
//!
//! Every address handled here is absolute. Implementations reject reads and
//! writes that fall outside `[base_address, base_address + size)` instead of
//! touching memory, so callers can probe candidate addresses freely.

use crate::error::{Error, Result};

pub trait ReadMemory {
    /// Absolute address of the first byte of the image.
    fn base_address(&self) -> usize;

    /// Number of addressable bytes starting at `base_address`.
    fn size(&self) -> usize;

    fn read_bytes(&self, address: usize, len: usize) -> Result<Vec<u8>>;

    /// Whether import slots hold callable entry points, as they do once the
    /// loader has bound the image. Copies and file mappings do not.
    fn imports_are_bound(&self) -> bool {
        false
    }

    fn contains(&self, address: usize, len: usize) -> bool {
        let base = self.base_address();
        let Some(end) = address.checked_add(len) else {
            return false;
        };
        address >= base && end <= base + self.size()
    }

    fn ensure_contains(&self, address: usize, len: usize) -> Result<()> {
        if self.contains(address, len) {
            Ok(())
        } else {
            Err(Error::OutOfBounds { address, len })
        }
    }

    fn read_u16(&self, address: usize) -> Result<u16> {
        let bytes = self.read_bytes(address, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&self, address: usize) -> Result<u32> {
        let bytes = self.read_bytes(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&self, address: usize) -> Result<i32> {
        Ok(self.read_u32(address)? as i32)
    }

    fn read_u64(&self, address: usize) -> Result<u64> {
        let bytes = self.read_bytes(address, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_f32(&self, address: usize) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32(address)?))
    }

    /// Read a pointer-sized value of the given width (4 or 8 bytes).
    fn read_pointer(&self, address: usize, width: usize) -> Result<usize> {
        match width {
            4 => Ok(self.read_u32(address)? as usize),
            8 => Ok(self.read_u64(address)? as usize),
            _ => Err(Error::InvalidImage(format!(
                "Unsupported pointer width {}",
                width
            ))),
        }
    }

    /// Read a NUL-terminated ASCII string of at most `max_len` bytes.
    fn read_c_string(&self, address: usize, max_len: usize) -> Result<String> {
        let available = (self.base_address() + self.size()).saturating_sub(address);
        let bytes = self.read_bytes(address, max_len.min(available))?;
        let len = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::InvalidImage(format!("Unterminated string at {:#x}", address)))?;
        Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
    }
}

pub trait WriteMemory: ReadMemory {
    /// Write `bytes` at `address`, making the page writable for the duration
    /// of the write and flushing the instruction cache afterwards.
    fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()>;

    fn write_u32(&self, address: usize, value: u32) -> Result<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    fn write_f32(&self, address: usize, value: f32) -> Result<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    fn write_pointer(&self, address: usize, value: usize, width: usize) -> Result<()> {
        match width {
            4 => {
                let value = u32::try_from(value).map_err(|_| {
                    Error::InvalidImage(format!("Pointer {:#x} does not fit a 32-bit slot", value))
                })?;
                self.write_bytes(address, &value.to_le_bytes())
            }
            8 => self.write_bytes(address, &(value as u64).to_le_bytes()),
            _ => Err(Error::InvalidImage(format!(
                "Unsupported pointer width {}",
                width
            ))),
        }
    }
}
