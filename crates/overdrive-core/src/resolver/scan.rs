//! Wildcard byte-pattern scanning over image memory.

use tracing::debug;

use super::constants::SCAN_CHUNK_SIZE;
use crate::error::Result;
use crate::memory::ReadMemory;

/// First concrete byte of the pattern and its index, used as a memchr anchor.
fn anchor(pattern: &[Option<u8>]) -> Option<(usize, u8)> {
    pattern
        .iter()
        .enumerate()
        .find_map(|(i, b)| b.map(|value| (i, value)))
}

pub fn matches_at(buffer: &[u8], pattern: &[Option<u8>]) -> bool {
    buffer.len() >= pattern.len()
        && pattern
            .iter()
            .zip(buffer)
            .all(|(p, b)| p.is_none_or(|value| value == *b))
}

/// Offsets of every match of `pattern` within `buffer`.
pub fn find_matches(buffer: &[u8], pattern: &[Option<u8>]) -> Vec<usize> {
    if pattern.is_empty() || buffer.len() < pattern.len() {
        return Vec::new();
    }
    let Some((anchor_index, anchor_byte)) = anchor(pattern) else {
        return Vec::new();
    };

    let last = buffer.len() - pattern.len();
    memchr::memchr_iter(anchor_byte, buffer)
        .filter_map(|pos| pos.checked_sub(anchor_index))
        .filter(|&start| start <= last && matches_at(&buffer[start..], pattern))
        .collect()
}

/// Address of the first match in `[start, start + len)`, reading in chunks.
///
/// The range is clamped to the image; a range entirely outside it yields `None`.
pub fn scan_range<M: ReadMemory + ?Sized>(
    memory: &M,
    start: usize,
    len: usize,
    pattern: &[Option<u8>],
) -> Result<Option<usize>> {
    let image_start = memory.base_address();
    let image_end = image_start + memory.size();
    let end = start.saturating_add(len).min(image_end);
    let start = start.max(image_start);
    if start >= end || end - start < pattern.len() {
        return Ok(None);
    }

    let mut address = start;
    let mut tail: Vec<u8> = Vec::new();
    while address < end {
        let read_size = (end - address).min(SCAN_CHUNK_SIZE);
        let chunk = memory.read_bytes(address, read_size)?;

        let mut data = Vec::with_capacity(tail.len() + chunk.len());
        data.extend_from_slice(&tail);
        data.extend_from_slice(&chunk);
        let data_base = address - tail.len();

        if let Some(&offset) = find_matches(&data, pattern).first() {
            return Ok(Some(data_base + offset));
        }

        let keep = pattern.len().saturating_sub(1).min(data.len());
        tail = data[data.len() - keep..].to_vec();
        address += read_size;
    }

    debug!(
        "Pattern ({} bytes) not found in {:#x}..{:#x}",
        pattern.len(),
        start,
        end
    );
    Ok(None)
}

/// Match closest to `center` within `center ± window`.
pub fn scan_nearest<M: ReadMemory + ?Sized>(
    memory: &M,
    center: usize,
    window: usize,
    pattern: &[Option<u8>],
) -> Result<Option<usize>> {
    let image_start = memory.base_address();
    let image_end = image_start + memory.size();
    let start = center.saturating_sub(window).max(image_start);
    let end = center
        .saturating_add(window)
        .saturating_add(pattern.len())
        .min(image_end);
    if start >= end {
        return Ok(None);
    }

    let buffer = memory.read_bytes(start, end - start)?;
    Ok(find_matches(&buffer, pattern)
        .into_iter()
        .map(|offset| start + offset)
        .min_by_key(|&address| address.abs_diff(center)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRegion, ReadMemory};

    #[test]
    fn test_find_matches_with_wildcards() {
        let buffer = [0x90, 0x68, 0x00, 0x00, 0x40, 0x06, 0x68, 0x11, 0x00, 0x40, 0x06];
        let pattern = [Some(0x68), None, Some(0x00), Some(0x40), Some(0x06)];
        assert_eq!(find_matches(&buffer, &pattern), vec![1, 6]);
    }

    #[test]
    fn test_leading_wildcard_anchor() {
        let buffer = [0xAA, 0xBB, 0xCC, 0xBB, 0xCC];
        let pattern = [None, Some(0xBB), Some(0xCC)];
        assert_eq!(find_matches(&buffer, &pattern), vec![0, 2]);
        // A match would need a byte before the buffer start
        assert!(find_matches(&[0xBB, 0x01, 0x02], &[None, Some(0xBB)]).is_empty());
    }

    #[test]
    fn test_scan_range_across_chunk_boundary() {
        let mut bytes = vec![0u8; SCAN_CHUNK_SIZE + 0x100];
        let at = SCAN_CHUNK_SIZE - 2;
        bytes[at..at + 4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let region = MemoryRegion::from_bytes(&bytes).unwrap();
        let base = region.base_address();

        let pattern = [Some(0xDE), Some(0xAD), Some(0xBE), Some(0xEF)];
        let found = scan_range(&region, base, bytes.len(), &pattern).unwrap();
        assert_eq!(found, Some(base + at));

        let outside = scan_range(&region, base + bytes.len(), 0x100, &pattern).unwrap();
        assert_eq!(outside, None);
    }

    #[test]
    fn test_scan_range_starting_before_image_keeps_requested_end() {
        let mut bytes = vec![0u8; 0x200];
        bytes[0x20] = 0x7F;
        bytes[0x120] = 0x7F;
        let region = MemoryRegion::from_bytes(&bytes).unwrap();
        let base = region.base_address();

        // Requested range ends at base + 0x100; only the first byte lies inside it
        let found = scan_range(&region, base - 0x100, 0x200, &[Some(0x7F)]).unwrap();
        assert_eq!(found, Some(base + 0x20));
        let found = scan_range(&region, base - 0x100, 0x110, &[Some(0x7F)]).unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn test_scan_nearest_prefers_closest() {
        let mut bytes = vec![0u8; 0x400];
        bytes[0x100] = 0x7F;
        bytes[0x2F0] = 0x7F;
        let region = MemoryRegion::from_bytes(&bytes).unwrap();
        let base = region.base_address();

        let found = scan_nearest(&region, base + 0x2C0, 0x200, &[Some(0x7F)]).unwrap();
        assert_eq!(found, Some(base + 0x2F0));
        let found = scan_nearest(&region, base + 0x180, 0x200, &[Some(0x7F)]).unwrap();
        assert_eq!(found, Some(base + 0x100));
    }
}
