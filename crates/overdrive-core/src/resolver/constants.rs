//! Search bounds for address resolution

/// Default half-width of the window scanned around a nominal offset (16KB)
///
/// Minor host rebuilds shift code by a few hundred bytes at most.
pub const DEFAULT_WINDOW: usize = 0x4000;

/// Half-width of the scan around an export hint (64KB)
pub const EXPORT_WINDOW: usize = 0x10000;

/// Chunk size for section-wide scans (1MB)
pub const SCAN_CHUNK_SIZE: usize = 0x10_0000;

/// Sections searched, in order, when a signature names none
pub const FALLBACK_SECTIONS: [&str; 3] = [".text", ".rdata", ".data"];

/// Bytes probed at the nominal address when no signature is given
pub const DIRECT_PROBE_LEN: usize = 4;
