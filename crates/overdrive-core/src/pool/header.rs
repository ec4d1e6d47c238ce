/// Marks a block served from the pool.
pub const POOL_MAGIC: u32 = 0xDEAD_BEEF;

/// Every block starts on this boundary, and so does every returned pointer.
pub const ALIGNMENT: usize = 16;

pub const HEADER_SIZE: usize = std::mem::size_of::<PoolAllocationHeader>();

/// Metadata stored immediately before each pool-served pointer.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAllocationHeader {
    pub magic: u32,
    padding: u32,
    /// Size the caller asked for (not the rounded block size)
    pub size: u64,
}

const _: () = assert!(HEADER_SIZE == ALIGNMENT);

impl PoolAllocationHeader {
    pub fn new(size: usize) -> Self {
        Self {
            magic: POOL_MAGIC,
            padding: 0,
            size: size as u64,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == POOL_MAGIC
    }
}

/// Bytes consumed from the pool for a request of `size`, or `None` on overflow.
///
/// A zero-byte request still takes a full block so it gets a unique pointer.
pub fn block_size(size: usize) -> Option<usize> {
    size.checked_add(HEADER_SIZE)?
        .checked_next_multiple_of(ALIGNMENT)
}
