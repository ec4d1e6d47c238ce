//! PE/COFF layout constants
//!
//! Offsets are relative to the start of the structure named by each module.
//! Only the fields the resolver, hook installer and loader read are listed.

/// IMAGE_DOS_HEADER
pub mod dos {
    /// "MZ"
    pub const MAGIC: u16 = 0x5A4D;
    pub const E_LFANEW: usize = 0x3C;
    /// Upper bound accepted for `e_lfanew` before the header is considered bogus
    pub const MAX_E_LFANEW: usize = 0x1000;
}

/// IMAGE_NT_HEADERS (signature + file header + optional header)
pub mod nt {
    /// "PE\0\0"
    pub const SIGNATURE: u32 = 0x0000_4550;
    pub const NUMBER_OF_SECTIONS: usize = 4 + 2;
    pub const SIZE_OF_OPTIONAL_HEADER: usize = 4 + 16;
    /// Signature (4) + IMAGE_FILE_HEADER (20)
    pub const OPTIONAL_HEADER: usize = 24;
}

/// IMAGE_OPTIONAL_HEADER32 / IMAGE_OPTIONAL_HEADER64
pub mod optional {
    pub const MAGIC: usize = 0;
    pub const PE32_MAGIC: u16 = 0x10B;
    pub const PE32_PLUS_MAGIC: u16 = 0x20B;

    pub const SIZE_OF_HEADERS: usize = 60;
    pub const SIZE_OF_IMAGE: usize = 56;
    /// ImageBase is a u32 at 28 in PE32 and a u64 at 24 in PE32+
    pub const IMAGE_BASE_PE32: usize = 28;
    pub const IMAGE_BASE_PE32_PLUS: usize = 24;

    /// Start of the data directory array
    pub const DATA_DIRECTORY_PE32: usize = 96;
    pub const DATA_DIRECTORY_PE32_PLUS: usize = 112;
    /// Each entry is {VirtualAddress: u32, Size: u32}
    pub const DATA_DIRECTORY_ENTRY: usize = 8;

    pub const DIRECTORY_EXPORT: usize = 0;
    pub const DIRECTORY_IMPORT: usize = 1;
}

/// IMAGE_SECTION_HEADER
pub mod section {
    pub const SIZE: usize = 40;
    pub const NAME_LEN: usize = 8;
    pub const VIRTUAL_SIZE: usize = 8;
    pub const VIRTUAL_ADDRESS: usize = 12;
    pub const SIZE_OF_RAW_DATA: usize = 16;
    pub const POINTER_TO_RAW_DATA: usize = 20;
    pub const CHARACTERISTICS: usize = 36;

    pub const CNT_CODE: u32 = 0x0000_0020;
    pub const MEM_EXECUTE: u32 = 0x2000_0000;
}

/// IMAGE_IMPORT_DESCRIPTOR
pub mod import {
    pub const DESCRIPTOR_SIZE: usize = 20;
    pub const ORIGINAL_FIRST_THUNK: usize = 0;
    pub const NAME: usize = 12;
    pub const FIRST_THUNK: usize = 16;

    pub const ORDINAL_FLAG_32: u64 = 0x8000_0000;
    pub const ORDINAL_FLAG_64: u64 = 0x8000_0000_0000_0000;

    /// IMAGE_IMPORT_BY_NAME: Hint (u16) followed by the name
    pub const BY_NAME_HINT_SIZE: usize = 2;

    /// Guards against corrupt tables
    pub const MAX_DESCRIPTORS: usize = 1024;
    pub const MAX_THUNKS: usize = 8192;
    pub const MAX_NAME_LEN: usize = 256;
}

/// IMAGE_EXPORT_DIRECTORY
pub mod export {
    pub const NUMBER_OF_FUNCTIONS: usize = 20;
    pub const NUMBER_OF_NAMES: usize = 24;
    pub const ADDRESS_OF_FUNCTIONS: usize = 28;
    pub const ADDRESS_OF_NAMES: usize = 32;
    pub const ADDRESS_OF_NAME_ORDINALS: usize = 36;
}
