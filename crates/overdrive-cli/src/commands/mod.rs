//! CLI command implementations.

pub mod hex_utils;
pub mod hexdump;
pub mod inspect;
pub mod presets;
pub mod signatures;
