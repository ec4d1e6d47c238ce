//! PE image parsing over [`ReadMemory`](crate::memory::ReadMemory).

pub mod layout;
mod loader;
mod pe;
#[cfg(test)]
pub mod synthetic;

pub use loader::{map_pe_file, map_pe_path};
pub use pe::{ImportEntry, ImportSymbol, ImportedModule, PeImage, Section};
