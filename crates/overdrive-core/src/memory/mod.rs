mod protect;
mod reader;
mod region;

#[cfg(test)]
pub mod mock;

pub use protect::protected_write;
pub use reader::{ReadMemory, WriteMemory};
pub use region::MemoryRegion;

#[cfg(test)]
pub use mock::{MockMemory, MockMemoryBuilder};
