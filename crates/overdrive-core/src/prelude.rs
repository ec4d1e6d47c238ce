//! Prelude module for convenient imports
//!
//! ```ignore
//! use overdrive_core::prelude::*;
//! ```

// Context and configuration
pub use crate::config::OverdriveConfig;
pub use crate::overdrive::Overdrive;

// Error handling
pub use crate::error::{Error, Result};

// Memory access
pub use crate::memory::{MemoryRegion, ReadMemory, WriteMemory};

// Components
pub use crate::hook::ImportHookInstaller;
pub use crate::patch::ImagePatcher;
pub use crate::pool::PooledAllocator;
pub use crate::resolver::{AddressResolver, ValidationPolicy};
pub use crate::stats::{StatsSnapshot, StatsTracker};
