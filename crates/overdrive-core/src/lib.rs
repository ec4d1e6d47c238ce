//! # overdrive-core
//!
//! Runtime interposition core for a 32-bit game host.
//!
//! This crate provides:
//! - Bounded reads and protected writes over a loaded image (`memory`)
//! - PE header, section, import and export parsing (`image`)
//! - Address resolution by nominal offset and byte signature (`resolver`)
//! - A lock-free bump allocator with header-tagged blocks (`pool`)
//! - Import address table redirection to C-ABI heap shims (`hook`)
//! - Budget, performance and culling patches with restore (`patch`)
//! - Counters and formatted statistics (`stats`)
//! - TOML configuration (`config`) and the owning context (`overdrive`)

pub mod config;
pub mod error;
pub mod hook;
pub mod image;
pub mod memory;
pub mod overdrive;
pub mod patch;
pub mod pool;
pub mod prelude;
pub mod resolver;
pub mod stats;

pub use config::{OverdriveConfig, OverdriveConfigBuilder};
pub use error::{Error, Result};
pub use hook::{
    HookRecord, HookTarget, ImportHookInstaller, ImportedHeap, InstallReport, MemoryFunction,
    RestoreReport, default_targets,
};
pub use image::{PeImage, map_pe_file, map_pe_path};
pub use memory::{MemoryRegion, ReadMemory, WriteMemory};
pub use overdrive::{InitReport, Overdrive, ShutdownReport};
pub use patch::{
    ImagePatcher, MemoryBudget, MemoryPreset, ObjectPreset, PatchPlan, PatchReport, PatchTarget,
    PerformancePreset,
};
pub use pool::{FallbackAllocator, Origin, PooledAllocator, default_fallback};
pub use resolver::{
    AddressResolver, ResolutionMethod, ResolvedAddress, Signature, SignatureSet, ValidationPolicy,
};
pub use stats::{StatsSnapshot, StatsTracker};
