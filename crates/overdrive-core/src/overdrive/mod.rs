//! The context object that owns every component for one host process.
//!
//! ## Example
//!
//! ```ignore
//! use overdrive_core::config::OverdriveConfig;
//! use overdrive_core::overdrive::Overdrive;
//!
//! let config = OverdriveConfig::load_or_default("overdrive.toml");
//! let mut overdrive = Overdrive::attach_current_process(config)?;
//! println!("{}", overdrive.status());
//!
//! // On exit
//! overdrive.shutdown(true);
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::OverdriveConfig;
use crate::error::Result;
use crate::hook::{
    ImportHookInstaller, InstallReport, RestoreReport, default_targets, shims,
};
use crate::memory::WriteMemory;
use crate::patch::{ImagePatcher, PatchPlan, PatchReport};
use crate::pool::{CrtFallback, FallbackAllocator, PooledAllocator, default_fallback};
use crate::resolver::{AddressResolver, load_signatures};
use crate::stats::{PoolGauge, StatsSnapshot, StatsTracker};

/// What `initialize` managed to set up.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitReport {
    pub planned_patches: usize,
    pub resolved_patches: usize,
    pub pool_active: bool,
    /// Runtime module whose heap receives blocks the pool did not serve.
    pub imported_heap: Option<String>,
    pub hooks: Option<InstallReport>,
    pub patches: PatchReport,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ShutdownReport {
    pub hooks: RestoreReport,
    pub patches: Option<PatchReport>,
}

pub struct Overdrive<'a, M: WriteMemory + ?Sized> {
    config: OverdriveConfig,
    stats: Arc<StatsTracker>,
    pool: Option<Arc<PooledAllocator>>,
    hooks: ImportHookInstaller<'a, M>,
    patcher: ImagePatcher<'a, M>,
    report: InitReport,
}

impl<'a, M: WriteMemory + ?Sized> Overdrive<'a, M> {
    /// Resolve, create the pool, install hooks and apply the configured patches.
    ///
    /// Only an unreadable image or an invalid configuration is an error; every
    /// other failure disables the affected feature and is logged.
    pub fn initialize(memory: &'a M, config: OverdriveConfig) -> Result<Self> {
        let plan = config.patch_plan();
        Self::initialize_with(memory, config, &plan, default_fallback())
    }

    /// Like [`initialize`](Self::initialize) with an explicit plan.
    ///
    /// `fallback` serves foreign blocks only when the image's own heap imports
    /// cannot be captured, e.g. because the image is not loader-bound.
    pub fn initialize_with(
        memory: &'a M,
        config: OverdriveConfig,
        plan: &PatchPlan,
        mut fallback: Arc<dyn FallbackAllocator>,
    ) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(StatsTracker::new());

        let resolver = AddressResolver::new(memory, config.general.validation)?;
        let mut patcher = ImagePatcher::new(resolver).with_stats(stats.clone());
        if let Some(path) = &config.general.signatures {
            match load_signatures(path) {
                Ok(signatures) => patcher = patcher.with_signatures(signatures),
                Err(e) => warn!("Ignoring signature file {}: {}", path.display(), e),
            }
        }

        let mut report = InitReport {
            planned_patches: plan.len(),
            resolved_patches: patcher.resolve_plan(plan),
            ..Default::default()
        };
        info!(
            "Resolved {}/{} patch targets",
            report.resolved_patches, report.planned_patches
        );

        let mut hooks = ImportHookInstaller::new(memory).with_stats(stats.clone());
        let targets = default_targets(&config.hooks.functions, &config.hooks.modules);

        // Blocks the host allocated before hooking belong to its own runtime.
        if config.pool.enabled && config.hooks.enabled && memory.imports_are_bound() {
            match hooks.imported_heap(&targets) {
                // SAFETY: bound import slots hold the runtime's entry points.
                Ok(Some(heap)) => match unsafe { heap.functions() } {
                    Some(functions) => {
                        info!("Unpooled blocks go to the {} heap", heap.module);
                        shims::set_originals(functions);
                        fallback = Arc::new(CrtFallback::new(functions));
                        report.imported_heap = Some(heap.module);
                    }
                    None => warn!("Unusable heap imports from {}", heap.module),
                },
                Ok(None) => warn!(
                    "No single runtime module imports malloc, free and realloc, using the {} fallback",
                    fallback.name()
                ),
                Err(e) => warn!("Heap imports not readable: {}", e),
            }
        }

        let pool = if config.pool.enabled {
            create_pool(&config, fallback, stats.clone())
        } else {
            info!("Memory pool disabled by configuration");
            None
        };
        report.pool_active = pool.is_some();

        match (&pool, config.hooks.enabled) {
            (Some(pool), true) => {
                // The shims must see the pool before the first slot is swapped.
                shims::publish(pool.clone());
                match hooks.install_all(&targets) {
                    Ok(install) => report.hooks = Some(install),
                    Err(e) => warn!("Allocation hooks not installed: {}", e),
                }
            }
            (None, true) => warn!("No memory pool, leaving the host allocator untouched"),
            (_, false) => info!("Allocation hooks disabled by configuration"),
        }

        report.patches = patcher.apply_plan(plan);

        info!(
            "Overdrive initialized: pool {}, {} hooks, {}",
            if report.pool_active { "active" } else { "inactive" },
            hooks.records().len(),
            report.patches
        );

        Ok(Self {
            config,
            stats,
            pool,
            hooks,
            patcher,
            report,
        })
    }

    pub fn config(&self) -> &OverdriveConfig {
        &self.config
    }

    pub fn report(&self) -> &InitReport {
        &self.report
    }

    pub fn pool(&self) -> Option<&Arc<PooledAllocator>> {
        self.pool.as_ref()
    }

    pub fn hooks(&self) -> &ImportHookInstaller<'a, M> {
        &self.hooks
    }

    pub fn patcher(&self) -> &ImagePatcher<'a, M> {
        &self.patcher
    }

    pub fn patcher_mut(&mut self) -> &mut ImagePatcher<'a, M> {
        &mut self.patcher
    }

    pub fn is_pool_active(&self) -> bool {
        self.pool.is_some()
    }

    pub fn is_hooked(&self) -> bool {
        self.hooks.is_hooked()
    }

    pub fn allocation_count(&self) -> u64 {
        self.stats.allocations()
    }

    pub fn free_count(&self) -> u64 {
        self.stats.frees()
    }

    pub fn usage_mb(&self) -> f64 {
        self.pool.as_ref().map_or(0.0, |pool| pool.usage_mb())
    }

    pub fn status(&self) -> StatsSnapshot {
        let gauge = match &self.pool {
            Some(pool) => PoolGauge {
                active: true,
                hooked: self.hooks.is_hooked(),
                capacity: pool.capacity(),
                used: pool.used_bytes(),
            },
            None => PoolGauge {
                hooked: self.hooks.is_hooked(),
                ..Default::default()
            },
        };
        self.stats.snapshot(gauge)
    }

    /// Put the import slots back and, if asked, undo every patch.
    ///
    /// The pool stays alive: blocks it served may still be in use by the host.
    pub fn shutdown(&mut self, restore_patches: bool) -> ShutdownReport {
        let hooks = self.hooks.restore_all();
        let patches = restore_patches.then(|| self.patcher.restore_all());
        info!("Overdrive shut down\n{}", self.status());
        ShutdownReport { hooks, patches }
    }
}

#[cfg(target_os = "windows")]
impl Overdrive<'static, crate::memory::MemoryRegion> {
    /// Initialize against the executable of the current process.
    pub fn attach_current_process(config: OverdriveConfig) -> Result<Self> {
        let region = crate::memory::MemoryRegion::current_module()?;
        // The executable stays mapped for the life of the process.
        let region: &'static crate::memory::MemoryRegion = Box::leak(Box::new(region));
        Self::initialize(region, config)
    }
}

fn create_pool(
    config: &OverdriveConfig,
    fallback: Arc<dyn FallbackAllocator>,
    stats: Arc<StatsTracker>,
) -> Option<Arc<PooledAllocator>> {
    let created = config
        .pool_capacity_bytes()
        .and_then(|capacity| PooledAllocator::new(capacity, fallback, stats));
    match created {
        Ok(pool) => Some(Arc::new(pool)),
        Err(e) => {
            error!("Memory pool unavailable: {}", e);
            None
        }
    }
}
