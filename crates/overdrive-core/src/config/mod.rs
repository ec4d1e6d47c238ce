//! Runtime configuration.
//!
//! Read once at startup from a TOML file; every section and field is optional.
//!
//! ```toml
//! [general]
//! validation = "strict"
//!
//! [pool]
//! capacity_mb = 2048
//!
//! [budgets]
//! memory_preset = "ultra"
//! object_preset = "recommended"
//!
//! [budgets.overrides]
//! interior_texture_mb = 512
//!
//! [performance]
//! preset = "high-end"
//! frame_time_ms = 25.0
//!
//! [hooks]
//! functions = ["malloc", "free"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hook::MemoryFunction;
use crate::patch::{
    MemoryBudget, MemoryPreset, ObjectPreset, PatchPlan, PerformancePreset, PerformanceValues,
};
use crate::resolver::ValidationPolicy;

pub const DEFAULT_POOL_MB: u32 = 1024;

/// Largest pool the address space of a 32-bit host can hold.
pub const MAX_POOL_MB: u32 = 3072;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverdriveConfig {
    pub general: GeneralConfig,
    pub pool: PoolConfig,
    pub budgets: BudgetConfig,
    pub performance: PerformanceConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub validation: ValidationPolicy,
    /// JSON signature file overriding the built-in signatures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
    pub capacity_mb: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_mb: DEFAULT_POOL_MB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub enabled: bool,
    pub memory_preset: MemoryPreset,
    pub overrides: BudgetOverrides,
    pub object_preset: ObjectPreset,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_preset: MemoryPreset::Aggressive,
            overrides: BudgetOverrides::default(),
            object_preset: ObjectPreset::Default,
        }
    }
}

/// Per-budget sizes in MB that replace the preset value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exterior_texture_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interior_geometry_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interior_texture_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interior_water_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_mb: Option<u32>,
}

impl BudgetOverrides {
    pub fn get(&self, budget: MemoryBudget) -> Option<u32> {
        match budget {
            MemoryBudget::ExteriorTexture => self.exterior_texture_mb,
            MemoryBudget::InteriorGeometry => self.interior_geometry_mb,
            MemoryBudget::InteriorTexture => self.interior_texture_mb,
            MemoryBudget::InteriorWater => self.interior_water_mb,
            MemoryBudget::Actor => self.actor_mb,
        }
    }

    pub fn set(&mut self, budget: MemoryBudget, mb: u32) {
        let slot = match budget {
            MemoryBudget::ExteriorTexture => &mut self.exterior_texture_mb,
            MemoryBudget::InteriorGeometry => &mut self.interior_geometry_mb,
            MemoryBudget::InteriorTexture => &mut self.interior_texture_mb,
            MemoryBudget::InteriorWater => &mut self.interior_water_mb,
            MemoryBudget::Actor => &mut self.actor_mb,
        };
        *slot = Some(mb);
    }

    pub fn to_map(&self) -> BTreeMap<MemoryBudget, u32> {
        MemoryBudget::iter()
            .filter_map(|budget| self.get(budget).map(|mb| (budget, mb)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub enabled: bool,
    pub preset: PerformancePreset,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_time_ms: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub texture_memory_mb: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry_memory_mb: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub particle_systems: Option<f32>,
    /// Overrides the preset's culling choice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_culling: Option<bool>,
    /// Also stub the city LOD and actor count budget handlers
    pub stub_budget_handlers: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preset: PerformancePreset::Vanilla,
            frame_time_ms: None,
            texture_memory_mb: None,
            geometry_memory_mb: None,
            particle_systems: None,
            disable_culling: None,
            stub_budget_handlers: false,
        }
    }
}

impl PerformanceConfig {
    /// Preset values with any explicit values applied on top.
    pub fn values(&self) -> PerformanceValues {
        let preset = self.preset.values();
        PerformanceValues {
            frame_time_ms: self.frame_time_ms.unwrap_or(preset.frame_time_ms),
            texture_memory_mb: self.texture_memory_mb.unwrap_or(preset.texture_memory_mb),
            geometry_memory_mb: self.geometry_memory_mb.unwrap_or(preset.geometry_memory_mb),
            particle_systems: self.particle_systems.unwrap_or(preset.particle_systems),
            disable_culling: self.disable_culling.unwrap_or(preset.disable_culling),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub enabled: bool,
    /// Functions to redirect; empty means all of them
    pub functions: Vec<MemoryFunction>,
    /// Runtime modules to hook; empty means the built-in list
    pub modules: Vec<String>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            functions: Vec::new(),
            modules: Vec::new(),
        }
    }
}

impl OverdriveConfig {
    pub fn builder() -> OverdriveConfigBuilder {
        OverdriveConfigBuilder::default()
    }

    /// Parse a TOML document and check its values.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: OverdriveConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path`, falling back to defaults when it is missing or invalid.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) if e.is_not_found() => {
                debug!("No configuration at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                warn!("Ignoring configuration {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity_mb == 0 || self.pool.capacity_mb > MAX_POOL_MB {
            return Err(Error::Config(format!(
                "pool.capacity_mb must be between 1 and {}, got {}",
                MAX_POOL_MB, self.pool.capacity_mb
            )));
        }
        let perf = &self.performance;
        for (name, value) in [
            ("frame_time_ms", perf.frame_time_ms),
            ("texture_memory_mb", perf.texture_memory_mb),
            ("geometry_memory_mb", perf.geometry_memory_mb),
            ("particle_systems", perf.particle_systems),
        ] {
            if let Some(value) = value
                && !(value.is_finite() && value > 0.0)
            {
                return Err(Error::Config(format!(
                    "performance.{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn pool_capacity_bytes(&self) -> Result<usize> {
        (self.pool.capacity_mb as usize)
            .checked_mul(1024 * 1024)
            .ok_or_else(|| {
                Error::Config(format!(
                    "pool of {} MB does not fit the address space",
                    self.pool.capacity_mb
                ))
            })
    }

    /// Every patch the configuration asks for, in application order.
    pub fn patch_plan(&self) -> PatchPlan {
        let mut plan = PatchPlan::new();
        if self.budgets.enabled {
            plan = plan.memory_budgets(self.budgets.memory_preset, &self.budgets.overrides.to_map());
            if self.budgets.object_preset != ObjectPreset::Default {
                plan = plan.object_budgets(self.budgets.object_preset);
            }
        }
        if self.performance.enabled {
            plan = plan.performance(&self.performance.values());
            if self.performance.stub_budget_handlers {
                plan = plan.budget_handler_stubs();
            }
        }
        plan
    }
}

#[derive(Debug, Clone, Default)]
pub struct OverdriveConfigBuilder {
    config: OverdriveConfig,
}

impl OverdriveConfigBuilder {
    pub fn validation(mut self, policy: ValidationPolicy) -> Self {
        self.config.general.validation = policy;
        self
    }

    pub fn signatures<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.general.signatures = Some(path.into());
        self
    }

    pub fn pool_enabled(mut self, enabled: bool) -> Self {
        self.config.pool.enabled = enabled;
        self
    }

    pub fn pool_capacity_mb(mut self, mb: u32) -> Self {
        self.config.pool.capacity_mb = mb;
        self
    }

    pub fn budgets_enabled(mut self, enabled: bool) -> Self {
        self.config.budgets.enabled = enabled;
        self
    }

    pub fn memory_preset(mut self, preset: MemoryPreset) -> Self {
        self.config.budgets.memory_preset = preset;
        self
    }

    pub fn budget_override_mb(mut self, budget: MemoryBudget, mb: u32) -> Self {
        self.config.budgets.overrides.set(budget, mb);
        self
    }

    pub fn object_preset(mut self, preset: ObjectPreset) -> Self {
        self.config.budgets.object_preset = preset;
        self
    }

    pub fn performance_enabled(mut self, enabled: bool) -> Self {
        self.config.performance.enabled = enabled;
        self
    }

    pub fn performance_preset(mut self, preset: PerformancePreset) -> Self {
        self.config.performance.preset = preset;
        self
    }

    pub fn disable_culling(mut self, disable: bool) -> Self {
        self.config.performance.disable_culling = Some(disable);
        self
    }

    pub fn stub_budget_handlers(mut self, stub: bool) -> Self {
        self.config.performance.stub_budget_handlers = stub;
        self
    }

    pub fn hooks_enabled(mut self, enabled: bool) -> Self {
        self.config.hooks.enabled = enabled;
        self
    }

    pub fn hook_functions(mut self, functions: &[MemoryFunction]) -> Self {
        self.config.hooks.functions = functions.to_vec();
        self
    }

    pub fn hook_modules<S: Into<String>>(mut self, modules: impl IntoIterator<Item = S>) -> Self {
        self.config.hooks.modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> OverdriveConfig {
        self.config
    }
}
