//! Preset tables for the budget and performance patches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use super::table::{MAX_BUDGET_BYTES, MAX_OBJECT_BUDGET, TableEntry, memory, objects};

const MB: u64 = 1024 * 1024;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum PerformancePreset {
    #[default]
    Vanilla,
    Relaxed,
    #[strum(to_string = "high-end", serialize = "highend")]
    HighEnd,
    Unlimited,
}

/// Concrete values written by a performance preset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceValues {
    pub frame_time_ms: f32,
    pub texture_memory_mb: f32,
    pub geometry_memory_mb: f32,
    pub particle_systems: f32,
    pub disable_culling: bool,
}

impl PerformancePreset {
    pub fn values(self) -> PerformanceValues {
        let (frame_time_ms, texture_memory_mb, geometry_memory_mb, particle_systems, disable_culling) =
            match self {
                PerformancePreset::Vanilla => (16.67, 512.0, 256.0, 100.0, false),
                PerformancePreset::Relaxed => (20.0, 1024.0, 512.0, 200.0, false),
                PerformancePreset::HighEnd => (33.33, 2048.0, 1024.0, 500.0, true),
                PerformancePreset::Unlimited => (1000.0, 12288.0, 6144.0, 3000.0, true),
            };
        PerformanceValues {
            frame_time_ms,
            texture_memory_mb,
            geometry_memory_mb,
            particle_systems,
            disable_culling,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum MemoryPreset {
    Default,
    Recommended,
    #[default]
    Aggressive,
    Heavy,
    Ultra,
    Extreme,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MemoryBudget {
    ExteriorTexture,
    InteriorGeometry,
    InteriorTexture,
    InteriorWater,
    Actor,
}

impl MemoryBudget {
    pub fn default_mb(self) -> u32 {
        match self {
            MemoryBudget::ExteriorTexture => 20,
            MemoryBudget::InteriorGeometry => 10,
            MemoryBudget::InteriorTexture => 100,
            MemoryBudget::InteriorWater => 10,
            MemoryBudget::Actor => 10,
        }
    }

    /// The `push imm32` that seeds the budget at startup.
    pub fn init_site(self) -> TableEntry {
        match self {
            MemoryBudget::ExteriorTexture => memory::EXTERIOR_TEXTURE_INIT,
            MemoryBudget::InteriorGeometry => memory::INTERIOR_GEOMETRY_INIT,
            MemoryBudget::InteriorTexture => memory::INTERIOR_TEXTURE_INIT,
            MemoryBudget::InteriorWater => memory::INTERIOR_WATER_INIT,
            MemoryBudget::Actor => memory::ACTOR_INIT,
        }
    }

    /// Live manager fields that already hold the budget.
    pub fn managers(self) -> &'static [TableEntry] {
        match self {
            MemoryBudget::ExteriorTexture => memory::EXTERIOR_TEXTURE_MANAGER,
            MemoryBudget::InteriorGeometry => memory::INTERIOR_GEOMETRY_MANAGER,
            MemoryBudget::InteriorTexture => memory::INTERIOR_TEXTURE_MANAGER,
            MemoryBudget::InteriorWater => memory::INTERIOR_WATER_MANAGER,
            MemoryBudget::Actor => memory::ACTOR_MANAGER,
        }
    }
}

impl MemoryPreset {
    /// Multiplier over the host default for one budget.
    ///
    /// Interior textures scale by a smaller factor than the other budgets.
    /// `Recommended` and `Aggressive` share the first increased tier.
    pub fn multiplier(self, budget: MemoryBudget) -> f64 {
        let (others, interior_texture) = match self {
            MemoryPreset::Default => (1.0, 1.0),
            MemoryPreset::Recommended | MemoryPreset::Aggressive => (3.2, 2.56),
            MemoryPreset::Heavy => (9.6, 7.68),
            MemoryPreset::Ultra => (25.6, 20.48),
            MemoryPreset::Extreme => (51.2, 30.72),
        };
        if budget == MemoryBudget::InteriorTexture {
            interior_texture
        } else {
            others
        }
    }

    /// Budget size in bytes, before overrides.
    pub fn budget_bytes(self, budget: MemoryBudget) -> u32 {
        let mb = (budget.default_mb() as f64 * self.multiplier(budget)).round() as u64;
        clamp_budget_bytes(mb * MB)
    }
}

pub fn clamp_budget_bytes(bytes: u64) -> u32 {
    bytes.clamp(MB, MAX_BUDGET_BYTES as u64) as u32
}

/// Bytes for every memory budget: the preset value unless an MB override is given.
pub fn memory_budget_values(
    preset: MemoryPreset,
    overrides_mb: &BTreeMap<MemoryBudget, u32>,
) -> Vec<(MemoryBudget, u32)> {
    MemoryBudget::iter()
        .map(|budget| {
            let bytes = match overrides_mb.get(&budget) {
                Some(&mb) => clamp_budget_bytes(mb as u64 * MB),
                None => preset.budget_bytes(budget),
            };
            (budget, bytes)
        })
        .collect()
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum ObjectPreset {
    #[default]
    Default,
    Recommended,
    Aggressive,
    Ultra,
    Extreme,
}

impl ObjectPreset {
    pub fn multiplier(self) -> u32 {
        match self {
            ObjectPreset::Default => 1,
            ObjectPreset::Recommended => 4,
            ObjectPreset::Aggressive => 8,
            ObjectPreset::Ultra => 10,
            ObjectPreset::Extreme => 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ObjectBudget {
    Triangles,
    Particles,
    HavokTriangles,
    Decals,
    Geometry,
    GeneralRefs,
    ActiveRefs,
    Emitters,
    AnimatedObjects,
    ActorRefs,
    Water,
    Lights,
}

impl ObjectBudget {
    pub fn entry(self) -> TableEntry {
        match self {
            ObjectBudget::Triangles => objects::TRIANGLES,
            ObjectBudget::Particles => objects::PARTICLES,
            ObjectBudget::HavokTriangles => objects::HAVOK_TRIANGLES,
            ObjectBudget::Decals => objects::DECALS,
            ObjectBudget::Geometry => objects::GEOMETRY,
            ObjectBudget::GeneralRefs => objects::GENERAL_REFS,
            ObjectBudget::ActiveRefs => objects::ACTIVE_REFS,
            ObjectBudget::Emitters => objects::EMITTERS,
            ObjectBudget::AnimatedObjects => objects::ANIMATED_OBJECTS,
            ObjectBudget::ActorRefs => objects::ACTOR_REFS,
            ObjectBudget::Water => objects::WATER,
            ObjectBudget::Lights => objects::LIGHTS,
        }
    }

    pub fn default_count(self) -> u32 {
        self.entry().expected.unwrap_or(0.0) as u32
    }

    pub fn value(self, preset: ObjectPreset) -> u32 {
        self.default_count()
            .saturating_mul(preset.multiplier())
            .min(MAX_OBJECT_BUDGET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggressive_interior_texture_is_256mb() {
        assert_eq!(
            MemoryPreset::Aggressive.budget_bytes(MemoryBudget::InteriorTexture),
            256 * 1024 * 1024
        );
        assert_eq!(
            MemoryPreset::Aggressive.budget_bytes(MemoryBudget::ExteriorTexture),
            64 * 1024 * 1024
        );
        assert!(
            MemoryPreset::Aggressive.budget_bytes(MemoryBudget::InteriorTexture) <= MAX_BUDGET_BYTES
        );
    }

    #[test]
    fn test_default_preset_keeps_host_values() {
        for budget in MemoryBudget::iter() {
            assert_eq!(
                MemoryPreset::Default.budget_bytes(budget) as f64,
                budget.init_site().expected.unwrap()
            );
        }
    }

    #[test]
    fn test_overrides_replace_preset_and_clamp() {
        let mut overrides = BTreeMap::new();
        overrides.insert(MemoryBudget::Actor, 48);
        overrides.insert(MemoryBudget::InteriorTexture, 8192);
        let values: BTreeMap<_, _> = memory_budget_values(MemoryPreset::Recommended, &overrides)
            .into_iter()
            .collect();

        assert_eq!(values[&MemoryBudget::Actor], 48 * 1024 * 1024);
        assert_eq!(values[&MemoryBudget::InteriorTexture], MAX_BUDGET_BYTES);
        assert_eq!(values[&MemoryBudget::InteriorWater], 32 * 1024 * 1024);
    }

    fn tier(preset: MemoryPreset) -> Vec<u32> {
        MemoryBudget::iter().map(|b| preset.budget_bytes(b)).collect()
    }

    #[test]
    fn test_memory_tiers_match_host_tables() {
        // exterior texture, interior geometry, interior texture, interior water, actor
        assert_eq!(
            tier(MemoryPreset::Recommended),
            [0x0400_0000, 0x0200_0000, 0x1000_0000, 0x0200_0000, 0x0200_0000]
        );
        assert_eq!(tier(MemoryPreset::Aggressive), tier(MemoryPreset::Recommended));
        assert_eq!(
            tier(MemoryPreset::Heavy),
            [0x0C00_0000, 0x0600_0000, 0x3000_0000, 0x0600_0000, 0x0600_0000]
        );
        assert_eq!(
            tier(MemoryPreset::Ultra),
            [0x2000_0000, 0x1000_0000, 0x8000_0000, 0x1000_0000, 0x1000_0000]
        );
        assert_eq!(
            tier(MemoryPreset::Extreme),
            [0x4000_0000, 0x2000_0000, 0xC000_0000, 0x2000_0000, 0x2000_0000]
        );
        assert_eq!(
            MemoryPreset::Extreme.budget_bytes(MemoryBudget::InteriorTexture),
            MAX_BUDGET_BYTES
        );
    }

    #[test]
    fn test_object_budgets_scale() {
        assert_eq!(ObjectBudget::Triangles.value(ObjectPreset::Default), 100_000);
        assert_eq!(ObjectBudget::Triangles.value(ObjectPreset::Extreme), 1_500_000);
        assert_eq!(ObjectBudget::Lights.value(ObjectPreset::Recommended), 40);
    }

    #[test]
    fn test_preset_names_parse() {
        assert_eq!(
            "high-end".parse::<PerformancePreset>().unwrap(),
            PerformancePreset::HighEnd
        );
        assert_eq!(
            "HighEnd".parse::<PerformancePreset>().unwrap(),
            PerformancePreset::HighEnd
        );
        assert_eq!(PerformancePreset::HighEnd.to_string(), "high-end");
        assert_eq!("ULTRA".parse::<MemoryPreset>().unwrap(), MemoryPreset::Ultra);
        assert_eq!(
            "interior_texture".parse::<MemoryBudget>().unwrap(),
            MemoryBudget::InteriorTexture
        );
        assert!("insane".parse::<ObjectPreset>().is_err());
    }

    #[test]
    fn test_performance_values() {
        let vanilla = PerformancePreset::Vanilla.values();
        assert!(!vanilla.disable_culling);
        assert_eq!(vanilla.texture_memory_mb, 512.0);
        assert!(PerformancePreset::Unlimited.values().disable_culling);
    }
}
