//! Presets command implementation.

use anyhow::Result;
use owo_colors::OwoColorize;
use serde::Serialize;
use strum::IntoEnumIterator;

use overdrive_core::patch::{
    MemoryBudget, MemoryPreset, ObjectBudget, ObjectPreset, PerformancePreset, PerformanceValues,
};

#[derive(Debug, Serialize)]
struct PresetTables {
    performance: Vec<(PerformancePreset, PerformanceValues)>,
    /// Budget sizes in MB
    memory: Vec<(MemoryPreset, Vec<(MemoryBudget, u32)>)>,
    objects: Vec<(ObjectPreset, Vec<(ObjectBudget, u32)>)>,
}

fn tables() -> PresetTables {
    let memory = MemoryPreset::iter()
        .map(|preset| {
            let sizes = MemoryBudget::iter()
                .map(|budget| (budget, preset.budget_bytes(budget) / (1024 * 1024)))
                .collect();
            (preset, sizes)
        })
        .collect();
    let objects = ObjectPreset::iter()
        .map(|preset| {
            let counts = ObjectBudget::iter()
                .map(|budget| (budget, budget.value(preset)))
                .collect();
            (preset, counts)
        })
        .collect();

    PresetTables {
        performance: PerformancePreset::iter().map(|p| (p, p.values())).collect(),
        memory,
        objects,
    }
}

pub fn run(json: bool) -> Result<()> {
    let tables = tables();
    if json {
        println!("{}", serde_json::to_string_pretty(&tables)?);
        return Ok(());
    }

    println!("{}", "Performance presets".bold());
    println!(
        "  {:<10} {:>10} {:>10} {:>10} {:>10}  culling",
        "preset", "frame ms", "tex MB", "geo MB", "particles"
    );
    for (preset, v) in &tables.performance {
        println!(
            "  {:<10} {:>10.2} {:>10} {:>10} {:>10}  {}",
            preset.to_string(),
            v.frame_time_ms,
            v.texture_memory_mb,
            v.geometry_memory_mb,
            v.particle_systems,
            if v.disable_culling { "off" } else { "on" }
        );
    }
    println!();

    println!("{}", "Memory budget presets (MB)".bold());
    for (preset, sizes) in &tables.memory {
        let row: Vec<String> = sizes.iter().map(|(b, mb)| format!("{}={}", b, mb)).collect();
        println!("  {:<12} {}", preset.to_string(), row.join(" "));
    }
    println!();

    println!("{}", "Object budget presets".bold());
    for (preset, counts) in &tables.objects {
        let row: Vec<String> = counts.iter().map(|(b, n)| format!("{}={}", b, n)).collect();
        println!("  {:<12} {}", preset.to_string(), row.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_cover_every_preset() {
        let tables = tables();
        assert_eq!(tables.performance.len(), 4);
        assert_eq!(tables.memory.len(), 6);
        assert_eq!(tables.objects.len(), 5);

        let (_, aggressive) = tables
            .memory
            .iter()
            .find(|(p, _)| *p == MemoryPreset::Aggressive)
            .unwrap();
        assert!(aggressive.contains(&(MemoryBudget::InteriorTexture, 256)));
    }

    #[test]
    fn test_tables_serialize() {
        let json = serde_json::to_string(&tables()).unwrap();
        assert!(json.contains("\"high-end\""));
        assert!(json.contains("\"interior_texture\""));
    }
}
