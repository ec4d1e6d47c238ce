//! Inspect command implementation.
//!
//! Maps the executable without running it, then checks which allocation
//! imports the hooks would find and how each patch table entry resolves.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use serde::Serialize;

use overdrive_core::hook::default_targets;
use overdrive_core::patch::table::{PatchKind, TableEntry, all_entries};
use overdrive_core::resolver::{read_value, value_within};
use overdrive_core::{
    AddressResolver, MemoryRegion, OverdriveConfig, PeImage, ReadMemory, ResolvedAddress,
    map_pe_path,
};

#[derive(Debug, Serialize)]
struct InspectReport {
    path: String,
    pe32_plus: bool,
    preferred_base: u64,
    size_of_image: u32,
    sections: Vec<SectionRow>,
    hooks: Vec<HookRow>,
    patches: Vec<PatchRow>,
}

#[derive(Debug, Serialize)]
struct SectionRow {
    name: String,
    rva: u32,
    size: u32,
    code: bool,
}

#[derive(Debug, Serialize)]
struct HookRow {
    target: String,
    imported: bool,
}

#[derive(Debug, Serialize)]
struct PatchRow {
    name: &'static str,
    offset: u32,
    kind: PatchKind,
    /// Value the configuration would write, if the entry is part of the plan
    planned: Option<String>,
    resolved: Option<ResolvedAddress>,
    current: Option<String>,
    /// Whether the current value matches the shipped default
    matches_default: Option<bool>,
    error: Option<String>,
}

pub fn run(exe: &Path, config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = match config_path {
        Some(path) => OverdriveConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => OverdriveConfig::default(),
    };
    let region = map_pe_path(exe).with_context(|| format!("mapping {}", exe.display()))?;
    let report = build_report(exe, &region, &config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn build_report(
    exe: &Path,
    region: &MemoryRegion,
    config: &OverdriveConfig,
) -> Result<InspectReport> {
    let pe = PeImage::parse(region)?;

    let sections = pe
        .sections()
        .iter()
        .map(|s| SectionRow {
            name: s.name.clone(),
            rva: s.virtual_address,
            size: s.len(),
            code: s.is_code(),
        })
        .collect();

    let mut hooks = Vec::new();
    for target in default_targets(&config.hooks.functions, &config.hooks.modules) {
        let imported = pe.find_import(&target.module, &target.symbol)?.is_some();
        hooks.push(HookRow {
            target: target.label(),
            imported,
        });
    }

    let planned: HashMap<u32, String> = config
        .patch_plan()
        .patches()
        .iter()
        .map(|p| (p.entry.offset, p.value.to_string()))
        .collect();
    let resolver = AddressResolver::new(region, config.general.validation)?;
    let patches = all_entries()
        .into_iter()
        .map(|entry| {
            let planned = planned.get(&entry.offset).cloned();
            inspect_entry(&resolver, entry, planned)
        })
        .collect();

    Ok(InspectReport {
        path: exe.display().to_string(),
        pe32_plus: pe.is_pe32_plus(),
        preferred_base: pe.preferred_base(),
        size_of_image: pe.size_of_image(),
        sections,
        hooks,
        patches,
    })
}

fn inspect_entry(
    resolver: &AddressResolver<'_, MemoryRegion>,
    entry: TableEntry,
    planned: Option<String>,
) -> PatchRow {
    let mut row = PatchRow {
        name: entry.name,
        offset: entry.offset,
        kind: entry.kind,
        planned,
        resolved: None,
        current: None,
        matches_default: None,
        error: None,
    };

    let resolved = match resolver.resolve(entry.offset, entry.signature().as_ref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            row.error = Some(e.to_string());
            return row;
        }
    };
    row.resolved = Some(resolved);

    let address = resolved.absolute_address;
    match entry.kind.value_kind() {
        Some(kind) => match read_value(resolver.memory(), address, kind) {
            Ok(value) => {
                row.current = Some(value.to_string());
                row.matches_default = entry
                    .expected
                    .map(|expected| value_within(value, expected, entry.tolerance));
            }
            Err(e) => row.error = Some(e.to_string()),
        },
        None => match resolver.memory().read_bytes(address, 4) {
            Ok(bytes) => {
                let hex: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
                row.current = Some(hex.join(" "));
            }
            Err(e) => row.error = Some(e.to_string()),
        },
    }
    row
}

fn print_report(report: &InspectReport) {
    println!("=== {} ===", report.path.bold());
    println!(
        "Format: {}  Preferred base: 0x{:X}  Size: 0x{:X}",
        if report.pe32_plus { "PE32+" } else { "PE32" },
        report.preferred_base,
        report.size_of_image
    );
    println!();

    println!("Sections:");
    for s in &report.sections {
        println!(
            "  {:<8} 0x{:08X} 0x{:08X}{}",
            s.name,
            s.rva,
            s.size,
            if s.code { "  code" } else { "" }
        );
    }
    println!();

    let imported = report.hooks.iter().filter(|h| h.imported).count();
    println!("Hook targets ({}/{} imported):", imported, report.hooks.len());
    for hook in report.hooks.iter().filter(|h| h.imported) {
        println!("  {} {}", "hooked".green(), hook.target);
    }
    println!();

    println!("Patch table:");
    for row in &report.patches {
        let status = match (&row.resolved, row.matches_default) {
            (None, _) => "unresolved".red().to_string(),
            (Some(_), Some(false)) => "mismatch".yellow().to_string(),
            (Some(r), _) if r.validated => "verified".green().to_string(),
            (Some(_), _) => "ok".green().to_string(),
        };
        let method = row
            .resolved
            .map(|r| r.method.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  0x{:08X} {:<28} {:<13} {:<7} {:<20} -> {:<12} {}",
            row.offset,
            row.name,
            row.kind.to_string(),
            method,
            row.current.as_deref().unwrap_or("-"),
            row.planned.as_deref().unwrap_or("-"),
            status
        );
        if let Some(error) = &row.error {
            println!("             {}", error.dimmed());
        }
    }
}
