//! Patched-address table for the supported host build.
//!
//! Offsets are module-relative. Values are bit-exact for that one build;
//! other builds rely on the resolver's signature scan for the entries that
//! carry one.

use serde::Serialize;
use strum::Display;

use crate::resolver::{Signature, SignatureEntry, SignatureSet, ValueKind};

/// Size of the stub written over a disabled function.
pub const STUB_LEN: usize = 16;

/// `RET` followed by `NOP` padding.
pub const STUB_BYTES: [u8; STUB_LEN] = {
    let mut bytes = [0x90u8; STUB_LEN];
    bytes[0] = 0xC3;
    bytes
};

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PatchKind {
    Float,
    Dword,
    FunctionStub,
}

impl PatchKind {
    pub fn value_kind(self) -> Option<ValueKind> {
        match self {
            PatchKind::Float => Some(ValueKind::F32),
            PatchKind::Dword => Some(ValueKind::U32),
            PatchKind::FunctionStub => None,
        }
    }

    pub fn byte_len(self) -> usize {
        match self {
            PatchKind::Float | PatchKind::Dword => 4,
            PatchKind::FunctionStub => STUB_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TableEntry {
    pub name: &'static str,
    pub offset: u32,
    pub kind: PatchKind,
    /// Value the host ships with; `None` for values computed at runtime
    pub expected: Option<f64>,
    /// Relative tolerance for `expected`
    pub tolerance: f64,
    pub min: f64,
    pub max: f64,
    /// The offset is the immediate operand of a `push imm32`
    pub push_site: bool,
}

impl TableEntry {
    const fn float(name: &'static str, offset: u32, expected: f64, min: f64, max: f64) -> Self {
        Self {
            name,
            offset,
            kind: PatchKind::Float,
            expected: Some(expected),
            tolerance: 0.10,
            min,
            max,
            push_site: false,
        }
    }

    const fn stub(name: &'static str, offset: u32) -> Self {
        Self {
            name,
            offset,
            kind: PatchKind::FunctionStub,
            expected: None,
            tolerance: 0.0,
            min: 0.0,
            max: 0.0,
            push_site: false,
        }
    }

    const fn dword(name: &'static str, offset: u32, expected: Option<f64>, max: f64) -> Self {
        Self {
            name,
            offset,
            kind: PatchKind::Dword,
            expected,
            tolerance: 0.10,
            min: 1.0,
            max,
            push_site: false,
        }
    }

    const fn push_site(name: &'static str, offset: u32, default_mb: f64) -> Self {
        Self {
            name,
            offset,
            kind: PatchKind::Dword,
            expected: Some(default_mb * MB),
            tolerance: 0.0,
            min: MB,
            max: MAX_BUDGET_BYTES as f64,
            push_site: true,
        }
    }

    /// Signature that locates the entry when the host build differs.
    pub fn signature(&self) -> Option<Signature> {
        match (self.push_site, self.expected) {
            (true, Some(expected)) => Some(Signature::push_imm32(expected as u32)),
            _ => None,
        }
    }
}

/// Largest memory budget the patcher writes (3 GB).
pub const MAX_BUDGET_BYTES: u32 = 0xC000_0000;

/// Largest object-count budget the patcher writes.
pub const MAX_OBJECT_BUDGET: u32 = 10_000_000;

pub mod performance {
    use super::TableEntry;

    pub const FRAME_TIME: TableEntry =
        TableEntry::float("frame_time_ms", 0x0101_F414, 16.67, 5.0, 2000.0);
    pub const TEXTURE_MEMORY: TableEntry =
        TableEntry::float("texture_memory_mb", 0x0101_F418, 512.0, 64.0, 32768.0);
    pub const GEOMETRY_MEMORY: TableEntry =
        TableEntry::float("geometry_memory_mb", 0x0101_F41C, 256.0, 32.0, 16384.0);
    pub const PARTICLE_SYSTEMS: TableEntry =
        TableEntry::float("particle_systems", 0x0101_F420, 100.0, 10.0, 10000.0);

    pub const ALL: [TableEntry; 4] = [FRAME_TIME, TEXTURE_MEMORY, GEOMETRY_MEMORY, PARTICLE_SYSTEMS];
}

/// Adaptive-quality routines that lower detail when frame time rises.
pub const CULLING_STUBS: [TableEntry; 6] = [
    TableEntry::stub("frame_time_monitor", 0x00FC_9010),
    TableEntry::stub("lod_frame_adjuster", 0x00FC_9040),
    TableEntry::stub("texture_budget_monitor", 0x00FC_9070),
    TableEntry::stub("geometry_budget_monitor", 0x00FC_90A0),
    TableEntry::stub("distance_culler", 0x00FC_90D0),
    TableEntry::stub("particle_culler", 0x00FC_9100),
];

/// Per-frame budget handlers; stubbed only when asked for explicitly.
pub const BUDGET_HANDLERS: [TableEntry; 2] = [
    TableEntry::stub("city_lod_handler", 0x0050_0000),
    TableEntry::stub("actor_count_handler", 0x0050_0010),
];

pub mod memory {
    use super::{MAX_BUDGET_BYTES, TableEntry};

    const MAX: f64 = MAX_BUDGET_BYTES as f64;

    pub const EXTERIOR_TEXTURE_INIT: TableEntry =
        TableEntry::push_site("exterior_texture_init", 0x00F3_DE43, 20.0);
    pub const INTERIOR_GEOMETRY_INIT: TableEntry =
        TableEntry::push_site("interior_geometry_init", 0x00F3_E113, 10.0);
    pub const INTERIOR_TEXTURE_INIT: TableEntry =
        TableEntry::push_site("interior_texture_init", 0x00F3_E143, 100.0);
    pub const INTERIOR_WATER_INIT: TableEntry =
        TableEntry::push_site("interior_water_init", 0x00F3_E173, 10.0);
    pub const ACTOR_INIT: TableEntry = TableEntry::push_site("actor_init", 0x00F3_E593, 10.0);

    pub const EXTERIOR_TEXTURE_MANAGER: &[TableEntry] = &[TableEntry::dword(
        "exterior_texture_manager",
        0x011C_5B5C,
        Some(20.0 * super::MB),
        MAX,
    )];
    /// The exterior geometry manager follows the interior value.
    pub const INTERIOR_GEOMETRY_MANAGER: &[TableEntry] = &[
        TableEntry::dword(
            "interior_geometry_manager",
            0x011C_5C80,
            Some(10.0 * super::MB),
            MAX,
        ),
        TableEntry::dword("exterior_geometry_manager", 0x011C_5BBC, None, MAX),
    ];
    pub const INTERIOR_TEXTURE_MANAGER: &[TableEntry] = &[TableEntry::dword(
        "interior_texture_manager",
        0x011C_5C60,
        Some(100.0 * super::MB),
        MAX,
    )];
    /// The exterior water manager follows the interior value.
    pub const INTERIOR_WATER_MANAGER: &[TableEntry] = &[
        TableEntry::dword(
            "interior_water_manager",
            0x011C_5A4C,
            Some(10.0 * super::MB),
            MAX,
        ),
        TableEntry::dword("exterior_water_manager", 0x011C_5C50, None, MAX),
    ];
    pub const ACTOR_MANAGER: &[TableEntry] = &[TableEntry::dword(
        "actor_manager",
        0x011C_59E0,
        Some(10.0 * super::MB),
        MAX,
    )];
}

pub mod objects {
    use super::{MAX_OBJECT_BUDGET, TableEntry};

    const fn cap(name: &'static str, offset: u32, default: f64) -> TableEntry {
        TableEntry::dword(name, offset, Some(default), MAX_OBJECT_BUDGET as f64)
    }

    pub const TRIANGLES: TableEntry = cap("triangles", 0x011C_59EC, 100_000.0);
    pub const PARTICLES: TableEntry = cap("particles", 0x011C_5B3C, 5_000.0);
    pub const HAVOK_TRIANGLES: TableEntry = cap("havok_triangles", 0x011C_59A0, 5_000.0);
    pub const DECALS: TableEntry = cap("decals", 0x011C_5BDC, 500.0);
    pub const GEOMETRY: TableEntry = cap("geometry", 0x011C_5A58, 1_000.0);
    pub const GENERAL_REFS: TableEntry = cap("general_refs", 0x011C_5A1C, 700.0);
    pub const ACTIVE_REFS: TableEntry = cap("active_refs", 0x011C_5AF0, 100.0);
    pub const EMITTERS: TableEntry = cap("emitters", 0x011C_5A64, 50.0);
    pub const ANIMATED_OBJECTS: TableEntry = cap("animated_objects", 0x011C_5C24, 50.0);
    pub const ACTOR_REFS: TableEntry = cap("actor_refs", 0x011C_5A40, 20.0);
    pub const WATER: TableEntry = cap("water", 0x011C_5A10, 10.0);
    pub const LIGHTS: TableEntry = cap("lights", 0x011C_5B80, 10.0);
}

/// Every entry, in application order.
pub fn all_entries() -> Vec<TableEntry> {
    use crate::patch::presets::{MemoryBudget, ObjectBudget};
    use strum::IntoEnumIterator;

    let mut entries = Vec::new();
    for budget in MemoryBudget::iter() {
        entries.push(budget.init_site());
        entries.extend_from_slice(budget.managers());
    }
    entries.extend(ObjectBudget::iter().map(ObjectBudget::entry));
    entries.extend_from_slice(&performance::ALL);
    entries.extend_from_slice(&CULLING_STUBS);
    entries.extend_from_slice(&BUDGET_HANDLERS);
    entries
}

/// Signatures for every entry that carries one, as a saveable set.
pub fn builtin_signatures() -> SignatureSet {
    SignatureSet {
        version: "builtin".to_string(),
        entries: all_entries()
            .into_iter()
            .filter_map(|entry| {
                entry.signature().map(|signature| SignatureEntry {
                    name: entry.name.to_string(),
                    offset: entry.offset,
                    signatures: vec![signature],
                })
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_stub_is_ret_then_nops() {
        assert_eq!(STUB_BYTES[0], 0xC3);
        assert!(STUB_BYTES[1..].iter().all(|&b| b == 0x90));
    }

    #[test]
    fn test_offsets_are_unique() {
        let entries = all_entries();
        let offsets: HashSet<u32> = entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets.len(), entries.len());
        assert_eq!(entries.len(), 5 + 7 + 12 + 4 + 6 + 2);
    }

    #[test]
    fn test_push_sites_carry_signatures() {
        let sig = memory::INTERIOR_TEXTURE_INIT.signature().unwrap();
        assert_eq!(sig.pattern, "68 00 00 40 06");
        assert_eq!(sig.target_offset, 1);
        assert!(performance::FRAME_TIME.signature().is_none());
        assert!(CULLING_STUBS[0].signature().is_none());
        assert!(BUDGET_HANDLERS.iter().all(|e| e.kind == PatchKind::FunctionStub));
    }

    #[test]
    fn test_builtin_signatures_cover_push_sites() {
        let set = builtin_signatures();
        assert_eq!(set.entries.len(), 5);
        let sig = set.for_offset(memory::ACTOR_INIT.offset).unwrap();
        assert_eq!(sig.pattern, "68 00 00 A0 00");
        assert!(set.entry("interior_water_init").is_some());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(PatchKind::Float.value_kind(), Some(ValueKind::F32));
        assert_eq!(PatchKind::FunctionStub.value_kind(), None);
        assert_eq!(PatchKind::FunctionStub.byte_len(), STUB_LEN);
        assert_eq!(PatchKind::FunctionStub.to_string(), "function_stub");
    }
}
