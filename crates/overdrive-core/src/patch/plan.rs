use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use strum::IntoEnumIterator;

use super::presets::{
    MemoryBudget, MemoryPreset, ObjectBudget, ObjectPreset, PerformanceValues,
};
use super::table::{BUDGET_HANDLERS, CULLING_STUBS, TableEntry, performance};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PatchValue {
    Float(f32),
    Dword(u32),
    Stub,
}

impl fmt::Display for PatchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchValue::Float(v) => write!(f, "{v}"),
            PatchValue::Dword(v) => write!(f, "{v}"),
            PatchValue::Stub => f.write_str("ret stub"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlannedPatch {
    pub entry: TableEntry,
    pub value: PatchValue,
}

/// Ordered list of table entries and the values to write into them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatchPlan {
    patches: Vec<PlannedPatch>,
}

impl PatchPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TableEntry, value: PatchValue) {
        self.patches.push(PlannedPatch { entry, value });
    }

    pub fn patches(&self) -> &[PlannedPatch] {
        &self.patches
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Init sites and live managers for every memory budget.
    pub fn memory_budgets(
        mut self,
        preset: MemoryPreset,
        overrides_mb: &BTreeMap<MemoryBudget, u32>,
    ) -> Self {
        for (budget, bytes) in super::presets::memory_budget_values(preset, overrides_mb) {
            self.push(budget.init_site(), PatchValue::Dword(bytes));
            for manager in budget.managers() {
                self.push(*manager, PatchValue::Dword(bytes));
            }
        }
        self
    }

    pub fn object_budgets(mut self, preset: ObjectPreset) -> Self {
        for budget in ObjectBudget::iter() {
            self.push(budget.entry(), PatchValue::Dword(budget.value(preset)));
        }
        self
    }

    pub fn performance(mut self, values: &PerformanceValues) -> Self {
        self.push(performance::FRAME_TIME, PatchValue::Float(values.frame_time_ms));
        self.push(
            performance::TEXTURE_MEMORY,
            PatchValue::Float(values.texture_memory_mb),
        );
        self.push(
            performance::GEOMETRY_MEMORY,
            PatchValue::Float(values.geometry_memory_mb),
        );
        self.push(
            performance::PARTICLE_SYSTEMS,
            PatchValue::Float(values.particle_systems),
        );
        if values.disable_culling {
            self = self.culling_stubs();
        }
        self
    }

    pub fn culling_stubs(self) -> Self {
        self.stubs(&CULLING_STUBS)
    }

    pub fn budget_handler_stubs(self) -> Self {
        self.stubs(&BUDGET_HANDLERS)
    }

    fn stubs(mut self, entries: &[TableEntry]) -> Self {
        for entry in entries {
            if !self.patches.iter().any(|p| p.entry.offset == entry.offset) {
                self.push(*entry, PatchValue::Stub);
            }
        }
        self
    }
}
