//! In-place patches to values and functions inside the host image.
//!
//! Every target is resolved through the [`AddressResolver`], soft-validated
//! against the value the host ships with, and its original bytes are captured
//! before the first write so it can be restored later.

mod plan;
pub mod presets;
pub mod table;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::memory::WriteMemory;
use crate::resolver::{AddressResolver, Signature, SignatureSet};
use crate::stats::StatsTracker;

pub use plan::{PatchPlan, PatchValue, PlannedPatch};
pub use presets::{
    MemoryBudget, MemoryPreset, ObjectBudget, ObjectPreset, PerformancePreset, PerformanceValues,
};
pub use table::{PatchKind, STUB_BYTES, STUB_LEN, TableEntry};

/// Relative tolerance used by the ad-hoc `patch_*` calls.
pub const DEFAULT_TOLERANCE: f64 = 0.10;

/// A patched (or at least captured) location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchTarget {
    pub name: String,
    pub nominal_offset: u32,
    pub address: usize,
    pub kind: PatchKind,
    pub original_bytes: Vec<u8>,
    pub expected_default: Option<f64>,
    pub tolerance: f64,
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    pub applied: usize,
    pub failed: usize,
    /// Targets not attempted because an earlier attempt could not resolve them
    pub skipped: usize,
}

impl PatchReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Applied => self.applied += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

impl fmt::Display for PatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "applied {} patches ({} failed, {} skipped)",
            self.applied, self.failed, self.skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Applied,
    Failed,
    Skipped,
}

struct ValueWrite<'l> {
    offset: u32,
    label: &'l str,
    kind: PatchKind,
    bytes: [u8; 4],
    shown: String,
    expected: Option<f64>,
    tolerance: f64,
    signature: Option<Signature>,
}

pub struct ImagePatcher<'a, M: WriteMemory + ?Sized> {
    resolver: AddressResolver<'a, M>,
    targets: BTreeMap<u32, PatchTarget>,
    unresolved: HashSet<u32>,
    signatures: Option<SignatureSet>,
    stats: Option<Arc<StatsTracker>>,
}

impl<'a, M: WriteMemory + ?Sized> ImagePatcher<'a, M> {
    pub fn new(resolver: AddressResolver<'a, M>) -> Self {
        Self {
            resolver,
            targets: BTreeMap::new(),
            unresolved: HashSet::new(),
            signatures: None,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<StatsTracker>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Signatures that take precedence over the built-in ones, by offset.
    pub fn with_signatures(mut self, signatures: SignatureSet) -> Self {
        self.signatures = Some(signatures);
        self
    }

    pub fn resolver(&self) -> &AddressResolver<'a, M> {
        &self.resolver
    }

    pub fn targets(&self) -> impl Iterator<Item = &PatchTarget> {
        self.targets.values()
    }

    pub fn target(&self, nominal_offset: u32) -> Option<&PatchTarget> {
        self.targets.get(&nominal_offset)
    }

    pub fn applied_count(&self) -> usize {
        self.targets.values().filter(|t| t.applied).count()
    }

    /// Write `new_value` clamped into `[min, max]` as an `f32`.
    pub fn patch_float(
        &mut self,
        nominal_offset: u32,
        new_value: f32,
        min: f32,
        max: f32,
        expected_default: Option<f32>,
        label: &str,
    ) -> bool {
        let value = clamp_f32(new_value, min, max, label);
        let outcome = self.write_value(ValueWrite {
            offset: nominal_offset,
            label,
            kind: PatchKind::Float,
            bytes: value.to_le_bytes(),
            shown: format!("{value}"),
            expected: expected_default.map(f64::from),
            tolerance: DEFAULT_TOLERANCE,
            signature: None,
        });
        self.count(outcome)
    }

    /// Write `new_value` clamped into `[min, max]` as a `u32`.
    pub fn patch_u32(
        &mut self,
        nominal_offset: u32,
        new_value: u32,
        min: u32,
        max: u32,
        expected_default: Option<u32>,
        label: &str,
    ) -> bool {
        let value = new_value.max(min).min(max);
        if value != new_value {
            warn!("{}: {} clamped to {}", label, new_value, value);
        }
        let outcome = self.write_value(ValueWrite {
            offset: nominal_offset,
            label,
            kind: PatchKind::Dword,
            bytes: value.to_le_bytes(),
            shown: format!("{value}"),
            expected: expected_default.map(f64::from),
            tolerance: DEFAULT_TOLERANCE,
            signature: None,
        });
        self.count(outcome)
    }

    /// Replace the start of a function with `RET` and `NOP` padding.
    ///
    /// The original bytes are captured on the first call only; stubbing an
    /// already stubbed function is a no-op.
    pub fn patch_function_stub(&mut self, nominal_offset: u32) -> bool {
        let label = format!("function at {:#010x}", nominal_offset);
        let outcome = self.write_stub(nominal_offset, &label);
        self.count(outcome)
    }

    pub fn restore_function_stub(&mut self, nominal_offset: u32) -> bool {
        let is_stub = self
            .targets
            .get(&nominal_offset)
            .is_some_and(|t| t.kind == PatchKind::FunctionStub);
        is_stub && self.restore(nominal_offset)
    }

    pub fn restore_value(&mut self, nominal_offset: u32) -> bool {
        let is_value = self
            .targets
            .get(&nominal_offset)
            .is_some_and(|t| t.kind != PatchKind::FunctionStub);
        is_value && self.restore(nominal_offset)
    }

    /// Write back the original bytes of every applied patch.
    pub fn restore_all(&mut self) -> PatchReport {
        let applied: Vec<u32> = self
            .targets
            .values()
            .filter(|t| t.applied)
            .map(|t| t.nominal_offset)
            .collect();

        let mut report = PatchReport::default();
        for offset in applied {
            if self.restore(offset) {
                report.applied += 1;
            } else {
                report.failed += 1;
            }
        }
        info!("Restored {} patches ({} failed)", report.applied, report.failed);
        report
    }

    /// Apply one table entry, using its bounds, tolerance and signature.
    pub fn apply_entry(&mut self, entry: &TableEntry, value: PatchValue) -> bool {
        let outcome = self.apply_planned(entry, value);
        self.count(outcome)
    }

    pub fn apply_plan(&mut self, plan: &PatchPlan) -> PatchReport {
        let mut report = PatchReport::default();
        for planned in plan.patches() {
            let outcome = self.apply_planned(&planned.entry, planned.value);
            self.count(outcome);
            report.record(outcome);
        }
        info!("{}", report);
        report
    }

    /// Resolve every entry of the plan without writing anything.
    ///
    /// Returns how many entries resolved.
    pub fn resolve_plan(&mut self, plan: &PatchPlan) -> usize {
        plan.patches()
            .iter()
            .filter(|p| self.locate(p.entry.offset, p.entry.signature()).is_some())
            .count()
    }

    fn apply_planned(&mut self, entry: &TableEntry, value: PatchValue) -> Outcome {
        let (bytes, shown) = match (entry.kind, value) {
            (PatchKind::Float, PatchValue::Float(v)) => {
                let v = clamp_f32(v, entry.min as f32, entry.max as f32, entry.name);
                (v.to_le_bytes(), format!("{v}"))
            }
            (PatchKind::Dword, PatchValue::Dword(v)) => {
                let v = v.max(entry.min as u32).min(entry.max as u32);
                (v.to_le_bytes(), format!("{v}"))
            }
            (PatchKind::FunctionStub, PatchValue::Stub) => {
                return self.write_stub(entry.offset, entry.name);
            }
            (kind, value) => {
                warn!("{}: cannot write {:?} into a {} target", entry.name, value, kind);
                return Outcome::Failed;
            }
        };

        self.write_value(ValueWrite {
            offset: entry.offset,
            label: entry.name,
            kind: entry.kind,
            bytes,
            shown,
            expected: entry.expected,
            tolerance: entry.tolerance,
            signature: entry.signature(),
        })
    }

    fn count(&self, outcome: Outcome) -> bool {
        if let Some(stats) = &self.stats {
            match outcome {
                Outcome::Applied => stats.record_patches(1, 0),
                Outcome::Failed => stats.record_patches(0, 1),
                Outcome::Skipped => {}
            }
        }
        outcome == Outcome::Applied
    }

    /// Absolute address for an offset, or `None` once it has failed to resolve.
    fn locate(&mut self, nominal_offset: u32, signature: Option<Signature>) -> Option<usize> {
        if self.unresolved.contains(&nominal_offset) {
            return None;
        }
        let signature = self
            .signatures
            .as_ref()
            .and_then(|set| set.for_offset(nominal_offset))
            .cloned()
            .or(signature);

        match self.resolver.resolve(nominal_offset, signature.as_ref()) {
            Ok(resolved) => Some(resolved.absolute_address),
            Err(e) => {
                warn!("Skipping target {:#010x}: {}", nominal_offset, e);
                self.unresolved.insert(nominal_offset);
                None
            }
        }
    }

    fn locate_for_write(
        &mut self,
        nominal_offset: u32,
        signature: Option<Signature>,
    ) -> std::result::Result<usize, Outcome> {
        if self.unresolved.contains(&nominal_offset) {
            debug!("Not retrying unresolved target {:#010x}", nominal_offset);
            return Err(Outcome::Skipped);
        }
        self.locate(nominal_offset, signature).ok_or(Outcome::Failed)
    }

    fn capture(
        &mut self,
        nominal_offset: u32,
        address: usize,
        label: &str,
        kind: PatchKind,
        expected: Option<f64>,
        tolerance: f64,
    ) -> Result<()> {
        if self.targets.contains_key(&nominal_offset) {
            return Ok(());
        }
        let original_bytes = self.resolver.memory().read_bytes(address, kind.byte_len())?;
        self.targets.insert(
            nominal_offset,
            PatchTarget {
                name: label.to_string(),
                nominal_offset,
                address,
                kind,
                original_bytes,
                expected_default: expected,
                tolerance,
                applied: false,
            },
        );
        Ok(())
    }

    fn write_value(&mut self, write: ValueWrite<'_>) -> Outcome {
        let address = match self.locate_for_write(write.offset, write.signature.clone()) {
            Ok(address) => address,
            Err(outcome) => return outcome,
        };

        // Only the host's own value is checked; after our first write the
        // location holds our value.
        let already_applied = self.targets.get(&write.offset).is_some_and(|t| t.applied);
        if !already_applied
            && let (Some(expected), Some(value_kind)) = (write.expected, write.kind.value_kind())
            && !self
                .resolver
                .validate_value(address, value_kind, expected, write.tolerance)
        {
            if self.resolver.policy().is_strict() {
                warn!("{}: unexpected value at {:#x}, not patching", write.label, address);
                return Outcome::Failed;
            }
            warn!("{}: unexpected value at {:#x}, patching anyway", write.label, address);
        }

        if let Err(e) = self.capture(
            write.offset,
            address,
            write.label,
            write.kind,
            write.expected,
            write.tolerance,
        ) {
            warn!("{}: cannot read original bytes: {}", write.label, e);
            return Outcome::Failed;
        }

        match self.resolver.memory().write_bytes(address, &write.bytes) {
            Ok(()) => {
                if let Some(target) = self.targets.get_mut(&write.offset) {
                    target.applied = true;
                }
                info!("Patched {} at {:#x} = {}", write.label, address, write.shown);
                Outcome::Applied
            }
            Err(e) => {
                warn!("Failed to patch {} at {:#x}: {}", write.label, address, e);
                Outcome::Failed
            }
        }
    }

    fn write_stub(&mut self, nominal_offset: u32, label: &str) -> Outcome {
        let address = match self.locate_for_write(nominal_offset, None) {
            Ok(address) => address,
            Err(outcome) => return outcome,
        };
        if self.targets.get(&nominal_offset).is_some_and(|t| t.applied) {
            debug!("{} already stubbed", label);
            return Outcome::Applied;
        }

        if let Err(e) = self.capture(
            nominal_offset,
            address,
            label,
            PatchKind::FunctionStub,
            None,
            0.0,
        ) {
            warn!("{}: cannot read original bytes: {}", label, e);
            return Outcome::Failed;
        }

        match self.resolver.memory().write_bytes(address, &STUB_BYTES) {
            Ok(()) => {
                if let Some(target) = self.targets.get_mut(&nominal_offset) {
                    target.applied = true;
                }
                info!("Stubbed {} at {:#x}", label, address);
                Outcome::Applied
            }
            Err(e) => {
                warn!("Failed to stub {} at {:#x}: {}", label, address, e);
                Outcome::Failed
            }
        }
    }

    fn restore(&mut self, nominal_offset: u32) -> bool {
        let Some(target) = self.targets.get_mut(&nominal_offset) else {
            return false;
        };
        if !target.applied {
            return false;
        }
        match self
            .resolver
            .memory()
            .write_bytes(target.address, &target.original_bytes)
        {
            Ok(()) => {
                target.applied = false;
                debug!("Restored {} at {:#x}", target.name, target.address);
                true
            }
            Err(e) => {
                warn!("Failed to restore {} at {:#x}: {}", target.name, target.address, e);
                false
            }
        }
    }
}

fn clamp_f32(value: f32, min: f32, max: f32, label: &str) -> f32 {
    let clamped = value.max(min).min(max);
    if clamped != value {
        warn!("{}: {} clamped to {}", label, value, clamped);
    }
    clamped
}
