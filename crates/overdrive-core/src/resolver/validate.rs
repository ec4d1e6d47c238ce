use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::Result;
use crate::memory::ReadMemory;

/// How the bytes at a target are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    F32,
    U32,
}

impl ValueKind {
    pub fn size(self) -> usize {
        4
    }
}

/// What to do when a target cannot be confirmed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ValidationPolicy {
    /// Warn and write anyway; use the nominal offset when a signature misses
    #[default]
    Permissive,
    /// Skip the write; an unmatched signature leaves the target unresolved
    Strict,
}

impl ValidationPolicy {
    pub fn is_strict(self) -> bool {
        self == ValidationPolicy::Strict
    }
}

pub fn read_value<M: ReadMemory + ?Sized>(memory: &M, address: usize, kind: ValueKind) -> Result<f64> {
    Ok(match kind {
        ValueKind::F32 => memory.read_f32(address)? as f64,
        ValueKind::U32 => memory.read_u32(address)? as f64,
    })
}

/// Whether `actual` lies within `tolerance` (a fraction of `expected`).
///
/// A zero tolerance requires an exact match. NaN never matches.
pub fn value_within(actual: f64, expected: f64, tolerance: f64) -> bool {
    if actual.is_nan() || expected.is_nan() {
        return false;
    }
    let tolerance = tolerance.max(0.0);
    (actual - expected).abs() <= expected.abs() * tolerance
}

pub fn validate_value<M: ReadMemory + ?Sized>(
    memory: &M,
    address: usize,
    kind: ValueKind,
    expected: f64,
    tolerance: f64,
) -> bool {
    read_value(memory, address, kind)
        .map(|actual| value_within(actual, expected, tolerance))
        .unwrap_or(false)
}
