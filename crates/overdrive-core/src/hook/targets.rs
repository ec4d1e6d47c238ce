use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use super::shims;
use crate::image::ImportSymbol;

/// Runtime libraries whose heap entry points are redirected.
pub const RUNTIME_MODULES: [&str; 5] = [
    "msvcrt.dll",
    "ucrtbase.dll",
    "msvcr120.dll",
    "msvcr110.dll",
    "msvcr100.dll",
];

/// Modules whose imports are never touched.
pub const SYSTEM_MODULE_DENYLIST: [&str; 5] = [
    "kernel32.dll",
    "kernelbase.dll",
    "ntdll.dll",
    "user32.dll",
    "gdi32.dll",
];

pub fn is_denied(module: &str) -> bool {
    SYSTEM_MODULE_DENYLIST
        .iter()
        .any(|denied| denied.eq_ignore_ascii_case(module))
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
pub enum MemoryFunction {
    #[strum(serialize = "malloc")]
    #[serde(rename = "malloc")]
    Malloc,
    #[strum(serialize = "free")]
    #[serde(rename = "free")]
    Free,
    #[strum(serialize = "calloc")]
    #[serde(rename = "calloc")]
    Calloc,
    #[strum(serialize = "realloc")]
    #[serde(rename = "realloc")]
    Realloc,
    #[strum(serialize = "_msize")]
    #[serde(rename = "_msize")]
    Msize,
}

impl MemoryFunction {
    pub fn symbol_name(self) -> &'static str {
        match self {
            MemoryFunction::Malloc => "malloc",
            MemoryFunction::Free => "free",
            MemoryFunction::Calloc => "calloc",
            MemoryFunction::Realloc => "realloc",
            MemoryFunction::Msize => "_msize",
        }
    }

    /// Address of the shim that replaces this function.
    pub fn shim_address(self) -> usize {
        match self {
            MemoryFunction::Malloc => shims::overdrive_malloc as usize,
            MemoryFunction::Free => shims::overdrive_free as usize,
            MemoryFunction::Calloc => shims::overdrive_calloc as usize,
            MemoryFunction::Realloc => shims::overdrive_realloc as usize,
            MemoryFunction::Msize => shims::overdrive_msize as usize,
        }
    }

    /// Whether `address` is one of the shims, i.e. the slot is already ours.
    pub fn is_shim(address: usize) -> bool {
        MemoryFunction::iter().any(|f| f.shim_address() == address)
    }
}

/// One (module, function) import to redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookTarget {
    pub module: String,
    pub symbol: ImportSymbol,
    pub replacement: usize,
}

impl HookTarget {
    pub fn new(module: impl Into<String>, function: impl Into<String>, replacement: usize) -> Self {
        Self {
            module: module.into(),
            symbol: ImportSymbol::Name(function.into()),
            replacement,
        }
    }

    pub fn by_ordinal(module: impl Into<String>, ordinal: u16, replacement: usize) -> Self {
        Self {
            module: module.into(),
            symbol: ImportSymbol::Ordinal(ordinal),
            replacement,
        }
    }

    pub fn label(&self) -> String {
        format!("{}!{}", self.module, self.symbol)
    }
}

/// Every allowed memory function across every listed runtime module, each
/// pointing at its shim.
///
/// An empty allowlist allows all functions; an empty module list means
/// [`RUNTIME_MODULES`].
pub fn default_targets(allowlist: &[MemoryFunction], modules: &[String]) -> Vec<HookTarget> {
    let modules: Vec<String> = if modules.is_empty() {
        RUNTIME_MODULES.iter().map(|m| m.to_string()).collect()
    } else {
        modules.to_vec()
    };

    let mut targets = Vec::new();
    for module in &modules {
        for function in MemoryFunction::iter() {
            if !allowlist.is_empty() && !allowlist.contains(&function) {
                continue;
            }
            targets.push(HookTarget::new(
                module.clone(),
                function.symbol_name(),
                function.shim_address(),
            ));
        }
    }
    targets
}
