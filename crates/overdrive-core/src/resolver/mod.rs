//! Address resolution for targets inside the host image
//!
//! A target is known by its nominal module-relative offset for one host build,
//! optionally backed by a byte signature. Resolution tries, in order:
//!
//! 1. the nominal offset (accepted only if the signature matches there),
//! 2. a window scan around the nominal offset,
//! 3. a scan around the signature's export hint,
//! 4. a scan of the signature's section (or `.text`, `.rdata`, `.data`).
//!
//! Results are cached per nominal offset for the lifetime of the resolver.

mod constants;
mod scan;
mod signature;
mod validate;

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image::PeImage;
use crate::memory::ReadMemory;

pub use constants::{DEFAULT_WINDOW, EXPORT_WINDOW, FALLBACK_SECTIONS};
pub use scan::{find_matches, matches_at, scan_nearest, scan_range};
pub use signature::{
    Signature, SignatureEntry, SignatureSet, format_pattern, load_signatures, parse_pattern,
    save_signatures,
};
pub use validate::{ValidationPolicy, ValueKind, read_value, validate_value, value_within};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    DirectOffset,
    PatternScan,
    ModuleExport,
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionMethod::DirectOffset => "direct",
            ResolutionMethod::PatternScan => "pattern",
            ResolutionMethod::ModuleExport => "export",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedAddress {
    pub nominal_offset: u32,
    pub absolute_address: usize,
    pub method: ResolutionMethod,
    /// True when a signature confirmed the location
    pub validated: bool,
}

pub struct AddressResolver<'a, M: ReadMemory + ?Sized> {
    image: PeImage<'a, M>,
    policy: ValidationPolicy,
    cache: Mutex<HashMap<u32, ResolvedAddress>>,
}

impl<'a, M: ReadMemory + ?Sized> AddressResolver<'a, M> {
    pub fn new(memory: &'a M, policy: ValidationPolicy) -> Result<Self> {
        Ok(Self {
            image: PeImage::parse(memory)?,
            policy,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn image(&self) -> &PeImage<'a, M> {
        &self.image
    }

    pub fn memory(&self) -> &'a M {
        self.image.memory()
    }

    pub fn policy(&self) -> ValidationPolicy {
        self.policy
    }

    pub fn cached(&self, nominal_offset: u32) -> Option<ResolvedAddress> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(&nominal_offset).copied())
    }

    /// Resolve a nominal offset to an absolute address.
    ///
    /// Never touches memory outside the image; a moved or patched image yields
    /// `UnresolvedAddress` rather than a bad address.
    pub fn resolve(
        &self,
        nominal_offset: u32,
        signature: Option<&Signature>,
    ) -> Result<ResolvedAddress> {
        if let Some(hit) = self.cached(nominal_offset) {
            return Ok(hit);
        }

        let resolved = match signature {
            None => self.resolve_direct(nominal_offset)?,
            Some(signature) => self.resolve_with_signature(nominal_offset, signature)?,
        };

        info!(
            "Resolved {:#010x} -> {:#x} ({}{})",
            nominal_offset,
            resolved.absolute_address,
            resolved.method,
            if resolved.validated { ", verified" } else { "" }
        );
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(nominal_offset, resolved);
        }
        Ok(resolved)
    }

    fn unresolved(nominal_offset: u32, reason: impl Into<String>) -> Error {
        Error::UnresolvedAddress {
            offset: nominal_offset,
            reason: reason.into(),
        }
    }

    fn resolve_direct(&self, nominal_offset: u32) -> Result<ResolvedAddress> {
        let address = self.image.rva_to_address(nominal_offset);
        if !self.memory().contains(address, constants::DIRECT_PROBE_LEN) {
            return Err(Self::unresolved(nominal_offset, "offset lies outside the image"));
        }
        Ok(ResolvedAddress {
            nominal_offset,
            absolute_address: address,
            method: ResolutionMethod::DirectOffset,
            validated: false,
        })
    }

    fn resolve_with_signature(
        &self,
        nominal_offset: u32,
        signature: &Signature,
    ) -> Result<ResolvedAddress> {
        let pattern = signature
            .pattern_bytes()
            .map_err(|e| Self::unresolved(nominal_offset, e.to_string()))?;
        let memory = self.memory();
        let nominal = self.image.rva_to_address(nominal_offset);
        let found = |match_address: usize, method| ResolvedAddress {
            nominal_offset,
            absolute_address: match_address + signature.target_offset,
            method,
            validated: true,
        };

        // 1. nominal location, confirmed by the signature
        if let Some(match_start) = nominal.checked_sub(signature.target_offset)
            && memory.contains(match_start, pattern.len())
            && matches_at(&memory.read_bytes(match_start, pattern.len())?, &pattern)
        {
            return Ok(found(match_start, ResolutionMethod::DirectOffset));
        }

        // 2. window around the nominal location
        let center = nominal.saturating_sub(signature.target_offset);
        if let Some(address) = scan_nearest(memory, center, signature.window, &pattern)? {
            debug!(
                "{:#010x}: signature moved by {:+} bytes",
                nominal_offset,
                address as i64 - center as i64
            );
            return Ok(found(address, ResolutionMethod::PatternScan));
        }

        // 3. near an exported symbol
        if let Some(export) = &signature.export_hint {
            if let Some(address) = self.scan_near_export(export, &pattern)? {
                return Ok(found(address, ResolutionMethod::ModuleExport));
            }
        }

        // 4. whole sections
        if let Some(address) = self.scan_sections(signature.section.as_deref(), &pattern)? {
            return Ok(found(address, ResolutionMethod::PatternScan));
        }

        match self.policy {
            ValidationPolicy::Strict => Err(Self::unresolved(
                nominal_offset,
                format!("signature '{}' not found", signature.pattern),
            )),
            ValidationPolicy::Permissive => {
                warn!(
                    "Signature '{}' not found for {:#010x}; using unverified nominal offset",
                    signature.pattern, nominal_offset
                );
                self.resolve_direct(nominal_offset)
            }
        }
    }

    fn scan_near_export(&self, export: &str, pattern: &[Option<u8>]) -> Result<Option<usize>> {
        let Some(anchor) = self.image.export_address(export)? else {
            debug!("Export hint {} not present", export);
            return Ok(None);
        };

        let mut start = anchor.saturating_sub(EXPORT_WINDOW);
        let mut end = anchor.saturating_add(EXPORT_WINDOW);
        if let Some(code) = self.image.code_section() {
            let code_start = self.image.rva_to_address(code.virtual_address);
            let code_end = code_start + code.len() as usize;
            start = start.max(code_start);
            end = end.min(code_end);
        }
        if start >= end {
            return Ok(None);
        }
        scan_range(self.memory(), start, end - start, pattern)
    }

    fn scan_sections(&self, hint: Option<&str>, pattern: &[Option<u8>]) -> Result<Option<usize>> {
        let names: Vec<&str> = match hint {
            Some(name) => vec![name],
            None => FALLBACK_SECTIONS.to_vec(),
        };

        for name in names {
            let Some(section) = self
                .image
                .sections()
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(name))
            else {
                continue;
            };
            let start = self.image.rva_to_address(section.virtual_address);
            if let Some(address) = scan_range(self.memory(), start, section.len() as usize, pattern)? {
                return Ok(Some(address));
            }
        }
        Ok(None)
    }

    /// Check the value at `address` against an expected default.
    ///
    /// Logs a warning on mismatch; callers decide whether to proceed based on
    /// the validation policy.
    pub fn validate_value(
        &self,
        address: usize,
        kind: ValueKind,
        expected: f64,
        tolerance: f64,
    ) -> bool {
        match read_value(self.memory(), address, kind) {
            Ok(actual) if value_within(actual, expected, tolerance) => true,
            Ok(actual) => {
                warn!(
                    "Value at {:#x} is {} (expected {} ±{:.0}%)",
                    address,
                    actual,
                    expected,
                    tolerance * 100.0
                );
                false
            }
            Err(e) => {
                warn!("Cannot validate {:#x}: {}", address, e);
                false
            }
        }
    }
}
