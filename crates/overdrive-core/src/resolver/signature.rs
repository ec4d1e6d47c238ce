use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::constants::DEFAULT_WINDOW;
use crate::error::{Error, Result};

/// Byte-pattern fingerprint for a target.
///
/// `target_offset` is the distance from the first pattern byte to the byte the
/// caller actually wants, e.g. 1 for the immediate of a `push imm32`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub pattern: String,
    #[serde(default)]
    pub target_offset: usize,
    /// Section to search when the window around the nominal offset misses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Exported symbol to search near when the window misses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_hint: Option<String>,
    /// Half-width of the window scanned around the nominal offset
    #[serde(default = "default_window")]
    pub window: usize,
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

impl Signature {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            target_offset: 0,
            section: None,
            export_hint: None,
            window: DEFAULT_WINDOW,
        }
    }

    /// `push imm32` with the given immediate; the target is the immediate.
    pub fn push_imm32(value: u32) -> Self {
        let mut bytes = vec![Some(0x68)];
        bytes.extend(value.to_le_bytes().into_iter().map(Some));
        Self::new(format_pattern(&bytes))
            .with_target_offset(1)
            .with_section(".text")
    }

    /// The little-endian encoding of an `f32` literal.
    pub fn f32_literal(value: f32) -> Self {
        let bytes: Vec<Option<u8>> = value.to_le_bytes().into_iter().map(Some).collect();
        Self::new(format_pattern(&bytes))
    }

    pub fn with_target_offset(mut self, target_offset: usize) -> Self {
        self.target_offset = target_offset;
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_export_hint(mut self, export: impl Into<String>) -> Self {
        self.export_hint = Some(export.into());
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn pattern_bytes(&self) -> Result<Vec<Option<u8>>> {
        let bytes = parse_pattern(&self.pattern)?;
        if bytes.iter().all(Option::is_none) {
            return Err(Error::InvalidSignature(format!(
                "Pattern '{}' has no concrete bytes",
                self.pattern
            )));
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub name: String,
    /// Nominal module-relative offset of the target
    pub offset: u32,
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureSet {
    pub version: String,
    pub entries: Vec<SignatureEntry>,
}

impl SignatureSet {
    pub fn entry(&self, name: &str) -> Option<&SignatureEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    /// First signature registered for a nominal offset.
    pub fn for_offset(&self, offset: u32) -> Option<&Signature> {
        self.entries
            .iter()
            .find(|entry| entry.offset == offset)
            .and_then(|entry| entry.signatures.first())
    }
}

pub fn load_signatures<P: AsRef<Path>>(path: P) -> Result<SignatureSet> {
    let content = fs::read_to_string(&path)?;
    let data = serde_json::from_str(&content)?;
    Ok(data)
}

pub fn save_signatures<P: AsRef<Path>>(path: P, signatures: &SignatureSet) -> Result<()> {
    let content = serde_json::to_string_pretty(signatures)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(None);
            continue;
        }

        let value = u8::from_str_radix(token, 16).map_err(|e| {
            Error::InvalidSignature(format!("Invalid signature token '{}': {}", token, e))
        })?;
        bytes.push(Some(value));
    }

    if bytes.is_empty() {
        return Err(Error::InvalidSignature("Signature pattern is empty".to_string()));
    }

    Ok(bytes)
}

pub fn format_pattern(bytes: &[Option<u8>]) -> String {
    bytes
        .iter()
        .map(|b| match b {
            Some(value) => format!("{:02X}", value),
            None => "??".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
