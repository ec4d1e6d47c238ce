//! Header, section, import and export parsing for a mapped PE image.
//!
//! All reads go through [`ReadMemory`], so a truncated or corrupt image yields
//! an error instead of a wild read.

use std::fmt;

use tracing::debug;

use super::layout::{dos, export, import, nt, optional, section};
use crate::error::{Error, Result};
use crate::memory::ReadMemory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_offset: u32,
    pub raw_size: u32,
    pub characteristics: u32,
}

impl Section {
    /// Mapped length: the virtual size, or the raw size for linkers that leave it 0.
    pub fn len(&self) -> u32 {
        if self.virtual_size == 0 {
            self.raw_size
        } else {
            self.virtual_size
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.len()
    }

    pub fn is_code(&self) -> bool {
        self.characteristics & (section::CNT_CODE | section::MEM_EXECUTE) != 0
    }
}

/// How an import is identified in the lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImportSymbol {
    Name(String),
    Ordinal(u16),
}

impl ImportSymbol {
    pub fn name(name: impl Into<String>) -> Self {
        ImportSymbol::Name(name.into())
    }
}

impl fmt::Display for ImportSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportSymbol::Name(name) => write!(f, "{}", name),
            ImportSymbol::Ordinal(ordinal) => write!(f, "#{}", ordinal),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub symbol: ImportSymbol,
    /// Absolute address of the IAT slot
    pub slot_address: usize,
    /// Pointer currently stored in the slot
    pub current_target: usize,
}

impl ImportEntry {
    pub fn matches(&self, wanted: &ImportSymbol) -> bool {
        match (&self.symbol, wanted) {
            (ImportSymbol::Name(a), ImportSymbol::Name(b)) => a == b,
            (ImportSymbol::Ordinal(a), ImportSymbol::Ordinal(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedModule {
    pub name: String,
    pub entries: Vec<ImportEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
struct DataDirectory {
    rva: u32,
    size: u32,
}

/// A parsed view of a PE image mapped at `memory.base_address()`.
pub struct PeImage<'a, M: ReadMemory + ?Sized> {
    memory: &'a M,
    base: usize,
    pointer_width: usize,
    preferred_base: u64,
    size_of_image: u32,
    size_of_headers: u32,
    sections: Vec<Section>,
    imports: DataDirectory,
    exports: DataDirectory,
}

impl<'a, M: ReadMemory + ?Sized> PeImage<'a, M> {
    pub fn parse(memory: &'a M) -> Result<Self> {
        let base = memory.base_address();

        if memory.read_u16(base)? != dos::MAGIC {
            return Err(Error::InvalidImage("Missing MZ signature".to_string()));
        }
        let e_lfanew = memory.read_u32(base + dos::E_LFANEW)? as usize;
        if e_lfanew == 0 || e_lfanew >= dos::MAX_E_LFANEW {
            return Err(Error::InvalidImage(format!(
                "Implausible e_lfanew {:#x}",
                e_lfanew
            )));
        }

        let nt_headers = base + e_lfanew;
        if memory.read_u32(nt_headers)? != nt::SIGNATURE {
            return Err(Error::InvalidImage("Missing PE signature".to_string()));
        }
        let section_count = memory.read_u16(nt_headers + nt::NUMBER_OF_SECTIONS)? as usize;
        let optional_size = memory.read_u16(nt_headers + nt::SIZE_OF_OPTIONAL_HEADER)? as usize;

        let opt = nt_headers + nt::OPTIONAL_HEADER;
        let (pointer_width, preferred_base, data_directory) =
            match memory.read_u16(opt + optional::MAGIC)? {
                optional::PE32_MAGIC => (
                    4,
                    memory.read_u32(opt + optional::IMAGE_BASE_PE32)? as u64,
                    opt + optional::DATA_DIRECTORY_PE32,
                ),
                optional::PE32_PLUS_MAGIC => (
                    8,
                    memory.read_u64(opt + optional::IMAGE_BASE_PE32_PLUS)?,
                    opt + optional::DATA_DIRECTORY_PE32_PLUS,
                ),
                other => {
                    return Err(Error::InvalidImage(format!(
                        "Unknown optional header magic {:#x}",
                        other
                    )));
                }
            };

        let size_of_image = memory.read_u32(opt + optional::SIZE_OF_IMAGE)?;
        let size_of_headers = memory.read_u32(opt + optional::SIZE_OF_HEADERS)?;
        let read_directory = |index: usize| -> Result<DataDirectory> {
            let entry = data_directory + index * optional::DATA_DIRECTORY_ENTRY;
            Ok(DataDirectory {
                rva: memory.read_u32(entry)?,
                size: memory.read_u32(entry + 4)?,
            })
        };
        let exports = read_directory(optional::DIRECTORY_EXPORT)?;
        let imports = read_directory(optional::DIRECTORY_IMPORT)?;

        let table = opt + optional_size;
        let mut sections = Vec::with_capacity(section_count);
        for i in 0..section_count {
            let header = table + i * section::SIZE;
            let raw_name = memory.read_bytes(header, section::NAME_LEN)?;
            let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(section::NAME_LEN);
            sections.push(Section {
                name: String::from_utf8_lossy(&raw_name[..name_len]).into_owned(),
                virtual_size: memory.read_u32(header + section::VIRTUAL_SIZE)?,
                virtual_address: memory.read_u32(header + section::VIRTUAL_ADDRESS)?,
                raw_size: memory.read_u32(header + section::SIZE_OF_RAW_DATA)?,
                raw_offset: memory.read_u32(header + section::POINTER_TO_RAW_DATA)?,
                characteristics: memory.read_u32(header + section::CHARACTERISTICS)?,
            });
        }

        debug!(
            "Parsed PE{} image at {:#x}: {} sections, SizeOfImage {:#x}",
            if pointer_width == 8 { "32+" } else { "32" },
            base,
            sections.len(),
            size_of_image
        );

        Ok(Self {
            memory,
            base,
            pointer_width,
            preferred_base,
            size_of_image,
            size_of_headers,
            sections,
            imports,
            exports,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn memory(&self) -> &'a M {
        self.memory
    }

    /// Thunk width in bytes: 4 for PE32, 8 for PE32+.
    pub fn pointer_width(&self) -> usize {
        self.pointer_width
    }

    pub fn is_pe32_plus(&self) -> bool {
        self.pointer_width == 8
    }

    /// ImageBase from the optional header (where the linker expected to load).
    pub fn preferred_base(&self) -> u64 {
        self.preferred_base
    }

    pub fn size_of_image(&self) -> u32 {
        self.size_of_image
    }

    pub fn size_of_headers(&self) -> u32 {
        self.size_of_headers
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_containing(&self, rva: u32) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// First executable section, usually `.text`.
    pub fn code_section(&self) -> Option<&Section> {
        self.section(".text")
            .or_else(|| self.sections.iter().find(|s| s.is_code()))
    }

    pub fn rva_to_address(&self, rva: u32) -> usize {
        self.base + rva as usize
    }

    pub fn address_to_rva(&self, address: usize) -> Option<u32> {
        address
            .checked_sub(self.base)
            .and_then(|rva| u32::try_from(rva).ok())
    }

    /// Walk the import directory.
    ///
    /// Entries whose lookup data cannot be read are skipped rather than failing
    /// the whole walk; a corrupt descriptor only hides its own module.
    pub fn imports(&self) -> Result<Vec<ImportedModule>> {
        let mut modules = Vec::new();
        if self.imports.rva == 0 {
            return Ok(modules);
        }

        let width = self.pointer_width;
        let ordinal_flag = if width == 8 {
            import::ORDINAL_FLAG_64
        } else {
            import::ORDINAL_FLAG_32
        };

        for index in 0..import::MAX_DESCRIPTORS {
            let descriptor =
                self.rva_to_address(self.imports.rva) + index * import::DESCRIPTOR_SIZE;
            let original_first_thunk =
                self.memory.read_u32(descriptor + import::ORIGINAL_FIRST_THUNK)?;
            let name_rva = self.memory.read_u32(descriptor + import::NAME)?;
            let first_thunk = self.memory.read_u32(descriptor + import::FIRST_THUNK)?;
            if original_first_thunk == 0 && first_thunk == 0 {
                break;
            }

            let name = match self
                .memory
                .read_c_string(self.rva_to_address(name_rva), import::MAX_NAME_LEN)
            {
                Ok(name) => name,
                Err(e) => {
                    debug!("Skipping import descriptor {}: {}", index, e);
                    continue;
                }
            };

            // Bound images may lack the lookup table; the IAT then doubles as one
            // until the loader overwrites it.
            let lookup_rva = if original_first_thunk != 0 {
                original_first_thunk
            } else {
                first_thunk
            };

            let mut entries = Vec::new();
            for slot in 0..import::MAX_THUNKS {
                let lookup = self.rva_to_address(lookup_rva) + slot * width;
                let slot_address = self.rva_to_address(first_thunk) + slot * width;
                let value = self.memory.read_pointer(lookup, width)? as u64;
                if value == 0 {
                    break;
                }

                let symbol = if value & ordinal_flag != 0 {
                    ImportSymbol::Ordinal((value & 0xFFFF) as u16)
                } else {
                    let by_name = self.rva_to_address((value & 0x7FFF_FFFF) as u32)
                        + import::BY_NAME_HINT_SIZE;
                    match self.memory.read_c_string(by_name, import::MAX_NAME_LEN) {
                        Ok(function) => ImportSymbol::Name(function),
                        Err(e) => {
                            debug!("Unreadable import name in {} slot {}: {}", name, slot, e);
                            continue;
                        }
                    }
                };

                entries.push(ImportEntry {
                    symbol,
                    slot_address,
                    current_target: self.memory.read_pointer(slot_address, width)?,
                });
            }

            modules.push(ImportedModule { name, entries });
        }

        Ok(modules)
    }

    /// Find `symbol` imported from `module` (case-insensitive module match).
    pub fn find_import(&self, module: &str, symbol: &ImportSymbol) -> Result<Option<ImportEntry>> {
        Ok(self
            .imports()?
            .into_iter()
            .filter(|m| m.name.eq_ignore_ascii_case(module))
            .flat_map(|m| m.entries)
            .find(|e| e.matches(symbol)))
    }

    /// Absolute address of an exported symbol, or `None` when the image does not
    /// export it. Forwarded exports resolve to `None`.
    pub fn export_address(&self, name: &str) -> Result<Option<usize>> {
        if self.exports.rva == 0 {
            return Ok(None);
        }
        let directory = self.rva_to_address(self.exports.rva);
        let function_count = self.memory.read_u32(directory + export::NUMBER_OF_FUNCTIONS)?;
        let name_count = self.memory.read_u32(directory + export::NUMBER_OF_NAMES)?;
        let functions = self.rva_to_address(self.memory.read_u32(directory + export::ADDRESS_OF_FUNCTIONS)?);
        let names = self.rva_to_address(self.memory.read_u32(directory + export::ADDRESS_OF_NAMES)?);
        let ordinals = self.rva_to_address(
            self.memory
                .read_u32(directory + export::ADDRESS_OF_NAME_ORDINALS)?,
        );

        for i in 0..name_count as usize {
            let name_rva = self.memory.read_u32(names + i * 4)?;
            let candidate = self
                .memory
                .read_c_string(self.rva_to_address(name_rva), import::MAX_NAME_LEN)?;
            if candidate != name {
                continue;
            }

            let ordinal = self.memory.read_u16(ordinals + i * 2)? as u32;
            if ordinal >= function_count {
                return Err(Error::InvalidImage(format!(
                    "Export {} has ordinal {} beyond {} functions",
                    name, ordinal, function_count
                )));
            }
            let function_rva = self.memory.read_u32(functions + ordinal as usize * 4)?;
            let forwarded = function_rva >= self.exports.rva
                && function_rva - self.exports.rva < self.exports.size;
            if forwarded {
                debug!("Export {} is forwarded, ignoring", name);
                return Ok(None);
            }
            return Ok(Some(self.rva_to_address(function_rva)));
        }

        Ok(None)
    }
}
