//! In-memory PE images for tests.
//!
//! Images are laid out with `FileAlignment == SectionAlignment`, so the same
//! bytes are both a valid file and a valid mapped image.

use std::collections::HashMap;

use super::layout::{dos, nt, optional, section};
use crate::memory::{MemoryRegion, MockMemory, MockMemoryBuilder};

const ALIGN: u32 = 0x1000;
const HEADERS_SIZE: u32 = 0x1000;
const NT_OFFSET: usize = 0x80;
const FAKE_TARGET_BASE: usize = 0x7100_0000;

const CODE_CHARACTERISTICS: u32 = 0x6000_0020;
const DATA_CHARACTERISTICS: u32 = 0xC000_0040;

struct SectionSpec {
    name: String,
    rva: u32,
    size: u32,
    code: bool,
}

enum ImportSpec {
    Name(String),
    Ordinal(u16),
}

pub struct SyntheticImageBuilder {
    pe32_plus: bool,
    image_base: u64,
    sections: Vec<SectionSpec>,
    imports: Vec<(String, Vec<ImportSpec>)>,
    exports: Vec<(String, u32)>,
    patches: Vec<(u32, Vec<u8>)>,
    bound: HashMap<(String, String), usize>,
}

pub struct SyntheticImage {
    bytes: Vec<u8>,
    pe32_plus: bool,
    slots: HashMap<(String, String), (u32, usize)>,
}

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// Growable byte area addressed by RVA.
struct Blob {
    rva: u32,
    data: Vec<u8>,
}

impl Blob {
    fn alloc(&mut self, len: usize, align: usize) -> u32 {
        let start = self.data.len().div_ceil(align) * align;
        self.data.resize(start + len, 0);
        self.rva + start as u32
    }

    fn put(&mut self, rva: u32, bytes: &[u8]) {
        let start = (rva - self.rva) as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn put_str(&mut self, s: &str) -> u32 {
        let rva = self.alloc(s.len() + 1, 2);
        self.put(rva, s.as_bytes());
        rva
    }

    fn put_thunk(&mut self, rva: u32, value: u64, width: usize) {
        if width == 8 {
            self.put(rva, &value.to_le_bytes());
        } else {
            self.put(rva, &(value as u32).to_le_bytes());
        }
    }
}

impl SyntheticImageBuilder {
    pub fn pe32() -> Self {
        Self::new(false)
    }

    pub fn pe32_plus() -> Self {
        Self::new(true)
    }

    fn new(pe32_plus: bool) -> Self {
        Self {
            pe32_plus,
            image_base: if pe32_plus { 0x1_4000_0000 } else { 0x0040_0000 },
            sections: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            patches: Vec::new(),
            bound: HashMap::new(),
        }
    }

    pub fn section(mut self, name: &str, rva: u32, size: u32, code: bool) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            rva,
            size,
            code,
        });
        self
    }

    pub fn import(mut self, module: &str, functions: &[&str]) -> Self {
        let specs = functions
            .iter()
            .map(|f| ImportSpec::Name(f.to_string()));
        self.import_entry(module).extend(specs);
        self
    }

    /// Fill a by-name import slot with `target` instead of a fake address,
    /// the way the loader binds it.
    pub fn bind(mut self, module: &str, function: &str, target: usize) -> Self {
        self.bound
            .insert((module.to_string(), function.to_string()), target);
        self
    }

    pub fn import_ordinal(mut self, module: &str, ordinal: u16) -> Self {
        self.import_entry(module).push(ImportSpec::Ordinal(ordinal));
        self
    }

    fn import_entry(&mut self, module: &str) -> &mut Vec<ImportSpec> {
        let index = match self.imports.iter().position(|(m, _)| m == module) {
            Some(index) => index,
            None => {
                self.imports.push((module.to_string(), Vec::new()));
                self.imports.len() - 1
            }
        };
        &mut self.imports[index].1
    }

    pub fn export(mut self, name: &str, rva: u32) -> Self {
        self.exports.push((name.to_string(), rva));
        self
    }

    /// Place raw bytes at an RVA inside one of the declared sections.
    pub fn bytes_at(mut self, rva: u32, bytes: &[u8]) -> Self {
        self.patches.push((rva, bytes.to_vec()));
        self
    }

    pub fn f32_at(self, rva: u32, value: f32) -> Self {
        self.bytes_at(rva, &value.to_le_bytes())
    }

    pub fn u32_at(self, rva: u32, value: u32) -> Self {
        self.bytes_at(rva, &value.to_le_bytes())
    }

    pub fn build(self) -> SyntheticImage {
        let width = if self.pe32_plus { 8 } else { 4 };
        let sections_end = self
            .sections
            .iter()
            .map(|s| align_up(s.rva + s.size, ALIGN))
            .max()
            .unwrap_or(HEADERS_SIZE);

        let mut blob = Blob {
            rva: sections_end,
            data: Vec::new(),
        };
        let mut slots = HashMap::new();
        let mut import_dir = (0u32, 0u32);
        let mut export_dir = (0u32, 0u32);

        if !self.imports.is_empty() {
            let descriptors_size = (self.imports.len() + 1) * 20;
            let descriptors = blob.alloc(descriptors_size, 8);
            import_dir = (descriptors, descriptors_size as u32);
            let mut fake_target = FAKE_TARGET_BASE;

            for (index, (module, entries)) in self.imports.iter().enumerate() {
                let ilt = blob.alloc((entries.len() + 1) * width, width);
                let iat = blob.alloc((entries.len() + 1) * width, width);
                for (slot, entry) in entries.iter().enumerate() {
                    let mut target = fake_target;
                    let lookup = match entry {
                        ImportSpec::Name(function) => {
                            let hint_name = blob.alloc(2 + function.len() + 1, 2);
                            blob.put(hint_name + 2, function.as_bytes());
                            let key = (module.clone(), function.clone());
                            if let Some(&bound) = self.bound.get(&key) {
                                target = bound;
                            }
                            slots.insert(key, (iat + (slot * width) as u32, target));
                            hint_name as u64
                        }
                        ImportSpec::Ordinal(ordinal) => {
                            let flag = if width == 8 { 1u64 << 63 } else { 1u64 << 31 };
                            flag | *ordinal as u64
                        }
                    };
                    blob.put_thunk(ilt + (slot * width) as u32, lookup, width);
                    blob.put_thunk(iat + (slot * width) as u32, target as u64, width);
                    fake_target += 0x10;
                }

                let name = blob.put_str(module);
                let descriptor = descriptors + (index * 20) as u32;
                blob.put(descriptor, &ilt.to_le_bytes());
                blob.put(descriptor + 12, &name.to_le_bytes());
                blob.put(descriptor + 16, &iat.to_le_bytes());
            }
        }

        if !self.exports.is_empty() {
            let directory = blob.alloc(40, 4);
            let count = self.exports.len();
            let functions = blob.alloc(count * 4, 4);
            let names = blob.alloc(count * 4, 4);
            let ordinals = blob.alloc(count * 2, 2);
            for (i, (name, rva)) in self.exports.iter().enumerate() {
                blob.put(functions + (i * 4) as u32, &rva.to_le_bytes());
                let name_rva = blob.put_str(name);
                blob.put(names + (i * 4) as u32, &name_rva.to_le_bytes());
                blob.put(ordinals + (i * 2) as u32, &(i as u16).to_le_bytes());
            }
            let dll_name = blob.put_str("host.exe");
            blob.put(directory + 12, &dll_name.to_le_bytes());
            blob.put(directory + 16, &1u32.to_le_bytes());
            blob.put(directory + 20, &(count as u32).to_le_bytes());
            blob.put(directory + 24, &(count as u32).to_le_bytes());
            blob.put(directory + 28, &functions.to_le_bytes());
            blob.put(directory + 32, &names.to_le_bytes());
            blob.put(directory + 36, &ordinals.to_le_bytes());
            let end = blob.rva + blob.data.len() as u32;
            export_dir = (directory, end - directory);
        }

        let idata_size = align_up(blob.data.len().max(1) as u32, ALIGN);
        let has_idata = !blob.data.is_empty();
        let size_of_image = if has_idata {
            sections_end + idata_size
        } else {
            sections_end
        };

        let mut bytes = vec![0u8; size_of_image as usize];
        let mut put = |offset: usize, data: &[u8]| {
            bytes[offset..offset + data.len()].copy_from_slice(data);
        };

        put(0, &dos::MAGIC.to_le_bytes());
        put(dos::E_LFANEW, &(NT_OFFSET as u32).to_le_bytes());
        put(NT_OFFSET, &nt::SIGNATURE.to_le_bytes());
        let machine: u16 = if self.pe32_plus { 0x8664 } else { 0x014C };
        put(NT_OFFSET + 4, &machine.to_le_bytes());
        let section_count = self.sections.len() + usize::from(has_idata);
        put(NT_OFFSET + nt::NUMBER_OF_SECTIONS, &(section_count as u16).to_le_bytes());
        let optional_size: u16 = if self.pe32_plus { 0xF0 } else { 0xE0 };
        put(NT_OFFSET + nt::SIZE_OF_OPTIONAL_HEADER, &optional_size.to_le_bytes());

        let opt = NT_OFFSET + nt::OPTIONAL_HEADER;
        let (magic, directories, rva_count_at) = if self.pe32_plus {
            put(opt + optional::IMAGE_BASE_PE32_PLUS, &self.image_base.to_le_bytes());
            (optional::PE32_PLUS_MAGIC, optional::DATA_DIRECTORY_PE32_PLUS, 108)
        } else {
            put(opt + optional::IMAGE_BASE_PE32, &(self.image_base as u32).to_le_bytes());
            (optional::PE32_MAGIC, optional::DATA_DIRECTORY_PE32, 92)
        };
        put(opt + optional::MAGIC, &magic.to_le_bytes());
        put(opt + 32, &ALIGN.to_le_bytes());
        put(opt + 36, &ALIGN.to_le_bytes());
        put(opt + optional::SIZE_OF_IMAGE, &size_of_image.to_le_bytes());
        put(opt + optional::SIZE_OF_HEADERS, &HEADERS_SIZE.to_le_bytes());
        put(opt + rva_count_at, &16u32.to_le_bytes());

        let directory = |index: usize| opt + directories + index * optional::DATA_DIRECTORY_ENTRY;
        put(directory(optional::DIRECTORY_EXPORT), &export_dir.0.to_le_bytes());
        put(directory(optional::DIRECTORY_EXPORT) + 4, &export_dir.1.to_le_bytes());
        put(directory(optional::DIRECTORY_IMPORT), &import_dir.0.to_le_bytes());
        put(directory(optional::DIRECTORY_IMPORT) + 4, &import_dir.1.to_le_bytes());

        let mut headers: Vec<(String, u32, u32, u32)> = self
            .sections
            .iter()
            .map(|s| {
                let characteristics = if s.code {
                    CODE_CHARACTERISTICS
                } else {
                    DATA_CHARACTERISTICS
                };
                (s.name.clone(), s.rva, s.size, characteristics)
            })
            .collect();
        if has_idata {
            headers.push((".idata".to_string(), sections_end, idata_size, DATA_CHARACTERISTICS));
        }

        let table = opt + optional_size as usize;
        for (i, (name, rva, size, characteristics)) in headers.iter().enumerate() {
            let header = table + i * section::SIZE;
            let mut raw_name = [0u8; section::NAME_LEN];
            let len = name.len().min(section::NAME_LEN);
            raw_name[..len].copy_from_slice(&name.as_bytes()[..len]);
            put(header, &raw_name);
            put(header + section::VIRTUAL_SIZE, &size.to_le_bytes());
            put(header + section::VIRTUAL_ADDRESS, &rva.to_le_bytes());
            put(header + section::SIZE_OF_RAW_DATA, &size.to_le_bytes());
            put(header + section::POINTER_TO_RAW_DATA, &rva.to_le_bytes());
            put(header + section::CHARACTERISTICS, &characteristics.to_le_bytes());
        }

        if has_idata {
            put(sections_end as usize, &blob.data);
        }
        for (rva, data) in &self.patches {
            put(*rva as usize, data);
        }

        SyntheticImage {
            bytes,
            pe32_plus: self.pe32_plus,
            slots,
        }
    }
}

impl SyntheticImage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_pe32_plus(&self) -> bool {
        self.pe32_plus
    }

    /// Copy the image into a fresh heap region.
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::from_bytes(&self.bytes).unwrap()
    }

    /// A fault-injectable copy; add read-only ranges before building.
    pub fn mock_builder(&self) -> MockMemoryBuilder {
        MockMemory::builder().with_data(self.bytes.clone())
    }

    pub fn mock(&self) -> MockMemory {
        self.mock_builder().build()
    }

    /// RVA of the IAT slot for a by-name import.
    pub fn slot_rva(&self, module: &str, function: &str) -> Option<u32> {
        self.slots
            .get(&(module.to_string(), function.to_string()))
            .map(|&(rva, _)| rva)
    }

    /// Value the IAT slot held when the image was built.
    pub fn original_target(&self, module: &str, function: &str) -> Option<usize> {
        self.slots
            .get(&(module.to_string(), function.to_string()))
            .map(|&(_, target)| target)
    }
}
