//! Import address table redirection
//!
//! Each hook swaps one IAT slot of the host image for a replacement pointer and
//! records what it replaced. Restoration writes the recorded originals back.

pub mod shims;
mod targets;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image::{ImportSymbol, ImportedModule, PeImage};
use crate::memory::WriteMemory;
use crate::pool::CrtFunctions;
use crate::stats::StatsTracker;

pub use targets::{
    HookTarget, MemoryFunction, RUNTIME_MODULES, SYSTEM_MODULE_DENYLIST, default_targets,
    is_denied,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRecord {
    pub module_name: String,
    pub function: ImportSymbol,
    pub original_target: usize,
    pub installed_target: usize,
    pub slot_address: usize,
}

/// Heap entry points one runtime module supplies through the import table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedHeap {
    pub module: String,
    pub malloc: usize,
    pub free: usize,
    pub realloc: usize,
    pub msize: Option<usize>,
}

impl ImportedHeap {
    /// # Safety
    ///
    /// The addresses must be the module's real entry points, which holds for
    /// an image whose imports are bound.
    pub unsafe fn functions(&self) -> Option<CrtFunctions> {
        // SAFETY: upheld by the caller.
        unsafe { CrtFunctions::from_addresses(self.malloc, self.free, self.realloc, self.msize) }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    pub requested: usize,
    pub installed: usize,
    /// Denylisted modules and pairs that were already hooked
    pub skipped: usize,
    pub missing: Vec<String>,
    pub failed: Vec<String>,
}

impl fmt::Display for InstallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "installed {}/{} hooks ({} missing, {} failed, {} skipped)",
            self.installed,
            self.requested,
            self.missing.len(),
            self.failed.len(),
            self.skipped
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    /// Slots that no longer held our replacement when restored
    pub contested: usize,
    pub failed: usize,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

pub struct ImportHookInstaller<'a, M: WriteMemory + ?Sized> {
    memory: &'a M,
    records: Vec<HookRecord>,
    stats: Option<Arc<StatsTracker>>,
}

impl<'a, M: WriteMemory + ?Sized> ImportHookInstaller<'a, M> {
    pub fn new(memory: &'a M) -> Self {
        Self {
            memory,
            records: Vec::new(),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<StatsTracker>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn records(&self) -> &[HookRecord] {
        &self.records
    }

    pub fn is_hooked(&self) -> bool {
        !self.records.is_empty()
    }

    fn is_recorded(&self, module: &str, symbol: &ImportSymbol) -> bool {
        self.records
            .iter()
            .any(|r| r.module_name.eq_ignore_ascii_case(module) && &r.function == symbol)
    }

    /// Redirect every target that the image actually imports.
    ///
    /// Fails only when the image itself cannot be parsed; per-target problems
    /// land in the report.
    pub fn install_all(&mut self, targets: &[HookTarget]) -> Result<InstallReport> {
        let image = PeImage::parse(self.memory)?;
        let width = image.pointer_width();
        let modules = image.imports()?;
        let mut report = InstallReport {
            requested: targets.len(),
            ..Default::default()
        };

        for target in targets {
            if is_denied(&target.module) {
                debug!("Not hooking system module import {}", target.label());
                report.skipped += 1;
                continue;
            }
            if self.is_recorded(&target.module, &target.symbol) {
                debug!("{} is already hooked", target.label());
                report.skipped += 1;
                continue;
            }

            let Some(entry) = find_entry(&modules, &target.module, &target.symbol) else {
                let err = Error::HookTargetNotFound {
                    module: target.module.clone(),
                    function: target.symbol.to_string(),
                };
                debug!("{}", err);
                report.missing.push(target.label());
                continue;
            };

            match self
                .memory
                .write_pointer(entry.slot_address, target.replacement, width)
            {
                Ok(()) => {
                    debug!(
                        "Hooked {} at slot {:#x}: {:#x} -> {:#x}",
                        target.label(),
                        entry.slot_address,
                        entry.current_target,
                        target.replacement
                    );
                    self.records.push(HookRecord {
                        module_name: target.module.clone(),
                        function: target.symbol.clone(),
                        original_target: entry.current_target,
                        installed_target: target.replacement,
                        slot_address: entry.slot_address,
                    });
                    report.installed += 1;
                }
                Err(e) => {
                    warn!("Failed to hook {}: {}", target.label(), e);
                    report.failed.push(target.label());
                }
            }
        }

        info!("{}", report);
        if let Some(stats) = &self.stats {
            stats.record_hooks(report.installed, report.failed.len());
        }
        Ok(report)
    }

    /// Put every recorded original back. Records that fail to restore are kept.
    pub fn restore_all(&mut self) -> RestoreReport {
        let width = match PeImage::parse(self.memory) {
            Ok(image) => image.pointer_width(),
            Err(e) => {
                warn!("Cannot restore hooks, image unreadable: {}", e);
                return RestoreReport {
                    failed: self.records.len(),
                    ..Default::default()
                };
            }
        };

        let mut report = RestoreReport::default();
        let mut remaining = Vec::new();
        for record in self.records.drain(..).rev() {
            let label = format!("{}!{}", record.module_name, record.function);
            match self.memory.read_pointer(record.slot_address, width) {
                Ok(current) if current != record.installed_target => {
                    warn!(
                        "Slot for {} at {:#x} holds {:#x}, not our {:#x}; restoring anyway",
                        label, record.slot_address, current, record.installed_target
                    );
                    report.contested += 1;
                }
                Ok(_) => {}
                Err(e) => debug!("Could not read slot for {}: {}", label, e),
            }

            match self
                .memory
                .write_pointer(record.slot_address, record.original_target, width)
            {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    warn!("Failed to restore {}: {}", label, e);
                    report.failed += 1;
                    remaining.push(record);
                }
            }
        }
        remaining.reverse();
        self.records = remaining;

        info!(
            "Restored {} hooks ({} contested, {} failed)",
            report.restored, report.contested, report.failed
        );
        if let Some(stats) = &self.stats {
            stats.record_hooks_restored(report.restored);
        }
        report
    }

    /// Original target of the first hooked import named `function`.
    pub fn original_for(&self, function: &str) -> Option<usize> {
        self.records
            .iter()
            .find(|r| matches!(&r.function, ImportSymbol::Name(name) if name == function))
            .map(|r| r.original_target)
    }

    /// The heap of the first targeted runtime module that imports `malloc`,
    /// `free` and `realloc`.
    ///
    /// All functions come from that one module, so blocks the host allocated
    /// before hooking go back to the heap that owns them. Hooked slots report
    /// their recorded original rather than the shim.
    pub fn imported_heap(&self, targets: &[HookTarget]) -> Result<Option<ImportedHeap>> {
        let image = PeImage::parse(self.memory)?;
        let modules = image.imports()?;

        let mut seen: Vec<&str> = Vec::new();
        for target in targets {
            let module = target.module.as_str();
            if is_denied(module) || seen.iter().any(|m| m.eq_ignore_ascii_case(module)) {
                continue;
            }
            seen.push(module);

            let original = |function: &str| -> Option<usize> {
                let symbol = ImportSymbol::Name(function.to_string());
                if let Some(record) = self
                    .records
                    .iter()
                    .find(|r| r.module_name.eq_ignore_ascii_case(module) && r.function == symbol)
                {
                    return Some(record.original_target);
                }
                find_entry(&modules, module, &symbol)
                    .map(|entry| entry.current_target)
                    .filter(|&address| address != 0 && !MemoryFunction::is_shim(address))
            };

            let (Some(malloc), Some(free), Some(realloc)) =
                (original("malloc"), original("free"), original("realloc"))
            else {
                continue;
            };
            let heap = ImportedHeap {
                module: module.to_string(),
                malloc,
                free,
                realloc,
                msize: original("_msize"),
            };
            debug!(
                "{} heap: malloc {:#x}, free {:#x}, realloc {:#x}",
                heap.module, heap.malloc, heap.free, heap.realloc
            );
            return Ok(Some(heap));
        }
        Ok(None)
    }
}

fn find_entry<'m>(
    modules: &'m [ImportedModule],
    module: &str,
    symbol: &ImportSymbol,
) -> Option<&'m crate::image::ImportEntry> {
    modules
        .iter()
        .filter(|m| m.name.eq_ignore_ascii_case(module))
        .flat_map(|m| m.entries.iter())
        .find(|e| e.matches(symbol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::synthetic::{SyntheticImage, SyntheticImageBuilder};
    use crate::memory::ReadMemory;

    const BASE: usize = 0x0040_0000;

    fn host_image(pe32_plus: bool) -> SyntheticImage {
        let builder = if pe32_plus {
            SyntheticImageBuilder::pe32_plus()
        } else {
            SyntheticImageBuilder::pe32()
        };
        builder
            .section(".text", 0x1000, 0x1000, true)
            .import("MSVCRT.dll", &["malloc", "free"])
            .import("ucrtbase.dll", &["calloc", "realloc"])
            .import("KERNEL32.dll", &["Sleep", "HeapAlloc"])
            .build()
    }

    fn eight_pairs() -> Vec<HookTarget> {
        vec![
            HookTarget::new("msvcrt.dll", "malloc", 0x6000_0000),
            HookTarget::new("msvcrt.dll", "free", 0x6000_0010),
            HookTarget::new("ucrtbase.dll", "calloc", 0x6000_0020),
            HookTarget::new("ucrtbase.dll", "realloc", 0x6000_0030),
            HookTarget::new("msvcrt.dll", "calloc", 0x6000_0040),
            HookTarget::new("msvcrt.dll", "_msize", 0x6000_0050),
            HookTarget::new("msvcr120.dll", "malloc", 0x6000_0060),
            HookTarget::new("ucrtbase.dll", "_msize", 0x6000_0070),
        ]
    }

    fn slot(image: &SyntheticImage, module: &str, function: &str) -> usize {
        BASE + image.slot_rva(module, function).unwrap() as usize
    }

    #[test]
    fn test_install_four_of_eight_then_restore_exactly_those() {
        let image = host_image(false);
        let memory = image.mock_builder().base(BASE).build();
        let mut installer = ImportHookInstaller::new(&memory);

        let report = installer.install_all(&eight_pairs()).unwrap();
        assert_eq!(report.requested, 8);
        assert_eq!(report.installed, 4);
        assert_eq!(report.missing.len(), 4);
        assert!(report.failed.is_empty());
        assert!(installer.is_hooked());

        assert_eq!(memory.read_u32(slot(&image, "MSVCRT.dll", "malloc")).unwrap(), 0x6000_0000);
        assert_eq!(memory.read_u32(slot(&image, "ucrtbase.dll", "realloc")).unwrap(), 0x6000_0030);
        let sleep = slot(&image, "KERNEL32.dll", "Sleep");
        let sleep_before = memory.read_u32(sleep).unwrap();

        let restore = installer.restore_all();
        assert_eq!(restore, RestoreReport { restored: 4, contested: 0, failed: 0 });
        assert!(!installer.is_hooked());
        assert_eq!(memory.write_count(), 8);

        for (module, function) in [
            ("MSVCRT.dll", "malloc"),
            ("MSVCRT.dll", "free"),
            ("ucrtbase.dll", "calloc"),
            ("ucrtbase.dll", "realloc"),
        ] {
            assert_eq!(
                memory.read_u32(slot(&image, module, function)).unwrap() as usize,
                image.original_target(module, function).unwrap()
            );
        }
        assert_eq!(memory.read_u32(sleep).unwrap(), sleep_before);
    }

    #[test]
    fn test_protection_failure_aborts_only_that_hook() {
        let image = host_image(false);
        let free_slot = slot(&image, "MSVCRT.dll", "free");
        let memory = image
            .mock_builder()
            .base(BASE)
            .read_only(free_slot..free_slot + 4)
            .build();
        let mut installer = ImportHookInstaller::new(&memory).with_stats(Arc::new(StatsTracker::new()));

        let report = installer.install_all(&eight_pairs()[..4]).unwrap();
        assert_eq!(report.installed, 3);
        assert_eq!(report.failed, vec!["msvcrt.dll!free".to_string()]);
        assert_eq!(installer.records().len(), 3);
    }

    #[test]
    fn test_contested_slot_is_still_restored() {
        let image = host_image(false);
        let memory = image.mock_builder().base(BASE).build();
        let mut installer = ImportHookInstaller::new(&memory);
        installer.install_all(&eight_pairs()[..2]).unwrap();

        let malloc_slot = slot(&image, "MSVCRT.dll", "malloc");
        memory.write_u32(malloc_slot, 0x7777_0000).unwrap();

        let report = installer.restore_all();
        assert_eq!(report.restored, 2);
        assert_eq!(report.contested, 1);
        assert_eq!(
            memory.read_u32(malloc_slot).unwrap() as usize,
            image.original_target("MSVCRT.dll", "malloc").unwrap()
        );
    }

    #[test]
    fn test_denylist_and_duplicate_install() {
        let image = host_image(false);
        let memory = image.mock_builder().base(BASE).build();
        let mut installer = ImportHookInstaller::new(&memory);

        let targets = vec![
            HookTarget::new("kernel32.dll", "HeapAlloc", 0x6000_0000),
            HookTarget::new("MSVCRT.DLL", "malloc", 0x6000_0010),
        ];
        let first = installer.install_all(&targets).unwrap();
        assert_eq!(first.installed, 1);
        assert_eq!(first.skipped, 1);

        let second = installer.install_all(&targets).unwrap();
        assert_eq!(second.installed, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(installer.records().len(), 1);
        assert_eq!(memory.write_count(), 1);
    }

    #[test]
    fn test_pe32_plus_slots_take_full_pointers() {
        let image = host_image(true);
        let region = image.region();
        let mut installer = ImportHookInstaller::new(&region);

        let shim = MemoryFunction::Malloc.shim_address();
        let report = installer
            .install_all(&[HookTarget::new("msvcrt.dll", "malloc", shim)])
            .unwrap();
        assert_eq!(report.installed, 1);

        let slot = region.base_address() + image.slot_rva("MSVCRT.dll", "malloc").unwrap() as usize;
        assert_eq!(region.read_u64(slot).unwrap() as usize, shim);
        assert_eq!(
            installer.original_for("malloc"),
            image.original_target("MSVCRT.dll", "malloc")
        );

        assert!(installer.restore_all().is_complete());
        assert_eq!(
            region.read_u64(slot).unwrap() as usize,
            image.original_target("MSVCRT.dll", "malloc").unwrap()
        );
    }

    #[test]
    fn test_imported_heap_never_mixes_modules() {
        // malloc/free from msvcrt, realloc from ucrtbase: no single heap
        let image = host_image(false);
        let memory = image.mock_builder().base(BASE).build();
        let installer = ImportHookInstaller::new(&memory);
        assert_eq!(installer.imported_heap(&eight_pairs()).unwrap(), None);
    }

    #[test]
    fn test_imported_heap_survives_hooking() {
        let image = SyntheticImageBuilder::pe32_plus()
            .section(".text", 0x1000, 0x1000, true)
            .import("KERNEL32.dll", &["HeapAlloc"])
            .import("msvcr100.dll", &["malloc", "free", "realloc", "_msize"])
            .build();
        let memory = image.mock_builder().base(BASE).build();
        let mut installer = ImportHookInstaller::new(&memory);
        let targets = default_targets(&[], &[]);

        let expected = ImportedHeap {
            module: "msvcr100.dll".to_string(),
            malloc: image.original_target("msvcr100.dll", "malloc").unwrap(),
            free: image.original_target("msvcr100.dll", "free").unwrap(),
            realloc: image.original_target("msvcr100.dll", "realloc").unwrap(),
            msize: image.original_target("msvcr100.dll", "_msize"),
        };
        assert_eq!(installer.imported_heap(&targets).unwrap(), Some(expected.clone()));

        // Once the slots point at the shims, the records still know the originals
        assert_eq!(installer.install_all(&targets).unwrap().installed, 4);
        assert_eq!(installer.imported_heap(&targets).unwrap(), Some(expected));
    }

    #[test]
    fn test_unparseable_image_is_an_error() {
        let memory = crate::memory::MockMemory::builder().with_data(vec![0; 64]).build();
        let mut installer = ImportHookInstaller::new(&memory);
        assert!(installer.install_all(&eight_pairs()).is_err());
    }
}
