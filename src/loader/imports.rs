//! Import-table slot patching.
//!
//! Every slot in the image's import address table gets rewritten exactly once, by the
//! first rule that claims it:
//!
//! 1. **Hook table** — functions the host must interpose regardless of module; by
//!    default the allocator triple (`malloc`/`realloc`/`free`), so all heap traffic the
//!    foreign code generates flows through the one allocator the host also uses.
//! 2. **Host runtime** — imports declared against the recognized C runtime module are
//!    resolved by name against the host's C library; hits are patched with the
//!    resolved address.
//! 3. **Markers** — everything else is patched with a distinguishable non-null poison
//!    pattern: [`UNRESOLVED_RUNTIME_MARKER`] for recognized-module misses,
//!    [`UNRESOLVED_FOREIGN_MARKER`] for imports from any other module. Faults through
//!    these slots are diagnosable as deliberate, not accidental null dereferences.
//!
//! Resolution failure is never fatal at load time: a real-world image carries many
//! transitive imports irrelevant to the entry points actually exercised, and an eager
//! failure would make loading nearly any such image impossible. A poisoned slot only
//! matters if the foreign code later calls through it.

use libloading::Library;
use log::{debug, warn};

use crate::{image::ImportRecord, loader::memory::ImageMemory, loader::LoadConfig, subset};

/// Pattern patched into slots of the recognized runtime module whose symbol the host
/// could not resolve.
pub const UNRESOLVED_RUNTIME_MARKER: u32 = 0xDDDD_DDDD;

/// Pattern patched into slots of any other module; never equal to
/// [`UNRESOLVED_RUNTIME_MARKER`].
pub const UNRESOLVED_FOREIGN_MARKER: u32 = 0xCCCC_CCCC;

/// Source of host symbol addresses.
///
/// The production implementation is [`CRuntime`]; tests substitute a table-backed
/// source so resolution results are deterministic and fit 32-bit slots on any host.
pub trait SymbolSource {
    /// Resolves `name` to an address in the host process, if the host has it.
    fn resolve(&mut self, name: &str) -> Option<usize>;
}

/// The host C runtime, dlopen'd lazily and cached for the life of the loader.
///
/// One instance owns one library handle; independent loaders (and tests) get
/// independent handles rather than sharing hidden process-wide state.
pub struct CRuntime {
    path: String,
    lib: Option<Library>,
    failed: bool,
}

impl CRuntime {
    /// Resolver over the default host C library, `libc.so.6`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_path("libc.so.6")
    }

    /// Resolver over a specific shared object.
    #[must_use]
    pub fn with_path(path: impl Into<String>) -> Self {
        CRuntime {
            path: path.into(),
            lib: None,
            failed: false,
        }
    }
}

impl Default for CRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolSource for CRuntime {
    fn resolve(&mut self, name: &str) -> Option<usize> {
        if self.failed {
            return None;
        }
        if self.lib.is_none() {
            match unsafe { Library::new(&self.path) } {
                Ok(lib) => {
                    debug!("opened host runtime {}", self.path);
                    self.lib = Some(lib);
                }
                Err(e) => {
                    warn!("unable to open host runtime {}: {}", self.path, e);
                    self.failed = true;
                    return None;
                }
            }
        }
        let lib = self.lib.as_ref()?;
        let sym = unsafe { lib.get::<*mut libc::c_void>(name.as_bytes()) }.ok()?;
        Some(*sym as usize)
    }
}

/// Closed table mapping import names to host-side interception functions.
///
/// Dispatch is by table lookup, not a comparison chain; extending the set of
/// interposed functions is a configuration change.
#[derive(Debug, Clone)]
pub struct HookTable {
    entries: Vec<(String, usize)>,
}

impl HookTable {
    /// The default table: the allocator triple routed to the host heap.
    #[must_use]
    pub fn host_allocator() -> Self {
        let mut table = Self::empty();
        table.insert("malloc", subset::cfp_alloc as usize);
        table.insert("realloc", subset::cfp_realloc as usize);
        table.insert("free", subset::cfp_free as usize);
        table
    }

    /// A table with no entries.
    #[must_use]
    pub fn empty() -> Self {
        HookTable {
            entries: Vec::new(),
        }
    }

    /// Adds or replaces a hook.
    pub fn insert(&mut self, name: &str, addr: usize) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = addr;
        } else {
            self.entries.push((name.to_string(), addr));
        }
    }

    /// Looks up a hook address by import name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, addr)| *addr)
    }

    /// Number of hooks in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table has no hooks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HookTable {
    fn default() -> Self {
        Self::host_allocator()
    }
}

/// Per-class counts of what import resolution did; recorded on the load result.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    /// Slots patched with an interception function.
    pub hooked: usize,
    /// Slots patched with a resolved host symbol.
    pub host_resolved: usize,
    /// Recognized-module slots patched with [`UNRESOLVED_RUNTIME_MARKER`].
    pub runtime_unresolved: usize,
    /// Other-module slots patched with [`UNRESOLVED_FOREIGN_MARKER`].
    pub foreign: usize,
    /// Slots that could not be patched at all (outside the mapped image).
    pub skipped: usize,
}

/// Rewrites every import slot per the resolution rules.
pub(crate) fn resolve_imports(
    records: &[ImportRecord],
    memory: &mut ImageMemory,
    config: &LoadConfig,
    symbols: &mut dyn SymbolSource,
) -> ImportSummary {
    let mut summary = ImportSummary::default();

    for record in records {
        let patch = 'patch: {
            if let Some(addr) = config.hooks().lookup(&record.name) {
                if let Ok(value) = u32::try_from(addr) {
                    debug!(
                        "hooking {}!{} at slot {:#x}",
                        record.module, record.name, record.slot_rva
                    );
                    summary.hooked += 1;
                    break 'patch value;
                }
                warn!(
                    "hook for {} at {:#x} does not fit a 32-bit slot",
                    record.name, addr
                );
            }

            if record.module.eq_ignore_ascii_case(config.runtime_module()) {
                if let Some(addr) = symbols.resolve(&record.name) {
                    if let Ok(value) = u32::try_from(addr) {
                        debug!(
                            "resolved {}!{} to host address {:#x}",
                            record.module, record.name, addr
                        );
                        summary.host_resolved += 1;
                        break 'patch value;
                    }
                    warn!(
                        "host symbol {} at {:#x} does not fit a 32-bit slot",
                        record.name, addr
                    );
                } else {
                    debug!("{} not found in the host runtime", record.name);
                }
                summary.runtime_unresolved += 1;
                break 'patch UNRESOLVED_RUNTIME_MARKER;
            }

            summary.foreign += 1;
            break 'patch UNRESOLVED_FOREIGN_MARKER;
        };

        if memory.write_u32(record.slot_rva, patch).is_err() {
            warn!(
                "import slot {}!{} at rva {:#x} is outside the mapped image",
                record.module, record.name, record.slot_rva
            );
            summary.skipped += 1;
        }
    }

    debug!(
        "imports: {} hooked, {} host, {} runtime-unresolved, {} foreign, {} skipped",
        summary.hooked,
        summary.host_resolved,
        summary.runtime_unresolved,
        summary.foreign,
        summary.skipped
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TableSource(HashMap<&'static str, usize>);

    impl SymbolSource for TableSource {
        fn resolve(&mut self, name: &str) -> Option<usize> {
            self.0.get(name).copied()
        }
    }

    fn record(module: &str, name: &str, slot_rva: u32) -> ImportRecord {
        ImportRecord {
            module: module.to_string(),
            name: name.to_string(),
            ordinal: 0,
            slot_rva,
        }
    }

    fn memory_over(buf: &mut [u8], rva: u32) -> ImageMemory {
        let mut memory = ImageMemory::new(buf.as_mut_ptr() as u64 - u64::from(rva));
        memory.add_span(rva, buf.len() as u32);
        memory
    }

    #[test]
    fn test_markers_are_distinct_and_non_null() {
        assert_ne!(UNRESOLVED_RUNTIME_MARKER, UNRESOLVED_FOREIGN_MARKER);
        assert_ne!(UNRESOLVED_RUNTIME_MARKER, 0);
        assert_ne!(UNRESOLVED_FOREIGN_MARKER, 0);
    }

    #[test]
    fn test_hook_table_lookup_and_replace() {
        let mut table = HookTable::empty();
        assert!(table.is_empty());
        table.insert("malloc", 0x1000);
        table.insert("free", 0x2000);
        table.insert("malloc", 0x3000);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("malloc"), Some(0x3000));
        assert_eq!(table.lookup("free"), Some(0x2000));
        assert_eq!(table.lookup("realloc"), None);
    }

    #[test]
    fn test_default_hook_table_covers_the_allocator_triple() {
        let table = HookTable::default();
        for name in ["malloc", "realloc", "free"] {
            assert!(table.lookup(name).is_some(), "missing hook for {}", name);
        }
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_resolution_order_and_markers() {
        let mut buf = vec![0u8; 32];
        let mut memory = memory_over(&mut buf, 0x2000);

        let records = [
            record("MSVCRT.dll", "malloc", 0x2000),
            record("MSVCRT.dll", "strlen", 0x2004),
            record("MSVCRT.dll", "_wfopen", 0x2008),
            record("KERNEL32.dll", "HeapAlloc", 0x200C),
        ];

        let mut hooks = HookTable::empty();
        hooks.insert("malloc", 0x0101_0101);
        let config = LoadConfig::new().with_hooks(hooks);

        let mut symbols = TableSource(HashMap::from([("strlen", 0x0A0B_0C0Dusize)]));
        let summary = resolve_imports(&records, &mut memory, &config, &mut symbols);

        assert_eq!(memory.read_u32(0x2000).unwrap(), 0x0101_0101);
        assert_eq!(memory.read_u32(0x2004).unwrap(), 0x0A0B_0C0D);
        assert_eq!(memory.read_u32(0x2008).unwrap(), UNRESOLVED_RUNTIME_MARKER);
        assert_eq!(memory.read_u32(0x200C).unwrap(), UNRESOLVED_FOREIGN_MARKER);

        assert_eq!(summary.hooked, 1);
        assert_eq!(summary.host_resolved, 1);
        assert_eq!(summary.runtime_unresolved, 1);
        assert_eq!(summary.foreign, 1);
        assert_eq!(summary.skipped, 0);
    }

    #[test]
    fn test_hook_applies_to_any_module() {
        let mut buf = vec![0u8; 8];
        let mut memory = memory_over(&mut buf, 0x2000);

        let records = [record("OTHER.dll", "free", 0x2000)];
        let mut hooks = HookTable::empty();
        hooks.insert("free", 0x0202_0202);
        let config = LoadConfig::new().with_hooks(hooks);
        let mut symbols = TableSource(HashMap::new());

        let summary = resolve_imports(&records, &mut memory, &config, &mut symbols);
        assert_eq!(memory.read_u32(0x2000).unwrap(), 0x0202_0202);
        assert_eq!(summary.hooked, 1);
        assert_eq!(summary.foreign, 0);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_oversized_address_degrades_to_marker() {
        let mut buf = vec![0u8; 8];
        let mut memory = memory_over(&mut buf, 0x2000);

        let records = [record("msvcrt.dll", "memcpy", 0x2000)];
        let config = LoadConfig::new().with_hooks(HookTable::empty());
        let mut symbols = TableSource(HashMap::from([("memcpy", usize::MAX)]));

        let summary = resolve_imports(&records, &mut memory, &config, &mut symbols);
        assert_eq!(memory.read_u32(0x2000).unwrap(), UNRESOLVED_RUNTIME_MARKER);
        assert_eq!(summary.host_resolved, 0);
        assert_eq!(summary.runtime_unresolved, 1);
    }

    #[test]
    fn test_unmapped_slot_is_recorded_not_fatal() {
        let mut buf = vec![0u8; 8];
        let mut memory = memory_over(&mut buf, 0x2000);

        let records = [record("OTHER.dll", "Frob", 0x9000)];
        let config = LoadConfig::new().with_hooks(HookTable::empty());
        let mut symbols = TableSource(HashMap::new());

        let summary = resolve_imports(&records, &mut memory, &config, &mut symbols);
        assert_eq!(summary.skipped, 1);
    }
}
