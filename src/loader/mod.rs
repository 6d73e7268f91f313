//! The load pipeline: parse → map → resolve imports → relocate → protect → locate
//! exports.
//!
//! # Architecture
//!
//! Loading is strictly sequential and single-shot. [`Loader::load`] drives the stages
//! in order and never revisits one:
//!
//! ```text
//! Unparsed -> Mapped -> ImportsResolved -> [Relocated] -> ProtectionsFinalized
//!          -> ExportsResolved -> Ready
//! ```
//!
//! `Relocated` is entered only when the image was placed away from its preferred
//! base; a zero load delta skips the stage outright. Mapping and protection errors
//! abort the load (the `Err` return is the terminal `Failed` state); import and
//! relocation anomalies are recorded on the result and do not fail anything by
//! themselves. Reaching `Ready` requires every required export to have resolved.
//!
//! # Key Components
//!
//! - [`LoadConfig`] - what to load where, and which symbols matter
//! - [`Loader`] - owns the configuration and the cached host symbol resolver
//! - [`LoadedLibrary`] - the mapped, patched, protected image and its exports
//! - [`LoadState`] - the pipeline state the result settled in
//!
//! # Ownership
//!
//! The mapped memory belongs to the loader's caller for the life of the process; it
//! is never unmapped. Process teardown reclaims it. This mirrors how the image will
//! be used: one load, a handful of entry-point calls, process exit.
//!
//! # Example
//!
//! ```ignore
//! use winsub::{LoadConfig, Loader};
//!
//! let dll = std::fs::read("fontsub.dll")?;
//! let config = LoadConfig::new().with_base_address(0x2000_0000);
//! let library = Loader::new(config).load(&dll)?;
//! println!(
//!     "CreateFontPackage at {:#010x}",
//!     library.export_address("CreateFontPackage").unwrap()
//! );
//! ```

pub mod exports;
pub mod imports;
pub mod memory;
pub mod relocs;

use goblin::pe::PE;
use log::debug;

use crate::{
    image::{self, SectionRecord},
    subset, Error, Result,
};

pub use exports::ResolvedExports;
pub use imports::{
    CRuntime, HookTable, ImportSummary, SymbolSource, UNRESOLVED_FOREIGN_MARKER,
    UNRESOLVED_RUNTIME_MARKER,
};
pub use memory::ImageMemory;
pub use relocs::RelocationOutcome;

/// Page granularity of the section mappings.
pub(crate) const PAGE_SIZE: u64 = 0x1000;

/// States of the load pipeline.
///
/// A successful load settles in [`LoadState::Ready`]; every error return from
/// [`Loader::load`] is the terminal failed state. `Relocated` appears only for
/// images placed away from their preferred base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Nothing has happened yet.
    Unparsed,
    /// All sections are mapped at their required addresses.
    Mapped,
    /// Every import slot has been rewritten.
    ImportsResolved,
    /// Relocation fixups were applied (nonzero delta only).
    Relocated,
    /// Final page protections are in place.
    ProtectionsFinalized,
    /// Every required export resolved to an address.
    ExportsResolved,
    /// The image is callable.
    Ready,
}

/// Configuration for one load: placement, required symbols, interposition.
///
/// # Example
///
/// ```
/// use winsub::LoadConfig;
///
/// let config = LoadConfig::new()
///     .with_base_address(0x2000_0000)
///     .with_required_exports(["CreateFontPackage", "MergeFontPackage"]);
/// assert_eq!(config.base_address(), Some(0x2000_0000));
/// ```
#[derive(Debug, Clone)]
pub struct LoadConfig {
    base_address: Option<u64>,
    required_exports: Vec<String>,
    runtime_module: String,
    hooks: HookTable,
}

impl LoadConfig {
    /// The default configuration: preferred-base placement, the font subsetter's
    /// two entry points required, `msvcrt.dll` recognized as the runtime module,
    /// the host allocator triple hooked.
    #[must_use]
    pub fn new() -> Self {
        LoadConfig {
            base_address: None,
            required_exports: vec![
                subset::CREATE_EXPORT.to_string(),
                subset::MERGE_EXPORT.to_string(),
            ],
            runtime_module: "msvcrt.dll".to_string(),
            hooks: HookTable::host_allocator(),
        }
    }

    /// Overrides the load address instead of using the image's preferred base.
    #[must_use]
    pub fn with_base_address(mut self, base: u64) -> Self {
        self.base_address = Some(base);
        self
    }

    /// Replaces the set of exports the load must resolve to count as `Ready`.
    #[must_use]
    pub fn with_required_exports<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_exports = names.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the module name whose imports are resolved against the host
    /// runtime.
    #[must_use]
    pub fn with_runtime_module(mut self, module: impl Into<String>) -> Self {
        self.runtime_module = module.into();
        self
    }

    /// Replaces the hook table.
    #[must_use]
    pub fn with_hooks(mut self, hooks: HookTable) -> Self {
        self.hooks = hooks;
        self
    }

    /// The configured base-address override, if any.
    #[must_use]
    pub fn base_address(&self) -> Option<u64> {
        self.base_address
    }

    /// The exports the load must resolve.
    #[must_use]
    pub fn required_exports(&self) -> &[String] {
        &self.required_exports
    }

    /// The recognized runtime module name.
    #[must_use]
    pub fn runtime_module(&self) -> &str {
        &self.runtime_module
    }

    /// The hook table.
    #[must_use]
    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the load pipeline for one image.
///
/// Owns the configuration and the cached handle to the host's dynamic symbol
/// resolver; independent loaders never share resolver state, so multiple loads
/// (e.g. in tests) coexist without interference.
pub struct Loader {
    config: LoadConfig,
    symbols: Box<dyn SymbolSource>,
}

impl Loader {
    /// A loader resolving host symbols against the real C runtime.
    #[must_use]
    pub fn new(config: LoadConfig) -> Self {
        Loader {
            config,
            symbols: Box::new(CRuntime::new()),
        }
    }

    /// A loader with a caller-supplied symbol source (used by tests).
    #[must_use]
    pub fn with_symbols(config: LoadConfig, symbols: Box<dyn SymbolSource>) -> Self {
        Loader { config, symbols }
    }

    /// Runs the whole pipeline over `data` and returns the callable image.
    ///
    /// # Errors
    ///
    /// - [`Error::Empty`] / [`Error::GoblinErr`] / [`Error::Malformed`] — the bytes
    ///   are not a loadable 32-bit PE image
    /// - [`Error::NotSupported`] — the image is PE32+
    /// - [`Error::MisalignedBase`] / [`Error::BaseOutOfRange`] — unusable placement
    /// - [`Error::SectionMap`] / [`Error::Protect`] — the OS refused the fixed
    ///   mapping or the final protection change (fatal by design)
    /// - [`Error::MissingExport`] — a required name is absent (logical failure; the
    ///   image is mapped but nothing will ever be invoked)
    pub fn load(&mut self, data: &[u8]) -> Result<LoadedLibrary> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        debug!("load state -> {:?}", LoadState::Unparsed);
        let pe = PE::parse(data)?;
        if pe.is_64 {
            return Err(Error::NotSupported(
                "PE32+ images are outside this loader's target set".to_string(),
            ));
        }
        let optional = pe
            .header
            .optional_header
            .ok_or_else(|| malformed_error!("image has no optional header"))?;

        let preferred_base = pe.image_base;
        let actual_base = self.config.base_address.unwrap_or(preferred_base);
        let delta = actual_base as i64 - preferred_base as i64;
        debug!(
            "preferred base {:#010x}, actual base {:#010x}, delta {:#x}",
            preferred_base, actual_base, delta
        );

        let sections = image::section_records(&pe);
        memory::validate_layout(&sections, actual_base)?;
        let mut mem = memory::map_sections(&sections, actual_base, data)?;
        debug!("load state -> {:?}", LoadState::Mapped);

        let import_records = image::import_records(&pe, data);
        let imports =
            imports::resolve_imports(&import_records, &mut mem, &self.config, self.symbols.as_mut());
        debug!("load state -> {:?}", LoadState::ImportsResolved);

        let relocation = if delta != 0 {
            let directory = optional
                .data_directories
                .get_base_relocation_table()
                .map(|dir| (dir.virtual_address, dir.size));
            let outcome = relocs::apply_relocations(directory, &mut mem, delta);
            debug!("load state -> {:?}", LoadState::Relocated);
            Some(outcome)
        } else {
            debug!("loaded at preferred base; relocation pass skipped");
            None
        };

        memory::finalize_protections(&sections, actual_base)?;
        debug!("load state -> {:?}", LoadState::ProtectionsFinalized);

        let export_records = image::export_records(&pe);
        let exports =
            exports::locate_exports(&export_records, actual_base, &self.config.required_exports)?;
        debug!("load state -> {:?}", LoadState::ExportsResolved);

        debug!("load state -> {:?}", LoadState::Ready);
        Ok(LoadedLibrary {
            preferred_base,
            actual_base,
            delta,
            state: LoadState::Ready,
            sections,
            memory: mem,
            exports,
            imports,
            relocation,
        })
    }
}

/// A mapped, patched, protected image with its entry points resolved.
///
/// Exclusively owns the mapped memory for the rest of the process's life; there is
/// no unload. After construction the image is immutable from the loader's side —
/// only the foreign code touches its own writable sections at call time.
pub struct LoadedLibrary {
    preferred_base: u64,
    actual_base: u64,
    delta: i64,
    state: LoadState,
    sections: Vec<SectionRecord>,
    memory: ImageMemory,
    exports: ResolvedExports,
    imports: ImportSummary,
    relocation: Option<RelocationOutcome>,
}

impl LoadedLibrary {
    /// Base address the image was linked for.
    #[must_use]
    pub fn preferred_base(&self) -> u64 {
        self.preferred_base
    }

    /// Base address the image actually occupies.
    #[must_use]
    pub fn actual_base(&self) -> u64 {
        self.actual_base
    }

    /// `actual_base - preferred_base`, signed.
    #[must_use]
    pub fn load_delta(&self) -> i64 {
        self.delta
    }

    /// The pipeline state the load settled in (always [`LoadState::Ready`] for a
    /// value of this type).
    #[must_use]
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// The image's section records.
    #[must_use]
    pub fn sections(&self) -> &[SectionRecord] {
        &self.sections
    }

    /// Bounds-checked access to the mapped image.
    #[must_use]
    pub fn memory(&self) -> &ImageMemory {
        &self.memory
    }

    /// The resolved required exports.
    #[must_use]
    pub fn exports(&self) -> &ResolvedExports {
        &self.exports
    }

    /// Absolute address of one resolved export.
    #[must_use]
    pub fn export_address(&self, name: &str) -> Option<u64> {
        self.exports.address(name)
    }

    /// What import resolution did, per class.
    #[must_use]
    pub fn import_summary(&self) -> ImportSummary {
        self.imports
    }

    /// What the relocation pass did; `None` when the pass was skipped because the
    /// image sits at its preferred base.
    #[must_use]
    pub fn relocation(&self) -> Option<RelocationOutcome> {
        self.relocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = LoadConfig::new();
        assert_eq!(config.base_address(), None);
        assert_eq!(
            config.required_exports(),
            &["CreateFontPackage".to_string(), "MergeFontPackage".to_string()]
        );
        assert_eq!(config.runtime_module(), "msvcrt.dll");
        assert_eq!(config.hooks().len(), 3);
    }

    #[test]
    fn test_config_builders() {
        let config = LoadConfig::new()
            .with_base_address(0x2000_0000)
            .with_required_exports(["OneExport"])
            .with_runtime_module("crtdll.dll")
            .with_hooks(HookTable::empty());
        assert_eq!(config.base_address(), Some(0x2000_0000));
        assert_eq!(config.required_exports(), &["OneExport".to_string()]);
        assert_eq!(config.runtime_module(), "crtdll.dll");
        assert!(config.hooks().is_empty());
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let mut loader = Loader::new(LoadConfig::new());
        assert!(matches!(loader.load(&[]), Err(Error::Empty)));
    }

    #[test]
    fn test_garbage_input_is_rejected() {
        let mut loader = Loader::new(LoadConfig::new());
        assert!(loader.load(&[0u8; 128]).is_err());
    }
}
