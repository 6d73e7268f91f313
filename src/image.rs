//! Parsed, read-only view of a PE image file.
//!
//! This module is the boundary between the external image parser ([`goblin`]) and the
//! loader: it re-expresses the parts of the parse the load pipeline consumes — section
//! placements, import slots, export names — as owned records, and provides the
//! memory-mapped file backend used to bring image files in.
//!
//! # Key Components
//!
//! - [`MappedFile`] - read-only `mmap` of an image file
//! - [`SectionRecord`] - one section's placement, raw data location and flags
//! - [`ImportRecord`] - one import-table slot (module, function, slot RVA)
//! - [`ExportRecord`] - one named export (name, RVA)
//! - [`ImageSummary`] - everything above in one bundle, for diagnostics
//!
//! The loader itself works from a borrowed [`goblin::pe::PE`] during the load call; the
//! record types exist so that nothing downstream of parsing has to interpret goblin
//! structures (or their integer widths) a second time.

use std::{fs::File, ops::Deref, path::Path};

use bitflags::bitflags;
use goblin::pe::PE;
use log::warn;
use memmap2::Mmap;

use crate::{Error, Result};

bitflags! {
    /// Section characteristic bits the loader cares about.
    ///
    /// Values are the `IMAGE_SCN_*` constants from the PE specification; anything
    /// outside this set is irrelevant to placement and protection and is dropped
    /// during conversion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        /// The section contains executable code (`IMAGE_SCN_CNT_CODE`).
        const CODE = 0x0000_0020;
        /// The section contains initialized data (`IMAGE_SCN_CNT_INITIALIZED_DATA`).
        const INITIALIZED_DATA = 0x0000_0040;
        /// The section contains uninitialized data (`IMAGE_SCN_CNT_UNINITIALIZED_DATA`).
        const UNINITIALIZED_DATA = 0x0000_0080;
        /// The section can be discarded (`IMAGE_SCN_MEM_DISCARDABLE`).
        const DISCARDABLE = 0x0200_0000;
        /// The section can be executed (`IMAGE_SCN_MEM_EXECUTE`).
        const EXECUTE = 0x2000_0000;
        /// The section can be read (`IMAGE_SCN_MEM_READ`).
        const READ = 0x4000_0000;
        /// The section can be written (`IMAGE_SCN_MEM_WRITE`).
        const WRITE = 0x8000_0000;
    }
}

/// A read-only memory map of an image file.
///
/// The backend equivalent of reading the whole file, without the copy; dereferences
/// to the raw bytes. The map lives as long as this value.
pub struct MappedFile {
    map: Mmap,
}

impl MappedFile {
    /// Maps the file at `path` read-only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] for zero-length files and [`Error::FileError`] when
    /// the file cannot be opened or mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(Error::Empty);
        }

        // The map is read-only and private; concurrent modification of the backing
        // file is outside this tool's threat model (single-shot fuzzing runs).
        let map = unsafe { Mmap::map(&file)? };
        Ok(MappedFile { map })
    }

    /// Length of the mapped file in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the mapped file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map
    }
}

impl AsRef<[u8]> for MappedFile {
    fn as_ref(&self) -> &[u8] {
        &self.map
    }
}

/// One section of the image: where it goes, where its bytes come from, what it is.
#[derive(Debug, Clone)]
pub struct SectionRecord {
    /// Section name with trailing NULs stripped (e.g. `.text`).
    pub name: String,
    /// RVA the section occupies in the loaded image.
    pub rva: u32,
    /// Size of the section in memory.
    pub virtual_size: u32,
    /// File offset of the section's raw data.
    pub raw_offset: u32,
    /// Size of the raw data on disk; may differ from [`virtual_size`](Self::virtual_size)
    /// in either direction.
    pub raw_size: u32,
    /// Characteristic flags controlling the final page protection.
    pub flags: SectionFlags,
}

impl SectionRecord {
    /// Whether the section holds code.
    #[must_use]
    pub fn is_code(&self) -> bool {
        self.flags.contains(SectionFlags::CODE)
    }

    /// Whether the section must stay writable after protection finalization.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(SectionFlags::WRITE)
    }

    /// Whether the section must be executable after protection finalization.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.flags
            .intersects(SectionFlags::CODE | SectionFlags::EXECUTE)
    }
}

/// One import-table slot: the function the image calls through it, and where the
/// slot lives.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    /// Module the import is declared against (as spelled in the image).
    pub module: String,
    /// Imported function name; empty for by-ordinal imports.
    pub name: String,
    /// Ordinal, for by-ordinal imports.
    pub ordinal: u16,
    /// RVA of the 4-byte slot the foreign code calls through.
    pub slot_rva: u32,
}

/// One named export: a symbol the image makes available to callers.
#[derive(Debug, Clone)]
pub struct ExportRecord {
    /// Exported name.
    pub name: String,
    /// RVA of the exported function.
    pub rva: u32,
}

/// Parsed layout of an image, for diagnostics and tooling.
///
/// The load pipeline does not go through this type; it exists for the `info`
/// style of consumer that wants to look at an image without mapping it.
#[derive(Debug, Clone)]
pub struct ImageSummary {
    /// Base address the image was linked for.
    pub preferred_base: u64,
    /// Total virtual size of the image.
    pub size_of_image: u32,
    /// Whether the image is PE32+ (unsupported by the loader, still reported).
    pub is_64: bool,
    /// Whether the image is a DLL.
    pub is_dll: bool,
    /// Section placements.
    pub sections: Vec<SectionRecord>,
    /// Import slots.
    pub imports: Vec<ImportRecord>,
    /// Named exports.
    pub exports: Vec<ExportRecord>,
}

impl ImageSummary {
    /// Parses `data` as a PE image and summarizes its layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] for empty input and [`Error::GoblinErr`] when the
    /// bytes are not a parsable PE image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Empty);
        }
        let pe = PE::parse(data)?;

        Ok(ImageSummary {
            preferred_base: pe.image_base,
            size_of_image: pe
                .header
                .optional_header
                .map(|oh| oh.windows_fields.size_of_image)
                .unwrap_or(0),
            is_64: pe.is_64,
            is_dll: pe.is_lib,
            sections: section_records(&pe),
            imports: import_records(&pe, data),
            exports: export_records(&pe),
        })
    }
}

/// Converts goblin's section table into owned [`SectionRecord`]s.
pub(crate) fn section_records(pe: &PE) -> Vec<SectionRecord> {
    pe.sections
        .iter()
        .map(|section| SectionRecord {
            name: String::from_utf8_lossy(&section.name)
                .trim_end_matches('\0')
                .to_string(),
            rva: section.virtual_address,
            virtual_size: section.virtual_size,
            raw_offset: section.pointer_to_raw_data,
            raw_size: section.size_of_raw_data,
            flags: SectionFlags::from_bits_truncate(section.characteristics),
        })
        .collect()
}

/// Translates an RVA to a file offset through the section table.
///
/// Inclusive of the section start, exclusive of its virtual end; RVAs in the
/// headers (below every section) have no translation here and none is needed.
pub(crate) fn rva_to_offset(pe: &PE, rva: u32) -> Option<usize> {
    for section in &pe.sections {
        let start = section.virtual_address;
        let end = start.checked_add(section.virtual_size)?;
        if rva >= start && rva < end {
            return Some((rva - start) as usize + section.pointer_to_raw_data as usize);
        }
    }
    None
}

fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_cstring_at(data: &[u8], offset: usize) -> Option<String> {
    let tail = data.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}

/// Walks the import directory and lists every IAT slot.
///
/// One descriptor per module (terminated by an all-zero entry), each pairing an
/// import lookup table with the address table the loader patches; the slot RVA is
/// the address-table position. By-ordinal entries carry an empty name. Anything
/// unreadable ends the walk for that table — a torn import directory degrades to
/// fewer records, never to a parse failure.
pub(crate) fn import_records(pe: &PE, data: &[u8]) -> Vec<ImportRecord> {
    const DESCRIPTOR_LEN: u32 = 20;

    let mut records = Vec::new();
    let Some(directory) = pe
        .header
        .optional_header
        .as_ref()
        .and_then(|oh| oh.data_directories.get_import_table())
    else {
        return records;
    };

    let mut descriptor_rva = directory.virtual_address;
    loop {
        let Some(descriptor) = rva_to_offset(pe, descriptor_rva) else {
            break;
        };
        let (Some(lookup_table), Some(name_rva), Some(address_table)) = (
            read_u32_at(data, descriptor),
            read_u32_at(data, descriptor + 12),
            read_u32_at(data, descriptor + 16),
        ) else {
            break;
        };
        if lookup_table == 0 && name_rva == 0 && address_table == 0 {
            break;
        }

        let module = rva_to_offset(pe, name_rva).and_then(|off| read_cstring_at(data, off));
        let Some(module) = module else {
            warn!("import descriptor at rva {:#x} has an unreadable module name", descriptor_rva);
            descriptor_rva += DESCRIPTOR_LEN;
            continue;
        };

        // Older linkers leave the lookup table zero and the names live in the
        // address table itself.
        let names_rva = if lookup_table != 0 {
            lookup_table
        } else {
            address_table
        };

        let mut index = 0u32;
        loop {
            let entry = rva_to_offset(pe, names_rva + 4 * index)
                .and_then(|off| read_u32_at(data, off));
            let Some(entry) = entry else {
                warn!("import table for {} is truncated at entry {}", module, index);
                break;
            };
            if entry == 0 {
                break;
            }

            let slot_rva = address_table + 4 * index;
            if entry & 0x8000_0000 != 0 {
                records.push(ImportRecord {
                    module: module.clone(),
                    name: String::new(),
                    ordinal: (entry & 0xFFFF) as u16,
                    slot_rva,
                });
            } else {
                let hint = rva_to_offset(pe, entry)
                    .and_then(|off| read_u16_at(data, off))
                    .unwrap_or(0);
                let name = rva_to_offset(pe, entry + 2)
                    .and_then(|off| read_cstring_at(data, off))
                    .unwrap_or_default();
                records.push(ImportRecord {
                    module: module.clone(),
                    name,
                    ordinal: hint,
                    slot_rva,
                });
            }
            index += 1;
        }

        descriptor_rva += DESCRIPTOR_LEN;
    }

    records
}

/// Converts goblin's export list into owned [`ExportRecord`]s, keeping named
/// exports only — the loader resolves by name, never by ordinal.
pub(crate) fn export_records(pe: &PE) -> Vec<ExportRecord> {
    let mut records = Vec::with_capacity(pe.exports.len());
    for export in &pe.exports {
        let Some(name) = export.name else { continue };
        let Ok(rva) = u32::try_from(export.rva) else {
            warn!("dropping export {} with out-of-range rva {:#x}", name, export.rva);
            continue;
        };
        records.push(ExportRecord {
            name: name.to_string(),
            rva,
        });
    }
    records
}
