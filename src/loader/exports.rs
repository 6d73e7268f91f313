//! Export lookup: required names to callable addresses.
//!
//! The caller declares up front which exported names it needs (for the font
//! subsetter, exactly two). Each located name combines its RVA with the actual load
//! base; a required name that is absent makes the whole load a logical failure —
//! the loader proceeds no further and nothing is ever invoked.

use std::collections::HashMap;

use log::debug;

use crate::{image::ExportRecord, Error, Result};

/// The required exports, resolved to absolute callable addresses.
#[derive(Debug, Default, Clone)]
pub struct ResolvedExports {
    entries: HashMap<String, u64>,
}

impl ResolvedExports {
    /// Address of a resolved export.
    #[must_use]
    pub fn address(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    /// Iterates over the resolved (name, address) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(name, addr)| (name.as_str(), *addr))
    }

    /// Number of resolved exports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scans the export records for every required name.
///
/// # Errors
///
/// [`Error::MissingExport`] naming the first required export the image lacks.
pub(crate) fn locate_exports(
    records: &[ExportRecord],
    base: u64,
    required: &[String],
) -> Result<ResolvedExports> {
    let mut entries = HashMap::with_capacity(required.len());

    for record in records {
        if required.iter().any(|name| name == &record.name) {
            let address = base + u64::from(record.rva);
            debug!("located export {} at {:#010x}", record.name, address);
            entries.insert(record.name.clone(), address);
        }
    }

    for name in required {
        if !entries.contains_key(name) {
            return Err(Error::MissingExport(name.clone()));
        }
    }

    Ok(ResolvedExports { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, rva: u32) -> ExportRecord {
        ExportRecord {
            name: name.to_string(),
            rva,
        }
    }

    #[test]
    fn test_all_required_names_resolve() {
        let records = [
            record("CreateFontPackage", 0x1010),
            record("MergeFontPackage", 0x1020),
            record("Irrelevant", 0x1030),
        ];
        let required = vec![
            "CreateFontPackage".to_string(),
            "MergeFontPackage".to_string(),
        ];

        let exports = locate_exports(&records, 0x1000_0000, &required).unwrap();
        assert_eq!(exports.len(), 2);
        assert_eq!(exports.address("CreateFontPackage"), Some(0x1000_1010));
        assert_eq!(exports.address("MergeFontPackage"), Some(0x1000_1020));
        assert_eq!(exports.address("Irrelevant"), None);
    }

    #[test]
    fn test_missing_required_name_is_a_logical_failure() {
        let records = [record("CreateFontPackage", 0x1010)];
        let required = vec![
            "CreateFontPackage".to_string(),
            "MergeFontPackage".to_string(),
        ];

        match locate_exports(&records, 0x1000_0000, &required) {
            Err(Error::MissingExport(name)) => assert_eq!(name, "MergeFontPackage"),
            other => panic!("expected MissingExport, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_no_required_names_resolves_empty() {
        let exports = locate_exports(&[], 0x1000_0000, &[]).unwrap();
        assert!(exports.is_empty());
    }
}
