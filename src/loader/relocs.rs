//! Base relocation application.
//!
//! Runs only when the image was placed away from its preferred base; the caller skips
//! the stage entirely for a zero delta, so "no relocation" is an explicit state rather
//! than an empty loop.
//!
//! The relocation directory is a sequence of blocks, each covering one 4 KiB page:
//! a block header (page RVA + block size) followed by 16-bit entries whose high nibble
//! is the kind and low 12 bits the offset within the page. Only `HIGHLOW` (32-bit
//! fixup) does work here; `ABSOLUTE` entries are alignment padding, and any other kind
//! is reported and skipped without failing the load — the images this loader targets
//! carry nothing else.

use log::{debug, warn};

use crate::loader::memory::ImageMemory;

/// Base relocation kinds from the PE format specification.
mod reloc_kind {
    /// No-op relocation, used for padding to maintain alignment.
    pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
    /// 32-bit fixup: add the load delta to the dword at the target.
    pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
}

/// What the relocation pass did; recorded on the load result.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelocationOutcome {
    /// `HIGHLOW` entries applied.
    pub applied: usize,
    /// Entries of unsupported kinds, reported and skipped.
    pub skipped: usize,
}

/// Walks the relocation directory in the mapped image and applies the fixups.
///
/// `directory` is the (RVA, size) of the base relocation data directory, if the image
/// has one. Anomalies — a missing directory, a truncated block, an entry whose target
/// is outside the mapped sections — are recorded or logged, never fatal.
pub(crate) fn apply_relocations(
    directory: Option<(u32, u32)>,
    memory: &mut ImageMemory,
    delta: i64,
) -> RelocationOutcome {
    let mut outcome = RelocationOutcome::default();

    let Some((dir_rva, dir_size)) = directory else {
        warn!("image has no relocation directory; absolute addresses keep their link-time base");
        return outcome;
    };

    let mut offset = u64::from(dir_rva);
    let end = u64::from(dir_rva) + u64::from(dir_size);

    while offset + 8 <= end {
        let header_rva = offset as u32;
        let (page_rva, block_size) = match (
            memory.read_u32(header_rva),
            memory.read_u32(header_rva + 4),
        ) {
            (Ok(page), Ok(size)) => (page, size),
            _ => {
                warn!("relocation block header at rva {:#x} is unreadable", offset);
                break;
            }
        };

        if block_size < 8 || offset + u64::from(block_size) > end {
            break;
        }

        let entry_count = (block_size as usize - 8) / 2;
        for index in 0..entry_count {
            let entry_rva = (offset + 8 + 2 * index as u64) as u32;
            let Ok(entry) = memory.read_u16(entry_rva) else {
                warn!("relocation entry at rva {:#x} is unreadable", entry_rva);
                outcome.skipped += 1;
                continue;
            };

            let kind = entry >> 12;
            let page_offset = u32::from(entry & 0x0FFF);
            match kind {
                reloc_kind::IMAGE_REL_BASED_ABSOLUTE => {
                    // Padding, nothing to do.
                }
                reloc_kind::IMAGE_REL_BASED_HIGHLOW => {
                    let target = page_rva.wrapping_add(page_offset);
                    match memory.read_u32(target) {
                        Ok(value) => {
                            let fixed = (i64::from(value) + delta) as u32;
                            if memory.write_u32(target, fixed).is_ok() {
                                outcome.applied += 1;
                            } else {
                                outcome.skipped += 1;
                            }
                        }
                        Err(_) => {
                            warn!(
                                "relocation target rva {:#x} is outside the mapped image",
                                target
                            );
                            outcome.skipped += 1;
                        }
                    }
                }
                other => {
                    warn!(
                        "unsupported relocation kind {} at rva {:#x}, skipping",
                        other, entry_rva
                    );
                    outcome.skipped += 1;
                }
            }
        }

        offset += u64::from(block_size);
    }

    debug!(
        "relocations: {} applied, {} skipped (delta {:#x})",
        outcome.applied, outcome.skipped, delta
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_over(buf: &mut [u8], rva: u32) -> ImageMemory {
        let mut memory = ImageMemory::new(buf.as_mut_ptr() as u64 - u64::from(rva));
        memory.add_span(rva, buf.len() as u32);
        memory
    }

    /// Builds a relocation block in-buffer: header at `at`, then entries.
    fn write_block(memory: &mut ImageMemory, at: u32, page_rva: u32, entries: &[u16]) -> u32 {
        let size = 8 + 2 * entries.len() as u32;
        memory.write_u32(at, page_rva).unwrap();
        memory.write_u32(at + 4, size).unwrap();
        for (i, entry) in entries.iter().enumerate() {
            let le = entry.to_le_bytes();
            memory
                .write_bytes(at + 8 + 2 * i as u32, &le)
                .unwrap();
        }
        size
    }

    #[test]
    fn test_highlow_applies_delta() {
        // One page of "image" at rva 0x1000 and a reloc area at rva 0x2000.
        let mut buf = vec![0u8; 0x2000];
        let mut memory = memory_over(&mut buf, 0x1000);

        memory.write_u32(0x1000, 0x4000_2000).unwrap();
        let size = write_block(&mut memory, 0x2000, 0x1000, &[(3 << 12), 0]);

        let outcome = apply_relocations(Some((0x2000, size)), &mut memory, 0x1000_0000);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(memory.read_u32(0x1000).unwrap(), 0x5000_2000);
    }

    #[test]
    fn test_negative_delta() {
        let mut buf = vec![0u8; 0x2000];
        let mut memory = memory_over(&mut buf, 0x1000);

        memory.write_u32(0x1010, 0x5000_2000).unwrap();
        let size = write_block(&mut memory, 0x2000, 0x1000, &[(3 << 12) | 0x010]);

        let outcome = apply_relocations(Some((0x2000, size)), &mut memory, -0x1000_0000);
        assert_eq!(outcome.applied, 1);
        assert_eq!(memory.read_u32(0x1010).unwrap(), 0x4000_2000);
    }

    #[test]
    fn test_unsupported_kind_is_skipped() {
        let mut buf = vec![0u8; 0x2000];
        let mut memory = memory_over(&mut buf, 0x1000);

        memory.write_u32(0x1000, 0x4000_2000).unwrap();
        // Kind 5 (MIPS jump) is not in this loader's target set.
        let size = write_block(&mut memory, 0x2000, 0x1000, &[(5 << 12), (3 << 12)]);

        let outcome = apply_relocations(Some((0x2000, size)), &mut memory, 0x1000);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(memory.read_u32(0x1000).unwrap(), 0x4000_3000);
    }

    #[test]
    fn test_missing_directory_is_not_fatal() {
        let mut buf = vec![0u8; 0x10];
        let mut memory = memory_over(&mut buf, 0x1000);
        let outcome = apply_relocations(None, &mut memory, 0x1000);
        assert_eq!(outcome, RelocationOutcome::default());
    }

    #[test]
    fn test_target_outside_image_is_skipped() {
        let mut buf = vec![0u8; 0x2000];
        let mut memory = memory_over(&mut buf, 0x1000);

        // Block points at page rva 0x8000 which is unmapped.
        let size = write_block(&mut memory, 0x2000, 0x8000, &[(3 << 12)]);
        let outcome = apply_relocations(Some((0x2000, size)), &mut memory, 0x1000);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn test_zero_sized_block_terminates_walk() {
        let mut buf = vec![0u8; 0x2000];
        let mut memory = memory_over(&mut buf, 0x1000);

        memory.write_u32(0x2000, 0x1000).unwrap();
        memory.write_u32(0x2004, 0).unwrap();
        let outcome = apply_relocations(Some((0x2000, 0x100)), &mut memory, 0x1000);
        assert_eq!(outcome, RelocationOutcome::default());
    }
}
