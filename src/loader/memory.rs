//! Fixed-placement section memory: mapping, the audited RVA accessor, and the
//! final protection pass.
//!
//! Every byte of the loaded image lives in anonymous mappings created here, one per
//! section, at exactly `actual_base + section_rva`. Placement is fixed, not advisory:
//! `MAP_FIXED_NOREPLACE` makes the kernel refuse an occupied range instead of silently
//! replacing it, and a refused range aborts the whole load — a partially mapped image
//! cannot safely be patched or executed.
//!
//! All reads and writes of mapped image memory go through [`ImageMemory`], the single
//! bounds-checked `base + offset` accessor. Import patching, relocation fixups and the
//! test probes all share this one code path; there are no other pointer casts into the
//! image.
//!
//! Protection finalization runs strictly after every write stage, because the earlier
//! stages need write access to sections that may end up read-only or execute-only.

use std::io;

use libc::c_void;
use log::{debug, trace};

use crate::{image::SectionRecord, loader::PAGE_SIZE, Error, Result};

/// The mapped image: base address plus the set of section ranges that back it.
///
/// This is the only type that dereferences into the image, and the unsafe blocks in
/// its read/write methods are the only places the crate touches mapped memory. Every
/// access is validated to fall entirely inside one mapped section range.
pub struct ImageMemory {
    base: u64,
    spans: Vec<Span>,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    rva: u32,
    size: u32,
}

impl ImageMemory {
    pub(crate) fn new(base: u64) -> Self {
        ImageMemory {
            base,
            spans: Vec::new(),
        }
    }

    pub(crate) fn add_span(&mut self, rva: u32, size: u32) {
        self.spans.push(Span { rva, size });
    }

    /// The address the image actually occupies.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Whether `len` bytes starting at `rva` fall entirely inside one mapped section.
    #[must_use]
    pub fn contains(&self, rva: u32, len: usize) -> bool {
        self.locate(rva, len).is_ok()
    }

    /// Resolves an in-image range to an absolute address, or rejects it.
    fn locate(&self, rva: u32, len: usize) -> Result<usize> {
        let start = u64::from(rva);
        let end = start + len as u64;
        for span in &self.spans {
            let span_start = u64::from(span.rva);
            let span_end = span_start + u64::from(span.size);
            if start >= span_start && end <= span_end {
                return Ok((self.base + start) as usize);
            }
        }
        Err(Error::OutOfBounds)
    }

    /// Reads one byte at `rva`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfBounds`] if `rva` is not inside a mapped section.
    pub fn read_u8(&self, rva: u32) -> Result<u8> {
        let addr = self.locate(rva, 1)?;
        Ok(unsafe { *(addr as *const u8) })
    }

    /// Reads a little-endian `u16` at `rva`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfBounds`] if the range is not inside a mapped section.
    pub fn read_u16(&self, rva: u32) -> Result<u16> {
        let addr = self.locate(rva, 2)?;
        let mut buf = [0u8; 2];
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), 2) };
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a little-endian `u32` at `rva`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfBounds`] if the range is not inside a mapped section.
    pub fn read_u32(&self, rva: u32) -> Result<u32> {
        let addr = self.locate(rva, 4)?;
        let mut buf = [0u8; 4];
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), 4) };
        Ok(u32::from_le_bytes(buf))
    }

    /// Copies `len` bytes starting at `rva` out of the image.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfBounds`] if the range is not inside a mapped section.
    pub fn read_bytes(&self, rva: u32, len: usize) -> Result<Vec<u8>> {
        let addr = self.locate(rva, len)?;
        let mut buf = vec![0u8; len];
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), len) };
        Ok(buf)
    }

    /// Writes a little-endian `u32` at `rva`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfBounds`] if the range is not inside a mapped section.
    pub fn write_u32(&mut self, rva: u32, value: u32) -> Result<()> {
        let addr = self.locate(rva, 4)?;
        let bytes = value.to_le_bytes();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, 4) };
        Ok(())
    }

    /// Writes raw bytes at `rva`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfBounds`] if the range is not inside a mapped section.
    pub(crate) fn write_bytes(&mut self, rva: u32, data: &[u8]) -> Result<()> {
        let addr = self.locate(rva, data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
        Ok(())
    }
}

/// Validates the planned layout: base and section placement alignment, 32-bit
/// extent, pairwise-disjoint section ranges.
pub(crate) fn validate_layout(sections: &[SectionRecord], base: u64) -> Result<()> {
    if base % PAGE_SIZE != 0 {
        return Err(Error::MisalignedBase(base));
    }

    let mut extent = 0u64;
    for section in sections {
        if section.virtual_size == 0 {
            continue;
        }
        if (base + u64::from(section.rva)) % PAGE_SIZE != 0 {
            return Err(malformed_error!(
                "section {} placement {:#x} is not page-aligned",
                section.name,
                section.rva
            ));
        }
        let end = u64::from(section.rva) + u64::from(section.virtual_size);
        extent = extent.max(end);
    }
    if base + extent > u64::from(u32::MAX) + 1 {
        return Err(Error::BaseOutOfRange(base));
    }

    // Pairwise disjoint memory ranges, checked on the page granularity the
    // mappings will actually occupy.
    let mut ranges: Vec<(u64, u64)> = sections
        .iter()
        .filter(|s| s.virtual_size > 0)
        .map(|s| {
            let start = u64::from(s.rva);
            let end = page_round_up(start + u64::from(s.virtual_size));
            (start, end)
        })
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(malformed_error!(
                "section ranges overlap: {:#x}..{:#x} and {:#x}..",
                pair[0].0,
                pair[0].1,
                pair[1].0
            ));
        }
    }

    Ok(())
}

/// Maps every section at its required address and copies the raw bytes in.
///
/// The regions come up read-write; [`finalize_protections`] fixes them later.
pub(crate) fn map_sections(
    sections: &[SectionRecord],
    base: u64,
    file: &[u8],
) -> Result<ImageMemory> {
    let mut memory = ImageMemory::new(base);

    for section in sections {
        if section.virtual_size == 0 {
            debug!("section {:8} has no virtual extent, skipping", section.name);
            continue;
        }

        let addr = base + u64::from(section.rva);
        debug!(
            "mapping section {:8} at {:#010x} ({:#x} bytes, raw {:#x})",
            section.name, addr, section.virtual_size, section.raw_size
        );
        map_fixed_rw(addr, section.virtual_size as usize)?;
        memory.add_span(section.rva, section.virtual_size);

        // The anonymous mapping is zero-filled; only the raw prefix is copied.
        let copy_len = section.raw_size.min(section.virtual_size) as usize;
        if copy_len > 0 {
            let start = section.raw_offset as usize;
            let raw = file
                .get(start..start + copy_len)
                .ok_or_else(|| {
                    malformed_error!(
                        "section {} raw data {:#x}+{:#x} exceeds the file",
                        section.name,
                        start,
                        copy_len
                    )
                })?;
            memory.write_bytes(section.rva, raw)?;
        }
    }

    Ok(memory)
}

/// One fixed-placement anonymous read-write mapping.
fn map_fixed_rw(addr: u64, len: usize) -> Result<()> {
    let ptr = unsafe {
        libc::mmap(
            addr as usize as *mut c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::SectionMap {
            addr,
            source: io::Error::last_os_error(),
        });
    }
    if ptr as usize as u64 != addr {
        // Kernels predating MAP_FIXED_NOREPLACE treat the flag as a hint and
        // return a different range; that range is not the image's and must go.
        unsafe { libc::munmap(ptr, len) };
        return Err(Error::SectionMap {
            addr,
            source: io::Error::from_raw_os_error(libc::EEXIST),
        });
    }
    trace!("mapped {:#010x}..{:#010x}", addr, addr + len as u64);
    Ok(())
}

/// Derives the final `PROT_*` bits for a section from its flags.
///
/// Base protection is read-only; execute is added for code/executable sections and
/// write for writable ones.
pub(crate) fn protection_bits(section: &SectionRecord) -> libc::c_int {
    let mut prot = libc::PROT_READ;
    if section.is_executable() {
        prot |= libc::PROT_EXEC;
    }
    if section.is_writable() {
        prot |= libc::PROT_WRITE;
    }
    prot
}

/// Applies every section's final page protection.
///
/// Must run after all writes (mapping, import patching, relocation); a failure is
/// fatal for the load.
pub(crate) fn finalize_protections(sections: &[SectionRecord], base: u64) -> Result<()> {
    for section in sections {
        if section.virtual_size == 0 {
            continue;
        }
        let addr = base + u64::from(section.rva);
        let prot = protection_bits(section);
        debug!(
            "protecting section {:8} at {:#010x} with {:#x}",
            section.name, addr, prot
        );
        let rc = unsafe {
            libc::mprotect(
                addr as usize as *mut c_void,
                section.virtual_size as usize,
                prot,
            )
        };
        if rc != 0 {
            return Err(Error::Protect {
                addr,
                source: io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

fn page_round_up(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::SectionFlags;

    fn record(name: &str, rva: u32, vsize: u32, flags: SectionFlags) -> SectionRecord {
        SectionRecord {
            name: name.to_string(),
            rva,
            virtual_size: vsize,
            raw_offset: 0,
            raw_size: 0,
            flags,
        }
    }

    /// Accessor over a heap buffer instead of a real mapping; the arithmetic is
    /// identical.
    fn memory_over(buf: &mut [u8], rva: u32) -> ImageMemory {
        let mut memory = ImageMemory::new(buf.as_mut_ptr() as u64 - u64::from(rva));
        memory.add_span(rva, buf.len() as u32);
        memory
    }

    #[test]
    fn test_accessor_round_trip() {
        let mut buf = vec![0u8; 64];
        let mut memory = memory_over(&mut buf, 0x1000);

        memory.write_u32(0x1000, 0x4000_2000).unwrap();
        assert_eq!(memory.read_u32(0x1000).unwrap(), 0x4000_2000);
        assert_eq!(memory.read_u8(0x1000).unwrap(), 0x00);
        assert_eq!(memory.read_u8(0x1003).unwrap(), 0x40);
        assert_eq!(memory.read_u16(0x1002).unwrap(), 0x4000);
    }

    #[test]
    fn test_accessor_rejects_out_of_span() {
        let mut buf = vec![0u8; 16];
        let mut memory = memory_over(&mut buf, 0x1000);

        assert!(matches!(memory.read_u32(0x0FFC), Err(Error::OutOfBounds)));
        assert!(matches!(memory.read_u32(0x100D), Err(Error::OutOfBounds)));
        assert!(matches!(
            memory.write_u32(0x1010, 0),
            Err(Error::OutOfBounds)
        ));
        // The last fully contained dword is fine.
        assert!(memory.write_u32(0x100C, 0xAABB_CCDD).is_ok());
    }

    #[test]
    fn test_protection_bits() {
        let text = record(
            ".text",
            0x1000,
            0x1000,
            SectionFlags::CODE | SectionFlags::EXECUTE | SectionFlags::READ,
        );
        assert_eq!(protection_bits(&text), libc::PROT_READ | libc::PROT_EXEC);

        let data = record(
            ".data",
            0x2000,
            0x1000,
            SectionFlags::INITIALIZED_DATA | SectionFlags::READ | SectionFlags::WRITE,
        );
        assert_eq!(protection_bits(&data), libc::PROT_READ | libc::PROT_WRITE);

        let rdata = record(
            ".rdata",
            0x3000,
            0x1000,
            SectionFlags::INITIALIZED_DATA | SectionFlags::READ,
        );
        assert_eq!(protection_bits(&rdata), libc::PROT_READ);

        // IMAGE_SCN_CNT_CODE alone implies execute.
        let code_only = record(".text2", 0x4000, 0x1000, SectionFlags::CODE);
        assert_eq!(
            protection_bits(&code_only),
            libc::PROT_READ | libc::PROT_EXEC
        );
    }

    #[test]
    fn test_layout_rejects_misaligned_base() {
        let sections = [record(".text", 0x1000, 0x1000, SectionFlags::CODE)];
        assert!(matches!(
            validate_layout(&sections, 0x2000_0800),
            Err(Error::MisalignedBase(_))
        ));
    }

    #[test]
    fn test_layout_rejects_overlap() {
        let sections = [
            record(".a", 0x1000, 0x1800, SectionFlags::READ),
            record(".b", 0x2000, 0x1000, SectionFlags::READ),
        ];
        // .a rounds up to 0x1000..0x3000 which collides with .b at 0x2000.
        assert!(validate_layout(&sections, 0x2000_0000).is_err());
    }

    #[test]
    fn test_layout_rejects_out_of_range_base() {
        let sections = [record(".text", 0x1000, 0x1000, SectionFlags::CODE)];
        assert!(matches!(
            validate_layout(&sections, 0xFFFF_F000),
            Err(Error::BaseOutOfRange(_))
        ));
    }

    #[test]
    fn test_layout_accepts_disjoint_sections() {
        let sections = [
            record(".a", 0x1000, 0x1000, SectionFlags::READ),
            record(".b", 0x2000, 0x0800, SectionFlags::READ),
            record(".empty", 0x5000, 0, SectionFlags::READ),
        ];
        assert!(validate_layout(&sections, 0x2000_0000).is_ok());
    }
}
