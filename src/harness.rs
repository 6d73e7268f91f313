//! Per-sample exercise workflow: derive call parameters from the input bytes and
//! drive the subsetter's entry points the way one fuzzing iteration does.
//!
//! Everything random here is seeded from the sample itself, so a given input always
//! produces the same parameters and the same call chain — a crash reproduces from
//! the file alone.

use fastrand::Rng;
use log::info;

use crate::subset::{
    FontSubsetter, SubsetRequest, TTFCFP_APPLE_PLATFORMID, TTFCFP_DELTA, TTFCFP_DONT_CARE,
    TTFCFP_FLAGS_COMPRESS, TTFCFP_FLAGS_GLYPHLIST, TTFCFP_FLAGS_SUBSET, TTFCFP_FLAGS_TTC,
    TTFCFP_ISO_PLATFORMID, TTFCFP_LANG_KEEP_ALL, TTFCFP_MS_PLATFORMID, TTFCFP_STD_MAC_CHAR_SET,
    TTFCFP_SUBSET, TTFCFP_SUBSET1, TTFCFP_SYMBOL_CHAR_SET, TTFCFP_UNICODE_CHAR_SET,
    TTFCFP_UNICODE_PLATFORMID, TTFMFP_DELTA, TTFMFP_SUBSET, TTFMFP_SUBSET1,
};

/// One entry-point call and what it returned.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Which call this was, with its input sizes.
    pub label: String,
    /// The foreign code's return value; 0 is success.
    pub status: u32,
    /// Bytes in the returned buffer.
    pub output_len: usize,
}

impl std::fmt::Display for CallRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[+] {} ---> {} ({} bytes)",
            self.label, self.status, self.output_len
        )
    }
}

/// Folds a sample into the RNG seed for its iteration.
#[must_use]
pub fn sample_seed(data: &[u8]) -> u64 {
    fxhash::hash64(data)
}

/// Number of faces in a font-collection header, if `data` is one.
///
/// Reads the single byte at offset 11 of the `ttcf` header and coerces 0 to 1.
/// That byte is really the low byte of a 32-bit big-endian count, so collections
/// beyond 255 faces are misread; the behavior is kept as-is because the subsetter
/// has only ever been driven this way.
#[must_use]
pub fn collection_face_count(data: &[u8]) -> Option<u32> {
    if data.len() >= 12 && &data[0..4] == b"ttcf" {
        let count = u32::from(data[11]);
        Some(count.max(1))
    } else {
        None
    }
}

/// A keep list of random characters/glyphs, sized by magnitude class.
///
/// Lengths land in 1..=10, 1..=100, 1..=1000 or 1..=10000 with equal probability;
/// entries stay below twice the length.
#[must_use]
pub fn generate_keep_list(rng: &mut Rng) -> Vec<u16> {
    let limit = match rng.u32(..) & 3 {
        0 => 10,
        1 => 100,
        2 => 1000,
        _ => 10000,
    };
    let len = 1 + (rng.u32(..) % limit) as usize;
    (0..len)
        .map(|_| (rng.u32(..) as usize % (len * 2)) as u16)
        .collect()
}

/// Derives one `CreateFontPackage` parameter set from the sample.
#[must_use]
pub fn derive_request(rng: &mut Rng, data: &[u8], format: u16) -> SubsetRequest {
    let mut flags = TTFCFP_FLAGS_SUBSET;
    if rng.bool() {
        flags |= TTFCFP_FLAGS_COMPRESS;
    }
    if rng.bool() {
        flags |= TTFCFP_FLAGS_GLYPHLIST;
    }

    let mut ttc_index = 0u16;
    if let Some(count) = collection_face_count(data) {
        flags |= TTFCFP_FLAGS_TTC;
        ttc_index = (rng.u32(..) % count) as u16;
    }

    let (platform, encoding) = match rng.u32(..) & 3 {
        0 => (TTFCFP_UNICODE_PLATFORMID, TTFCFP_DONT_CARE),
        1 => {
            let encoding = if rng.bool() {
                TTFCFP_STD_MAC_CHAR_SET
            } else {
                TTFCFP_DONT_CARE
            };
            (TTFCFP_APPLE_PLATFORMID, encoding)
        }
        2 => (TTFCFP_ISO_PLATFORMID, TTFCFP_DONT_CARE),
        _ => {
            let encoding = match rng.u32(..) & 3 {
                0 => TTFCFP_SYMBOL_CHAR_SET,
                1 => TTFCFP_UNICODE_CHAR_SET,
                _ => TTFCFP_DONT_CARE,
            };
            (TTFCFP_MS_PLATFORMID, encoding)
        }
    };

    SubsetRequest {
        flags,
        ttc_index,
        format,
        language: TTFCFP_LANG_KEEP_ALL,
        platform,
        encoding,
        keep_list: generate_keep_list(rng),
    }
}

/// Runs one fuzzing iteration over `data`: a subset/merge pair, or a subset1 font
/// carried through a short chain of delta merges.
///
/// Returns the record of every call made, in order.
///
/// # Safety
///
/// Executes foreign code in-process; the sample decides what that code does. Run
/// under a supervisor that can kill and restart the process.
pub unsafe fn process_sample(subsetter: &FontSubsetter, data: &[u8]) -> Vec<CallRecord> {
    let mut rng = Rng::with_seed(sample_seed(data));
    let mut records = Vec::new();

    if rng.bool() {
        let request = derive_request(&mut rng, data, TTFCFP_SUBSET);
        let package = subsetter.create(data, &request);
        push(
            &mut records,
            format!("CreateFontPackage([ {} bytes ], TTFCFP_SUBSET)", data.len()),
            package.status,
            package.output.len(),
        );

        if package.is_success() {
            let merged = subsetter.merge(None, &package.output, TTFMFP_SUBSET);
            push(
                &mut records,
                format!(
                    "MergeFontPackage(NULL, [ {} bytes ], TTFMFP_SUBSET)",
                    package.output.len()
                ),
                merged.status,
                merged.output.len(),
            );
        }
    } else {
        let request = derive_request(&mut rng, data, TTFCFP_SUBSET1);
        let package = subsetter.create(data, &request);
        push(
            &mut records,
            format!("CreateFontPackage([ {} bytes ], TTFCFP_SUBSET1)", data.len()),
            package.status,
            package.output.len(),
        );

        if package.is_success() {
            let expanded = subsetter.merge(None, &package.output, TTFMFP_SUBSET1);
            push(
                &mut records,
                format!(
                    "MergeFontPackage(NULL, [ {} bytes ], TTFMFP_SUBSET1)",
                    package.output.len()
                ),
                expanded.status,
                expanded.output.len(),
            );

            let mut working_font = expanded.output;
            let merges = 1 + (rng.u32(..) % 5);
            for _ in 0..merges {
                let delta_request = derive_request(&mut rng, data, TTFCFP_DELTA);
                let delta = subsetter.create(data, &delta_request);
                push(
                    &mut records,
                    format!("CreateFontPackage([ {} bytes ], TTFCFP_DELTA)", data.len()),
                    delta.status,
                    delta.output.len(),
                );

                if delta.is_success() {
                    let next = subsetter.merge(Some(&working_font), &delta.output, TTFMFP_DELTA);
                    push(
                        &mut records,
                        format!(
                            "MergeFontPackage([ {} bytes ], [ {} bytes ], TTFMFP_DELTA)",
                            working_font.len(),
                            delta.output.len()
                        ),
                        next.status,
                        next.output.len(),
                    );
                    if next.is_success() {
                        working_font = next.output;
                    }
                }
            }
        }
    }

    records
}

fn push(records: &mut Vec<CallRecord>, label: String, status: u32, output_len: usize) {
    let record = CallRecord {
        label,
        status,
        output_len,
    };
    info!("{}", record);
    records.push(record);
}
