//! `winsub run` — load the DLL and process one sample.

use std::path::Path;

use anyhow::{bail, Context};
use winsub::{
    harness,
    image::MappedFile,
    subset::FontSubsetter,
    LoadConfig, Loader,
};

pub fn run(dll: &Path, font: &Path, base: Option<&str>) -> anyhow::Result<()> {
    let mut config = LoadConfig::new();
    if let Some(base) = base {
        config = config.with_base_address(parse_base(base)?);
    }

    let image = MappedFile::open(dll)
        .with_context(|| format!("unable to read the {} image", dll.display()))?;
    let library = Loader::new(config)
        .load(&image)
        .with_context(|| format!("unable to load the {} image", dll.display()))?;
    log::info!(
        "loaded {} at {:#010x} (delta {:#x})",
        dll.display(),
        library.actual_base(),
        library.load_delta()
    );
    for (name, address) in library.exports().iter() {
        log::info!("located {} at {:#010x}", name, address);
    }

    let font_data = std::fs::read(font)
        .with_context(|| format!("unable to read the {} input file", font.display()))?;

    // From here on the foreign code is in charge; a hostile sample can hang or
    // crash the process, which the outer fuzzing supervisor handles.
    let subsetter = unsafe { FontSubsetter::from_library(&library)? };
    let records = unsafe { harness::process_sample(&subsetter, &font_data) };
    for record in &records {
        println!("{}", record);
    }

    Ok(())
}

/// Parses the load-address override: hex with or without a 0x prefix, 64 KiB
/// aligned.
fn parse_base(text: &str) -> anyhow::Result<u64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    let Ok(base) = u64::from_str_radix(digits, 16) else {
        bail!("invalid base address {}", text);
    };
    if base & 0xFFFF != 0 {
        bail!("base address {} is not aligned to a 64 KiB boundary", text);
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base_accepts_aligned_hex() {
        assert_eq!(parse_base("20000000").unwrap(), 0x2000_0000);
        assert_eq!(parse_base("0x20000000").unwrap(), 0x2000_0000);
        assert_eq!(parse_base("0X10000").unwrap(), 0x1_0000);
    }

    #[test]
    fn test_parse_base_rejects_misalignment_and_garbage() {
        assert!(parse_base("0x20000800").is_err());
        assert!(parse_base("0x1234").is_err());
        assert!(parse_base("zzz").is_err());
        assert!(parse_base("").is_err());
    }
}
