//! `winsub info` — dump an image's layout without loading it.

use std::path::Path;

use anyhow::Context;
use winsub::image::{ImageSummary, MappedFile};

pub fn run(dll: &Path) -> anyhow::Result<()> {
    let image = MappedFile::open(dll)
        .with_context(|| format!("unable to read the {} image", dll.display()))?;
    let summary = ImageSummary::parse(&image)
        .with_context(|| format!("unable to parse the {} image", dll.display()))?;

    println!("image base: {:#010x}", summary.preferred_base);
    println!("image size: {:#x}", summary.size_of_image);
    println!(
        "format:     {}{}",
        if summary.is_64 { "PE32+" } else { "PE32" },
        if summary.is_dll { " (DLL)" } else { "" }
    );

    println!("sections -");
    for section in &summary.sections {
        println!(
            "\t{:8} rva {:#08x} vsize {:#08x} raw {:#08x} {}{}{}",
            section.name,
            section.rva,
            section.virtual_size,
            section.raw_size,
            if section.is_code() { "c" } else { "-" },
            if section.is_writable() { "w" } else { "-" },
            if section.is_executable() { "x" } else { "-" },
        );
    }

    println!("imports -");
    for import in &summary.imports {
        if import.name.is_empty() {
            println!(
                "\t{:16} ordinal {:5} @ {:#08x}",
                import.module, import.ordinal, import.slot_rva
            );
        } else {
            println!(
                "\t{:16} {:32} @ {:#08x}",
                import.module, import.name, import.slot_rva
            );
        }
    }

    println!("exports -");
    for export in &summary.exports {
        println!("\t{:32} @ {:#08x}", export.name, export.rva);
    }

    Ok(())
}
