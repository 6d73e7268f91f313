//! `winsub mutate` — sfnt-aware mutation of one font file.

use std::path::Path;

use anyhow::Context;
use winsub::{
    harness::sample_seed,
    mutate::{default_strategies, Mutator},
    sfnt::SfntFont,
};

pub fn run(input: &Path, output: &Path, seed: Option<u64>) -> anyhow::Result<()> {
    let data = std::fs::read(input)
        .with_context(|| format!("unable to read the {} input file", input.display()))?;
    let mut font = SfntFont::parse(&data)
        .with_context(|| format!("unable to load {} as a TTF/OTF font", input.display()))?;

    let seed = seed.unwrap_or_else(|| sample_seed(&data));
    let mut mutator = Mutator::new(seed);
    let changed = mutator.mutate_font(&default_strategies(), &mut font);
    log::info!("seed {:#x} changed {} table bytes", seed, changed);

    font.to_file(output)
        .with_context(|| format!("unable to save the output font to {}", output.display()))?;
    println!(
        "[+] Font successfully mutated and saved in \"{}\".",
        output.display()
    );

    Ok(())
}
