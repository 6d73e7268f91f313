#![no_main]

use libfuzzer_sys::fuzz_target;
use winsub::{
    harness::sample_seed,
    mutate::{default_strategies, Mutator},
    sfnt::SfntFont,
};

fuzz_target!(|data: &[u8]| {
    let Ok(mut font) = SfntFont::parse(data) else {
        return;
    };

    let mut mutator = Mutator::new(sample_seed(data));
    mutator.mutate_font(&default_strategies(), &mut font);

    // Whatever the mutator did to the tables, the rewritten container must
    // stay parsable and stable.
    let bytes = font.to_bytes();
    let reparsed = SfntFont::parse(&bytes).expect("rewritten font must parse");
    assert_eq!(reparsed.version, font.version);
    assert_eq!(reparsed.tables.len(), font.tables.len());
});
