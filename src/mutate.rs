//! Ratio-driven byte mutators.
//!
//! Five independent transforms, each parameterized by a mutation ratio — the fraction
//! of the buffer it is allowed to disturb. A mutation round picks a random subset of
//! the configured strategies, draws each one a ratio from its range, scales the
//! ratios by a random partition of the unit interval so the round's total stays
//! bounded, and applies the survivors in sequence. The transforms share no state;
//! order only matters in that later ones may overwrite earlier output.

use fastrand::Rng;

use crate::sfnt::SfntFont;

/// The available transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Flip individual bits at random offsets.
    BitFlip,
    /// Replace whole bytes with random values.
    ByteFlip,
    /// Copy random chunks of the buffer over other offsets.
    ChunkSpew,
    /// Stamp boundary integers (0, 0x7F, 0x80, 0xFF, ...) over random offsets.
    SpecialInts,
    /// Add or subtract small operands from 1/2/4-byte units in either endianness.
    AddSubBinary,
}

/// One transform with the ratio range it may draw from.
#[derive(Debug, Clone, Copy)]
pub struct MutationStrategy {
    /// Which transform to run.
    pub kind: MutationKind,
    /// Smallest fraction of the buffer the transform may disturb.
    pub min_ratio: f64,
    /// Largest fraction of the buffer the transform may disturb.
    pub max_ratio: f64,
}

/// The stock strategy set used for font tables.
#[must_use]
pub fn default_strategies() -> Vec<MutationStrategy> {
    vec![
        MutationStrategy {
            kind: MutationKind::BitFlip,
            min_ratio: 0.0001,
            max_ratio: 0.004,
        },
        MutationStrategy {
            kind: MutationKind::ByteFlip,
            min_ratio: 0.0001,
            max_ratio: 0.004,
        },
        MutationStrategy {
            kind: MutationKind::ChunkSpew,
            min_ratio: 0.0001,
            max_ratio: 0.002,
        },
        MutationStrategy {
            kind: MutationKind::SpecialInts,
            min_ratio: 0.0001,
            max_ratio: 0.002,
        },
        MutationStrategy {
            kind: MutationKind::AddSubBinary,
            min_ratio: 0.0001,
            max_ratio: 0.002,
        },
    ]
}

/// Boundary integers stamped by [`MutationKind::SpecialInts`], in both widths'
/// natural byte orders.
const SPECIAL_INTS: &[&[u8]] = &[
    &[0x00],
    &[0x7F],
    &[0x80],
    &[0xFF],
    &[0x00, 0x00],
    &[0x7F, 0xFF],
    &[0xFF, 0xFF],
    &[0x80, 0x00],
    &[0x40, 0x00],
    &[0xC0, 0x00],
    &[0x00, 0x00, 0x00, 0x00],
    &[0x7F, 0xFF, 0xFF, 0xFF],
    &[0x80, 0x00, 0x00, 0x00],
    &[0x40, 0x00, 0x00, 0x00],
    &[0xC0, 0x00, 0x00, 0x00],
    &[0xFF, 0xFF, 0xFF, 0xFF],
];

const MAX_CHUNK_SPEW: usize = 64;

/// Applies mutation strategies to byte buffers and sfnt tables.
pub struct Mutator {
    rng: Rng,
}

impl Mutator {
    /// A mutator with a fixed seed; the same seed replays the same mutations.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Mutator {
            rng: Rng::with_seed(seed),
        }
    }

    /// Runs one mutation round over `buffer` and returns the number of changed
    /// bytes (bit flips count one per flip).
    pub fn mutate(&mut self, strategies: &[MutationStrategy], buffer: &mut [u8]) -> usize {
        if buffer.is_empty() || strategies.is_empty() {
            return 0;
        }

        // Randomly choose the strategies used for this round.
        let mut chosen = strategies.to_vec();
        let keep = (self.rng.u32(..) as usize % chosen.len()) + 1;
        self.rng.shuffle(&mut chosen);
        chosen.truncate(keep);

        // Draw each strategy's ratio from its range.
        let mut ratios: Vec<f64> = chosen
            .iter()
            .map(|s| s.min_ratio + self.rng.f64() % (s.max_ratio - s.min_ratio + 1e-10))
            .collect();

        // Scale the ratios by a random partition of the unit interval so the
        // round's combined impact stays bounded.
        let mut division: Vec<f64> = (1..chosen.len()).map(|_| self.rng.f64()).collect();
        division.push(0.0);
        division.push(1.0);
        division.sort_by(|a, b| a.total_cmp(b));
        for i in 1..division.len() {
            ratios[i - 1] *= division[i] - division[i - 1];
        }

        let mut changed = 0;
        for (strategy, ratio) in chosen.iter().zip(ratios) {
            changed += self.apply(strategy.kind, ratio, buffer);
        }
        changed
    }

    /// Applies a single transform at an explicit ratio.
    pub fn apply(&mut self, kind: MutationKind, ratio: f64, buffer: &mut [u8]) -> usize {
        if buffer.is_empty() || ratio <= 0.0 {
            return 0;
        }
        match kind {
            MutationKind::BitFlip => self.bit_flip(ratio, buffer),
            MutationKind::ByteFlip => self.byte_flip(ratio, buffer),
            MutationKind::ChunkSpew => self.chunk_spew(ratio, buffer),
            MutationKind::SpecialInts => self.special_ints(ratio, buffer),
            MutationKind::AddSubBinary => self.add_sub_binary(ratio, buffer),
        }
    }

    /// Mutates every table of an sfnt font in place and returns total changed
    /// bytes. Structural fields (offsets, checksums, search fields) are not
    /// touched here; serialization regenerates them.
    pub fn mutate_font(&mut self, strategies: &[MutationStrategy], font: &mut SfntFont) -> usize {
        let mut changed = 0;
        for table in &mut font.tables {
            if table.data.is_empty() {
                continue;
            }
            // Half of the tables per round keeps most of the font well-formed.
            if self.rng.bool() {
                continue;
            }
            changed += self.mutate(strategies, &mut table.data);
        }
        changed
    }

    fn bit_flip(&mut self, ratio: f64, buffer: &mut [u8]) -> usize {
        let flips = (buffer.len() as f64 * ratio * 8.0) as usize;
        for _ in 0..flips {
            let offset = self.rng.usize(0..buffer.len());
            let bit = self.rng.u32(..) & 7;
            buffer[offset] ^= 1u8 << bit;
        }
        flips
    }

    fn byte_flip(&mut self, ratio: f64, buffer: &mut [u8]) -> usize {
        let count = (buffer.len() as f64 * ratio) as usize;
        for _ in 0..count {
            let offset = self.rng.usize(0..buffer.len());
            buffer[offset] = self.rng.u8(..);
        }
        count
    }

    fn chunk_spew(&mut self, ratio: f64, buffer: &mut [u8]) -> usize {
        let target = (buffer.len() as f64 * ratio) as usize;
        let mut moved = 0;
        while moved < target {
            let upper = MAX_CHUNK_SPEW
                .min(buffer.len() / 2)
                .min(target - moved + 1);
            if upper <= 1 {
                break;
            }
            let size = self.rng.usize(0..upper);
            if size == 0 {
                continue;
            }
            let src = self.rng.usize(0..buffer.len() - size);
            let dst = self.rng.usize(0..buffer.len() - size);
            buffer.copy_within(src..src + size, dst);
            moved += size;
        }
        moved
    }

    fn special_ints(&mut self, ratio: f64, buffer: &mut [u8]) -> usize {
        let target = (buffer.len() as f64 * ratio) as usize;
        let mut stamped = 0;
        while stamped < target {
            let value = SPECIAL_INTS[self.rng.usize(0..SPECIAL_INTS.len())];
            if buffer.len() < value.len() {
                break;
            }
            let offset = self.rng.usize(0..buffer.len() - value.len() + 1);
            buffer[offset..offset + value.len()].copy_from_slice(value);
            stamped += value.len();
        }
        stamped
    }

    fn add_sub_binary(&mut self, ratio: f64, buffer: &mut [u8]) -> usize {
        let target = (buffer.len() as f64 * ratio) as usize;
        let mut changed = 0;
        while changed < target {
            let spec = self.rng.u32(..);
            let big_endian = spec & 1 == 1;
            let addition = spec & 2 == 2;
            let (width, max_value) = match (spec >> 2) % 3 {
                0 => (1usize, u32::from(u8::MAX)),
                1 => (2, u32::from(u16::MAX)),
                _ => (4, u32::MAX),
            };

            if buffer.len() < width {
                continue;
            }
            let offset = self.rng.usize(0..buffer.len() - width + 1);

            let mut value = 0u32;
            for i in 0..width {
                let shift = if big_endian { 8 * (width - 1 - i) } else { 8 * i };
                value |= u32::from(buffer[offset + i]) << shift;
            }

            let op = match width {
                1 => 1 + self.rng.u32(..) % u32::from(u8::MAX),
                _ => {
                    if value > u32::from(u8::MAX) && self.rng.bool() {
                        1 + self.rng.u32(..) % u32::from(u16::MAX)
                    } else {
                        1 + self.rng.u32(..) % u32::from(u8::MAX)
                    }
                }
            };

            // Saturating arithmetic at the unit's own width.
            let value = if addition {
                if max_value - value < op {
                    max_value
                } else {
                    value + op
                }
            } else if value < op {
                0
            } else {
                value - op
            };

            let mut delta = 0;
            for i in 0..width {
                let shift = if big_endian { 8 * (width - 1 - i) } else { 8 * i };
                let byte = (value >> shift) as u8;
                if buffer[offset + i] != byte {
                    buffer[offset + i] = byte;
                    delta += 1;
                }
            }

            // A round that changed nothing still has to make progress eventually;
            // a one-byte buffer saturated at 0 or MAX can stall here.
            if delta == 0 && buffer.len() < 2 {
                break;
            }
            changed += delta;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(kind: MutationKind) -> MutationStrategy {
        MutationStrategy {
            kind,
            min_ratio: 0.01,
            max_ratio: 0.05,
        }
    }

    #[test]
    fn test_zero_ratio_changes_nothing() {
        let mut mutator = Mutator::new(7);
        let original: Vec<u8> = (0..=255).collect();
        for kind in [
            MutationKind::BitFlip,
            MutationKind::ByteFlip,
            MutationKind::ChunkSpew,
            MutationKind::SpecialInts,
            MutationKind::AddSubBinary,
        ] {
            let mut buffer = original.clone();
            let changed = mutator.apply(kind, 0.0, &mut buffer);
            assert_eq!(changed, 0);
            assert_eq!(buffer, original);
        }
    }

    #[test]
    fn test_empty_buffer_is_a_no_op() {
        let mut mutator = Mutator::new(7);
        let mut empty: Vec<u8> = Vec::new();
        assert_eq!(mutator.mutate(&default_strategies(), &mut empty), 0);
        assert_eq!(mutator.apply(MutationKind::BitFlip, 0.5, &mut empty), 0);
    }

    #[test]
    fn test_same_seed_replays_the_same_mutations() {
        let original: Vec<u8> = (0u32..4096).map(|i| (i * 31 % 251) as u8).collect();

        let mut first = original.clone();
        let mut second = original.clone();
        Mutator::new(0xFEED).mutate(&default_strategies(), &mut first);
        Mutator::new(0xFEED).mutate(&default_strategies(), &mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn test_bit_flip_count_matches_ratio() {
        let mut mutator = Mutator::new(3);
        let mut buffer = vec![0u8; 1000];
        // ratio 0.01 over 1000 bytes = 80 bit flips reported.
        let changed = mutator.apply(MutationKind::BitFlip, 0.01, &mut buffer);
        assert_eq!(changed, 80);
        assert!(buffer.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_special_ints_only_stamps_table_values() {
        let mut mutator = Mutator::new(11);
        let mut buffer = vec![0xA5u8; 512];
        let stamped = mutator.apply(MutationKind::SpecialInts, 0.05, &mut buffer);
        assert!(stamped >= (512.0 * 0.05) as usize);
        // Everything that changed must now hold a byte from one of the patterns.
        for &b in &buffer {
            assert!(
                b == 0xA5
                    || SPECIAL_INTS
                        .iter()
                        .any(|pattern| pattern.contains(&b)),
                "unexpected byte {:#x}",
                b
            );
        }
    }

    #[test]
    fn test_chunk_spew_keeps_length_and_content_set() {
        let mut mutator = Mutator::new(13);
        let original: Vec<u8> = (0u32..2048).map(|i| (i % 256) as u8).collect();
        let mut buffer = original.clone();
        mutator.apply(MutationKind::ChunkSpew, 0.02, &mut buffer);
        assert_eq!(buffer.len(), original.len());
        // Chunk copies only move existing bytes around.
        for &b in &buffer {
            assert!(original.contains(&b));
        }
    }

    #[test]
    fn test_tiny_buffers_terminate() {
        let mut mutator = Mutator::new(17);
        for len in 0..4 {
            let mut buffer = vec![0xFFu8; len];
            mutator.apply(MutationKind::ChunkSpew, 1.0, &mut buffer);
            mutator.apply(MutationKind::AddSubBinary, 1.0, &mut buffer);
            mutator.apply(MutationKind::SpecialInts, 1.0, &mut buffer);
        }
    }

    #[test]
    fn test_mutation_round_respects_strategy_subset() {
        // A round over a single-strategy list can only ever run that strategy.
        let mut mutator = Mutator::new(19);
        let mut buffer: Vec<u8> = (0..=255).collect();
        let changed = mutator.mutate(&[strategy(MutationKind::ByteFlip)], &mut buffer);
        assert_eq!(buffer.len(), 256);
        // Changed-byte accounting for byte flips is the draw count.
        assert!(changed <= (256.0 * 0.05) as usize + 1);
    }
}
