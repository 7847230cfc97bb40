//! Property-Based Tests for the Parity Engines
//!
//! Systematically verifies engine correctness across random group contents
//! and erasure patterns.
//!
//! # Test Properties
//!
//! 1. **Row/diagonal invariants**: computed double parity always XORs to
//!    zero along rows and non-omitted diagonals.
//! 2. **Fault tolerance**: any loss within tolerance reconstructs the group
//!    bytewise-identically.
//! 3. **Idempotence**: recovery of a complete group never mutates it.
//! 4. **Determinism**: identical `(D, P)` and data produce identical parity.

#![cfg(test)]

use proptest::prelude::*;

use crate::block::RainBlock;
use crate::layout::{LayoutDescriptor, ParityScheme};
use crate::parity::double::DoubleParityEngine;
use crate::parity::reed_solomon::ReedSolomonEngine;
use crate::parity::{xor_into, ParityEngine};

const BLOCK: u32 = 64;

// =============================================================================
// Strategies
// =============================================================================

/// Data-stripe counts whose diagonal modulus `D + 1` is prime, the regime
/// in which double parity tolerates arbitrary double losses.
fn dp_data_count_strategy() -> impl Strategy<Value = u16> {
    prop_oneof![Just(4u16), Just(6u16)]
}

/// Reed-Solomon `(D, P)` configurations.
fn rs_config_strategy() -> impl Strategy<Value = (u16, u16)> {
    (2u16..=6, 1u16..=4).prop_filter("minimum stripe count", |(d, p)| d + p >= 5)
}

fn group_data_strategy(total_blocks: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(
        prop::collection::vec(any::<u8>(), BLOCK as usize),
        total_blocks,
    )
}

fn build_group(engine: &dyn ParityEngine, data: &[Vec<u8>]) -> Vec<RainBlock> {
    let mut blocks: Vec<RainBlock> = data
        .iter()
        .map(|content| {
            let mut block = RainBlock::new(BLOCK).unwrap();
            block.write(content, 0).unwrap();
            block
        })
        .collect();
    engine.compute_parity(&mut blocks).unwrap();
    blocks
}

fn snapshot(blocks: &[RainBlock]) -> Vec<Vec<u8>> {
    blocks.iter().map(|b| b.data().to_vec()).collect()
}

// =============================================================================
// Double-Parity Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: every row and every non-omitted diagonal XORs to zero.
    #[test]
    fn prop_dp_parity_invariants(
        d in dp_data_count_strategy(),
        seed in any::<u64>(),
    ) {
        let layout = LayoutDescriptor::new(BLOCK, d, 2, ParityScheme::DoubleParity).unwrap();
        let engine = DoubleParityEngine::new(&layout).unwrap();
        let n = layout.total_count() as usize;
        let d = d as usize;

        let data: Vec<Vec<u8>> = (0..n * d)
            .map(|i| {
                (0..BLOCK as usize)
                    .map(|j| (seed as usize + i * 257 + j * 31) as u8)
                    .collect()
            })
            .collect();
        let blocks = build_group(&engine, &data);

        for row in 0..d {
            let mut acc = vec![0u8; BLOCK as usize];
            for col in 0..=d {
                xor_into(&mut acc, blocks[row * n + col].data());
            }
            prop_assert!(acc.iter().all(|&b| b == 0), "row {} parity broken", row);
        }

        let dp_indices = engine.double_parity_indices();
        for (k, &dp) in dp_indices.iter().enumerate() {
            let mut acc = blocks[dp].data().to_vec();
            for row in 0..d {
                let col = (k + row) % (d + 1);
                xor_into(&mut acc, blocks[row * n + col].data());
            }
            prop_assert!(acc.iter().all(|&b| b == 0), "diagonal {} parity broken", k);
        }
    }

    /// Property: any two erased blocks are reconstructed bytewise.
    #[test]
    fn prop_dp_double_erasure_recovers(
        d in dp_data_count_strategy(),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 2),
        seed in any::<u64>(),
    ) {
        let layout = LayoutDescriptor::new(BLOCK, d, 2, ParityScheme::DoubleParity).unwrap();
        let engine = DoubleParityEngine::new(&layout).unwrap();
        let total = layout.total_blocks_per_group();

        let data: Vec<Vec<u8>> = (0..total)
            .map(|i| {
                (0..BLOCK as usize)
                    .map(|j| (seed as usize ^ (i * 101 + j * 7)) as u8)
                    .collect()
            })
            .collect();

        let mut blocks = build_group(&engine, &data);
        let before = snapshot(&blocks);

        let mut present = vec![true; total];
        for pick in &picks {
            let victim = pick.index(total);
            blocks[victim].data_mut().fill(0);
            present[victim] = false;
        }

        engine.recover(&mut blocks, &present).unwrap();
        prop_assert_eq!(snapshot(&blocks), before);
    }

    /// Property: recovery of a complete group is the identity.
    #[test]
    fn prop_dp_recover_idempotent(
        d in dp_data_count_strategy(),
        seed in any::<u64>(),
    ) {
        let layout = LayoutDescriptor::new(BLOCK, d, 2, ParityScheme::DoubleParity).unwrap();
        let engine = DoubleParityEngine::new(&layout).unwrap();
        let total = layout.total_blocks_per_group();

        let data: Vec<Vec<u8>> = (0..total)
            .map(|i| {
                (0..BLOCK as usize)
                    .map(|j| (seed as usize + i + j) as u8)
                    .collect()
            })
            .collect();

        let mut blocks = build_group(&engine, &data);
        let before = snapshot(&blocks);

        let recovered = engine.recover(&mut blocks, &vec![true; total]).unwrap();
        prop_assert!(recovered.is_empty());
        prop_assert_eq!(snapshot(&blocks), before);
    }
}

// =============================================================================
// Reed-Solomon Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: erasing up to P whole columns reconstructs bytewise.
    #[test]
    fn prop_rs_column_erasures_recover(
        (d, p) in rs_config_strategy(),
        column_picks in prop::collection::vec(any::<prop::sample::Index>(), 0..=4),
        data in group_data_strategy(1),
    ) {
        let layout = LayoutDescriptor::new(BLOCK, d, p, ParityScheme::ReedSolomon).unwrap();
        let engine = ReedSolomonEngine::new(&layout).unwrap();
        let n = layout.total_count() as usize;
        let total = layout.total_blocks_per_group();
        let seed = &data[0];

        let contents: Vec<Vec<u8>> = (0..total)
            .map(|i| seed.iter().map(|&b| b.wrapping_add(i as u8)).collect())
            .collect();

        let mut blocks = build_group(&engine, &contents);
        let before = snapshot(&blocks);

        // Pick at most P distinct columns to erase entirely.
        let mut columns: Vec<usize> = column_picks.iter().map(|ix| ix.index(n)).collect();
        columns.sort_unstable();
        columns.dedup();
        columns.truncate(p as usize);

        let mut present = vec![true; total];
        for row in 0..d as usize {
            for &col in &columns {
                let i = row * n + col;
                blocks[i].data_mut().fill(0);
                present[i] = false;
            }
        }

        engine.recover(&mut blocks, &present).unwrap();
        prop_assert_eq!(snapshot(&blocks), before);
    }

    /// Property: the codec is deterministic for a fixed configuration.
    #[test]
    fn prop_rs_deterministic(
        (d, p) in rs_config_strategy(),
        data in group_data_strategy(1),
    ) {
        let layout = LayoutDescriptor::new(BLOCK, d, p, ParityScheme::ReedSolomon).unwrap();
        let total = layout.total_blocks_per_group();
        let seed = &data[0];

        let contents: Vec<Vec<u8>> = (0..total)
            .map(|i| seed.iter().map(|&b| b.wrapping_mul(i as u8 | 1)).collect())
            .collect();

        let engine_a = ReedSolomonEngine::new(&layout).unwrap();
        let engine_b = ReedSolomonEngine::new(&layout).unwrap();

        let blocks_a = build_group(&engine_a, &contents);
        let blocks_b = build_group(&engine_b, &contents);
        prop_assert_eq!(snapshot(&blocks_a), snapshot(&blocks_b));
    }
}
