//! Double-parity engine
//!
//! Classic RAID-DP over a square group: `D` rows of `D` data blocks, a row
//! parity column `P` and a diagonal parity column `DP`:
//!
//! ```text
//! row 0:   d d d d | P DP
//! row 1:   d d d d | P DP
//! ...
//! row D-1: d d d d | P DP
//! ```
//!
//! `P[r]` is the XOR of the data blocks of row `r`. Diagonals run through
//! the `D x (D+1)` subgrid formed by the data columns plus the `P` column:
//! diagonal `k` holds the cells `(row, (k + row) mod (D+1))`, and `DP[k]`
//! is the XOR of diagonal `k`'s cells. The diagonal through cell `(0, D)`
//! has no DP block and is deliberately omitted; with `D + 1` prime the
//! construction tolerates any two simultaneous block losses.

use tracing::debug;

use crate::block::RainBlock;
use crate::error::{Error, Result};
use crate::layout::{LayoutDescriptor, ParityScheme};
use crate::parity::{check_group_shape, xor_into, ParityEngine};

// =============================================================================
// DoubleParityEngine
// =============================================================================

/// Row + diagonal parity over a square block group.
pub struct DoubleParityEngine {
    /// Number of data columns (D)
    data_count: usize,
    /// Number of columns including parity (N = D + 2)
    total_count: usize,
    /// Block size in bytes
    block_size: usize,
}

impl DoubleParityEngine {
    /// Build the engine; the layout must carry exactly two parity stripes.
    pub fn new(layout: &LayoutDescriptor) -> Result<Self> {
        if layout.parity_count != 2 {
            return Err(Error::UnsupportedLayout(format!(
                "double parity requires 2 parity stripes, layout has {}",
                layout.parity_count
            )));
        }

        Ok(Self {
            data_count: layout.data_count as usize,
            total_count: layout.total_count() as usize,
            block_size: layout.block_size as usize,
        })
    }

    /// Total number of blocks in one group.
    fn total_blocks(&self) -> usize {
        self.total_count * self.data_count
    }

    // =========================================================================
    // Index helpers
    // =========================================================================

    /// Indices of the row-parity blocks within the flat group.
    pub fn simple_parity_indices(&self) -> Vec<usize> {
        (0..self.data_count)
            .map(|r| r * self.total_count + self.data_count)
            .collect()
    }

    /// Indices of the diagonal-parity blocks within the flat group.
    pub fn double_parity_indices(&self) -> Vec<usize> {
        (0..self.data_count)
            .map(|r| r * self.total_count + self.data_count + 1)
            .collect()
    }

    /// Diagonal index of a block: its DP row for DP-column blocks,
    /// otherwise `(col - row) mod (D + 1)` over the data + P subgrid.
    fn diagonal_of(&self, block: usize) -> usize {
        let row = block / self.total_count;
        let col = block % self.total_count;
        let modulo = self.data_count + 1;

        if col == self.data_count + 1 {
            row
        } else {
            (col + modulo - row % modulo) % modulo
        }
    }

    /// Cells of diagonal `k` inside the data + P subgrid, one per row.
    fn diagonal_cells(&self, k: usize) -> Vec<usize> {
        let modulo = self.data_count + 1;
        (0..self.data_count)
            .map(|row| row * self.total_count + (k + row) % modulo)
            .collect()
    }

    /// Full diagonal stripe of a block: its subgrid cells plus the DP
    /// block. Empty for blocks on the omitted diagonal.
    fn diagonal_stripe(&self, block: usize) -> Vec<usize> {
        let k = self.diagonal_of(block);
        if k == self.data_count {
            return Vec::new();
        }

        let mut stripe = self.diagonal_cells(k);
        stripe.push(k * self.total_count + self.data_count + 1);
        stripe
    }

    /// Horizontal stripe of a block: every cell of its row except the DP
    /// column. Empty for DP-column blocks, which have no row parity.
    fn horizontal_stripe(&self, block: usize) -> Vec<usize> {
        let base = (block / self.total_count) * self.total_count;

        if block == base + self.data_count + 1 {
            return Vec::new();
        }

        (0..self.total_count - 1).map(|c| base + c).collect()
    }

    /// True when the stripe is usable for recovering `block`: non-empty and
    /// with `block` its only missing member.
    fn stripe_usable(stripe: &[usize], block: usize, present: &[bool]) -> bool {
        !stripe.is_empty()
            && stripe
                .iter()
                .all(|&cell| cell == block || present[cell])
    }

    /// Rebuild `block` as the XOR of the other members of `stripe`.
    fn reduce_from(&self, blocks: &mut [RainBlock], stripe: &[usize], block: usize) {
        let mut acc = vec![0u8; self.block_size];

        for &cell in stripe {
            if cell != block {
                xor_into(&mut acc, blocks[cell].data());
            }
        }

        blocks[block].data_mut().copy_from_slice(&acc);
    }
}

impl ParityEngine for DoubleParityEngine {
    fn scheme(&self) -> ParityScheme {
        ParityScheme::DoubleParity
    }

    fn compute_parity(&self, blocks: &mut [RainBlock]) -> Result<()> {
        check_group_shape(blocks, None, self.total_blocks())?;

        let n = self.total_count;
        let d = self.data_count;

        // Row parity first; the diagonals run through the P column.
        for row in 0..d {
            let mut acc = vec![0u8; self.block_size];
            for col in 0..d {
                xor_into(&mut acc, blocks[row * n + col].data());
            }
            blocks[row * n + d].data_mut().copy_from_slice(&acc);
        }

        // Diagonal parity for every non-omitted diagonal.
        for k in 0..d {
            let mut acc = vec![0u8; self.block_size];
            for cell in self.diagonal_cells(k) {
                xor_into(&mut acc, blocks[cell].data());
            }
            blocks[k * n + d + 1].data_mut().copy_from_slice(&acc);
        }

        Ok(())
    }

    fn recover(&self, blocks: &mut [RainBlock], present: &[bool]) -> Result<Vec<usize>> {
        check_group_shape(blocks, Some(present), self.total_blocks())?;

        let mut present = present.to_vec();
        let mut missing: Vec<usize> = (0..present.len()).filter(|&i| !present[i]).collect();
        let mut recovered = Vec::new();

        // Block-by-block worklist: each pass rebuilds whatever has become
        // recoverable; no progress over a full pass means the loss pattern
        // exceeds what row + diagonal parity can express.
        while !missing.is_empty() {
            let mut next_round = Vec::new();
            let mut progress = false;

            for block in missing {
                let horizontal = self.horizontal_stripe(block);

                if Self::stripe_usable(&horizontal, block, &present) {
                    self.reduce_from(blocks, &horizontal, block);
                } else {
                    let diagonal = self.diagonal_stripe(block);

                    if Self::stripe_usable(&diagonal, block, &present) {
                        self.reduce_from(blocks, &diagonal, block);
                    } else {
                        next_round.push(block);
                        continue;
                    }
                }

                present[block] = true;
                recovered.push(block);
                progress = true;
            }

            if !progress {
                debug!(
                    unrecovered = next_round.len(),
                    "double-parity recovery stalled"
                );
                return Err(Error::Io(format!(
                    "{} blocks not reconstructable from row or diagonal parity",
                    next_round.len()
                )));
            }

            missing = next_round;
        }

        Ok(recovered)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const BLOCK: u32 = 64;

    fn engine(d: u16) -> DoubleParityEngine {
        let layout = LayoutDescriptor::new(BLOCK, d, 2, ParityScheme::DoubleParity).unwrap();
        DoubleParityEngine::new(&layout).unwrap()
    }

    /// A group filled with a per-block byte pattern, parity computed.
    fn sample_group(engine: &DoubleParityEngine) -> Vec<RainBlock> {
        let mut blocks: Vec<RainBlock> = (0..engine.total_blocks())
            .map(|_| RainBlock::new(BLOCK).unwrap())
            .collect();

        for (i, block) in blocks.iter_mut().enumerate() {
            let pattern: Vec<u8> = (0..BLOCK as usize)
                .map(|j| (i * 31 + j) as u8)
                .collect();
            block.write(&pattern, 0).unwrap();
        }

        engine.compute_parity(&mut blocks).unwrap();
        blocks
    }

    fn snapshot(blocks: &[RainBlock]) -> Vec<Vec<u8>> {
        blocks.iter().map(|b| b.data().to_vec()).collect()
    }

    // =========================================================================
    // Index Tests
    // =========================================================================

    #[test]
    fn test_parity_indices() {
        let eng = engine(4);
        assert_eq!(eng.simple_parity_indices(), vec![4, 10, 16, 22]);
        assert_eq!(eng.double_parity_indices(), vec![5, 11, 17, 23]);
    }

    #[test]
    fn test_diagonals_partition_subgrid() {
        let eng = engine(4);
        let mut seen = HashSet::new();

        for k in 0..=eng.data_count {
            let cells = eng.diagonal_cells(k);
            assert_eq!(cells.len(), eng.data_count);
            for cell in cells {
                assert!(cell % eng.total_count <= eng.data_count);
                assert!(seen.insert(cell), "cell {} on two diagonals", cell);
            }
        }

        // Every data + P cell is on exactly one diagonal.
        assert_eq!(seen.len(), eng.data_count * (eng.data_count + 1));
    }

    #[test]
    fn test_omitted_diagonal_blocks() {
        let eng = engine(4);
        // Cell (0, D) anchors the omitted diagonal.
        assert!(eng.diagonal_stripe(4).is_empty());
        // (1, 0) lies on the same diagonal: (0 - 1) mod 5 == 4.
        assert!(eng.diagonal_stripe(6).is_empty());
        // (0, 0) does not.
        assert_eq!(eng.diagonal_stripe(0), vec![0, 7, 14, 21, 5]);
    }

    #[test]
    fn test_horizontal_stripe_excludes_dp() {
        let eng = engine(4);
        assert_eq!(eng.horizontal_stripe(0), vec![0, 1, 2, 3, 4]);
        assert_eq!(eng.horizontal_stripe(8), vec![6, 7, 8, 9, 10]);
        assert!(eng.horizontal_stripe(5).is_empty());
        assert!(eng.horizontal_stripe(11).is_empty());
    }

    // =========================================================================
    // Parity Invariant Tests
    // =========================================================================

    #[test]
    fn test_row_parity_invariant() {
        let eng = engine(4);
        let blocks = sample_group(&eng);

        for row in 0..eng.data_count {
            let mut acc = vec![0u8; BLOCK as usize];
            for col in 0..=eng.data_count {
                xor_into(&mut acc, blocks[row * eng.total_count + col].data());
            }
            assert!(acc.iter().all(|&b| b == 0), "row {} parity broken", row);
        }
    }

    #[test]
    fn test_diagonal_parity_invariant() {
        let eng = engine(4);
        let blocks = sample_group(&eng);

        for k in 0..eng.data_count {
            let mut acc = vec![0u8; BLOCK as usize];
            for cell in eng.diagonal_cells(k) {
                xor_into(&mut acc, blocks[cell].data());
            }
            xor_into(&mut acc, blocks[k * eng.total_count + eng.data_count + 1].data());
            assert!(acc.iter().all(|&b| b == 0), "diagonal {} parity broken", k);
        }
    }

    // =========================================================================
    // Recovery Tests
    // =========================================================================

    #[test]
    fn test_recover_noop_when_complete() {
        let eng = engine(4);
        let mut blocks = sample_group(&eng);
        let before = snapshot(&blocks);

        let present = vec![true; blocks.len()];
        let recovered = eng.recover(&mut blocks, &present).unwrap();

        assert!(recovered.is_empty());
        assert_eq!(snapshot(&blocks), before, "recovery must not mutate");
    }

    #[test]
    fn test_recover_single_block() {
        let eng = engine(4);

        for victim in 0..eng.total_blocks() {
            let mut blocks = sample_group(&eng);
            let before = snapshot(&blocks);

            blocks[victim].data_mut().fill(0);
            let mut present = vec![true; blocks.len()];
            present[victim] = false;

            let recovered = eng.recover(&mut blocks, &present).unwrap();
            assert_eq!(recovered, vec![victim]);
            assert_eq!(snapshot(&blocks), before, "victim {}", victim);
        }
    }

    #[test]
    fn test_recover_two_lost_columns() {
        let eng = engine(4);
        let n = eng.total_count;

        for c1 in 0..n {
            for c2 in (c1 + 1)..n {
                let mut blocks = sample_group(&eng);
                let before = snapshot(&blocks);
                let mut present = vec![true; blocks.len()];

                for row in 0..eng.data_count {
                    for &c in &[c1, c2] {
                        blocks[row * n + c].data_mut().fill(0);
                        present[row * n + c] = false;
                    }
                }

                eng.recover(&mut blocks, &present)
                    .unwrap_or_else(|e| panic!("columns {} + {}: {}", c1, c2, e));
                assert_eq!(snapshot(&blocks), before, "columns {} + {}", c1, c2);
            }
        }
    }

    #[test]
    fn test_recover_fails_beyond_tolerance() {
        let eng = engine(4);
        let n = eng.total_count;
        let mut blocks = sample_group(&eng);
        let mut present = vec![true; blocks.len()];

        // Lose three full columns.
        for row in 0..eng.data_count {
            for c in 0..3 {
                present[row * n + c] = false;
            }
        }

        assert!(eng.recover(&mut blocks, &present).is_err());
    }

    #[test]
    fn test_recover_chained_passes() {
        // (1, 0) sits on the omitted diagonal; with its whole row lost it
        // only becomes recoverable after the rest of the row was rebuilt
        // diagonally, which exercises the multi-pass worklist.
        let eng = engine(4);
        let n = eng.total_count;
        let mut blocks = sample_group(&eng);
        let before = snapshot(&blocks);
        let mut present = vec![true; blocks.len()];

        for col in [0usize, 2] {
            blocks[n + col].data_mut().fill(0);
            present[n + col] = false;
        }

        eng.recover(&mut blocks, &present).unwrap();
        assert_eq!(snapshot(&blocks), before);
    }
}
