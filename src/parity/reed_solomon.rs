//! Reed-Solomon parity engine
//!
//! Systematic Reed-Solomon over GF(2^8) using the `reed-solomon-erasure`
//! crate. Each row of the group is one codeword: the `D` data blocks of the
//! row are the data shards, the `P` parity columns hold the parity shards.
//! The codec derives its coding matrix deterministically from `(D, P)`, so
//! identical layouts always produce identical parity, and any `P` erasures
//! per row are reconstructable from the survivors.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::block::RainBlock;
use crate::error::{Error, Result};
use crate::layout::{LayoutDescriptor, ParityScheme};
use crate::parity::{check_group_shape, ParityEngine};

// =============================================================================
// ReedSolomonEngine
// =============================================================================

/// Row-wise Reed-Solomon coding for a block group.
pub struct ReedSolomonEngine {
    rs: ReedSolomon,
    /// Number of data columns (D)
    data_count: usize,
    /// Number of columns including parity (N)
    total_count: usize,
}

impl ReedSolomonEngine {
    /// Build the engine for a layout.
    pub fn new(layout: &LayoutDescriptor) -> Result<Self> {
        let rs = ReedSolomon::new(layout.data_count as usize, layout.parity_count as usize)
            .map_err(|e| {
                Error::UnsupportedLayout(format!("failed to create Reed-Solomon codec: {}", e))
            })?;

        Ok(Self {
            rs,
            data_count: layout.data_count as usize,
            total_count: layout.total_count() as usize,
        })
    }

    fn total_blocks(&self) -> usize {
        self.total_count * self.data_count
    }

    /// Block indices of row `r`, data columns first.
    fn row_indices(&self, row: usize) -> std::ops::Range<usize> {
        row * self.total_count..(row + 1) * self.total_count
    }
}

impl ParityEngine for ReedSolomonEngine {
    fn scheme(&self) -> ParityScheme {
        ParityScheme::ReedSolomon
    }

    fn compute_parity(&self, blocks: &mut [RainBlock]) -> Result<()> {
        check_group_shape(blocks, None, self.total_blocks())?;

        for row in 0..self.data_count {
            let mut shards: Vec<Vec<u8>> = self
                .row_indices(row)
                .map(|i| {
                    if i % self.total_count < self.data_count {
                        blocks[i].data().to_vec()
                    } else {
                        vec![0u8; blocks[i].len()]
                    }
                })
                .collect();

            self.rs.encode(&mut shards).map_err(|e| {
                Error::Io(format!("Reed-Solomon encoding failed on row {}: {}", row, e))
            })?;

            for (col, shard) in shards.iter().enumerate().skip(self.data_count) {
                blocks[row * self.total_count + col]
                    .data_mut()
                    .copy_from_slice(shard);
            }
        }

        Ok(())
    }

    fn recover(&self, blocks: &mut [RainBlock], present: &[bool]) -> Result<Vec<usize>> {
        check_group_shape(blocks, Some(present), self.total_blocks())?;

        let mut recovered = Vec::new();

        for row in 0..self.data_count {
            let indices: Vec<usize> = self.row_indices(row).collect();

            if indices.iter().all(|&i| present[i]) {
                continue;
            }

            let available = indices.iter().filter(|&&i| present[i]).count();
            if available < self.data_count {
                return Err(Error::Io(format!(
                    "row {} has {} of {} shards, need {}",
                    row, available, self.total_count, self.data_count
                )));
            }

            let mut shards: Vec<Option<Vec<u8>>> = indices
                .iter()
                .map(|&i| present[i].then(|| blocks[i].data().to_vec()))
                .collect();

            self.rs.reconstruct(&mut shards).map_err(|e| {
                Error::Io(format!(
                    "Reed-Solomon reconstruction failed on row {}: {}",
                    row, e
                ))
            })?;

            for (&index, shard) in indices.iter().zip(shards.iter()) {
                if !present[index] {
                    let shard = shard.as_ref().ok_or_else(|| {
                        Error::Io(format!("row {} shard missing after reconstruct", row))
                    })?;
                    blocks[index].data_mut().copy_from_slice(shard);
                    recovered.push(index);
                }
            }
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

    const BLOCK: u32 = 64;

    fn engine(d: u16, p: u16) -> ReedSolomonEngine {
        let layout = LayoutDescriptor::new(BLOCK, d, p, ParityScheme::ReedSolomon).unwrap();
        ReedSolomonEngine::new(&layout).unwrap()
    }

    fn sample_group(eng: &ReedSolomonEngine) -> Vec<RainBlock> {
        let mut blocks: Vec<RainBlock> = (0..eng.total_blocks())
            .map(|_| RainBlock::new(BLOCK).unwrap())
            .collect();

        for (i, block) in blocks.iter_mut().enumerate() {
            let pattern: Vec<u8> = (0..BLOCK as usize).map(|j| (i * 13 + j) as u8).collect();
            block.write(&pattern, 0).unwrap();
        }

        eng.compute_parity(&mut blocks).unwrap();
        blocks
    }

    fn snapshot(blocks: &[RainBlock]) -> Vec<Vec<u8>> {
        blocks.iter().map(|b| b.data().to_vec()).collect()
    }

    #[test]
    fn test_parity_is_deterministic() {
        let eng_a = engine(4, 2);
        let eng_b = engine(4, 2);
        let a = sample_group(&eng_a);
        let b = sample_group(&eng_b);
        assert_eq!(snapshot(&a), snapshot(&b));
    }

    #[test]
    fn test_recover_noop_when_complete() {
        let eng = engine(4, 2);
        let mut blocks = sample_group(&eng);
        let before = snapshot(&blocks);

        let all_present = vec![true; blocks.len()];
        let recovered = eng.recover(&mut blocks, &all_present).unwrap();
        assert!(recovered.is_empty());
        assert_eq!(snapshot(&blocks), before);
    }

    #[test]
    fn test_recover_up_to_p_erasures_per_row() {
        let eng = engine(4, 3);
        let n = eng.total_count;
        let mut blocks = sample_group(&eng);
        let before = snapshot(&blocks);
        let mut present = vec![true; blocks.len()];

        // Erase three blocks of row 0 (max), one of row 2.
        for &i in &[0usize, 2, n - 1, 2 * n + 3] {
            blocks[i].data_mut().fill(0xee);
            present[i] = false;
        }

        let mut recovered = eng.recover(&mut blocks, &present).unwrap();
        recovered.sort_unstable();
        assert_eq!(recovered, vec![0, 2, n - 1, 2 * n + 3]);
        assert_eq!(snapshot(&blocks), before);
    }

    #[test]
    fn test_recover_fails_beyond_p() {
        let eng = engine(4, 2);
        let mut blocks = sample_group(&eng);
        let mut present = vec![true; blocks.len()];
        for i in 0..3 {
            present[i] = false;
        }

        assert!(eng.recover(&mut blocks, &present).is_err());
    }

    #[test]
    fn test_single_parity_configuration() {
        // P = 1 degenerates to plain row parity but must still round-trip.
        let eng = engine(4, 1);
        let mut blocks = sample_group(&eng);
        let before = snapshot(&blocks);
        let mut present = vec![true; blocks.len()];

        blocks[1].data_mut().fill(0);
        present[1] = false;

        eng.recover(&mut blocks, &present).unwrap();
        assert_eq!(snapshot(&blocks), before);
    }
}
