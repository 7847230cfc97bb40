//! Parity engines
//!
//! A [`ParityEngine`] owns the redundancy math for one layout: deriving the
//! parity blocks of a complete group and reconstructing absent blocks from
//! the survivors. Two engines exist:
//!
//! - [`double::DoubleParityEngine`]: row XOR plus one modular diagonal
//!   XOR, tolerating two losses over a square block group.
//! - [`reed_solomon::ReedSolomonEngine`]: systematic Reed-Solomon over
//!   GF(2^8), tolerating up to `P` losses for any `P >= 1`.
//!
//! Both operate on a group's block slice laid out row-major with the data
//! columns first: block `i` sits at row `i / N`, column `i % N`; columns
//! `D..N` hold parity. Callers must have populated every data block
//! (`RainGroup::fill_with_zeros` completes short tails) before computing.

use crate::block::RainBlock;
use crate::error::{Error, Result};
use crate::layout::{LayoutDescriptor, ParityScheme, VECTOR_WORD};

pub mod double;
pub mod reed_solomon;

#[cfg(test)]
mod proptest;

pub use double::DoubleParityEngine;
pub use reed_solomon::ReedSolomonEngine;

// =============================================================================
// ParityEngine
// =============================================================================

/// Redundancy math for one layout.
pub trait ParityEngine: Send + Sync {
    /// Scheme implemented by this engine.
    fn scheme(&self) -> ParityScheme;

    /// Fill every parity-block position of the group from the data
    /// positions. All data blocks must be fully populated.
    fn compute_parity(&self, blocks: &mut [RainBlock]) -> Result<()>;

    /// Reconstruct every block whose `present` entry is false, returning
    /// the indices actually rebuilt in the order they were recovered.
    ///
    /// With nothing absent this is a no-op returning an empty list; with
    /// more losses than the scheme tolerates it fails without a partial
    /// result contract on the absent blocks.
    fn recover(&self, blocks: &mut [RainBlock], present: &[bool]) -> Result<Vec<usize>>;
}

/// Build the parity engine for a layout.
pub fn engine_for(layout: &LayoutDescriptor) -> Result<Box<dyn ParityEngine>> {
    match layout.scheme {
        ParityScheme::DoubleParity => Ok(Box::new(DoubleParityEngine::new(layout)?)),
        ParityScheme::ReedSolomon => Ok(Box::new(ReedSolomonEngine::new(layout)?)),
    }
}

// =============================================================================
// XOR primitive
// =============================================================================

/// XOR `src` into `acc` in vector-sized words with a scalar tail.
///
/// Both slices must have equal length; block buffers are aligned and sized
/// in multiples of [`VECTOR_WORD`], so the tail only runs for odd-sized
/// test inputs.
pub(crate) fn xor_into(acc: &mut [u8], src: &[u8]) {
    debug_assert_eq!(acc.len(), src.len());

    let mut acc_words = acc.chunks_exact_mut(VECTOR_WORD);
    let mut src_words = src.chunks_exact(VECTOR_WORD);

    for (a, s) in acc_words.by_ref().zip(src_words.by_ref()) {
        let mut word = [0u8; VECTOR_WORD];
        word.copy_from_slice(a);
        let x = u128::from_ne_bytes(word);

        word.copy_from_slice(s);
        let y = u128::from_ne_bytes(word);

        a.copy_from_slice(&(x ^ y).to_ne_bytes());
    }

    for (a, s) in acc_words
        .into_remainder()
        .iter_mut()
        .zip(src_words.remainder())
    {
        *a ^= *s;
    }
}

/// Shared helper validating a group slice and present mask against the
/// engine geometry.
pub(crate) fn check_group_shape(
    blocks: &[RainBlock],
    present: Option<&[bool]>,
    expected: usize,
) -> Result<()> {
    if blocks.len() != expected {
        return Err(Error::Invalid(format!(
            "group has {} blocks, engine expects {}",
            blocks.len(),
            expected
        )));
    }

    if let Some(present) = present {
        if present.len() != expected {
            return Err(Error::Invalid(format!(
                "present mask has {} entries, engine expects {}",
                present.len(),
                expected
            )));
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_into_word_sized() {
        let mut acc = vec![0xffu8; 64];
        let src = vec![0x0fu8; 64];
        xor_into(&mut acc, &src);
        assert!(acc.iter().all(|&b| b == 0xf0));

        // Self-inverse.
        xor_into(&mut acc, &src);
        assert!(acc.iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_xor_into_with_tail() {
        let mut acc: Vec<u8> = (0..37).collect();
        let src: Vec<u8> = (0..37).map(|b| b ^ 0x5a).collect();
        xor_into(&mut acc, &src);
        assert!(acc.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn test_engine_for_selects_scheme() {
        let dp = LayoutDescriptor::new(256, 4, 2, ParityScheme::DoubleParity).unwrap();
        assert_eq!(engine_for(&dp).unwrap().scheme(), ParityScheme::DoubleParity);

        let rs = LayoutDescriptor::new(256, 4, 3, ParityScheme::ReedSolomon).unwrap();
        assert_eq!(engine_for(&rs).unwrap().scheme(), ParityScheme::ReedSolomon);
    }
}
