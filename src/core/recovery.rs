//! Recovery and non-streaming parity
//!
//! Failed read pieces are partitioned by group; each affected group is
//! loaded in full from the surviving stripes, reconstructed by the parity
//! engine and, on writable handles, repaired on disk. Blocks lying entirely
//! beyond the truncated stripe extent are virtual: their content is zero by
//! definition and they never count as losses.
//!
//! The same group-loading machinery serves the non-streaming pipeline,
//! which derives parity at close (or whenever complete groups accumulate)
//! from the map of written pieces.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, error, instrument, warn};

use crate::core::read::PieceRef;
use crate::core::worker;
use crate::core::{CoreState, RainCore};
use crate::error::{Error, Result};

impl RainCore {
    // =========================================================================
    // Piece recovery
    // =========================================================================

    /// Recover every failed piece, group by group, copying the rebuilt
    /// bytes into the caller buffers referenced by the pieces.
    pub(crate) fn recover_pieces(
        &self,
        state: &mut CoreState,
        mut errs: Vec<PieceRef>,
        sinks: &mut [&mut [u8]],
    ) -> Result<()> {
        let group_size = self.shared().layout.group_data_size();

        while !errs.is_empty() {
            let grp_off = (errs[0].offset / group_size) * group_size;

            let (grp_errs, rest): (Vec<PieceRef>, Vec<PieceRef>) = errs
                .into_iter()
                .partition(|p| p.offset >= grp_off && p.offset < grp_off + group_size);
            errs = rest;

            self.recover_group(state, grp_off, &grp_errs, sinks)?;
        }

        state.done_recovery = true;
        Ok(())
    }

    /// Load one group from the stripes, reconstruct its absent blocks and
    /// serve the failed pieces from the rebuilt content.
    #[instrument(skip(self, state, errs, sinks))]
    fn recover_group(
        &self,
        state: &CoreState,
        grp_off: u64,
        errs: &[PieceRef],
        sinks: &mut [&mut [u8]],
    ) -> Result<()> {
        let shared = self.shared();
        let grp = shared.registry.get_or_create(grp_off)?;

        let inner = (|| -> Result<()> {
            let layout = &shared.layout;
            let total = layout.total_count() as usize;
            let block_size = layout.block_size as usize;
            let group_size = layout.group_data_size();
            let header = layout.header_size as u64;
            let rows_on_disk = layout.stripe_rows(state.file_size);

            let mut blocks = grp.lock_blocks();
            let mut present = vec![false; blocks.len()];

            for index in 0..blocks.len() {
                let row = index / total;
                let col = index % total;
                let local_row = grp_off / layout.line_size() + row as u64;

                // Blocks past the stripe extent hold no real data; their
                // content is zero by definition.
                if local_row >= rows_on_disk {
                    blocks[index].data_mut().fill(0);
                    present[index] = true;
                    continue;
                }

                let physical = shared.map_lp[col];
                let file_off = layout.local_block_offset(grp_off, row) + header;

                if let Some(stripe) = shared.stripe(physical) {
                    match stripe.read(file_off, blocks[index].data_mut()) {
                        Ok(n) if n == block_size => present[index] = true,
                        Ok(n) => {
                            warn!(index, wanted = block_size, got = n, "short block read")
                        }
                        Err(err) => warn!(index, %err, "failed reading block"),
                    }
                }
            }

            let missing = present.iter().filter(|p| !**p).count();
            debug!(grp_off, missing, "loaded group for recovery");

            let recovered =
                shared
                    .parity
                    .recover(&mut blocks, &present)
                    .map_err(|err| Error::RecoveryFailed {
                        group_offset: grp_off,
                        reason: err.to_string(),
                    })?;

            // Persist the repairs when the handle may write.
            if shared.store_recovery && !recovered.is_empty() {
                for &index in &recovered {
                    let row = index / total;
                    let col = index % total;
                    let physical = shared.map_lp[col];

                    if let Some(stripe) = shared.stripe(physical) {
                        let file_off = layout.local_block_offset(grp_off, row) + header;
                        let content = Bytes::copy_from_slice(blocks[index].data());
                        grp.store_future(stripe.write_async(file_off, content));
                    } else {
                        warn!(index, "cannot persist repaired block to null stripe");
                    }
                }
            }

            // Serve the failed pieces from the now-complete group.
            for piece in errs {
                let small = ((piece.offset % group_size) / layout.block_size_u64()) as usize;
                let index = layout.small_to_big(small);
                let start = (piece.offset % layout.block_size_u64()) as usize;

                sinks[piece.chunk][piece.chunk_off..piece.chunk_off + piece.len]
                    .copy_from_slice(&blocks[index].data()[start..start + piece.len]);
            }

            Ok(())
        })();

        // Join any repair writes before the group can be recycled.
        let flushed = grp.wait_async_ok(shared.timeout);
        shared.registry.recycle(&grp);

        inner?;
        if !flushed {
            return Err(Error::RecoveryFailed {
                group_offset: grp_off,
                reason: "failed to persist repaired blocks".into(),
            });
        }

        Ok(())
    }

    // =========================================================================
    // Non-streaming parity
    // =========================================================================

    /// Derive and persist parity for groups covered by the piece map.
    ///
    /// Complete groups are always processed; with `force` set, remaining
    /// partial groups are zero-padded and completed too, which is how a
    /// sparse write session settles its parity at close.
    pub(crate) fn sparse_parity_computation(
        &self,
        state: &mut CoreState,
        force: bool,
    ) -> Result<()> {
        if state.pieces.is_empty() {
            return Ok(());
        }

        merge_pieces(&mut state.pieces);
        let group_size = self.shared().layout.group_data_size();
        let groups = take_offset_groups(&mut state.pieces, group_size, force);

        for grp_off in groups {
            self.read_group(state, grp_off)?;

            if !worker::do_block_parity(self.shared(), grp_off) {
                return Err(Error::ParityFailed {
                    group_offset: grp_off,
                });
            }
        }

        Ok(())
    }

    /// Read the data blocks of one group back from the stripes into the
    /// group object, so parity can be recomputed over them.
    fn read_group(&self, state: &CoreState, grp_off: u64) -> Result<()> {
        let shared = self.shared();
        let layout = &shared.layout;
        let header = layout.header_size as u64;
        let data_count = layout.data_count as usize;
        let block_size = layout.block_size as usize;
        let rows_on_disk = layout.stripe_rows(state.file_size);

        // Outstanding writes must land before their blocks are read back.
        for slot in shared.stripes.read().iter() {
            if let Some(stripe) = slot {
                let handler = stripe.async_handler();
                handler.wait_ok().map_err(|err| {
                    error!(%err, "write failed in previous requests");
                    err
                })?;
                handler.reset();
            }
        }

        let grp = shared.registry.get_or_create(grp_off)?;
        let mut futures = Vec::new();

        for small in 0..layout.data_blocks_per_group() {
            let stripe_idx = small % data_count;
            let row = small / data_count;

            // Rows past the stripe extent stay zero; the parity pass
            // zero-fills them.
            if grp_off / layout.line_size() + row as u64 >= rows_on_disk {
                continue;
            }

            let physical = shared.map_lp[stripe_idx];
            let file_off = layout.local_block_offset(grp_off, row) + header;

            let stripe = shared.stripe(physical).ok_or_else(|| {
                error!(stripe = stripe_idx, "stripe is null");
                Error::Io(format!("stripe {} unavailable for parity read", stripe_idx))
            })?;

            futures.push((
                layout.small_to_big(small),
                stripe.read_async(file_off, block_size),
            ));
        }

        for (index, future) in futures {
            let data = future.wait_timeout(shared.timeout)?;
            if data.len() != block_size {
                error!(index, got = data.len(), "failed reading data block");
                return Err(Error::Io(format!(
                    "short read of group block {} at group {}",
                    index, grp_off
                )));
            }

            grp.lock_blocks()[index].data_mut().copy_from_slice(&data);
        }

        Ok(())
    }
}

// =============================================================================
// Piece map
// =============================================================================

/// Record a written piece, widening an existing entry at the same offset.
pub(crate) fn add_piece(pieces: &mut BTreeMap<u64, u64>, offset: u64, len: u64) {
    match pieces.get_mut(&offset) {
        Some(existing) => {
            if len > *existing {
                *existing = len;
            }
        }
        None => {
            pieces.insert(offset, len);
        }
    }
}

/// Merge overlapping and touching pieces in place.
pub(crate) fn merge_pieces(pieces: &mut BTreeMap<u64, u64>) {
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(pieces.len());

    for (&offset, &len) in pieces.iter() {
        match merged.last_mut() {
            Some((last_off, last_len)) if *last_off + *last_len >= offset => {
                let end = (offset + len).max(*last_off + *last_len);
                *last_len = end - *last_off;
            }
            _ => merged.push((offset, len)),
        }
    }

    pieces.clear();
    pieces.extend(merged);
}

/// Extract the group offsets whose parity can be computed.
///
/// Fully covered groups are removed from the piece map and returned; the
/// uncovered remainders of their pieces stay behind. With `force`, every
/// touched group is returned and the map is drained.
pub(crate) fn take_offset_groups(
    pieces: &mut BTreeMap<u64, u64>,
    group_size: u64,
    force: bool,
) -> Vec<u64> {
    let mut groups = Vec::new();
    let mut keep: BTreeMap<u64, u64> = BTreeMap::new();

    for (&offset, &len) in pieces.iter() {
        let end = offset + len;

        if force {
            let mut grp = (offset / group_size) * group_size;
            while grp < end {
                groups.push(grp);
                grp += group_size;
            }
            continue;
        }

        // First group boundary at or after the piece start.
        let first_full = offset.div_ceil(group_size) * group_size;
        let mut grp = first_full;
        while grp + group_size <= end {
            groups.push(grp);
            grp += group_size;
        }

        if grp == first_full {
            // No full group inside the piece; keep it whole.
            add_piece(&mut keep, offset, len);
            continue;
        }

        // Keep the uncovered head and tail.
        if offset < first_full {
            add_piece(&mut keep, offset, first_full - offset);
        }
        if grp < end {
            add_piece(&mut keep, grp, end - grp);
        }
    }

    *pieces = keep;
    groups.sort_unstable();
    groups.dedup();
    groups
}

// =============================================================================
// Tests
// =============================================================================
