//! Read paths
//!
//! Forward reads split the request into per-block chunks, map each to its
//! stripe and read with prefetch hints; failures are collected and handed
//! to group-wise recovery afterwards, so a lost stripe costs one repair
//! pass instead of failing the read. Vector reads fan asynchronous scatter
//! requests out per stripe. Forced-recovery mode converts reads into
//! visit-once group repair.

use tracing::{debug, error, info, instrument, warn};

use crate::core::{CoreState, RainCore};
use crate::error::{Error, Result};
use crate::layout::LayoutDescriptor;

// =============================================================================
// Request descriptors
// =============================================================================

/// One caller-supplied target range of a vector read.
pub struct ChunkBuf<'a> {
    /// Logical file offset
    pub offset: u64,
    /// Destination buffer; its length is the read length
    pub buf: &'a mut [u8],
}

/// One block-aligned piece of a read, pointing back into a caller buffer.
#[derive(Debug, Clone)]
pub(crate) struct PieceRef {
    /// Logical file offset of the piece
    pub offset: u64,
    /// Piece length, never crossing a block boundary
    pub len: usize,
    /// Index of the caller buffer this piece belongs to
    pub chunk: usize,
    /// Byte offset of the piece within that buffer
    pub chunk_off: usize,
}

/// Split `[offset, offset + len)` into pieces that each stay within one
/// block, tagged with their position in caller buffer `chunk`.
pub(crate) fn split_read(
    layout: &LayoutDescriptor,
    mut offset: u64,
    len: usize,
    chunk: usize,
) -> Vec<PieceRef> {
    let block_size = layout.block_size_u64();
    let mut pieces = Vec::with_capacity(len / block_size as usize + 2);
    let mut remaining = len;
    let mut chunk_off = 0usize;

    while remaining > 0 {
        let block_end = (offset / block_size + 1) * block_size;
        let piece = ((block_end - offset) as usize).min(remaining);

        pieces.push(PieceRef {
            offset,
            len: piece,
            chunk,
            chunk_off,
        });

        offset += piece as u64;
        chunk_off += piece;
        remaining -= piece;
    }

    pieces
}

impl RainCore {
    // =========================================================================
    // Forward read
    // =========================================================================

    /// Read into `buf` at logical offset `offset`, reconstructing from
    /// parity where stripes fail. Returns the bytes read, clamped to the
    /// file size.
    #[instrument(skip(self, buf), fields(len = buf.len()))]
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<u64> {
        let shared = self.shared();
        let mut state = self.state.lock();

        if !state.is_open {
            return Err(Error::Io("file is not open".into()));
        }

        if !shared.is_entry {
            // Non-entry opener reads only its local stripe.
            let stripe = shared
                .stripe(0)
                .ok_or_else(|| Error::Io("local stripe is unavailable".into()))?;
            return Ok(stripe.read(offset, buf)? as u64);
        }

        if offset > state.file_size {
            warn!(offset, file_size = state.file_size, "read past end-of-file");
            return Ok(0);
        }

        let mut len = buf.len();
        if offset + len as u64 > state.file_size {
            warn!(
                end = offset + len as u64,
                file_size = state.file_size,
                "read too big, resizing the read length"
            );
            len = (state.file_size - offset) as usize;
            if len == 0 {
                return Ok(0);
            }
        }

        if shared.force_recovery {
            return self.read_force_recovery(&mut state, offset, len as u64);
        }

        let layout = &shared.layout;
        let header = layout.header_size as u64;
        let pieces = split_read(layout, offset, len, 0);
        let mut errs: Vec<PieceRef> = Vec::new();

        for piece in &pieces {
            let (stripe_idx, local_off) = layout.global_to_local(piece.offset);
            let physical = shared.map_lp[stripe_idx];
            let file_off = local_off + header;
            let target = &mut buf[piece.chunk_off..piece.chunk_off + piece.len];

            let ok = match shared.stripe(physical) {
                Some(stripe) => {
                    debug!(
                        stripe = stripe_idx,
                        offset = piece.offset,
                        stripe_off = file_off,
                        len = piece.len,
                        "read"
                    );
                    match stripe.read_prefetch(file_off, target) {
                        Ok(n) if n == piece.len => true,
                        Ok(n) => {
                            error!(
                                offset = piece.offset,
                                wanted = piece.len,
                                got = n,
                                "short stripe read"
                            );
                            false
                        }
                        Err(err) => {
                            error!(offset = piece.offset, len = piece.len, %err, "read error");
                            false
                        }
                    }
                }
                // Stripe not opened counts as a read error.
                None => false,
            };

            if !ok {
                errs.push(piece.clone());
            }
        }

        if !errs.is_empty() {
            let mut sinks = [&mut *buf];
            if let Err(err) = self.recover_pieces(&mut state, errs, &mut sinks) {
                error!(offset, len, %err, "failed read recovery");
                return Err(err);
            }
        }

        Ok(len as u64)
    }

    /// Forced-recovery read: repair every group the range touches, once per
    /// group for the handle's lifetime, and report the requested length.
    /// Callers rely on the on-disk side effect, not the buffer content.
    fn read_force_recovery(
        &self,
        state: &mut CoreState,
        offset: u64,
        len: u64,
    ) -> Result<u64> {
        let shared = self.shared();
        let group_size = shared.layout.group_data_size();
        let block_size = shared.layout.block_size as usize;

        let first = offset / group_size;
        let last = (offset + len.max(1) - 1) / group_size;

        for grp_idx in first..=last {
            if !self.recovered_groups.insert(grp_idx) {
                // Already repaired during this session.
                continue;
            }

            info!(grp_idx, "recovering group");
            let mut scratch = vec![0u8; block_size];
            let errs = vec![PieceRef {
                offset: grp_idx * group_size,
                len: block_size,
                chunk: 0,
                chunk_off: 0,
            }];

            let mut sinks = [&mut scratch[..]];
            if let Err(err) = self.recover_pieces(state, errs, &mut sinks) {
                error!(offset, len, %err, "failed forced recovery");
                return Err(err);
            }
            debug!(grp_idx, "done forced group recovery");
        }

        Ok(len)
    }

    // =========================================================================
    // Vector read
    // =========================================================================

    /// Scatter read into the caller's chunk buffers, reconstructing failed
    /// pieces from parity. Returns the total bytes transferred.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub fn read_v(&self, chunks: &mut [ChunkBuf<'_>]) -> Result<u64> {
        let shared = self.shared();
        let mut state = self.state.lock();

        if !state.is_open {
            return Err(Error::Io("file is not open".into()));
        }

        let total: u64 = chunks.iter().map(|c| c.buf.len() as u64).sum();

        if !shared.is_entry {
            // Non-entry opener: local scatter read with stripe-local offsets.
            let stripe = shared
                .stripe(0)
                .ok_or_else(|| Error::Io("local stripe is unavailable".into()))?;
            let requests: Vec<(u64, usize)> =
                chunks.iter().map(|c| (c.offset, c.buf.len())).collect();

            let datas = stripe.read_vector(&requests).map_err(|err| {
                error!(%err, "failed local vector read");
                err
            })?;
            for (chunk, data) in chunks.iter_mut().zip(datas) {
                chunk.buf.copy_from_slice(&data);
            }
            return Ok(total);
        }

        let layout = &shared.layout;
        let header = layout.header_size as u64;
        let data_count = layout.data_count as usize;

        // Start every stripe's error aggregation from a clean slate.
        for slot in shared.stripes.read().iter() {
            if let Some(stripe) = slot {
                stripe.async_handler().reset();
            }
        }

        // Split all chunks into block pieces and bucket them per logical
        // stripe with their stripe-local offsets.
        let mut per_stripe: Vec<Vec<PieceRef>> = vec![Vec::new(); data_count];
        for (chunk_idx, chunk) in chunks.iter().enumerate() {
            for piece in split_read(layout, chunk.offset, chunk.buf.len(), chunk_idx) {
                let (stripe_idx, _) = layout.global_to_local(piece.offset);
                per_stripe[stripe_idx].push(piece);
            }
        }

        let mut errs: Vec<PieceRef> = Vec::new();
        let mut pending = Vec::new();

        for (stripe_idx, pieces) in per_stripe.into_iter().enumerate() {
            if pieces.is_empty() {
                continue;
            }

            let physical = shared.map_lp[stripe_idx];
            let requests: Vec<(u64, usize)> = pieces
                .iter()
                .map(|p| {
                    let (_, local_off) = layout.global_to_local(p.offset);
                    (local_off + header, p.len)
                })
                .collect();

            match shared.stripe(physical) {
                Some(stripe) => {
                    debug!(
                        stripe = stripe_idx,
                        read_count = requests.len(),
                        physical,
                        "readv"
                    );
                    pending.push((physical, stripe.read_vector_async(requests), pieces));
                }
                None => {
                    // Stripe gone: everything aimed at it goes to recovery.
                    errs.extend(pieces);
                }
            }
        }

        for (physical, future, pieces) in pending {
            match future.wait_timeout(shared.timeout) {
                Ok(datas) => {
                    for (piece, data) in pieces.iter().zip(datas) {
                        chunks[piece.chunk].buf[piece.chunk_off..piece.chunk_off + piece.len]
                            .copy_from_slice(&data);
                    }
                }
                Err(err) => {
                    error!(physical, %err, "vector read error");

                    // A timed-out stripe is considered down for the rest of
                    // the handle's life.
                    if matches!(err, Error::OperationExpired(_)) {
                        debug!(physical, "closing stripe after timeout");
                        let mut stripes = shared.stripes.write();
                        if let Some(stripe) = stripes[physical].take() {
                            let _ = stripe.close();
                        }
                    }

                    errs.extend(pieces);
                }
            }
        }

        // The scatter futures are joined above; drop any handler state they
        // left so close does not re-report it.
        for slot in shared.stripes.read().iter() {
            if let Some(stripe) = slot {
                stripe.async_handler().reset();
            }
        }

        if !errs.is_empty() {
            let mut sinks: Vec<&mut [u8]> = chunks.iter_mut().map(|c| &mut *c.buf).collect();
            if let Err(err) = self.recover_pieces(&mut state, errs, &mut sinks) {
                error!(%err, "readv recovery failed");
                return Err(err);
            }
        }

        Ok(total)
    }
}

// =============================================================================
// Tests
// =============================================================================
