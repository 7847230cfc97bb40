//! Write paths
//!
//! The entry server splits writes into block-aligned chunks and dispatches
//! each to its stripe. Sequential writes take the streaming path: data is
//! copied into the live parity group and the group is handed to the parity
//! worker once the write ends exactly on a group boundary. The first
//! out-of-order offset switches the handle into non-streaming mode, where
//! chunks are written directly and parity is derived later from the piece
//! map.

use bytes::Bytes;
use tracing::{debug, error, instrument};

use crate::core::recovery;
use crate::core::RainCore;
use crate::error::{Error, Result};

impl RainCore {
    /// Write `buf` at logical offset `offset`, returning the bytes written.
    #[instrument(skip(self, buf), fields(len = buf.len()))]
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<u64> {
        let shared = self.shared();

        if !shared.is_rw {
            return Err(Error::NotMutable("write on read-only handle".into()));
        }

        let mut state = self.state.lock();
        if !state.is_open {
            return Err(Error::Io("file is not open".into()));
        }

        if buf.is_empty() {
            return Ok(0);
        }

        if !shared.is_entry {
            // Non-entry opener writes only to its local stripe; offsets are
            // already stripe-local.
            let stripe = shared
                .stripe(0)
                .ok_or_else(|| Error::Io("local stripe is unavailable".into()))?;
            let written = stripe.write(offset, buf)? as u64;
            state.last_write_offset += buf.len() as u64;
            return Ok(written);
        }

        // The streaming pipeline assumes strictly sequential offsets; the
        // first gap switches to the sparse pipeline for good.
        if state.is_streaming && offset != state.last_write_offset {
            debug!(
                offset,
                expected = state.last_write_offset,
                "enabling non-streaming mode"
            );
            state.is_streaming = false;
        }

        if shared.has_parity_error() {
            error!(offset, "write refused after parity computation error");
            return Err(Error::Io(
                "handle failed by an earlier parity computation error".into(),
            ));
        }

        state.last_write_offset += buf.len() as u64;

        let layout = &shared.layout;
        let block_size = layout.block_size_u64();
        let header = layout.header_size as u64;
        let mut off = offset;
        let mut remaining = buf;

        while !remaining.is_empty() {
            let in_block = (off % block_size) as usize;
            let nwrite = remaining
                .len()
                .min(block_size as usize - in_block);

            let (stripe_idx, local_off) = layout.global_to_local(off);
            let physical = shared.map_lp[stripe_idx];
            let file_off = local_off + header;

            let stripe = shared.stripe(physical).ok_or_else(|| {
                error!(offset = off, physical, "write failed, stripe file is null");
                Error::Io(format!("stripe {} is unavailable", physical))
            })?;

            let chunk = Bytes::copy_from_slice(&remaining[..nwrite]);

            if state.is_streaming {
                self.add_data_block(off, chunk, stripe.as_ref(), file_off)?;
            } else {
                // Direct dispatch; completion is tracked by the stripe's
                // async handler and joined before parity or close.
                drop(stripe.write_async(file_off, chunk));
            }

            // Track the piece either way so parity can still be derived at
            // close if the write pattern turns out to be sparse.
            recovery::add_piece(&mut state.pieces, off, nwrite as u64);

            off += nwrite as u64;
            remaining = &remaining[nwrite..];
        }

        // The new extent must be known before any parity read-back so the
        // just-written blocks are not mistaken for virtual tail blocks.
        let end = offset + buf.len() as u64;
        if end > state.file_size {
            debug!(file_size = end, "updating file size");
            state.file_size = end;
            state.do_truncate = true;
        }

        if !state.is_streaming {
            self.sparse_parity_computation(&mut state, false)?;
        }

        Ok(buf.len() as u64)
    }

    /// Add one block-aligned chunk to its parity group and queue the write
    /// to the owning stripe.
    fn add_data_block(
        &self,
        offset: u64,
        data: Bytes,
        stripe: &dyn crate::io::StripeIo,
        file_off: u64,
    ) -> Result<()> {
        let shared = self.shared();
        let layout = &shared.layout;
        let group_size = layout.group_data_size();
        let block_size = layout.block_size_u64();

        let grp_off = layout.group_offset(offset);
        let index = layout.small_to_big(((offset % group_size) / block_size) as usize);
        let off_in_block = (offset % block_size) as usize;

        if shared.has_parity_error() {
            return Err(Error::Io(
                "handle failed by an earlier parity computation error".into(),
            ));
        }

        let grp = shared.registry.get_or_create(offset)?;

        // Admission may have blocked; an error latched while waiting makes
        // continuing pointless.
        if shared.has_parity_error() {
            shared.registry.recycle(&grp);
            return Err(Error::Io(
                "handle failed by an earlier parity computation error".into(),
            ));
        }

        {
            let mut blocks = grp.lock_blocks();
            blocks[index].write(&data, off_in_block)?;
        }

        grp.store_future(stripe.write_async(file_off, data.clone()));

        // Group complete: the next write would start a new group, so hand
        // this one to the parity worker. Scoped so the group reference is
        // dropped first and recycling can see the true count.
        let completes_group = (offset + data.len() as u64) % group_size == 0;
        drop(grp);

        if completes_group {
            let worker = self.worker.lock();
            match worker.as_ref() {
                Some(worker) => worker.enqueue(grp_off)?,
                // The worker runs for the whole RW lifetime of the handle.
                None => {
                    return Err(Error::Io(
                        "parity worker is not running for a writable handle".into(),
                    ))
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::core::{AccessMode, RainCore, RainOptions};
    use crate::io::{FsStripeIo, IoEngine, StripeIo};
    use crate::layout::{LayoutDescriptor, ParityScheme};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_rw(dir: &TempDir) -> RainCore {
        let layout = LayoutDescriptor::new(1024, 4, 2, ParityScheme::DoubleParity).unwrap();
        let engine = IoEngine::new().unwrap();
        let stripes: Vec<Option<Arc<dyn StripeIo>>> = (0..6)
            .map(|i| {
                Some(Arc::new(FsStripeIo::new(
                    dir.path().join(format!("stripe{}", i)),
                    engine.clone(),
                    false,
                )) as Arc<dyn StripeIo>)
            })
            .collect();

        RainCore::open(
            layout,
            stripes,
            0,
            0,
            RainOptions {
                mode: AccessMode::ReadWrite,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_write_rejected_on_read_only_handle() {
        let dir = TempDir::new().unwrap();
        let core = open_rw(&dir);
        core.write(0, &[0xab; 128]).unwrap();
        core.close().unwrap();

        let layout = LayoutDescriptor::new(1024, 4, 2, ParityScheme::DoubleParity).unwrap();
        let engine = IoEngine::new().unwrap();
        let stripes: Vec<Option<Arc<dyn StripeIo>>> = (0..6)
            .map(|i| {
                Some(Arc::new(FsStripeIo::new(
                    dir.path().join(format!("stripe{}", i)),
                    engine.clone(),
                    false,
                )) as Arc<dyn StripeIo>)
            })
            .collect();
        let ro = RainCore::open(layout, stripes, 0, 0, RainOptions::default()).unwrap();

        let err = ro.write(0, b"nope").unwrap_err();
        assert_eq!(err.status(), crate::error::StatusCode::NotMutable);
        ro.close().unwrap();
    }

    #[test]
    fn test_streaming_mode_toggles_on_gap() {
        let dir = TempDir::new().unwrap();
        let core = open_rw(&dir);

        core.write(0, &[1u8; 512]).unwrap();
        assert!(core.state.lock().is_streaming);

        // Skip ahead: the handle must fall back to the sparse pipeline.
        core.write(4096, &[2u8; 512]).unwrap();
        assert!(!core.state.lock().is_streaming);

        core.close().unwrap();
    }

    #[test]
    fn test_write_grows_file_size() {
        let dir = TempDir::new().unwrap();
        let core = open_rw(&dir);

        core.write(0, &[7u8; 100]).unwrap();
        assert_eq!(core.file_size(), 100);

        core.write(100, &[7u8; 50]).unwrap();
        assert_eq!(core.file_size(), 150);

        core.close().unwrap();
    }

    #[test]
    fn test_parity_error_fails_writes_fast() {
        let dir = TempDir::new().unwrap();
        let core = open_rw(&dir);

        core.write(0, &[1u8; 64]).unwrap();
        let size_before = core.file_size();
        core.shared().set_parity_error();

        // Every further write must fail fast without advancing any state.
        assert!(core.write(64, &[1u8; 64]).is_err());
        assert!(core.write(128, &[1u8; 64]).is_err());
        assert_eq!(core.file_size(), size_before);

        // Close surfaces the failure as well.
        assert!(core.close().is_err());
    }

    #[test]
    fn test_group_completion_trigger() {
        // Writing exactly up to the group boundary hands the group to the
        // worker; a partial group stays resident until close.
        let dir = TempDir::new().unwrap();
        let core = open_rw(&dir);
        let group_size = core.layout().group_data_size() as usize;

        core.write(0, &vec![3u8; group_size / 2]).unwrap();
        assert_eq!(core.shared().registry.len(), 1, "partial group stays");

        core.write((group_size / 2) as u64, &vec![3u8; group_size / 2])
            .unwrap();

        // The worker picks the group up and recycles it.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while core.shared().registry.len() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(core.shared().registry.len(), 0, "completed group recycled");

        core.close().unwrap();
    }
}
