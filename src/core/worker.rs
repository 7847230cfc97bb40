//! Background parity worker
//!
//! A dedicated thread consumes completed group offsets from a channel. For
//! each group it locks the blocks, zero-completes short tails, computes the
//! parity columns, queues the parity writes, joins every write stashed in
//! the group (the write path's data writes included) and recycles the
//! group's registry slot. Any failure sets the engine's sticky parity
//! error, after which writes fail fast until close.

use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error, info};

use crate::block::RainBlock;
use crate::core::RainShared;
use crate::error::{Error, Result};
use crate::group::RainGroup;

/// Queue value that shuts the worker down.
pub(crate) const QUEUE_SENTINEL: u64 = u64::MAX;

// =============================================================================
// ParityWorker
// =============================================================================

/// Handle to the running parity thread.
pub(crate) struct ParityWorker {
    tx: Sender<u64>,
    handle: Option<JoinHandle<()>>,
}

impl ParityWorker {
    /// Start the worker thread for an open file handle.
    pub(crate) fn spawn(shared: Arc<RainShared>) -> Result<Self> {
        let (tx, rx) = crossbeam::channel::unbounded();

        let handle = std::thread::Builder::new()
            .name("rain-parity".into())
            .spawn(move || worker_loop(shared, rx))
            .map_err(|e| Error::Io(format!("failed to start parity worker: {}", e)))?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Hand a completed group offset to the worker.
    pub(crate) fn enqueue(&self, grp_off: u64) -> Result<()> {
        self.tx
            .send(grp_off)
            .map_err(|_| Error::Io("parity worker queue is closed".into()))
    }

    /// Push the sentinel and join the thread.
    pub(crate) fn stop(mut self) {
        let _ = self.tx.send(QUEUE_SENTINEL);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<RainShared>, rx: Receiver<u64>) {
    while let Ok(grp_off) = rx.recv() {
        if grp_off == QUEUE_SENTINEL {
            info!("parity worker exiting");
            break;
        }

        if !do_block_parity(&shared, grp_off) {
            error!(grp_off, "failed parity computation");
            break;
        }
        debug!(grp_off, "parity computation done");
    }

    // Release whatever is still queued so a writer blocked on group
    // admission cannot deadlock against a stopped worker.
    while let Ok(grp_off) = rx.try_recv() {
        if grp_off == QUEUE_SENTINEL {
            continue;
        }
        if let Ok(grp) = shared.registry.get_or_create(grp_off) {
            shared.registry.recycle(&grp);
        }
    }
}

// =============================================================================
// Group parity
// =============================================================================

/// Compute and persist the parity of one group, joining all of its pending
/// writes. Returns false (and sets the sticky parity error) on any failure.
pub(crate) fn do_block_parity(shared: &RainShared, grp_off: u64) -> bool {
    let grp = match shared.registry.get_or_create(grp_off) {
        Ok(grp) => grp,
        Err(err) => {
            error!(grp_off, %err, "failed to materialize group");
            shared.set_parity_error();
            return false;
        }
    };

    let mut done = true;
    {
        // The lock spans fill, compute, flush and the join of the pending
        // writes, so data commits atomically with parity relative to it.
        let mut blocks = grp.lock_blocks();

        for block in blocks.iter_mut() {
            block.fill_with_zeros();
        }

        match shared.parity.compute_parity(&mut blocks) {
            Ok(()) => {
                if let Err(err) = write_parity_to_files(shared, &grp, &blocks) {
                    error!(grp_off, %err, "failed to write parity blocks");
                    done = false;
                }
            }
            Err(err) => {
                error!(grp_off, %err, "failed to compute parity");
                done = false;
            }
        }

        if !grp.wait_async_ok(shared.timeout) {
            error!(grp_off, "some async operations failed in group");
            done = false;
        }
    }

    if !done {
        shared.set_parity_error();
    }

    shared.registry.recycle(&grp);
    done
}

/// Queue one asynchronous write per parity block of the group, stashing the
/// futures in the group for the caller to join.
fn write_parity_to_files(
    shared: &RainShared,
    grp: &Arc<RainGroup>,
    blocks: &[RainBlock],
) -> Result<()> {
    let layout = &shared.layout;
    let data = layout.data_count as usize;
    let total = layout.total_count() as usize;
    let header = layout.header_size as u64;

    for col in data..total {
        let physical = shared.map_lp[col];
        let stripe = shared.stripe(physical).ok_or_else(|| {
            Error::Io(format!("parity stripe {} is unavailable", col))
        })?;

        for row in 0..data {
            let offset = layout.local_block_offset(grp.offset(), row) + header;
            let content = Bytes::copy_from_slice(blocks[row * total + col].data());
            grp.store_future(stripe.write_async(offset, content));
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
    use crate::layout::{LayoutDescriptor, ParityScheme};
    use crate::parity::engine_for;
    use crate::registry::GroupRegistry;
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicBool;

    fn shared_without_stripes(layout: LayoutDescriptor) -> Arc<RainShared> {
        let total = layout.total_count() as usize;
        Arc::new(RainShared {
            registry: GroupRegistry::new(&layout, 4),
            parity: engine_for(&layout).unwrap(),
            stripes: RwLock::new((0..total).map(|_| None).collect()),
            map_lp: (0..total).collect(),
            map_pl: (0..total).collect(),
            layout,
            parity_error: AtomicBool::new(false),
            is_rw: true,
            is_entry: true,
            force_recovery: false,
            store_recovery: true,
            timeout: None,
        })
    }

    #[test]
    fn test_parity_error_is_sticky_on_missing_stripes() {
        let layout = LayoutDescriptor::new(256, 4, 2, ParityScheme::DoubleParity).unwrap();
        let shared = shared_without_stripes(layout);

        // Parity stripes are all None, so the flush must fail and latch the
        // sticky error.
        assert!(!do_block_parity(&shared, 0));
        assert!(shared.has_parity_error());
        assert!(shared.registry.is_empty(), "group recycled after failure");
    }

    #[test]
    fn test_worker_releases_groups_on_shutdown() {
        let layout = LayoutDescriptor::new(256, 4, 2, ParityScheme::DoubleParity).unwrap();
        let gs = layout.group_data_size();
        let shared = shared_without_stripes(layout);

        // Groups a writer would have filled before handing them over.
        drop(shared.registry.get_or_create(0).unwrap());
        drop(shared.registry.get_or_create(gs).unwrap());

        let worker = ParityWorker::spawn(shared.clone()).unwrap();
        worker.enqueue(0).unwrap();
        worker.enqueue(gs).unwrap();
        worker.stop();

        // Whether an offset was processed (and failed on the null stripes)
        // or drained after shutdown, its group must have been recycled so
        // no writer can deadlock on admission.
        assert!(shared.registry.is_empty());
        assert!(shared.has_parity_error());
    }
}
