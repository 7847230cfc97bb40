//! Parity groups
//!
//! A [`RainGroup`] is the ordered collection of all blocks, data and parity,
//! sharing one group offset. Writers copy data into the group's blocks and
//! stash the futures of their in-flight stripe writes here; the parity
//! worker later locks the group, completes the blocks, derives parity and
//! joins everything that is pending before the group is recycled.

use parking_lot::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

use crate::block::RainBlock;
use crate::error::Result;
use crate::io::IoFuture;

// =============================================================================
// RainGroup
// =============================================================================

/// One group of blocks plus its pending asynchronous writes.
pub struct RainGroup {
    /// Logical file offset of the first data byte in this group
    offset: u64,
    /// All blocks of the group, row-major over data then parity columns
    blocks: Mutex<Vec<RainBlock>>,
    /// Futures of writes issued against this group, joined before recycling
    pending: Mutex<Vec<IoFuture<()>>>,
}

impl RainGroup {
    /// Allocate a group of `total_blocks` zeroed blocks.
    pub fn new(offset: u64, total_blocks: usize, block_size: u32) -> Result<Self> {
        let mut blocks = Vec::with_capacity(total_blocks);
        for _ in 0..total_blocks {
            blocks.push(RainBlock::new(block_size)?);
        }

        Ok(Self {
            offset,
            blocks: Mutex::new(blocks),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Group offset of this object.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Lock the group's blocks. The parity worker holds this over the
    /// complete fill/compute/flush sequence to serialize against recycling.
    pub fn lock_blocks(&self) -> MutexGuard<'_, Vec<RainBlock>> {
        self.blocks.lock()
    }

    /// Zero-fill any block region not yet covered by writes. Short final
    /// groups tolerate this; virtual past-end bytes are defined as zero.
    pub fn fill_with_zeros(&self) {
        let mut blocks = self.blocks.lock();
        for block in blocks.iter_mut() {
            block.fill_with_zeros();
        }
    }

    /// Append the future of an asynchronous write touching this group.
    pub fn store_future(&self, future: IoFuture<()>) {
        self.pending.lock().push(future);
    }

    /// Join all stashed futures, reporting whether every one completed OK.
    /// The pending list is cleared either way.
    pub fn wait_async_ok(&self, timeout: Option<Duration>) -> bool {
        let futures: Vec<_> = std::mem::take(&mut *self.pending.lock());
        let mut all_ok = true;

        for future in futures {
            if let Err(err) = future.wait_timeout(timeout) {
                warn!(grp_off = self.offset, %err, "async write failed in group");
                all_ok = false;
            }
        }

        all_ok
    }

    /// Number of futures currently stashed.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
