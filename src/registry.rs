//! Group registry with bounded admission
//!
//! The registry owns every live [`RainGroup`] of one file handle, keyed by
//! group offset. Admission is bounded: creating a new group blocks while
//! `max_groups` are already live, which couples the engine's memory
//! footprint to `max_groups * group_size`. Looking up an existing group
//! always succeeds immediately, bound or not.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::group::RainGroup;
use crate::layout::LayoutDescriptor;

/// Default bound on simultaneously live groups.
pub const DEFAULT_MAX_GROUPS: usize = 32;

// =============================================================================
// GroupRegistry
// =============================================================================

/// Bounded map of group offset to live group.
pub struct GroupRegistry {
    max_groups: usize,
    block_size: u32,
    total_blocks: usize,
    group_data_size: u64,
    groups: Mutex<HashMap<u64, Arc<RainGroup>>>,
    slot_freed: Condvar,
}

impl GroupRegistry {
    /// Create a registry for the given layout.
    pub fn new(layout: &LayoutDescriptor, max_groups: usize) -> Self {
        Self {
            max_groups: max_groups.max(1),
            block_size: layout.block_size,
            total_blocks: layout.total_blocks_per_group(),
            group_data_size: layout.group_data_size(),
            groups: Mutex::new(HashMap::new()),
            slot_freed: Condvar::new(),
        }
    }

    /// Get the group covering `offset`, creating it when absent.
    ///
    /// An existing group is returned regardless of the admission bound.
    /// Otherwise the call waits until a slot is free, then allocates a
    /// group of the registry's arity and block size.
    pub fn get_or_create(&self, offset: u64) -> Result<Arc<RainGroup>> {
        let grp_off = (offset / self.group_data_size) * self.group_data_size;
        let mut groups = self.groups.lock();

        loop {
            if let Some(grp) = groups.get(&grp_off) {
                return Ok(grp.clone());
            }

            if groups.len() < self.max_groups {
                break;
            }

            info!(grp_off, "waiting for a free group slot");
            self.slot_freed.wait(&mut groups);
        }

        let grp = Arc::new(RainGroup::new(grp_off, self.total_blocks, self.block_size)?);
        groups.insert(grp_off, grp.clone());
        Ok(grp)
    }

    /// Drop the registry's reference to `group` when no external holder
    /// remains, freeing one admission slot and waking one waiter.
    ///
    /// With other references still alive the call is skipped; whoever holds
    /// the last external reference recycles eventually.
    pub fn recycle(&self, group: &Arc<RainGroup>) {
        {
            let mut groups = self.groups.lock();

            // Caller's reference plus the map's own one.
            if Arc::strong_count(group) > 2 {
                debug!(grp_off = group.offset(), "skip group recycle, still referenced");
                return;
            }

            if groups.remove(&group.offset()).is_none() {
                warn!(
                    grp_off = group.offset(),
                    "tried to recycle a group missing from the registry"
                );
                return;
            }

            debug!(grp_off = group.offset(), "recycled group");
        }

        self.slot_freed.notify_one();
    }

    /// Snapshot of the offsets of all live groups.
    pub fn all_offsets(&self) -> Vec<u64> {
        let mut offsets: Vec<u64> = self.groups.lock().keys().copied().collect();
        offsets.sort_unstable();
        offsets
    }

    /// Number of live groups.
    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    /// True when no group is live.
    pub fn is_empty(&self) -> bool {
        self.groups.lock().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
