//! RAIN engine core
//!
//! [`RainCore`] orchestrates one open striped file: it owns the stripe I/O
//! objects, validates and repairs headers on open, maps logical stripes to
//! physical ones, schedules parity groups and drives the read, write,
//! truncate, sync and close paths.
//!
//! One opener is designated the *entry server* (its replica index equals the
//! replica head) and coordinates all multi-stripe work; every other opener
//! only passes operations through to its local stripe.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::header::StripeHeader;
use crate::io::{OpenFlags, StripeIo};
use crate::layout::LayoutDescriptor;
use crate::parity::{engine_for, ParityEngine};
use crate::registry::{GroupRegistry, DEFAULT_MAX_GROUPS};

mod read;
mod recovery;
mod worker;
mod write;

pub use read::ChunkBuf;

use worker::ParityWorker;

/// Size reported by [`RainCore::stat`]-style helpers when the stripes have
/// never been opened; the real size cannot be known without them.
pub const UNKNOWN_FILE_SIZE: u64 = 0x19DE_ADBE_EF;

// =============================================================================
// Options
// =============================================================================

/// Access mode requested for the file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Tunables for opening a [`RainCore`].
#[derive(Debug, Clone)]
pub struct RainOptions {
    /// Requested access mode
    pub mode: AccessMode,
    /// Convert reads into on-disk group repair; implies read-write
    pub force_recovery: bool,
    /// Timeout applied when joining asynchronous stripe operations
    pub timeout: Option<Duration>,
    /// Bound on simultaneously live parity groups
    pub max_groups: usize,
}

impl Default for RainOptions {
    fn default() -> Self {
        Self {
            mode: AccessMode::ReadOnly,
            force_recovery: false,
            timeout: None,
            max_groups: DEFAULT_MAX_GROUPS,
        }
    }
}

// =============================================================================
// Shared + session state
// =============================================================================

/// State shared between the public entry points and the parity worker.
pub(crate) struct RainShared {
    pub(crate) layout: LayoutDescriptor,
    /// Stripe I/O objects in physical order, position 0 being the local
    /// stripe. A slot turns `None` when the stripe is lost for good.
    pub(crate) stripes: RwLock<Vec<Option<Arc<dyn StripeIo>>>>,
    /// Logical stripe id to physical position
    pub(crate) map_lp: Vec<usize>,
    /// Physical position to logical stripe id
    pub(crate) map_pl: Vec<usize>,
    pub(crate) registry: GroupRegistry,
    pub(crate) parity: Box<dyn ParityEngine>,
    /// Sticky flag set by any failed parity computation
    pub(crate) parity_error: AtomicBool,
    pub(crate) is_rw: bool,
    pub(crate) is_entry: bool,
    pub(crate) force_recovery: bool,
    /// Whether recovered blocks are persisted back to the stripes
    pub(crate) store_recovery: bool,
    pub(crate) timeout: Option<Duration>,
}

impl RainShared {
    /// Clone the stripe handle at a physical position, if still alive.
    pub(crate) fn stripe(&self, physical: usize) -> Option<Arc<dyn StripeIo>> {
        self.stripes.read()[physical].clone()
    }

    pub(crate) fn has_parity_error(&self) -> bool {
        self.parity_error.load(Ordering::SeqCst)
    }

    pub(crate) fn set_parity_error(&self) {
        self.parity_error.store(true, Ordering::SeqCst);
    }
}

/// Mutable session state, guarded by the exclusive-access mutex so that
/// mutating entry points serialize against each other.
pub(crate) struct CoreState {
    pub(crate) is_open: bool,
    pub(crate) is_streaming: bool,
    pub(crate) do_truncate: bool,
    pub(crate) done_recovery: bool,
    pub(crate) file_size: u64,
    pub(crate) last_write_offset: u64,
    pub(crate) headers: Vec<StripeHeader>,
    /// Written pieces whose parity is still outstanding (offset -> length)
    pub(crate) pieces: std::collections::BTreeMap<u64, u64>,
}

// =============================================================================
// RainCore
// =============================================================================

/// One open RAIN striped file.
pub struct RainCore {
    shared: Arc<RainShared>,
    state: Mutex<CoreState>,
    worker: Mutex<Option<ParityWorker>>,
    /// Groups already repaired by forced-recovery reads
    recovered_groups: DashSet<u64>,
}

impl RainCore {
    /// Open a striped file.
    ///
    /// `stripes` lists the stripe I/O objects in physical order with the
    /// local stripe at position 0; `None` marks an intentionally missing
    /// stripe. The entry server (replica index equals the head index) must
    /// pass all `N` slots, other openers only their local stripe.
    #[instrument(skip_all)]
    pub fn open(
        layout: LayoutDescriptor,
        stripes: Vec<Option<Arc<dyn StripeIo>>>,
        replica_index: u16,
        replica_head: u16,
        opts: RainOptions,
    ) -> Result<Self> {
        layout.validate()?;

        let total = layout.total_count() as usize;
        if replica_index as usize >= total || replica_head as usize >= total {
            return Err(Error::Invalid(format!(
                "replica index {} / head {} out of range for {} stripes",
                replica_index, replica_head, total
            )));
        }

        let is_entry = replica_index == replica_head;

        // Force-recovery implies writing repaired blocks back; a regular RW
        // open always rewrites the file wholesale.
        let (is_rw, flags) = if opts.force_recovery {
            (true, OpenFlags::recover())
        } else if opts.mode == AccessMode::ReadWrite {
            (true, OpenFlags::write())
        } else {
            (false, OpenFlags::read_only())
        };
        // Recovered blocks are persisted whenever the stripes are writable.
        let store_recovery = is_rw;

        let expected = if is_entry { total } else { 1 };
        if stripes.len() != expected {
            return Err(Error::Invalid(format!(
                "expected {} stripe slots, got {}",
                expected,
                stripes.len()
            )));
        }

        let missing = stripes.iter().filter(|s| s.is_none()).count();
        if is_rw && missing > 0 {
            return Err(Error::Invalid(format!(
                "{} stripes missing, writing requires all of them",
                missing
            )));
        }
        if missing > layout.parity_count as usize {
            return Err(Error::Invalid(format!(
                "{} stripes missing and parity is {}",
                missing, layout.parity_count
            )));
        }

        // Open every available stripe in parallel and collect the replies.
        let mut stripes = stripes;
        let open_futures: Vec<_> = stripes
            .iter()
            .map(|slot| slot.as_ref().map(|s| s.open_async(flags)))
            .collect();

        let mut failures = 0usize;
        for (i, future) in open_futures.into_iter().enumerate() {
            let failed = match future {
                Some(future) => match future.wait_timeout(opts.timeout) {
                    Ok(()) => false,
                    Err(err) => {
                        warn!(stripe = i, %err, "failed to open stripe");
                        true
                    }
                },
                None => false,
            };

            if failed {
                stripes[i] = None;
                failures += 1;
            }
        }

        if (is_rw && failures > 0)
            || (!is_entry && failures > 0)
            || (is_entry && missing + failures > layout.parity_count as usize)
        {
            return Err(Error::InsufficientStripes {
                available: stripes.iter().filter(|s| s.is_some()).count(),
                required: if is_rw {
                    total
                } else {
                    layout.data_count as usize
                },
            });
        }

        // Read every stripe's header.
        let mut headers: Vec<StripeHeader> = Vec::with_capacity(stripes.len());
        for slot in &stripes {
            let mut hdr = StripeHeader::new(layout.header_size, layout.block_size_u64());
            if let Some(stripe) = slot {
                hdr.read_from(stripe.as_ref());
            }
            headers.push(hdr);
        }

        // Entry server classifies and repairs the headers; other openers
        // only carry their local one.
        let (map_pl, map_lp, repaired) = if is_entry {
            validate_headers(
                &layout,
                &stripes,
                &mut headers,
                is_rw || opts.force_recovery,
            )?
        } else {
            (vec![0], vec![0], false)
        };

        let file_size = headers
            .iter()
            .find(|h| h.is_valid())
            .map(|h| h.file_size())
            .unwrap_or(0);

        let shared = Arc::new(RainShared {
            registry: GroupRegistry::new(&layout, opts.max_groups),
            parity: engine_for(&layout)?,
            layout,
            stripes: RwLock::new(stripes),
            map_lp,
            map_pl,
            parity_error: AtomicBool::new(false),
            is_rw,
            is_entry,
            force_recovery: opts.force_recovery,
            store_recovery,
            timeout: opts.timeout,
        });

        // Only the entry server in RW mode runs the parity worker; the
        // write path always hands completed groups to it.
        let worker = if is_entry && is_rw {
            Some(ParityWorker::spawn(shared.clone())?)
        } else {
            None
        };

        debug!(file_size, is_entry, is_rw, "open successful");

        Ok(Self {
            shared,
            state: Mutex::new(CoreState {
                is_open: true,
                is_streaming: true,
                do_truncate: false,
                done_recovery: repaired,
                file_size,
                last_write_offset: 0,
                headers,
                pieces: std::collections::BTreeMap::new(),
            }),
            worker: Mutex::new(worker),
            recovered_groups: DashSet::new(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Layout this handle was opened with.
    pub fn layout(&self) -> &LayoutDescriptor {
        &self.shared.layout
    }

    /// Whether this opener coordinates multi-stripe operations.
    pub fn is_entry_server(&self) -> bool {
        self.shared.is_entry
    }

    /// Whether the handle is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().is_open
    }

    /// Current logical file size.
    pub fn file_size(&self) -> u64 {
        self.state.lock().file_size
    }

    pub(crate) fn shared(&self) -> &Arc<RainShared> {
        &self.shared
    }

    // =========================================================================
    // Truncate
    // =========================================================================

    /// Truncate the logical file to `size` bytes.
    #[instrument(skip(self))]
    pub fn truncate(&self, size: u64) -> Result<()> {
        if !self.shared.is_rw {
            return Err(Error::NotMutable("truncate on read-only handle".into()));
        }

        let mut state = self.state.lock();
        if !state.is_open {
            return Err(Error::Io("file is not open".into()));
        }

        self.truncate_stripes(&mut state, size)
    }

    /// Fan the per-stripe truncate out in parallel and update the size.
    pub(crate) fn truncate_stripes(&self, state: &mut CoreState, size: u64) -> Result<()> {
        let shared = &self.shared;
        let stripe_offset = shared.layout.stripe_truncate_offset(size);
        debug!(size, stripe_offset, "truncating stripes");

        let stripes = shared.stripes.read();
        let mut futures = Vec::with_capacity(stripes.len());

        for (i, slot) in stripes.iter().enumerate() {
            match slot {
                Some(stripe) => futures.push((i, stripe.truncate_async(stripe_offset))),
                None => {
                    error!(stripe = i, "cannot truncate null stripe");
                    return Err(Error::Io(format!("stripe {} unavailable for truncate", i)));
                }
            }
        }
        drop(stripes);

        let mut result = Ok(());
        for (i, future) in futures {
            if let Err(err) = future.wait_timeout(shared.timeout) {
                error!(stripe = i, %err, "failed to truncate stripe");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        state.file_size = size;
        result
    }

    // =========================================================================
    // Sync / Remove / Stat / Fctl
    // =========================================================================

    /// Flush every reachable stripe to stable storage.
    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        if !state.is_open {
            return Err(Error::Io("file is not open".into()));
        }
        drop(state);

        let shared = &self.shared;
        let stripes = shared.stripes.read();
        let mut result = Ok(());

        for (i, slot) in stripes.iter().enumerate() {
            // Non-entry openers only sync their local stripe.
            if i > 0 && !shared.is_entry {
                break;
            }

            match slot {
                Some(stripe) => {
                    if let Err(err) = stripe.sync() {
                        error!(stripe = i, %err, "failed to sync stripe");
                        if result.is_ok() {
                            result = Err(err);
                        }
                    }
                }
                None => warn!(stripe = i, "cannot sync null stripe"),
            }
        }

        result
    }

    /// Remove every stripe file, the local stripe last so its header
    /// survives as long as possible.
    pub fn remove(&self) -> Result<()> {
        let shared = &self.shared;
        let stripes = shared.stripes.read();
        let mut result = Ok(());

        if shared.is_entry {
            for (i, slot) in stripes.iter().enumerate().skip(1) {
                match slot {
                    Some(stripe) => {
                        if let Err(err) = stripe.remove() {
                            error!(stripe = i, %err, "failed to remove remote stripe");
                            if result.is_ok() {
                                result = Err(err);
                            }
                        }
                    }
                    None => warn!(stripe = i, "cannot remove null stripe"),
                }
            }
        }

        match stripes.first().and_then(|s| s.as_ref()) {
            Some(stripe) => {
                if let Err(err) = stripe.remove() {
                    error!(%err, "failed to remove local stripe");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
            None => warn!("cannot remove null local stripe"),
        }

        result
    }

    /// Logical file size for stat purposes.
    ///
    /// A handle that was never opened cannot know the size without the
    /// stripes and reports [`UNKNOWN_FILE_SIZE`]. Non-entry openers re-read
    /// their local header, which keeps stat working after a remote close.
    pub fn stat_size(&self) -> u64 {
        let mut state = self.state.lock();
        if !state.is_open {
            return UNKNOWN_FILE_SIZE;
        }

        if !self.shared.is_entry {
            if let Some(stripe) = self.shared.stripe(0) {
                let mut hdr = StripeHeader::new(
                    self.shared.layout.header_size,
                    self.shared.layout.block_size_u64(),
                );
                if hdr.read_from(stripe.as_ref()) {
                    state.file_size = hdr.file_size();
                }
            }
        }

        state.file_size
    }

    /// Fan an implementation-defined control command out to the stripes.
    pub fn fctl(&self, cmd: &str) -> Result<()> {
        let stripes = self.shared.stripes.read();
        let mut result = Ok(());

        for (i, slot) in stripes.iter().enumerate() {
            debug!(stripe = i, cmd, "sending fctl");
            if let Some(stripe) = slot {
                if let Err(err) = stripe.fctl(cmd) {
                    error!(stripe = i, %err, cmd, "fctl failed");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }

        result
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Close the file handle.
    ///
    /// The entry server re-truncates when recovery or writes changed the
    /// extent, stops the parity worker, computes any outstanding parity,
    /// joins all in-flight stripe operations, persists updated headers and
    /// closes the remote stripes. Every path closes the local stripe and
    /// marks the handle closed; errors are aggregated into the first one.
    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.is_open {
            return Err(Error::Io("file is not open".into()));
        }

        let shared = &self.shared;
        let mut result = Ok(());
        let keep = |r: Result<()>, result: &mut Result<()>| {
            if let Err(err) = r {
                if result.is_ok() {
                    *result = Err(err);
                }
            }
        };

        if shared.is_entry {
            if shared.is_rw {
                if state.done_recovery || state.do_truncate {
                    debug!("truncating after recovery or at end of write");
                    state.do_truncate = false;
                    state.done_recovery = false;
                    let size = state.file_size;
                    keep(self.truncate_stripes(&mut state, size), &mut result);
                }

                if let Some(worker) = self.worker.lock().take() {
                    worker.stop();
                }

                if state.is_streaming {
                    if shared.has_parity_error() {
                        keep(
                            Err(Error::Io("parity computation failed during write".into())),
                            &mut result,
                        );
                    } else {
                        for grp_off in shared.registry.all_offsets() {
                            if !worker::do_block_parity(shared, grp_off) {
                                error!(grp_off, "failed closing parity computation");
                                keep(Err(Error::ParityFailed { group_offset: grp_off }), &mut result);
                            }
                        }
                    }
                } else {
                    keep(self.sparse_parity_computation(&mut state, true), &mut result);
                }

                // Join everything still in flight on any stripe.
                for slot in shared.stripes.read().iter() {
                    if let Some(stripe) = slot {
                        let handler = stripe.async_handler();
                        keep(handler.wait_ok(), &mut result);
                        handler.reset();
                    }
                }

                keep(self.persist_headers(&mut state), &mut result);
            }

            // Close remote stripes.
            for (i, slot) in shared.stripes.read().iter().enumerate().skip(1) {
                match slot {
                    Some(stripe) => {
                        if let Err(err) = stripe.close() {
                            error!(stripe = i, %err, "failed remote stripe close");
                            keep(Err(err), &mut result);
                        }
                    }
                    None => warn!(stripe = i, "cannot close null stripe"),
                }
            }
        }

        // Close the local stripe.
        if let Some(stripe) = shared.stripe(0) {
            keep(stripe.close(), &mut result);
        }

        state.is_open = false;
        result
    }

    /// Update `num_blocks`/`size_last_block` from the final file size and
    /// rewrite every header whose content changed.
    fn persist_headers(&self, state: &mut CoreState) -> Result<()> {
        let shared = &self.shared;
        let block_size = shared.layout.block_size_u64();

        let size_last_block = state.file_size % block_size;
        let mut num_blocks = state.file_size.div_ceil(block_size) as i64;
        // A file ending exactly on a block boundary counts that block as a
        // full final block.
        if size_last_block == 0 && num_blocks > 0 {
            num_blocks += 1;
        }
        debug!(num_blocks, size_last_block, "final header fields");

        let mut update = false;
        for hdr in state.headers.iter_mut() {
            if hdr.num_blocks() != num_blocks {
                hdr.set_num_blocks(num_blocks);
                update = true;
            }
            if hdr.size_last_block() != size_last_block {
                hdr.set_size_last_block(size_last_block);
                update = true;
            }
        }

        if !update {
            return Ok(());
        }

        let stripes = shared.stripes.read();
        let mut result = Ok(());

        for (i, hdr) in state.headers.iter_mut().enumerate() {
            hdr.set_stripe_id(shared.map_pl[i] as u32);

            match &stripes[i] {
                Some(stripe) => {
                    if !hdr.write_to(stripe.as_ref()) {
                        error!(stripe = i, "failed to write header");
                        if result.is_ok() {
                            result = Err(Error::Io(format!("header write failed on stripe {}", i)));
                        }
                    }
                }
                None => warn!(stripe = i, "cannot write header to null stripe"),
            }
        }

        result
    }
}

impl Drop for RainCore {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
    }
}

// =============================================================================
// Header validation
// =============================================================================

/// Classify the headers read at open time, repair what can be repaired and
/// build the physical/logical stripe mappings.
///
/// Rules:
///
/// 1. No valid header at all means a new file: every header becomes a valid
///    zero header and the mapping is the identity.
/// 2. All valid: the mapping comes straight from the headers; two stripes
///    claiming one logical id is fatal.
/// 3. Up to `P` invalid: each invalid stripe is assigned the smallest
///    unused logical id and its counters are cloned from a valid reference
///    header; repaired headers are written back when `write_back` is set
///    and the stripe is reachable.
/// 4. More than `P` invalid is fatal.
fn validate_headers(
    layout: &LayoutDescriptor,
    stripes: &[Option<Arc<dyn StripeIo>>],
    headers: &mut [StripeHeader],
    write_back: bool,
) -> Result<(Vec<usize>, Vec<usize>, bool)> {
    let total = layout.total_count() as usize;
    let mut map_pl = vec![0usize; total];
    let mut used: HashSet<usize> = HashSet::new();
    let mut invalid: Vec<usize> = Vec::new();
    let mut reference: Option<usize> = None;

    for (i, hdr) in headers.iter().enumerate() {
        // A logical id out of range is treated as corruption.
        if hdr.is_valid() && (hdr.stripe_id() as usize) < total {
            let sid = hdr.stripe_id() as usize;

            if !used.insert(sid) {
                error!(logical = sid, "two physical stripes claim the same logical id");
                return Err(Error::Io(format!(
                    "two stripes claim logical id {}",
                    sid
                )));
            }

            map_pl[i] = sid;
            reference = Some(i);
        } else {
            invalid.push(i);
        }
    }

    if reference.is_none() {
        // Brand new file: identity mapping, zeroed headers.
        debug!("no valid header, initializing new file");
        for (i, hdr) in headers.iter_mut().enumerate() {
            hdr.set_valid(true);
            hdr.set_stripe_id(i as u32);
            hdr.set_num_blocks(0);
            hdr.set_size_last_block(0);
            map_pl[i] = i;
        }
        let map_lp = map_pl.clone();
        return Ok((map_pl, map_lp, false));
    }

    if invalid.len() > layout.parity_count as usize {
        error!(
            num_corrupt = invalid.len(),
            parity = layout.parity_count,
            "cannot recover headers"
        );
        return Err(Error::Io(format!(
            "{} corrupted headers exceed parity count {}",
            invalid.len(),
            layout.parity_count
        )));
    }

    if !invalid.is_empty() {
        let reference = reference.expect("checked above");
        let (ref_blocks, ref_last) = (
            headers[reference].num_blocks(),
            headers[reference].size_last_block(),
        );

        for &physical in &invalid {
            // Smallest logical id not claimed by a valid header.
            let logical = (0..total)
                .find(|id| !used.contains(id))
                .expect("a free logical id always exists");
            used.insert(logical);
            map_pl[physical] = logical;

            let hdr = &mut headers[physical];
            hdr.set_stripe_id(logical as u32);
            hdr.set_num_blocks(ref_blocks);
            hdr.set_size_last_block(ref_last);
            hdr.set_valid(true);

            if write_back {
                if let Some(stripe) = &stripes[physical] {
                    info!(physical, logical, "recovered header for stripe");
                    hdr.write_to(stripe.as_ref());
                }
            }
        }
    }

    let repaired = !invalid.is_empty();
    let mut map_lp = vec![0usize; total];
    for (physical, &logical) in map_pl.iter().enumerate() {
        map_lp[logical] = physical;
        debug!(physical, logical, "stripe mapping");
    }

    Ok((map_pl, map_lp, repaired))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ParityScheme;

    fn layout() -> LayoutDescriptor {
        LayoutDescriptor::new(1024, 4, 2, ParityScheme::DoubleParity).unwrap()
    }

    fn headers_with_ids(ids: &[Option<u32>]) -> Vec<StripeHeader> {
        ids.iter()
            .map(|id| {
                let mut hdr = StripeHeader::new(4096, 1024);
                if let Some(id) = id {
                    hdr.set_stripe_id(*id);
                    hdr.set_num_blocks(8);
                    hdr.set_size_last_block(100);
                    hdr.set_valid(true);
                }
                hdr
            })
            .collect()
    }

    fn no_stripes(n: usize) -> Vec<Option<Arc<dyn StripeIo>>> {
        (0..n).map(|_| None).collect()
    }

    #[test]
    fn test_validate_new_file_identity_mapping() {
        let layout = layout();
        let mut headers = headers_with_ids(&[None; 6]);

        let (map_pl, map_lp, repaired) =
            validate_headers(&layout, &no_stripes(6), &mut headers, false).unwrap();

        assert_eq!(map_pl, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(map_lp, vec![0, 1, 2, 3, 4, 5]);
        assert!(!repaired, "a new file is not a recovery");
        assert!(headers.iter().all(|h| h.is_valid()));
        assert!(headers.iter().all(|h| h.num_blocks() == 0));
    }

    #[test]
    fn test_validate_permuted_headers() {
        let layout = layout();
        let ids = [Some(2), Some(0), Some(1), Some(3), Some(5), Some(4)];
        let mut headers = headers_with_ids(&ids);

        let (map_pl, map_lp, repaired) =
            validate_headers(&layout, &no_stripes(6), &mut headers, false).unwrap();

        assert!(!repaired);
        assert_eq!(map_pl, vec![2, 0, 1, 3, 5, 4]);
        // Bijection property.
        for logical in 0..6 {
            assert_eq!(map_pl[map_lp[logical]], logical);
        }
    }

    #[test]
    fn test_validate_duplicate_logical_id_fatal() {
        let layout = layout();
        let ids = [Some(0), Some(0), Some(1), Some(2), Some(3), Some(4)];
        let mut headers = headers_with_ids(&ids);

        assert!(validate_headers(&layout, &no_stripes(6), &mut headers, false).is_err());
    }

    #[test]
    fn test_validate_repairs_up_to_parity_count() {
        let layout = layout();
        let ids = [Some(4), None, Some(1), Some(3), None, Some(0)];
        let mut headers = headers_with_ids(&ids);

        let (map_pl, map_lp, repaired) =
            validate_headers(&layout, &no_stripes(6), &mut headers, false).unwrap();

        assert!(repaired);
        // The invalid stripes took the smallest unused logical ids (2, 5).
        assert_eq!(map_pl[1], 2);
        assert_eq!(map_pl[4], 5);
        for logical in 0..6 {
            assert_eq!(map_pl[map_lp[logical]], logical);
        }

        // Repaired headers cloned the reference counters.
        assert!(headers[1].is_valid());
        assert_eq!(headers[1].num_blocks(), 8);
        assert_eq!(headers[1].size_last_block(), 100);
    }

    #[test]
    fn test_validate_too_many_corruptions_fatal() {
        let layout = layout();
        let ids = [Some(0), None, None, None, Some(1), Some(2)];
        let mut headers = headers_with_ids(&ids);

        assert!(validate_headers(&layout, &no_stripes(6), &mut headers, false).is_err());
    }

    #[test]
    fn test_validate_out_of_range_id_counts_as_invalid() {
        let layout = layout();
        let ids = [Some(0), Some(99), Some(1), Some(2), Some(3), Some(4)];
        let mut headers = headers_with_ids(&ids);

        let (map_pl, _, _) =
            validate_headers(&layout, &no_stripes(6), &mut headers, false).unwrap();
        assert_eq!(map_pl[1], 5, "smallest unused id assigned");
    }
}
