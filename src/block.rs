//! Aligned block buffers
//!
//! Stripe blocks are the unit of parity computation, so their backing memory
//! is aligned to the larger of the OS page size and the parity engines'
//! vector word. [`AlignedBuf`] provides a safe wrapper around a raw aligned
//! allocation with automatic cleanup; [`RainBlock`] layers write-coverage
//! tracking on top so short tail blocks can be zero-completed before parity
//! is derived.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::layout::VECTOR_WORD;

/// OS page size, queried once.
static OS_PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    #[cfg(unix)]
    {
        // SAFETY: sysconf is always safe to call; a negative result means
        // the limit is indeterminate and we fall back to 4 KiB.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as usize;
        }
    }
    4096
});

/// Alignment applied to every block and header buffer.
pub fn buffer_alignment() -> usize {
    std::cmp::max(*OS_PAGE_SIZE, VECTOR_WORD)
}

// =============================================================================
// AlignedBuf
// =============================================================================

/// A zero-initialized, page-aligned byte buffer.
///
/// The buffer is:
///
/// - **Aligned** to [`buffer_alignment`], so XOR and Galois-field routines
///   can run over full vector words and direct I/O stays legal.
/// - **Zeroed** at allocation, which makes uncovered block regions read as
///   zeroes without extra work.
/// - **Owned**: freed on drop, pointer checked non-null at allocation.
///
/// Implements `Send`; concurrent access goes through the owning group's lock.
#[derive(Debug)]
pub struct AlignedBuf {
    /// Non-null pointer to the allocation
    ptr: NonNull<u8>,
    /// Allocation layout, kept for deallocation
    layout: Layout,
}

// SAFETY: AlignedBuf owns its memory exclusively and can be sent between
// threads; nothing in it is tied to the allocating thread.
unsafe impl Send for AlignedBuf {}
// SAFETY: shared references only permit reads of plain bytes.
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a new zeroed buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if `size` is 0 or the allocation fails.
    pub fn new_zeroed(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Io("cannot allocate empty aligned buffer".into()));
        }

        let layout = Layout::from_size_align(size, buffer_alignment())
            .map_err(|e| Error::Io(format!("bad buffer layout: {}", e)))?;

        // SAFETY: layout has non-zero size, validated above.
        let raw = unsafe { alloc_zeroed(layout) };

        match NonNull::new(raw) {
            Some(ptr) => Ok(Self { ptr, layout }),
            None => Err(Error::Io(format!(
                "failed to allocate {} aligned bytes",
                size
            ))),
        }
    }

    /// Length of the buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// True when the buffer has zero length. Never the case after
    /// construction, present for slice-like completeness.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Stable pointer to the underlying storage.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for len() bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid and uniquely borrowed through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// =============================================================================
// RainBlock
// =============================================================================

/// One block of one stripe within a group.
///
/// Tracks how far the block has been covered by writes in its current
/// lifetime so that [`RainBlock::fill_with_zeros`] can promote a partially
/// written tail block to a full block of well-defined content.
#[derive(Debug)]
pub struct RainBlock {
    buf: AlignedBuf,
    /// Highest byte offset covered by writes so far
    covered: usize,
}

impl RainBlock {
    /// Allocate a zeroed block of `block_size` bytes.
    pub fn new(block_size: u32) -> Result<Self> {
        Ok(Self {
            buf: AlignedBuf::new_zeroed(block_size as usize)?,
            covered: 0,
        })
    }

    /// Copy `src` into the block at `offset`.
    ///
    /// Accumulates the covered interval. Fails with `Error::Invalid` if the
    /// write would run past the end of the block.
    pub fn write(&mut self, src: &[u8], offset: usize) -> Result<()> {
        let end = offset
            .checked_add(src.len())
            .ok_or_else(|| Error::Invalid("block write overflows".into()))?;

        if end > self.buf.len() {
            return Err(Error::Invalid(format!(
                "block write [{}, {}) past block end {}",
                offset,
                end,
                self.buf.len()
            )));
        }

        self.buf[offset..end].copy_from_slice(src);

        if end > self.covered {
            self.covered = end;
        }

        Ok(())
    }

    /// Zero any bytes not yet covered by a write so the block represents a
    /// full block of file content, then mark the whole block covered.
    pub fn fill_with_zeros(&mut self) {
        let len = self.buf.len();
        if self.covered < len {
            self.buf[self.covered..len].fill(0);
        }
        self.covered = len;
    }

    /// Bytes covered by writes so far.
    #[inline]
    pub fn covered(&self) -> usize {
        self.covered
    }

    /// Block size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Always false for a constructed block.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Read-only view of the block content.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable view of the block content; marks the block fully covered
    /// since the caller may write anywhere in it.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.covered = self.buf.len();
        &mut self.buf
    }
}

// =============================================================================
// Tests
// =============================================================================
