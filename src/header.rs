//! Stripe-file header
//!
//! Every stripe file starts with a fixed-size, self-describing binary
//! preamble. The header records file-wide parameters (block count and
//! sizes) plus the logical position of this particular stripe, which lets
//! the engine rebuild the physical-to-logical mapping after stripes have
//! been permuted or lost.
//!
//! Wire format, little-endian, zero-padded to the configured header size:
//!
//! ```text
//! offset  0: tag              16 bytes  "_HEADER__RAIDIO_"
//! offset 16: stripe_id         u32      logical stripe index
//! offset 20: num_blocks        i64      data blocks in the logical file
//! offset 28: size_last_block   u64      bytes used in the final block
//! offset 36: block_size        u64      block size at creation time
//! ```

use serde::Serialize;
use tracing::{debug, warn};

use crate::block::AlignedBuf;
use crate::error::Result;
use crate::io::StripeIo;
use crate::layout::DEFAULT_HEADER_SIZE;

/// Marker at the start of every stripe file.
pub const HEADER_TAG: &[u8; 16] = b"_HEADER__RAIDIO_";

/// Serialized size of the meaningful header fields.
const FIELDS_LEN: usize = 16 + 4 + 8 + 8 + 8;

// =============================================================================
// StripeHeader
// =============================================================================

/// Parsed header of one stripe file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StripeHeader {
    /// Logical index of this stripe within the layout
    stripe_id: u32,
    /// Total number of data blocks in the logical file
    num_blocks: i64,
    /// Bytes used in the final data block
    size_last_block: u64,
    /// Block size recorded at creation
    block_size: u64,
    /// Size of the on-disk header region
    #[serde(skip)]
    header_size: u32,
    /// Whether the header passed validation
    #[serde(skip)]
    valid: bool,
}

impl StripeHeader {
    /// Create an empty, invalid header for a stripe of the given geometry.
    ///
    /// A `header_size` of zero selects the default; a `block_size` of zero
    /// means "adopt whatever the on-disk header says".
    pub fn new(header_size: u32, block_size: u64) -> Self {
        let header_size = if header_size == 0 {
            DEFAULT_HEADER_SIZE
        } else {
            header_size
        };

        Self {
            stripe_id: 0,
            num_blocks: 0,
            size_last_block: 0,
            block_size,
            header_size,
            valid: false,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Logical stripe index recorded in the header.
    pub fn stripe_id(&self) -> u32 {
        self.stripe_id
    }

    /// Total number of data blocks in the logical file.
    pub fn num_blocks(&self) -> i64 {
        self.num_blocks
    }

    /// Bytes used in the final data block.
    pub fn size_last_block(&self) -> u64 {
        self.size_last_block
    }

    /// Block size recorded at creation.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Size of the on-disk header region.
    pub fn header_size(&self) -> u32 {
        self.header_size
    }

    /// Whether the header passed validation.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_stripe_id(&mut self, id: u32) {
        self.stripe_id = id;
    }

    pub fn set_num_blocks(&mut self, num_blocks: i64) {
        self.num_blocks = num_blocks;
    }

    pub fn set_size_last_block(&mut self, size: u64) {
        self.size_last_block = size;
    }

    /// Mark the header valid or corrupted.
    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Logical file size derived from the header fields.
    pub fn file_size(&self) -> u64 {
        if self.num_blocks > 0 {
            (self.num_blocks as u64 - 1) * self.block_size + self.size_last_block
        } else {
            0
        }
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Serialize the fields into the front of `buf`; the rest is zeroed.
    fn encode_into(&self, buf: &mut [u8]) {
        buf.fill(0);
        buf[0..16].copy_from_slice(HEADER_TAG);
        buf[16..20].copy_from_slice(&self.stripe_id.to_le_bytes());
        buf[20..28].copy_from_slice(&self.num_blocks.to_le_bytes());
        buf[28..36].copy_from_slice(&self.size_last_block.to_le_bytes());
        buf[36..44].copy_from_slice(&self.block_size.to_le_bytes());
    }

    /// Parse the fields out of `buf`; `None` when the tag does not match.
    fn decode_from(buf: &[u8]) -> Option<(u32, i64, u64, u64)> {
        if buf.len() < FIELDS_LEN || &buf[0..16] != HEADER_TAG {
            return None;
        }

        let stripe_id = u32::from_le_bytes(buf[16..20].try_into().ok()?);
        let num_blocks = i64::from_le_bytes(buf[20..28].try_into().ok()?);
        let size_last_block = u64::from_le_bytes(buf[28..36].try_into().ok()?);
        let block_size = u64::from_le_bytes(buf[36..44].try_into().ok()?);
        Some((stripe_id, num_blocks, size_last_block, block_size))
    }

    // =========================================================================
    // Stripe I/O
    // =========================================================================

    /// Read and validate the header from the start of a stripe file.
    ///
    /// Returns true and marks the header valid on success. A short read, a
    /// tag mismatch or a block-size mismatch leaves the header invalid.
    pub fn read_from(&mut self, io: &dyn StripeIo) -> bool {
        self.valid = false;

        let mut buf = match AlignedBuf::new_zeroed(self.header_size as usize) {
            Ok(buf) => buf,
            Err(err) => {
                warn!(%err, "failed to allocate header buffer");
                return false;
            }
        };

        match io.read(0, &mut buf) {
            Ok(n) if n == self.header_size as usize => {}
            Ok(n) => {
                debug!(url = io.url(), got = n, "short header read");
                return false;
            }
            Err(err) => {
                debug!(url = io.url(), %err, "header read failed");
                return false;
            }
        }

        let Some((stripe_id, num_blocks, size_last_block, block_size)) =
            Self::decode_from(&buf)
        else {
            debug!(url = io.url(), "header tag mismatch");
            return false;
        };

        if self.block_size == 0 {
            self.block_size = block_size;
        } else if self.block_size != block_size {
            warn!(
                url = io.url(),
                got = block_size,
                expected = self.block_size,
                "header block size does not match layout"
            );
            return false;
        }

        self.stripe_id = stripe_id;
        self.num_blocks = num_blocks;
        self.size_last_block = size_last_block;
        self.valid = true;
        true
    }

    /// Serialize the header and write it at offset 0 of the stripe file.
    ///
    /// Marks the header valid and returns true when the transport accepted
    /// a positive byte count.
    pub fn write_to(&mut self, io: &dyn StripeIo) -> bool {
        self.valid = false;

        let mut buf = match AlignedBuf::new_zeroed(self.header_size as usize) {
            Ok(buf) => buf,
            Err(err) => {
                warn!(%err, "failed to allocate header buffer");
                return false;
            }
        };

        self.encode_into(&mut buf);

        match io.write(0, &buf) {
            Ok(n) if n > 0 => {
                self.valid = true;
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!(url = io.url(), %err, "header write failed");
                false
            }
        }
    }

    /// Human-readable header summary for the dump tool.
    pub fn dump_info(&self) -> String {
        if !self.valid {
            return "ERROR: RAIN header not valid!".to_string();
        }

        format!(
            "Stripe index    : {}\n\
             Num. blocks     : {}\n\
             Block size      : {}\n\
             Size last block : {}",
            self.stripe_id, self.num_blocks, self.block_size, self.size_last_block
        )
    }

    /// JSON rendering of the header fields for the dump tool.
    pub fn dump_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::Error::Io(format!("header json encoding failed: {}", e)))
    }
}

// =============================================================================
// Tests
// =============================================================================
