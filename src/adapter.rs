//! Engine adaptor
//!
//! Bridges the client-facing plumbing to [`RainCore`]: decodes the packed
//! layout id from the catalog, parses the opaque CGI-style key-value
//! parameters of an open request, constructs the stripe I/O objects and
//! surfaces engine errors as status codes plus messages.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::core::{AccessMode, RainCore, RainOptions};
use crate::error::{Error, Result, StatusCode};
use crate::io::{FsStripeIo, IoEngine, StripeIo};
use crate::layout::LayoutId;

// =============================================================================
// Opaque parameters
// =============================================================================

/// Parameters carried by the opaque info of an open request.
///
/// The opaque string is a CGI-style `key=value&key=value` list with
/// URL-encoded values. Recognized keys:
///
/// | Key            | Effect                                              |
/// |----------------|-----------------------------------------------------|
/// | `replicaindex` | Physical stripe index of this opener (required)     |
/// | `replicahead`  | Physical index of the entry server (required)       |
/// | `url{i}`       | URL of stripe *i*; absent means missing stripe      |
/// | `readahead`    | Enable read-ahead hints on stripe I/O               |
/// | `blocksize`    | Bytes per block, overriding the layout id           |
/// | `path`         | Logical file path, passed through                   |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenParams {
    pub replica_index: u16,
    pub replica_head: u16,
    /// Stripe URLs indexed by physical stripe; `None` marks a missing one
    pub stripe_urls: Vec<Option<String>>,
    pub readahead: bool,
    /// Block size override; 0 keeps the layout id's value
    pub block_size: u32,
    pub path: Option<String>,
}

impl OpenParams {
    /// Parse the opaque info for a layout of `total` stripes.
    pub fn from_opaque(opaque: &str, total: u16) -> Result<Self> {
        let mut replica_index: Option<u16> = None;
        let mut replica_head: Option<u16> = None;
        let mut stripe_urls: Vec<Option<String>> = vec![None; total as usize];
        let mut readahead = false;
        let mut block_size = 0u32;
        let mut path = None;

        for pair in opaque.split('&').filter(|p| !p.is_empty()) {
            let Some((key, raw)) = pair.split_once('=') else {
                warn!(pair, "ignoring malformed opaque parameter");
                continue;
            };

            let value = urlencoding::decode(raw)
                .map_err(|e| Error::Invalid(format!("bad encoding in '{}': {}", key, e)))?
                .into_owned();

            match key {
                "replicaindex" => {
                    replica_index = Some(parse_number(key, &value)?);
                }
                "replicahead" => {
                    replica_head = Some(parse_number(key, &value)?);
                }
                "readahead" => {
                    readahead = matches!(value.as_str(), "1" | "true" | "yes");
                }
                "blocksize" => {
                    block_size = parse_number(key, &value)?;
                }
                "path" => {
                    path = Some(value);
                }
                _ => {
                    if let Some(index) = key.strip_prefix("url") {
                        let index: usize = index.parse().map_err(|_| {
                            Error::Invalid(format!("bad stripe url key '{}'", key))
                        })?;
                        if index >= stripe_urls.len() {
                            return Err(Error::Invalid(format!(
                                "stripe url index {} out of range for {} stripes",
                                index, total
                            )));
                        }
                        stripe_urls[index] = Some(value);
                    } else {
                        debug!(key, "ignoring unknown opaque parameter");
                    }
                }
            }
        }

        let replica_index = replica_index
            .ok_or_else(|| Error::Invalid("missing replicaindex in opaque info".into()))?;
        let replica_head = replica_head
            .ok_or_else(|| Error::Invalid("missing replicahead in opaque info".into()))?;

        Ok(Self {
            replica_index,
            replica_head,
            stripe_urls,
            readahead,
            block_size,
            path,
        })
    }

    /// Whether this opener is the entry server.
    pub fn is_entry(&self) -> bool {
        self.replica_index == self.replica_head
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Invalid(format!("bad value '{}' for '{}'", value, key)))
}

// =============================================================================
// Adapter
// =============================================================================

/// Factory translating open requests into [`RainCore`] handles backed by
/// local-file stripe I/O.
pub struct RainAdapter {
    engine: Arc<IoEngine>,
}

impl RainAdapter {
    /// Create an adaptor with its own I/O executor.
    pub fn new() -> Result<Self> {
        Ok(Self {
            engine: IoEngine::new()?,
        })
    }

    /// Open a striped file from a packed layout id, the opener's local
    /// stripe URL and the opaque open parameters.
    #[instrument(skip(self, opaque))]
    pub fn open(
        &self,
        layout_id: u32,
        local_url: &str,
        mode: AccessMode,
        force_recovery: bool,
        opaque: &str,
    ) -> Result<RainCore> {
        let id = LayoutId::unpack(layout_id);
        let params = OpenParams::from_opaque(opaque, id.stripe_count)?;
        let layout = id.to_descriptor(params.block_size)?;

        if local_url.is_empty() {
            return Err(Error::Invalid("empty local stripe url".into()));
        }

        // Local stripe always sits at position 0; the entry server appends
        // the remaining stripes in physical index order.
        let mut stripes: Vec<Option<Arc<dyn StripeIo>>> = Vec::new();
        stripes.push(Some(self.stripe_for(local_url, params.readahead)));

        if params.is_entry() {
            for (index, url) in params.stripe_urls.iter().enumerate() {
                if index == params.replica_index as usize {
                    continue;
                }

                stripes.push(
                    url.as_deref()
                        .map(|url| self.stripe_for(url, params.readahead)),
                );
            }
        }

        RainCore::open(
            layout,
            stripes,
            params.replica_index,
            params.replica_head,
            RainOptions {
                mode,
                force_recovery,
                ..Default::default()
            },
        )
    }

    fn stripe_for(&self, url: &str, readahead: bool) -> Arc<dyn StripeIo> {
        Arc::new(FsStripeIo::new(url, self.engine.clone(), readahead))
    }

    /// Shared I/O executor, for callers constructing stripes directly.
    pub fn io_engine(&self) -> Arc<IoEngine> {
        self.engine.clone()
    }
}

/// Render an engine error as the wire status plus a human-readable message.
pub fn surface_error(err: &Error) -> (StatusCode, String) {
    (err.status(), err.to_string())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // OpenParams Tests
    // =========================================================================

    #[test]
    fn test_parse_minimal_opaque() {
        let params = OpenParams::from_opaque("replicaindex=0&replicahead=0", 6).unwrap();
        assert_eq!(params.replica_index, 0);
        assert_eq!(params.replica_head, 0);
        assert!(params.is_entry());
        assert!(!params.readahead);
        assert_eq!(params.block_size, 0);
        assert_eq!(params.stripe_urls, vec![None; 6]);
    }

    #[test]
    fn test_parse_full_opaque() {
        let opaque = "replicaindex=2&replicahead=0&url0=/data/s0&url1=/data/s1&\
                      url3=/data/s3&readahead=1&blocksize=4096&path=%2Ffiles%2Fbig.bin";
        let params = OpenParams::from_opaque(opaque, 6).unwrap();

        assert_eq!(params.replica_index, 2);
        assert!(!params.is_entry());
        assert!(params.readahead);
        assert_eq!(params.block_size, 4096);
        assert_eq!(params.path.as_deref(), Some("/files/big.bin"));
        assert_eq!(params.stripe_urls[0].as_deref(), Some("/data/s0"));
        assert_eq!(params.stripe_urls[2], None);
        assert_eq!(params.stripe_urls[3].as_deref(), Some("/data/s3"));
    }

    #[test]
    fn test_parse_requires_replica_fields() {
        let err = OpenParams::from_opaque("replicahead=0", 6).unwrap_err();
        assert_eq!(err.status(), StatusCode::Invalid);

        let err = OpenParams::from_opaque("replicaindex=0", 6).unwrap_err();
        assert_eq!(err.status(), StatusCode::Invalid);
    }

    #[test]
    fn test_parse_rejects_out_of_range_url() {
        let err =
            OpenParams::from_opaque("replicaindex=0&replicahead=0&url9=/x", 6).unwrap_err();
        assert_eq!(err.status(), StatusCode::Invalid);
    }

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let params =
            OpenParams::from_opaque("replicaindex=1&replicahead=1&fst.valid=1", 6).unwrap();
        assert_eq!(params.replica_index, 1);
    }

    #[test]
    fn test_surface_error() {
        let (status, msg) = surface_error(&Error::NotFound("stripe 3".into()));
        assert_eq!(status, StatusCode::NotFound);
        assert!(msg.contains("stripe 3"));
    }
}
