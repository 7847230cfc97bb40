//! Local-file stripe I/O
//!
//! [`FsStripeIo`] drives a stripe stored as a plain file on the local
//! filesystem. Asynchronous operations are dispatched to the shared
//! [`IoEngine`] blocking pool; positional reads and writes use `FileExt`
//! so no per-handle cursor state exists and operations can overlap freely.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::io::{AsyncHandler, IoEngine, IoFuture, OpenFlags, StripeIo, StripeStat};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

// =============================================================================
// FsStripeIo
// =============================================================================

struct Inner {
    path: PathBuf,
    url: String,
    file: RwLock<Option<Arc<File>>>,
    handler: Arc<AsyncHandler>,
    readahead: bool,
}

/// Stripe I/O over a local file.
pub struct FsStripeIo {
    inner: Arc<Inner>,
    engine: Arc<IoEngine>,
}

impl FsStripeIo {
    /// Create a stripe handle for `path`. The file is not touched until
    /// [`StripeIo::open_async`] completes.
    pub fn new(path: impl Into<PathBuf>, engine: Arc<IoEngine>, readahead: bool) -> Self {
        let path = path.into();
        let url = path.display().to_string();
        Self {
            inner: Arc::new(Inner {
                path,
                url,
                file: RwLock::new(None),
                handler: AsyncHandler::new(),
                readahead,
            }),
            engine,
        }
    }
}

impl Inner {
    fn file(&self) -> Result<Arc<File>> {
        self.file
            .read()
            .clone()
            .ok_or_else(|| Error::Io(format!("stripe {} is not open", self.url)))
    }

    /// Positional read that retries on partial transfers; stops early at
    /// end-of-file, making short reads visible to the caller.
    fn read_at(&self, mut offset: u64, buf: &mut [u8]) -> Result<usize> {
        let file = self.file()?;
        let mut done = 0;

        while done < buf.len() {
            let n = file.read_at(&mut buf[done..], offset)?;
            if n == 0 {
                break;
            }
            done += n;
            offset += n as u64;
        }

        Ok(done)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let file = self.file()?;
        file.write_all_at(buf, offset)?;
        Ok(buf.len())
    }

    /// Hint the kernel that `[offset, offset + len)` will be needed soon.
    fn advise_willneed(&self, offset: u64, len: usize) {
        if !self.readahead {
            return;
        }

        #[cfg(unix)]
        if let Some(file) = self.file.read().as_ref() {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fd is valid while the File is alive; fadvise is purely
            // advisory and has no memory-safety requirements.
            unsafe {
                libc::posix_fadvise(
                    file.as_raw_fd(),
                    offset as libc::off_t,
                    len as libc::off_t,
                    libc::POSIX_FADV_WILLNEED,
                );
            }
        }

        #[cfg(not(unix))]
        let _ = (offset, len);
    }

    fn read_chunk(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        let n = self.read_at(offset, &mut buf)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

impl StripeIo for FsStripeIo {
    fn url(&self) -> &str {
        &self.inner.url
    }

    fn open_async(&self, flags: OpenFlags) -> IoFuture<()> {
        let inner = self.inner.clone();

        self.engine.submit(None, move || {
            let mut options = OpenOptions::new();
            options.read(true);

            if flags.read_write {
                options
                    .write(true)
                    .create(flags.create)
                    .truncate(flags.truncate);
            }

            let file = options.open(&inner.path)?;
            debug!(url = %inner.url, ?flags, "opened stripe file");
            *inner.file.write() = Some(Arc::new(file));
            Ok(())
        })
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.read_at(offset, buf)
    }

    fn read_prefetch(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.advise_willneed(offset, buf.len());
        self.inner.read_at(offset, buf)
    }

    fn read_async(&self, offset: u64, len: usize) -> IoFuture<Bytes> {
        let inner = self.inner.clone();
        self.engine.submit(Some(self.inner.handler.clone()), move || {
            inner.read_chunk(offset, len)
        })
    }

    fn read_vector(&self, chunks: &[(u64, usize)]) -> Result<Vec<Bytes>> {
        let mut out = Vec::with_capacity(chunks.len());

        for &(offset, len) in chunks {
            let bytes = self.inner.read_chunk(offset, len)?;
            if bytes.len() != len {
                return Err(Error::Io(format!(
                    "short vector read on {}: wanted {} bytes at {}, got {}",
                    self.inner.url,
                    len,
                    offset,
                    bytes.len()
                )));
            }
            out.push(bytes);
        }

        Ok(out)
    }

    fn read_vector_async(&self, chunks: Vec<(u64, usize)>) -> IoFuture<Vec<Bytes>> {
        let inner = self.inner.clone();

        self.engine.submit(Some(self.inner.handler.clone()), move || {
            let mut out = Vec::with_capacity(chunks.len());

            for (offset, len) in chunks {
                let bytes = inner.read_chunk(offset, len)?;
                if bytes.len() != len {
                    return Err(Error::Io(format!(
                        "short vector read on {}: wanted {} bytes at {}, got {}",
                        inner.url,
                        len,
                        offset,
                        bytes.len()
                    )));
                }
                out.push(bytes);
            }

            Ok(out)
        })
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.inner.write_at(offset, buf)
    }

    fn write_async(&self, offset: u64, data: Bytes) -> IoFuture<()> {
        let inner = self.inner.clone();
        self.engine.submit(Some(self.inner.handler.clone()), move || {
            inner.write_at(offset, &data)?;
            Ok(())
        })
    }

    fn truncate_async(&self, size: u64) -> IoFuture<()> {
        let inner = self.inner.clone();
        self.engine.submit(None, move || {
            let file = inner.file()?;
            file.set_len(size)?;
            Ok(())
        })
    }

    fn stat(&self) -> Result<StripeStat> {
        let size = match self.inner.file.read().as_ref() {
            Some(file) => file.metadata()?.len(),
            None => std::fs::metadata(&self.inner.path)?.len(),
        };
        Ok(StripeStat { size })
    }

    fn sync(&self) -> Result<()> {
        let file = self.inner.file()?;
        file.sync_all()?;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        *self.inner.file.write() = None;
        std::fs::remove_file(&self.inner.path)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        *self.inner.file.write() = None;
        Ok(())
    }

    fn fctl(&self, cmd: &str) -> Result<()> {
        debug!(url = %self.inner.url, cmd, "fctl ignored by local stripe");
        Ok(())
    }

    fn async_handler(&self) -> Arc<AsyncHandler> {
        self.inner.handler.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
