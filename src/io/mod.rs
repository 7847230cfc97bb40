//! Stripe I/O capability
//!
//! One [`StripeIo`] object drives one stripe file, local or remote. The
//! engine core only ever talks to this trait: it issues blocking reads on
//! the calling thread and queues writes, opens and truncates as asynchronous
//! operations joined later through [`IoFuture`] handles.
//!
//! Every stripe also exposes an [`AsyncHandler`] that aggregates the fate of
//! all in-flight asynchronous operations so the core can join "everything
//! outstanding on this stripe" at barriers (vector reads, group parity,
//! close) and learn the first error class encountered.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::Runtime;
use tracing::debug;

use crate::error::{Error, Result};

pub mod file;

pub use file::FsStripeIo;

// =============================================================================
// Open Flags / Stat
// =============================================================================

/// Flags applied when opening a stripe file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open for reading and writing
    pub read_write: bool,
    /// Create the file when missing
    pub create: bool,
    /// Truncate existing content on open
    pub truncate: bool,
}

impl OpenFlags {
    /// Read-only open.
    pub fn read_only() -> Self {
        Self::default()
    }

    /// Read-write open, creating and truncating. Stripe files are rewritten
    /// wholesale, never updated in place.
    pub fn write() -> Self {
        Self {
            read_write: true,
            create: true,
            truncate: true,
        }
    }

    /// Read-write open that preserves existing content, used when repairing
    /// stripes in place.
    pub fn recover() -> Self {
        Self {
            read_write: true,
            create: true,
            truncate: false,
        }
    }
}

/// Minimal stat information for a stripe file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeStat {
    /// File size in bytes, header included
    pub size: u64,
}

// =============================================================================
// IoFuture
// =============================================================================

/// Completion handle for one asynchronous stripe operation.
///
/// The producing side runs on the I/O executor; the consumer joins with
/// [`IoFuture::wait`] or [`IoFuture::wait_timeout`]. Dropping the handle
/// abandons the result but not the operation.
#[derive(Debug)]
pub struct IoFuture<T> {
    rx: mpsc::Receiver<Result<T>>,
}

impl<T: Send + 'static> IoFuture<T> {
    /// Create a future together with its completion sender.
    pub(crate) fn channel() -> (mpsc::SyncSender<Result<T>>, Self) {
        let (tx, rx) = mpsc::sync_channel(1);
        (tx, Self { rx })
    }

    /// A future that is already complete.
    pub fn ready(result: Result<T>) -> Self {
        let (tx, fut) = Self::channel();
        // Buffered channel of one, cannot fail.
        let _ = tx.send(result);
        fut
    }

    /// Block until the operation completes.
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(res) => res,
            Err(_) => Err(Error::Io("async stripe operation was aborted".into())),
        }
    }

    /// Block until the operation completes or the timeout elapses.
    ///
    /// `None` waits indefinitely. A timeout surfaces as
    /// [`Error::OperationExpired`]; the operation itself keeps running and
    /// its effect on the stripe is undefined from the caller's view.
    pub fn wait_timeout(self, timeout: Option<Duration>) -> Result<T> {
        let Some(timeout) = timeout else {
            return self.wait();
        };

        match self.rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::OperationExpired(format!(
                "stripe operation did not complete within {:?}",
                timeout
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(Error::Io("async stripe operation was aborted".into()))
            }
        }
    }
}

// =============================================================================
// AsyncHandler
// =============================================================================

#[derive(Debug, Default)]
struct HandlerState {
    in_flight: usize,
    first_error: Option<Error>,
}

/// Aggregates the outcome of all in-flight asynchronous operations issued
/// on one stripe.
///
/// [`AsyncHandler::wait_ok`] joins everything outstanding and returns the
/// first error class encountered since the last reset. The handler is
/// resettable so each barrier starts from a clean slate.
#[derive(Debug, Default)]
pub struct AsyncHandler {
    state: Mutex<HandlerState>,
    cv: Condvar,
}

impl AsyncHandler {
    /// Create a fresh handler with no pending operations.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record that one more operation is in flight.
    pub(crate) fn op_started(&self) {
        self.state.lock().in_flight += 1;
    }

    /// Record completion of one operation, capturing the first error.
    pub(crate) fn op_finished(&self, error: Option<&Error>) {
        let mut state = self.state.lock();
        debug_assert!(state.in_flight > 0);
        state.in_flight = state.in_flight.saturating_sub(1);

        if let Some(err) = error {
            if state.first_error.is_none() {
                state.first_error = Some(err.clone());
            }
        }

        if state.in_flight == 0 {
            self.cv.notify_all();
        }
    }

    /// Join all pending operations and return the first error seen since
    /// the last reset, if any. The error stays recorded until [`reset`].
    ///
    /// [`reset`]: AsyncHandler::reset
    pub fn wait_ok(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            self.cv.wait(&mut state);
        }

        match &state.first_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Forget any recorded error. Pending-operation accounting is kept.
    pub fn reset(&self) {
        self.state.lock().first_error = None;
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}

// =============================================================================
// IoEngine
// =============================================================================

/// Shared executor for stripe I/O.
///
/// Wraps a multi-thread tokio runtime whose blocking pool carries the
/// actual file operations, letting stripe I/O overlap while the engine
/// itself stays thread-based.
#[derive(Debug)]
pub struct IoEngine {
    rt: Runtime,
}

impl IoEngine {
    /// Build a new executor.
    pub fn new() -> Result<Arc<Self>> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("rain-io")
            .build()
            .map_err(|e| Error::Io(format!("failed to start io runtime: {}", e)))?;
        Ok(Arc::new(Self { rt }))
    }

    /// Run `op` on the blocking pool, completing the returned future and,
    /// when given, the stripe's async handler.
    pub(crate) fn submit<T, F>(&self, handler: Option<Arc<AsyncHandler>>, op: F) -> IoFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, fut) = IoFuture::channel();

        if let Some(h) = &handler {
            h.op_started();
        }

        let _task = self.rt.spawn_blocking(move || {
            let res = op();

            if let Some(h) = handler {
                h.op_finished(res.as_ref().err());
            }

            if tx.send(res).is_err() {
                debug!("io completion dropped by caller");
            }
        });

        fut
    }
}

// =============================================================================
// StripeIo
// =============================================================================

/// Capability for driving one stripe file.
///
/// All operations may fail with an I/O-class error. Asynchronous variants
/// return an [`IoFuture`]; synchronous reads permit short reads at
/// end-of-file and report the byte count actually transferred.
pub trait StripeIo: Send + Sync {
    /// Identifier of this stripe (path or URL), for diagnostics.
    fn url(&self) -> &str;

    /// Open or create the stripe file.
    fn open_async(&self, flags: OpenFlags) -> IoFuture<()>;

    /// Blocking positional read; short reads permitted at end-of-file.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Same as [`read`](StripeIo::read) but hints the OS to read ahead.
    fn read_prefetch(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Queue an asynchronous read of `len` bytes at `offset`; the future
    /// completes with the bytes actually read.
    fn read_async(&self, offset: u64, len: usize) -> IoFuture<Bytes>;

    /// Blocking scatter read; every chunk fully satisfied or an error.
    fn read_vector(&self, chunks: &[(u64, usize)]) -> Result<Vec<Bytes>>;

    /// Asynchronous scatter read with the same all-or-error contract.
    fn read_vector_async(&self, chunks: Vec<(u64, usize)>) -> IoFuture<Vec<Bytes>>;

    /// Blocking positional write of the whole buffer.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Queue an asynchronous write. The data travels as [`Bytes`] so the
    /// buffer outlives the future by construction.
    fn write_async(&self, offset: u64, data: Bytes) -> IoFuture<()>;

    /// Queue an asynchronous truncate to `size` bytes.
    fn truncate_async(&self, size: u64) -> IoFuture<()>;

    /// Stat the stripe file.
    fn stat(&self) -> Result<StripeStat>;

    /// Flush stripe content to stable storage.
    fn sync(&self) -> Result<()>;

    /// Remove the stripe file.
    fn remove(&self) -> Result<()>;

    /// Close the stripe file; further operations fail.
    fn close(&self) -> Result<()>;

    /// Implementation-defined control command.
    fn fctl(&self, cmd: &str) -> Result<()>;

    /// Handler aggregating this stripe's in-flight async operations.
    fn async_handler(&self) -> Arc<AsyncHandler>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // =========================================================================
    // IoFuture Tests
    // =========================================================================

    #[test]
    fn test_ready_future() {
        let fut = IoFuture::ready(Ok(42u32));
        assert_eq!(fut.wait().unwrap(), 42);
    }

    #[test]
    fn test_future_wait_timeout_expires() {
        let (_tx, fut) = IoFuture::<u32>::channel();
        let err = fut
            .wait_timeout(Some(Duration::from_millis(10)))
            .unwrap_err();
        assert_matches!(err, Error::OperationExpired(_));
    }

    #[test]
    fn test_future_aborted_when_sender_dropped() {
        let (tx, fut) = IoFuture::<u32>::channel();
        drop(tx);
        assert_matches!(fut.wait(), Err(Error::Io(_)));
    }

    // =========================================================================
    // AsyncHandler Tests
    // =========================================================================

    #[test]
    fn test_handler_collects_first_error() {
        let handler = AsyncHandler::new();
        handler.op_started();
        handler.op_started();
        handler.op_finished(Some(&Error::Io("first".into())));
        handler.op_finished(Some(&Error::NoSpace("second".into())));

        let err = handler.wait_ok().unwrap_err();
        assert_matches!(err, Error::Io(_));

        // Error sticks across joins until reset.
        assert!(handler.wait_ok().is_err());
        handler.reset();
        assert!(handler.wait_ok().is_ok());
    }

    #[test]
    fn test_handler_wait_blocks_until_completion() {
        let handler = AsyncHandler::new();
        handler.op_started();

        let h = handler.clone();
        let joiner = std::thread::spawn(move || h.wait_ok());

        std::thread::sleep(Duration::from_millis(20));
        handler.op_finished(None);
        assert!(joiner.join().unwrap().is_ok());
    }

    // =========================================================================
    // IoEngine Tests
    // =========================================================================

    #[test]
    fn test_engine_submit_completes_future_and_handler() {
        let engine = IoEngine::new().unwrap();
        let handler = AsyncHandler::new();

        let fut = engine.submit(Some(handler.clone()), || Ok(7u64));
        assert_eq!(fut.wait().unwrap(), 7);
        assert!(handler.wait_ok().is_ok());

        let fut = engine.submit(Some(handler.clone()), || {
            Err::<u64, _>(Error::Io("boom".into()))
        });
        assert!(fut.wait().is_err());
        assert!(handler.wait_ok().is_err());
    }
}
