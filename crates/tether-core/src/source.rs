//! The source capability.
//!
//! A source is any endpoint that can be bridged: it pushes inbound payloads
//! onto its own queue while `consume` runs and accepts outbound payloads
//! through `write`. The transmitter only ever talks to sources through these
//! traits.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;

/// Capacity of a source's inbound queue.
///
/// One slot keeps delivery as close to a hand-off as tokio channels allow,
/// so a slow bridge throttles the socket reads.
pub const INBOX_CAPACITY: usize = 1;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a source.
///
/// Issued once at construction; two handles are the same logical source
/// if and only if their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Issue a fresh, process-unique id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src-{}", self.0)
    }
}

/// Receiving side of a source's inbound queue.
///
/// Cloning is cheap. Only one holder can receive at a time: the
/// transmitter locks it for the lifetime of a reader task.
#[derive(Debug, Clone)]
pub struct Reader(Arc<Mutex<mpsc::Receiver<Bytes>>>);

impl Reader {
    /// Take exclusive access to the queue.
    pub async fn lock(&self) -> OwnedMutexGuard<mpsc::Receiver<Bytes>> {
        Arc::clone(&self.0).lock_owned().await
    }
}

/// Inbound queue owned by a concrete source.
///
/// Closing is idempotent: the first call drops the sender so the reader
/// sees end-of-stream, later calls do nothing.
#[derive(Debug)]
pub struct Inbox {
    sender: std::sync::Mutex<Option<mpsc::Sender<Bytes>>>,
    reader: Reader,
}

impl Inbox {
    /// Create an open inbox.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        Self {
            sender: std::sync::Mutex::new(Some(tx)),
            reader: Reader(Arc::new(Mutex::new(rx))),
        }
    }

    /// Queue a payload for the reader, waiting for room.
    ///
    /// Returns `false` if the inbox is closed or the reader side is gone.
    pub async fn deliver(&self, payload: Bytes) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sender {
            Some(tx) => tx.send(payload).await.is_ok(),
            None => false,
        }
    }

    /// Close the inbox. Returns `true` if this call closed it.
    pub fn close(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Whether the inbox has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Handle to the receiving side.
    #[must_use]
    pub fn reader(&self) -> Reader {
        self.reader.clone()
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

/// An endpoint that can take part in a bridge.
#[async_trait]
pub trait Source: Send + Sync {
    /// Identity used for pool membership and author matching.
    fn id(&self) -> SourceId;

    /// Read from the endpoint until it ends, pushing every payload onto
    /// the queue returned by [`Source::reader`].
    ///
    /// Returns `Ok(())` on clean end-of-stream or cancellation and an error
    /// on any other failure. Implementations must keep delivering while a
    /// reader is draining the queue, and must only close their queue after
    /// the underlying connection is closed.
    async fn consume(&self, cancel: CancellationToken) -> Result<(), SourceError>;

    /// Queue on which inbound payloads are delivered.
    fn reader(&self) -> Reader;

    /// Send a payload to the endpoint.
    async fn write(&self, payload: Bytes) -> Result<(), SourceError>;
}

/// A source that dials a remote endpoint.
#[async_trait]
pub trait NetworkSource: Source {
    /// Establish the connection. A no-op if already connected.
    async fn connect(&self, cancel: CancellationToken) -> Result<(), SourceError>;

    /// Stable address of the remote endpoint, used for logging.
    fn url(&self) -> &str;
}
