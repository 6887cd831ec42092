//! The transmitter: fans reads in from every source and broadcasts them out.
//!
//! One reader task runs per source and forwards its payloads into a single
//! shared channel. One writer task drains that channel and writes each
//! payload to every pool member except its author.
//!
//! ```text
//!  source A ──reader──┐                 ┌──▶ write B
//!  source B ──reader──┼──▶ messages ──▶ writer ──▶ write C
//!  source C ──reader──┘                 └──▶ write A (skipped if author)
//! ```
//!
//! A single cancellation token governs the bridge. It is cancelled from the
//! outside or by any reader whose source fails; `run` then waits for every
//! reader to finish before the channel is released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use crate::error::TransmitterError;
use crate::message::Message;
use crate::observer::{NoopObserver, Observer};
use crate::pool::Pool;
use crate::source::Source;

/// Capacity of the shared message channel.
///
/// Readers block on the writer once this fills up, which throttles every
/// source to the speed of the slowest broadcast.
pub const MESSAGE_CHANNEL_CAPACITY: usize = 1;

/// Lifecycle of a transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitterState {
    /// Constructed, `run` not called yet.
    Idle,
    /// `run` is relaying.
    Running,
    /// Cancelled, waiting for reader tasks to finish.
    Draining,
    /// `run` has returned.
    Stopped,
}

/// State shared with the spawned tasks.
struct Shared {
    pool: Pool,
    observer: Arc<dyn Observer>,
}

/// Present only while `run` executes.
struct RunState {
    cancel: CancellationToken,
    readers: TaskTracker,
    messages: mpsc::Sender<Message>,
}

struct Inner {
    state: TransmitterState,
    run: Option<RunState>,
}

/// Relays every payload from one source to all other sources.
pub struct Transmitter {
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
    span: Span,
}

impl Transmitter {
    /// Create an idle transmitter with an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                pool: Pool::new(),
                observer: Arc::new(NoopObserver),
            }),
            inner: Mutex::new(Inner {
                state: TransmitterState::Idle,
                run: None,
            }),
            span: Span::none(),
        }
    }

    /// Report relay events to `observer`.
    ///
    /// Sources already pooled stay pooled; only later events reach
    /// `observer`.
    #[must_use]
    pub fn with_observer(self, observer: Arc<dyn Observer>) -> Self {
        let pool = Pool::new();
        pool.add(self.shared.pool.all());
        Self {
            shared: Arc::new(Shared { pool, observer }),
            ..self
        }
    }

    /// Emit diagnostics inside `span`.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransmitterState {
        self.lock().state
    }

    /// The sources currently bridged.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.shared.pool
    }

    /// Number of sources currently bridged.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.shared.pool.len()
    }

    /// Add sources to the bridge.
    ///
    /// While running, a reader task starts for each new source right away.
    /// Sources already in the pool are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TransmitterError::Closed`] once the transmitter's token has
    /// been cancelled, including after `run` has returned.
    pub fn add_sources<I>(&self, sources: I) -> Result<(), TransmitterError>
    where
        I: IntoIterator<Item = Arc<dyn Source>>,
    {
        let inner = self.lock();
        let cancelled = inner
            .run
            .as_ref()
            .is_some_and(|run| run.cancel.is_cancelled());
        if cancelled
            || matches!(
                inner.state,
                TransmitterState::Draining | TransmitterState::Stopped
            )
        {
            return Err(TransmitterError::Closed);
        }

        let added = self.shared.pool.add(sources);
        for source in &added {
            self.span.in_scope(|| debug!(source = %source.id(), "Source added"));
            self.shared.observer.source_added(source.id());
        }

        if let Some(run) = &inner.run {
            self.spawn_readers(run, added);
        }
        Ok(())
    }

    /// Add a single source.
    ///
    /// # Errors
    ///
    /// See [`Transmitter::add_sources`].
    pub fn add_source(&self, source: impl Source + 'static) -> Result<(), TransmitterError> {
        self.add_sources([Arc::new(source) as Arc<dyn Source>])
    }

    fn spawn_readers(&self, run: &RunState, sources: Vec<Arc<dyn Source>>) {
        for source in sources {
            let task = read_source(
                Arc::clone(&self.shared),
                source,
                run.cancel.clone(),
                run.messages.clone(),
            );
            run.readers.spawn(task.instrument(self.span.clone()));
        }
    }

    /// Relay until `cancel` fires, then drain.
    ///
    /// Returns once every reader task has finished and the writer has
    /// delivered everything they forwarded. A transmitter runs once.
    ///
    /// # Errors
    ///
    /// Returns [`TransmitterError::AlreadyStarted`] if `run` was called
    /// before on this transmitter.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TransmitterError> {
        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let readers = TaskTracker::new();

        {
            let mut inner = self.lock();
            if inner.state != TransmitterState::Idle {
                self.span
                    .in_scope(|| warn!(state = ?inner.state, "Transmitter already started"));
                return Err(TransmitterError::AlreadyStarted);
            }
            let run = RunState {
                cancel: cancel.clone(),
                readers: readers.clone(),
                messages: tx,
            };
            self.spawn_readers(&run, self.shared.pool.all());
            inner.run = Some(run);
            inner.state = TransmitterState::Running;
        }

        let writer = tokio::spawn(
            write_to_sources(Arc::clone(&self.shared), rx).instrument(self.span.clone()),
        );
        self.span.in_scope(|| {
            info!(sources = self.shared.pool.len(), "Transmitter running");
        });

        cancel.cancelled().await;

        {
            let mut inner = self.lock();
            inner.state = TransmitterState::Draining;
            readers.close();
        }
        self.span.in_scope(|| debug!("Transmitter draining"));
        readers.wait().await;

        // Last sender goes away here, which ends the writer loop.
        {
            let mut inner = self.lock();
            inner.run = None;
        }
        if let Err(e) = writer.await {
            self.span
                .in_scope(|| error!(error = %e, "Writer task failed"));
        }

        self.lock().state = TransmitterState::Stopped;
        self.span.in_scope(|| info!("Transmitter stopped"));
        Ok(())
    }
}

impl Default for Transmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader task for one source.
///
/// Consume runs inside this task while payloads are forwarded, so the
/// source never blocks on a full queue nobody drains. The source leaves the
/// pool only after consume has returned.
async fn read_source(
    shared: Arc<Shared>,
    source: Arc<dyn Source>,
    cancel: CancellationToken,
    messages: mpsc::Sender<Message>,
) {
    let id = source.id();
    debug!(source = %id, "Reader started");

    let reader = source.reader();
    let mut inbound = reader.lock().await;
    let consume = source.consume(cancel.clone());
    tokio::pin!(consume);

    // Consume stays polled while a payload waits for the writer, so a
    // cancelled source can tear its connection down and unblock a writer
    // stuck on it.
    let result = loop {
        tokio::select! {
            result = &mut consume => break result,
            Some(payload) = inbound.recv() => {
                let send = messages.send(Message::new(payload, id));
                tokio::pin!(send);
                let ended = tokio::select! {
                    sent = &mut send => {
                        if sent.is_err() {
                            warn!(source = %id, "Message channel closed, dropping payload");
                        }
                        None
                    }
                    result = &mut consume => Some(result),
                };
                if let Some(result) = ended {
                    if send.await.is_err() {
                        warn!(source = %id, "Message channel closed, dropping payload");
                    }
                    break result;
                }
            }
        }
    };

    // Payloads queued just before consume returned.
    while let Ok(payload) = inbound.try_recv() {
        if messages.send(Message::new(payload, id)).await.is_err() {
            break;
        }
    }
    drop(inbound);

    shared.pool.remove(id);
    let failed = match result {
        Ok(()) => {
            debug!(source = %id, "Source ended");
            false
        }
        Err(err) => {
            error!(source = %id, error = %err, "Source failed, stopping bridge");
            cancel.cancel();
            true
        }
    };
    shared.observer.source_removed(id, failed);
}

/// Writer task: broadcast each message to every member but its author.
async fn write_to_sources(shared: Arc<Shared>, mut messages: mpsc::Receiver<Message>) {
    while let Some(message) = messages.recv().await {
        let author = message.author();
        let mut recipients = 0;
        for source in shared.pool.all() {
            let id = source.id();
            if id == author {
                continue;
            }
            match source.write(message.content().clone()).await {
                Ok(()) => recipients += 1,
                Err(err) => {
                    debug!(source = %id, error = %err, "Write failed, dropping delivery");
                    shared.observer.write_failed(id, &err);
                }
            }
        }
        trace!(source = %author, bytes = message.len(), recipients, "Relayed");
        shared
            .observer
            .message_relayed(author, message.len(), recipients);
    }
    debug!("Writer stopped");
}
