//! TCP sources.
//!
//! Raw stream chunks are relayed as they arrive; no framing is applied.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::PoisonError;
use std::time::Duration;
use tether_core::{
    is_closed_connection, Inbox, NetworkSource, Reader, Source, SourceError, SourceId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest chunk read from the socket in one go.
pub const READ_BUFFER_SIZE: usize = 1024;

/// How long a dial may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The two halves of a TCP connection, each usable independently.
///
/// `closing` fires when the connection is shut down and aborts any write in
/// progress, so a peer that stops reading cannot hold the write lock
/// forever. Each installed connection gets a fresh token.
#[derive(Debug, Default)]
struct TcpLink {
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    closing: std::sync::Mutex<CancellationToken>,
}

impl TcpLink {
    fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(Some(write_half)),
            closing: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    fn closing_token(&self) -> CancellationToken {
        self.closing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn install(&self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        *self.closing.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        *self.read_half.lock().await = Some(read_half);
        *self.write_half.lock().await = Some(write_half);
    }

    async fn is_connected(&self) -> bool {
        self.write_half.lock().await.is_some()
    }

    /// Read until end-of-stream, cancellation or failure, delivering every
    /// chunk to `inbox`. Both halves are dropped when this returns.
    async fn pump(
        &self,
        inbox: &Inbox,
        cancel: &CancellationToken,
        label: &str,
    ) -> Result<(), SourceError> {
        let mut guard = self.read_half.lock().await;
        let Some(read_half) = guard.as_mut() else {
            return Err(SourceError::NotConnected);
        };

        let mut buffer = [0u8; READ_BUFFER_SIZE];
        let result = loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                read = read_half.read(&mut buffer) => read,
            };
            match read {
                Ok(0) => {
                    debug!(peer = label, "TCP stream ended");
                    break Ok(());
                }
                Ok(n) => {
                    let payload = Bytes::copy_from_slice(&buffer[..n]);
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        delivered = inbox.deliver(payload) => {
                            if !delivered {
                                break Ok(());
                            }
                        }
                    }
                }
                Err(e) if is_closed_connection(&e) => break Ok(()),
                Err(e) => {
                    break Err(SourceError::Read(format!(
                        "could not read from tcp on {label}: {e}"
                    )))
                }
            }
        };

        guard.take();
        drop(guard);
        self.shutdown().await;
        result
    }

    async fn write(&self, payload: &[u8]) -> Result<(), SourceError> {
        let closing = self.closing_token();
        let mut guard = tokio::select! {
            _ = closing.cancelled() => return Err(SourceError::NotConnected),
            guard = self.write_half.lock() => guard,
        };
        let write_half = guard.as_mut().ok_or(SourceError::NotConnected)?;
        tokio::select! {
            _ = closing.cancelled() => Err(SourceError::Write(
                "tcp connection closed during write".to_string(),
            )),
            written = write_half.write_all(payload) => {
                written.map_err(|e| SourceError::Write(e.to_string()))
            }
        }
    }

    async fn shutdown(&self) {
        // Abort a pending write first so the lock below is released.
        self.closing_token().cancel();
        let write_half = self.write_half.lock().await.take();
        let Some(mut write_half) = write_half else {
            return;
        };
        if let Err(e) = write_half.shutdown().await {
            if !is_closed_connection(&e) {
                debug!(error = %e, "Could not shut down tcp connection");
            }
        }
    }
}

/// Dials a TCP endpoint.
#[derive(Debug)]
pub struct TcpSource {
    id: SourceId,
    url: String,
    addr: String,
    inbox: Inbox,
    link: TcpLink,
    connect_timeout: Duration,
}

impl TcpSource {
    /// Create an unconnected source for `host:port` (a `tcp://` prefix is
    /// accepted).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let addr = url.strip_prefix("tcp://").unwrap_or(&url).to_string();
        Self {
            id: SourceId::next(),
            url,
            addr,
            inbox: Inbox::new(),
            link: TcpLink::default(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Override the dial timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether a connection is currently established.
    pub async fn is_connected(&self) -> bool {
        self.link.is_connected().await
    }
}

fn classify_dial_error(url: &str, err: io::Error) -> SourceError {
    if err.kind() == io::ErrorKind::InvalidInput {
        return SourceError::fatal(format!("invalid tcp address {url}: {err}"));
    }
    SourceError::Connect(format!("tcp dial to {url} failed: {err}"))
}

#[async_trait]
impl Source for TcpSource {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        debug!(url = %self.url, "Consuming tcp");
        let result = self.link.pump(&self.inbox, &cancel, &self.url).await;
        if cancel.is_cancelled() {
            self.inbox.close();
        }
        result
    }

    fn reader(&self) -> Reader {
        self.inbox.reader()
    }

    async fn write(&self, payload: Bytes) -> Result<(), SourceError> {
        self.link.write(&payload).await
    }
}

#[async_trait]
impl NetworkSource for TcpSource {
    async fn connect(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        if self.link.is_connected().await {
            return Ok(());
        }
        info!(url = %self.url, "Connecting to tcp");

        let dial = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr));
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            dialed = dial => match dialed {
                Err(_) => {
                    return Err(SourceError::Connect(format!(
                        "tcp dial to {} timed out", self.url
                    )))
                }
                Ok(Err(e)) => return Err(classify_dial_error(&self.url, e)),
                Ok(Ok(stream)) => stream,
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(url = %self.url, error = %e, "Could not set TCP_NODELAY");
        }

        self.link.install(stream).await;
        info!(url = %self.url, "Connected to tcp");
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// An accepted TCP connection.
///
/// Cannot reconnect: its queue is closed as soon as `consume` returns.
#[derive(Debug)]
pub struct TcpConnection {
    id: SourceId,
    peer: String,
    inbox: Inbox,
    link: TcpLink,
}

impl TcpConnection {
    /// Wrap an accepted stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        Self {
            id: SourceId::next(),
            peer,
            inbox: Inbox::new(),
            link: TcpLink::from_stream(stream),
        }
    }

    /// Remote address of the connection.
    #[must_use]
    pub fn peer_addr(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Source for TcpConnection {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        debug!(peer = %self.peer, "Consuming tcp connection");
        let result = self.link.pump(&self.inbox, &cancel, &self.peer).await;
        self.inbox.close();
        result
    }

    fn reader(&self) -> Reader {
        self.inbox.reader()
    }

    async fn write(&self, payload: Bytes) -> Result<(), SourceError> {
        self.link.write(&payload).await
    }
}

/// Accepts TCP connections as sources.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, SourceError> {
        let listener = TcpListener::bind(addr).await?;
        info!("TCP listener bound on {}", addr);
        Ok(Self { listener })
    }

    /// Wait for the next connection.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails.
    pub async fn accept(&self) -> Result<TcpConnection, SourceError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);
        Ok(TcpConnection::new(stream))
    }

    /// Get the local address this listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}
