//! WebSocket sources using tokio-tungstenite.
//!
//! Each WebSocket message is relayed as one payload. Outbound payloads are
//! sent as binary or text messages depending on [`MessageKind`].

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::PoisonError;
use std::time::Duration;
use tether_core::{
    is_closed_connection, Inbox, NetworkSource, Reader, Source, SourceError, SourceId,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue, StatusCode},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long the opening handshake may take.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the close frame to go out on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Message type used for outbound payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    /// Binary messages.
    #[default]
    Binary,
    /// Text messages. Invalid UTF-8 is replaced.
    Text,
}

impl MessageKind {
    fn wrap(self, payload: &[u8]) -> Message {
        match self {
            Self::Binary => Message::Binary(payload.to_vec()),
            Self::Text => Message::Text(String::from_utf8_lossy(payload).into_owned()),
        }
    }
}

/// The two halves of a WebSocket connection.
///
/// `closing` fires on shutdown and aborts a send in progress. Each
/// installed connection gets a fresh token.
struct WsLink<S> {
    sink: Mutex<Option<SplitSink<WebSocketStream<S>, Message>>>,
    stream: Mutex<Option<SplitStream<WebSocketStream<S>>>>,
    closing: std::sync::Mutex<CancellationToken>,
}

impl<S> WsLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn empty() -> Self {
        Self {
            sink: Mutex::new(None),
            stream: Mutex::new(None),
            closing: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    fn from_stream(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(Some(sink)),
            stream: Mutex::new(Some(stream)),
            closing: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    fn closing_token(&self) -> CancellationToken {
        self.closing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn install(&self, ws: WebSocketStream<S>) {
        let (sink, stream) = ws.split();
        *self.closing.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
    }

    async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Read messages until the peer closes, `cancel` fires or reading
    /// fails. The connection is closed when this returns.
    async fn pump(
        &self,
        inbox: &Inbox,
        cancel: &CancellationToken,
        label: &str,
    ) -> Result<(), SourceError> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(SourceError::NotConnected);
        };

        let result = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                next = stream.next() => next,
            };
            let payload = match next {
                Some(Ok(Message::Binary(data))) => Bytes::from(data),
                Some(Ok(Message::Text(text))) => Bytes::from(text),
                Some(Ok(Message::Close(frame))) => break close_outcome(frame, label),
                // Pings are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => break Ok(()),
                Some(Err(WsError::Io(e))) if is_closed_connection(&e) => break Ok(()),
                Some(Err(e)) => {
                    break Err(SourceError::Read(format!(
                        "could not read from ws on {label}: {e}"
                    )))
                }
                None => {
                    debug!(peer = label, "WebSocket stream ended");
                    break Ok(());
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                delivered = inbox.deliver(payload) => {
                    if !delivered {
                        break Ok(());
                    }
                }
            }
        };

        guard.take();
        drop(guard);
        self.shutdown().await;
        result
    }

    async fn send(&self, message: Message) -> Result<(), SourceError> {
        let closing = self.closing_token();
        let mut guard = tokio::select! {
            _ = closing.cancelled() => return Err(SourceError::NotConnected),
            guard = self.sink.lock() => guard,
        };
        let sink = guard.as_mut().ok_or(SourceError::NotConnected)?;
        tokio::select! {
            _ = closing.cancelled() => Err(SourceError::Write(
                "ws connection closed during send".to_string(),
            )),
            sent = sink.send(message) => sent.map_err(|e| SourceError::Write(e.to_string())),
        }
    }

    async fn shutdown(&self) {
        // Abort a pending send first so the lock below is released.
        self.closing_token().cancel();
        let sink = self.sink.lock().await.take();
        let Some(mut sink) = sink else {
            return;
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {}
            Ok(Err(e)) => debug!(error = %e, "Could not close ws"),
            Err(_) => debug!("Timed out sending ws close frame"),
        }
    }
}

fn close_outcome(frame: Option<CloseFrame<'_>>, label: &str) -> Result<(), SourceError> {
    match frame {
        None => Ok(()),
        Some(frame) if frame.code == CloseCode::Normal => Ok(()),
        Some(frame) => Err(SourceError::Read(format!(
            "ws on {label} closed with code {}: {}",
            u16::from(frame.code),
            frame.reason
        ))),
    }
}

fn is_fatal_status(status: StatusCode) -> bool {
    status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED
}

fn classify_handshake_error(url: &str, err: WsError) -> SourceError {
    match err {
        WsError::Http(response) if is_fatal_status(response.status()) => SourceError::fatal(
            format!(
                "ws connection cannot connect to {url}, response status is {}",
                response.status()
            ),
        ),
        WsError::Url(e) => SourceError::fatal(format!("invalid ws url {url}: {e}")),
        other => SourceError::Connect(format!("cannot connect to ws {url}: {other}")),
    }
}

/// Dials a WebSocket endpoint.
pub struct WsSource {
    id: SourceId,
    url: String,
    headers: Vec<(String, String)>,
    kind: MessageKind,
    inbox: Inbox,
    link: WsLink<MaybeTlsStream<TcpStream>>,
    handshake_timeout: Duration,
}

impl WsSource {
    /// Create an unconnected source for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: SourceId::next(),
            url: url.into(),
            headers: Vec::new(),
            kind: MessageKind::default(),
            inbox: Inbox::new(),
            link: WsLink::empty(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Create a source that sends one credential header on the handshake.
    #[must_use]
    pub fn authorized(
        url: impl Into<String>,
        header_name: impl Into<String>,
        header_value: impl Into<String>,
    ) -> Self {
        Self::new(url).with_header(header_name, header_value)
    }

    /// Add a request header to the handshake.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the outbound message type.
    #[must_use]
    pub fn with_message_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Override the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Whether a connection is currently established.
    pub async fn is_connected(&self) -> bool {
        self.link.is_connected().await
    }
}

#[async_trait]
impl Source for WsSource {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        debug!(url = %self.url, "Consuming ws");
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
        self.link.send(self.kind.wrap(&payload)).await
    }
}

#[async_trait]
impl NetworkSource for WsSource {
    async fn connect(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        if self.link.is_connected().await {
            return Ok(());
        }
        info!(url = %self.url, "Connecting to ws");

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SourceError::fatal(format!("invalid ws url {}: {e}", self.url)))?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SourceError::fatal(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SourceError::fatal(format!("invalid value for header {name}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let handshake = tokio::time::timeout(self.handshake_timeout, connect_async(request));
        let ws = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            shaken = handshake => match shaken {
                Err(_) => {
                    return Err(SourceError::Connect(format!(
                        "ws handshake with {} timed out", self.url
                    )))
                }
                Ok(Err(e)) => return Err(classify_handshake_error(&self.url, e)),
                Ok(Ok((ws, _response))) => ws,
            },
        };

        self.link.install(ws).await;
        info!(url = %self.url, "Connected to ws");
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// An accepted WebSocket connection.
///
/// Cannot reconnect: its queue is closed as soon as `consume` returns.
pub struct WsConnection {
    id: SourceId,
    peer: String,
    kind: MessageKind,
    inbox: Inbox,
    link: WsLink<TcpStream>,
}

impl WsConnection {
    /// Wrap a WebSocket that finished its handshake.
    #[must_use]
    pub fn new(ws: WebSocketStream<TcpStream>, peer: SocketAddr) -> Self {
        Self {
            id: SourceId::next(),
            peer: peer.to_string(),
            kind: MessageKind::default(),
            inbox: Inbox::new(),
            link: WsLink::from_stream(ws),
        }
    }

    /// Set the outbound message type.
    #[must_use]
    pub fn with_message_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Remote address of the connection.
    #[must_use]
    pub fn peer_addr(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Source for WsConnection {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        debug!(peer = %self.peer, "Consuming ws connection");
        let result = self.link.pump(&self.inbox, &cancel, &self.peer).await;
        self.inbox.close();
        result
    }

    fn reader(&self) -> Reader {
        self.inbox.reader()
    }

    async fn write(&self, payload: Bytes) -> Result<(), SourceError> {
        self.link.send(self.kind.wrap(&payload)).await
    }
}

/// Accepts WebSocket connections as sources.
pub struct WsAcceptor {
    listener: TcpListener,
    kind: MessageKind,
}

impl WsAcceptor {
    /// Bind to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, SourceError> {
        let listener = TcpListener::bind(addr).await?;
        info!("WebSocket listener bound on {}", addr);
        Ok(Self {
            listener,
            kind: MessageKind::default(),
        })
    }

    /// Message type for accepted connections.
    #[must_use]
    pub fn with_message_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Wait for the next connection and complete its handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting or the handshake fails.
    pub async fn accept(&self) -> Result<WsConnection, SourceError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);

        let ws = accept_async(stream)
            .await
            .map_err(|e| SourceError::Connect(format!("WebSocket handshake failed: {e}")))?;
        debug!("WebSocket handshake completed with {}", addr);

        Ok(WsConnection::new(ws, addr).with_message_kind(self.kind))
    }

    /// Get the local address this listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn next_payload(source: &dyn Source) -> Option<Bytes> {
        let reader = source.reader();
        let mut rx = reader.lock().await;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no payload in time")
    }

    /// Answers every handshake with a bare HTTP status line.
    async fn rejecting_server(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let response = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\n\r\n");
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("ws://{addr}/")
    }

    #[test]
    fn test_message_kind_wrap() {
        assert_eq!(
            MessageKind::Binary.wrap(b"\x00\x01"),
            Message::Binary(vec![0, 1])
        );
        assert_eq!(
            MessageKind::Text.wrap(b"hello"),
            Message::Text("hello".to_string())
        );
    }

    #[test]
    fn test_close_outcome() {
        assert!(close_outcome(None, "peer").is_ok());
        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        assert!(close_outcome(Some(normal), "peer").is_ok());
        let away = CloseFrame {
            code: CloseCode::Error,
            reason: "boom".into(),
        };
        assert!(close_outcome(Some(away), "peer").is_err());
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let url = rejecting_server("401 Unauthorized").await;
        let source = WsSource::authorized(url, "Authorization", "Bearer nope");
        let err = source.connect(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_bad_request_is_fatal() {
        let url = rejecting_server("400 Bad Request").await;
        let err = WsSource::new(url)
            .connect(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let url = rejecting_server("503 Service Unavailable").await;
        let err = WsSource::new(url)
            .connect(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_malformed_url_is_fatal() {
        let err = WsSource::new("not a url")
            .connect(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_write_before_connect() {
        let source = WsSource::new("ws://127.0.0.1:1/");
        assert!(matches!(
            source.write(Bytes::from_static(b"x")).await,
            Err(SourceError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_round_trip_and_normal_close() {
        let acceptor = WsAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let url = format!("ws://{}/", acceptor.local_addr().unwrap());

        let source = Arc::new(WsSource::new(url));
        let (connected, accepted) = tokio::join!(
            source.connect(CancellationToken::new()),
            acceptor.accept()
        );
        connected.unwrap();
        let conn = Arc::new(accepted.unwrap());

        let source_cancel = CancellationToken::new();
        let source_task = {
            let source = Arc::clone(&source);
            let cancel = source_cancel.clone();
            tokio::spawn(async move { source.consume(cancel).await })
        };
        let conn_task = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.consume(CancellationToken::new()).await })
        };

        source.write(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(
            next_payload(conn.as_ref()).await.unwrap(),
            Bytes::from_static(b"hello")
        );

        conn.write(Bytes::from_static(b"back")).await.unwrap();
        assert_eq!(
            next_payload(source.as_ref()).await.unwrap(),
            Bytes::from_static(b"back")
        );

        // Cancelling the dialing side sends a normal close frame.
        source_cancel.cancel();
        source_task.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(2), conn_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!source.is_connected().await);
        assert!(next_payload(conn.as_ref()).await.is_none());
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_shutdown() {
        let acceptor = WsAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let url = format!("ws://{}/", acceptor.local_addr().unwrap());

        // Connected but never consumed, so it never reads.
        let peer = WsSource::new(url);
        let (connected, accepted) =
            tokio::join!(peer.connect(CancellationToken::new()), acceptor.accept());
        connected.unwrap();
        let conn = Arc::new(accepted.unwrap());

        let cancel = CancellationToken::new();
        let consumer = {
            let conn = Arc::clone(&conn);
            let cancel = cancel.clone();
            tokio::spawn(async move { conn.consume(cancel).await })
        };
        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let chunk = Bytes::from(vec![0u8; 64 * 1024]);
                while conn.write(chunk.clone()).await.is_ok() {}
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consume did not return after cancel")
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("blocked send was not aborted")
            .unwrap();
        assert!(!conn.link.is_connected().await);
    }
}
