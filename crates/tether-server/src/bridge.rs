//! Bridge assembly.
//!
//! Builds the upstream sources from configuration, feeds accepted
//! connections into the transmitter and runs it until interrupted or torn
//! down by a failing source.

use crate::config::{Config, MessageKindConfig, UpstreamConfig};
use crate::metrics::{self, MetricsObserver};
use crate::status;
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_core::{
    CancellationToken, NetworkSource, NoopObserver, Observer, Retrier, RetryPolicy, Transmitter,
};
use tether_transport::{MessageKind, TcpAcceptor, TcpSource, WsAcceptor, WsSource};
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn};

impl From<MessageKindConfig> for MessageKind {
    fn from(kind: MessageKindConfig) -> Self {
        match kind {
            MessageKindConfig::Binary => MessageKind::Binary,
            MessageKindConfig::Text => MessageKind::Text,
        }
    }
}

/// Build the network source for an upstream.
///
/// # Errors
///
/// Returns an error if the URL scheme is neither `tcp://` nor `ws://`.
pub fn upstream_source(upstream: &UpstreamConfig) -> Result<Arc<dyn NetworkSource>> {
    let url = upstream.url.as_str();

    if url.starts_with("tcp://") {
        if upstream.header_name.is_some() {
            warn!(url, "Handshake headers are ignored for TCP upstreams");
        }
        return Ok(Arc::new(TcpSource::new(url)));
    }

    if url.starts_with("ws://") {
        let mut source = WsSource::new(url).with_message_kind(upstream.message_kind.into());
        if let (Some(name), Some(value)) = (&upstream.header_name, &upstream.header_value) {
            source = source.with_header(name.as_str(), value.as_str());
        }
        return Ok(Arc::new(source));
    }

    bail!("Unsupported upstream URL: {url}")
}

/// Connect every upstream through a [`Retrier`] and add it to the bridge.
///
/// Stops early without error if `cancel` fires while connecting.
///
/// # Errors
///
/// Returns an error if an upstream fails fatally or runs out of attempts.
pub async fn connect_upstreams(
    upstreams: &[UpstreamConfig],
    policy: &RetryPolicy,
    transmitter: &Transmitter,
    cancel: &CancellationToken,
) -> Result<()> {
    for upstream in upstreams {
        let retrier = Retrier::from_arc(upstream_source(upstream)?, policy.clone());

        info!(url = %upstream.url, "Connecting upstream");
        retrier
            .connect(cancel.clone())
            .await
            .with_context(|| format!("Could not connect to {}", upstream.url))?;

        if cancel.is_cancelled() {
            return Ok(());
        }
        transmitter.add_source(retrier)?;
    }
    Ok(())
}

/// Add accepted TCP connections to the bridge until `cancel` fires.
pub async fn accept_tcp(
    acceptor: TcpAcceptor,
    transmitter: Arc<Transmitter>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };

        match accepted {
            Ok(connection) => {
                info!(peer = connection.peer_addr(), "Bridging TCP connection");
                if transmitter.add_source(connection).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "TCP accept failed"),
        }
    }
}

/// Add accepted WebSocket connections to the bridge until `cancel` fires.
pub async fn accept_ws(
    acceptor: WsAcceptor,
    transmitter: Arc<Transmitter>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };

        match accepted {
            Ok(connection) => {
                info!(peer = connection.peer_addr(), "Bridging WebSocket connection");
                if transmitter.add_source(connection).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "WebSocket accept failed"),
        }
    }
}

/// Run the bridge described by `config`.
///
/// # Errors
///
/// Returns an error if startup fails or a source failure tore the bridge
/// down. An interrupt is a clean exit.
pub async fn run(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    let tasks = TaskTracker::new();

    tasks.spawn({
        let cancel = cancel.clone();
        let interrupted = Arc::clone(&interrupted);
        async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => {
                        info!("Interrupt received, shutting down");
                        interrupted.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                    Err(e) => error!("Failed to listen for interrupt: {}", e),
                },
            }
        }
    });

    let observer: Arc<dyn Observer> = if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        Arc::new(MetricsObserver)
    } else {
        Arc::new(NoopObserver)
    };

    let transmitter = Arc::new(
        Transmitter::new()
            .with_observer(observer)
            .with_span(info_span!("bridge")),
    );

    let outcome = match start(&config, &transmitter, &tasks, &cancel).await {
        Ok(()) => transmitter
            .run(cancel.clone())
            .await
            .context("Bridge could not start"),
        Err(e) => Err(e),
    };

    cancel.cancel();
    tasks.close();
    tasks.wait().await;
    outcome?;

    if interrupted.load(Ordering::SeqCst) {
        info!("Bridge stopped");
        Ok(())
    } else {
        bail!("Bridge torn down after a source failed")
    }
}

/// Bind listeners, start the status endpoint and connect upstreams.
async fn start(
    config: &Config,
    transmitter: &Arc<Transmitter>,
    tasks: &TaskTracker,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Some(addr) = config.listen.tcp_addr()? {
        let acceptor = TcpAcceptor::bind(addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {addr}"))?;
        tasks.spawn(accept_tcp(acceptor, Arc::clone(transmitter), cancel.clone()));
    }

    if let Some(addr) = config.listen.websocket_addr()? {
        let acceptor = WsAcceptor::bind(addr)
            .await
            .with_context(|| format!("Failed to bind WebSocket listener on {addr}"))?
            .with_message_kind(config.listen.message_kind.into());
        tasks.spawn(accept_ws(acceptor, Arc::clone(transmitter), cancel.clone()));
    }

    if config.status.enabled {
        let addr = config.status.bind_addr()?;
        let transmitter = Arc::clone(transmitter);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = status::serve(addr, transmitter, cancel).await {
                error!("{:#}", e);
            }
        });
    }

    connect_upstreams(
        &config.upstreams,
        &config.retry.policy(),
        transmitter,
        cancel,
    )
    .await
}
