//! # tether-core
//!
//! Relay engine for Tether: bridges any number of byte-stream endpoints and
//! copies every payload read from one of them to all the others.
//!
//! - **Source** - Capability every endpoint implements
//! - **Pool** - Concurrency-safe set of bridged sources
//! - **Transmitter** - Fans reads in, broadcasts writes out
//! - **Retrier** - Reconnect with backoff for network sources
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Source    │────▶│ Transmitter │────▶│    Pool     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲
//!        │
//! ┌─────────────┐
//! │   Retrier   │
//! └─────────────┘
//! ```
//!
//! ```rust,ignore
//! use tether_core::{Retrier, RetryPolicy, Transmitter};
//! use tokio_util::sync::CancellationToken;
//!
//! let transmitter = Transmitter::new();
//! transmitter.add_source(Retrier::new(upstream, RetryPolicy::default()))?;
//! transmitter.add_source(accepted)?;
//! transmitter.run(CancellationToken::new()).await?;
//! ```

pub mod error;
pub mod message;
pub mod observer;
pub mod pool;
pub mod retry;
pub mod source;
pub mod transmitter;

#[cfg(test)]
mod mock;

pub use error::{is_closed_connection, SourceError, TransmitterError};
pub use message::Message;
pub use observer::{NoopObserver, Observer};
pub use pool::Pool;
pub use retry::{exponential_jitter, Backoff, JitterFn, Retrier, RetryPolicy};
pub use source::{Inbox, NetworkSource, Reader, Source, SourceId};
pub use transmitter::{Transmitter, TransmitterState};

/// Re-exported so callers do not need a direct `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
