//! # tether-transport
//!
//! Concrete sources for the Tether relay engine.
//!
//! - **TCP** - Dialed endpoints and accepted connections, relayed as raw
//!   stream chunks
//! - **WebSocket** - Dialed endpoints (with optional auth headers) and
//!   accepted connections, relayed one message per payload
//!
//! Dialed sources implement `NetworkSource` and are meant to be wrapped in
//! a `Retrier`; accepted connections implement `Source` only.
//!
//! ```rust,ignore
//! use tether_core::{Retrier, RetryPolicy, Transmitter};
//! use tether_transport::{TcpSource, WsSource};
//!
//! let control = WsSource::authorized(url, "Authorization", token);
//! let device = TcpSource::new("tcp://10.0.0.7:22");
//!
//! let transmitter = Transmitter::new();
//! transmitter.add_source(Retrier::new(control, RetryPolicy::default()))?;
//! transmitter.add_source(Retrier::new(device, RetryPolicy::default()))?;
//! ```

pub mod tcp;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use tcp::{TcpAcceptor, TcpConnection, TcpSource};

#[cfg(feature = "websocket")]
pub use websocket::{MessageKind, WsAcceptor, WsConnection, WsSource};
