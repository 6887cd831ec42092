//! Hooks for observing the relay.
//!
//! The transmitter reports lifecycle and delivery events to an [`Observer`]
//! handed in at construction. Every method has a no-op default.

use crate::error::SourceError;
use crate::source::SourceId;

/// Receives relay events.
pub trait Observer: Send + Sync {
    /// A source joined the pool.
    fn source_added(&self, _id: SourceId) {}

    /// A source left the pool after its consume loop ended.
    fn source_removed(&self, _id: SourceId, _failed: bool) {}

    /// A payload was broadcast to `recipients` other sources.
    fn message_relayed(&self, _author: SourceId, _bytes: usize, _recipients: usize) {}

    /// Writing a payload to a source failed.
    fn write_failed(&self, _id: SourceId, _error: &SourceError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
