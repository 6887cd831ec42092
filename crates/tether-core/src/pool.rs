//! The set of sources currently bridged together.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

use crate::source::{Source, SourceId};

/// Concurrency-safe, unordered collection of sources.
///
/// Membership is keyed by [`SourceId`]; a source is never present twice.
/// Lookups are linear, which is fine for the tens of sources a bridge
/// usually carries.
#[derive(Default)]
pub struct Pool {
    sources: Mutex<Vec<Arc<dyn Source>>>,
}

impl Pool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn Source>>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add sources, skipping any that are already members.
    ///
    /// Returns the sources that were actually inserted.
    pub fn add<I>(&self, sources: I) -> Vec<Arc<dyn Source>>
    where
        I: IntoIterator<Item = Arc<dyn Source>>,
    {
        let mut members = self.lock();
        let mut added = Vec::new();
        for source in sources {
            let id = source.id();
            if members.iter().any(|s| s.id() == id) {
                trace!(source = %id, "Source already in pool");
                continue;
            }
            members.push(Arc::clone(&source));
            added.push(source);
        }
        added
    }

    /// Remove a source. Returns `false` if it was not a member.
    pub fn remove(&self, id: SourceId) -> bool {
        let mut members = self.lock();
        match members.iter().position(|s| s.id() == id) {
            Some(index) => {
                members.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of the members.
    ///
    /// The lock is released before this returns, so callers can write to
    /// every member without blocking membership changes.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn Source>> {
        self.lock().clone()
    }

    /// Whether a source is a member.
    #[must_use]
    pub fn contains(&self, id: SourceId) -> bool {
        self.lock().iter().any(|s| s.id() == id)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<SourceId> = self.lock().iter().map(|s| s.id()).collect();
        f.debug_struct("Pool").field("sources", &ids).finish()
    }
}
