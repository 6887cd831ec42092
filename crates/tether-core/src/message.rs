//! Messages passed from reader tasks to the writer task.

use bytes::Bytes;

use crate::source::SourceId;

/// A payload read from one source, on its way to every other source.
#[derive(Debug, Clone)]
pub struct Message {
    content: Bytes,
    author: SourceId,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(content: impl Into<Bytes>, author: SourceId) -> Self {
        Self {
            content: content.into(),
            author,
        }
    }

    /// Payload bytes, exactly as read.
    #[must_use]
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Source the payload was read from.
    #[must_use]
    pub fn author(&self) -> SourceId {
        self.author
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
