//! Scripted in-memory source used by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::source::{Inbox, Reader, Source, SourceId};

/// How a mock's consume loop ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ending {
    /// Emit the script, then wait for cancellation.
    Hold,
    /// Fail before emitting anything.
    FailBefore,
    /// Emit the script, then fail.
    FailAfter,
    /// Emit the script, then end cleanly.
    Eof,
    /// Emit the script, wait for cancellation, then keep running a while.
    Linger(Duration),
}

pub(crate) struct MockSource {
    id: SourceId,
    inbox: Inbox,
    script: Vec<Bytes>,
    ending: Ending,
    fail_writes: bool,
    written: Mutex<Vec<Bytes>>,
}

impl MockSource {
    pub(crate) fn new(script: &[&str], ending: Ending) -> Self {
        Self {
            id: SourceId::next(),
            inbox: Inbox::new(),
            script: script
                .iter()
                .map(|s| Bytes::copy_from_slice(s.as_bytes()))
                .collect(),
            ending,
            fail_writes: false,
            written: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn holding(script: &[&str]) -> Self {
        Self::new(script, Ending::Hold)
    }

    pub(crate) fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub(crate) fn received(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }
}

#[async_trait]
impl Source for MockSource {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        if self.ending == Ending::FailBefore {
            return Err(SourceError::Read("failed before".into()));
        }
        for payload in &self.script {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.inbox.deliver(payload.clone()) => {}
            }
        }
        match self.ending {
            Ending::FailAfter => Err(SourceError::Read("failed after".into())),
            Ending::Eof => Ok(()),
            Ending::Linger(delay) => {
                cancel.cancelled().await;
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Ending::Hold | Ending::FailBefore => {
                cancel.cancelled().await;
                Ok(())
            }
        }
    }

    fn reader(&self) -> Reader {
        self.inbox.reader()
    }

    async fn write(&self, payload: Bytes) -> Result<(), SourceError> {
        if self.fail_writes {
            return Err(SourceError::Write("mock refuses writes".into()));
        }
        self.written.lock().unwrap().push(payload);
        Ok(())
    }
}
