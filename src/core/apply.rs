//! Delivery of committed entries to the state machine
//!
//! `RaftCore` pushes each newly applied entry into an unbounded channel while
//! holding its lock, so entries leave the core in index order, exactly once.
//! The consumer drains `CommittedEntries` at its own pace.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

/// A committed client command, detached from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// Sending half, owned by `RaftCore`
pub type ApplySender = mpsc::UnboundedSender<CommittedEntry>;

/// Ordered stream of committed entries
#[derive(Debug)]
pub struct CommittedEntries {
    rx: mpsc::UnboundedReceiver<CommittedEntry>,
}

/// Create a connected sender/stream pair
pub fn channel() -> (ApplySender, CommittedEntries) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, CommittedEntries { rx })
}

impl CommittedEntries {
    /// Wait for the next committed entry. `None` once the core is dropped.
    pub async fn next(&mut self) -> Option<CommittedEntry> {
        self.rx.recv().await
    }

    /// Take an entry if one is already queued
    pub fn try_next(&mut self) -> Option<CommittedEntry> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<CommittedEntry> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

impl Stream for CommittedEntries {
    type Item = CommittedEntry;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
