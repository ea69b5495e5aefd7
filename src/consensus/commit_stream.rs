use crate::consensus::log::{LogIndex, Term};
use bytes::Bytes;
use tokio::sync::mpsc;

pub fn create_commit_stream() -> (CommitStreamPublisher, CommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    let publisher = CommitStreamPublisher { sender: tx };
    let stream = CommitStream { receiver: rx };

    (publisher, stream)
}

pub struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<CommittedEntry>,
}

impl CommitStreamPublisher {
    pub(crate) fn notify_commit(&self, logger: &slog::Logger, entry: CommittedEntry) {
        if let Err(_) = self.sender.send(entry) {
            slog::warn!(logger, "CommitStream has disconnected.");
        }
    }
}

/// Stream of committed entries, consumed by the command applier to drive the
/// cluster state machine.
pub struct CommitStream {
    receiver: mpsc::UnboundedReceiver<CommittedEntry>,
}

impl CommitStream {
    /// The next committed entry, or None once the consensus engine has
    /// stopped.
    pub async fn next(&mut self) -> Option<CommittedEntry> {
        self.receiver.recv().await
    }
}

#[derive(Debug)]
pub struct CommittedEntry {
    pub key: EntryKey,
    pub data: Bytes,
}

/// Opaque key for the application to match a committed entry with an
/// append it issued.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EntryKey {
    pub term: Term,
    pub index: LogIndex,
}
