use crate::consensus::commit_stream::{CommitStreamPublisher, CommittedEntry, EntryKey};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Term is the monotonically increasing consensus epoch. Used to detect
/// stale leaders.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based index of an entry in the replicated log.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    pub fn new(index: u64) -> Self {
        LogIndex(index)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> LogIndex {
        LogIndex(self.0 + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<LogIndex> {
        self.0.checked_sub(delta).map(LogIndex)
    }
}

impl fmt::Debug for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub term: Term,
    pub data: Bytes,
}

/// Append-only storage seam for the consensus log. Correctness-critical:
/// `append` must not return until the entry is durable for the durable
/// implementations.
pub trait LogStore: Send + 'static {
    /// Append at the next index and return that index.
    fn append(&mut self, entry: LogEntry) -> Result<LogIndex, io::Error>;

    fn read(&self, index: LogIndex) -> Result<Option<LogEntry>, io::Error>;

    /// Remove `index` and everything after it.
    fn truncate_from(&mut self, index: LogIndex) -> Result<(), io::Error>;

    /// The index the next `append` will use; equals the current length.
    fn next_index(&self) -> LogIndex;
}

/// Volatile store for tests and ephemeral members.
pub struct InMemoryLogStore {
    entries: Vec<LogEntry>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        InMemoryLogStore { entries: Vec::new() }
    }
}

impl LogStore for InMemoryLogStore {
    fn append(&mut self, entry: LogEntry) -> Result<LogIndex, io::Error> {
        self.entries.push(entry);
        Ok(LogIndex::new(self.entries.len() as u64 - 1))
    }

    fn read(&self, index: LogIndex) -> Result<Option<LogEntry>, io::Error> {
        Ok(self.entries.get(index.as_u64() as usize).cloned())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), io::Error> {
        self.entries.truncate(index.as_u64() as usize);
        Ok(())
    }

    fn next_index(&self) -> LogIndex {
        LogIndex::new(self.entries.len() as u64)
    }
}

// Record framing:
//
// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 10| 11| 12| ... |
// +---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
// |Vrs|        Term (8 bytes, BE)     | Len (4 bytes) | Data|
// +---+-------------------------------+---------------+-...-+
const RECORD_FORMAT_VERSION: u8 = 1;
const RECORD_HEADER_LEN: usize = 1 + 8 + 4;

/// Durable append-only file store. Every append is flushed and synced before
/// it returns, so an acknowledged entry survives a process restart. Entries
/// are also cached in memory for reads; the file is the source of truth at
/// startup.
pub struct FileLogStore {
    path: PathBuf,
    file: File,
    entries: Vec<LogEntry>,
}

impl FileLogStore {
    pub fn open(path: PathBuf) -> Result<Self, io::Error> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let entries = Self::load_existing(&mut file)?;
        file.seek(SeekFrom::End(0))?;

        Ok(FileLogStore { path, file, entries })
    }

    fn load_existing(file: &mut File) -> Result<Vec<LogEntry>, io::Error> {
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        let mut cursor = 0usize;
        while cursor + RECORD_HEADER_LEN <= bytes.len() {
            if bytes[cursor] != RECORD_FORMAT_VERSION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Unknown log record version {}", bytes[cursor]),
                ));
            }
            let mut term_bytes = [0u8; 8];
            term_bytes.copy_from_slice(&bytes[cursor + 1..cursor + 9]);
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&bytes[cursor + 9..cursor + 13]);
            let data_len = u32::from_be_bytes(len_bytes) as usize;

            let data_start = cursor + RECORD_HEADER_LEN;
            if data_start + data_len > bytes.len() {
                // Torn tail from a crash mid-append. The entry was never
                // acknowledged, so dropping it is safe.
                break;
            }

            entries.push(LogEntry {
                term: Term::new(u64::from_be_bytes(term_bytes)),
                data: Bytes::copy_from_slice(&bytes[data_start..data_start + data_len]),
            });
            cursor = data_start + data_len;
        }

        Ok(entries)
    }

    fn encode_record(entry: &LogEntry) -> Vec<u8> {
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + entry.data.len());
        record.push(RECORD_FORMAT_VERSION);
        record.extend_from_slice(&entry.term.as_u64().to_be_bytes());
        record.extend_from_slice(&(entry.data.len() as u32).to_be_bytes());
        record.extend_from_slice(&entry.data);
        record
    }

    fn rewrite_all(&mut self) -> Result<(), io::Error> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        for entry in &self.entries {
            let record = Self::encode_record(entry);
            self.file.write_all(&record)?;
        }
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl LogStore for FileLogStore {
    fn append(&mut self, entry: LogEntry) -> Result<LogIndex, io::Error> {
        let record = Self::encode_record(&entry);
        self.file.write_all(&record)?;
        self.file.flush()?;
        self.file.sync_data()?;

        self.entries.push(entry);
        Ok(LogIndex::new(self.entries.len() as u64 - 1))
    }

    fn read(&self, index: LogIndex) -> Result<Option<LogEntry>, io::Error> {
        Ok(self.entries.get(index.as_u64() as usize).cloned())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), io::Error> {
        let new_len = index.as_u64() as usize;
        if new_len >= self.entries.len() {
            return Ok(());
        }
        self.entries.truncate(new_len);
        self.rewrite_all()
    }

    fn next_index(&self) -> LogIndex {
        LogIndex::new(self.entries.len() as u64)
    }
}

/// ConsensusLog is the consensus-specific facade over a `LogStore`.
///
/// A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written locally, not yet replicated to majority
/// 2. Committed - replicated to majority
/// 3. Applied - a committed entry that has been published to the commit stream
///
/// Each member has its own local view of what state an entry is in.
pub(crate) struct ConsensusLog<S: LogStore> {
    logger: slog::Logger,
    store: S,
    // Metadata about the highest entry locally written.
    latest_entry_metadata: Option<(Term, LogIndex)>,
    commit_stream: CommitStreamPublisher,
    // Index of highest entry known committed. None if nothing committed.
    commit_index: Option<LogIndex>,
    // Index of highest entry published to the commit stream.
    last_applied_index: Option<LogIndex>,
}

impl<S: LogStore> ConsensusLog<S> {
    pub(crate) fn new(logger: slog::Logger, store: S, commit_stream: CommitStreamPublisher) -> Result<Self, io::Error> {
        // Recover the latest-entry metadata from whatever the store already
        // holds (non-empty after a restart with a durable store).
        let latest_entry_metadata = match store.next_index().checked_minus(1) {
            None => None,
            Some(last_index) => match store.read(last_index)? {
                Some(entry) => Some((entry.term, last_index)),
                None => None,
            },
        };

        Ok(ConsensusLog {
            logger,
            store,
            latest_entry_metadata,
            commit_stream,
            commit_index: None,
            last_applied_index: None,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, LogIndex)> {
        self.latest_entry_metadata
    }

    pub(crate) fn next_index(&self) -> LogIndex {
        self.store.next_index()
    }

    pub(crate) fn read(&self, index: LogIndex) -> Result<Option<LogEntry>, io::Error> {
        self.store.read(index)
    }

    pub(crate) fn append(&mut self, entry: LogEntry) -> Result<LogIndex, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.store.append(entry)?;
        // Only update state after the store action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    /// Remove `index` and everything after it.
    pub(crate) fn truncate_from(&mut self, index: LogIndex) -> Result<(), io::Error> {
        let mut new_latest = None;
        if let Some(new_latest_index) = index.checked_minus(1) {
            new_latest = self
                .read(new_latest_index)?
                .map(|entry| (entry.term, new_latest_index));
        }

        self.store.truncate_from(index)?;
        self.latest_entry_metadata = new_latest;
        Ok(())
    }

    pub(crate) fn commit_index(&self) -> Option<LogIndex> {
        self.commit_index
    }

    pub(crate) fn last_applied(&self) -> Option<LogIndex> {
        self.last_applied_index
    }

    /// Ratchet the commit index forward. Regressions and no-ops are ignored,
    /// which makes duplicated or reordered replicate deliveries harmless.
    /// Returns true if the commit index moved.
    pub(crate) fn ratchet_commit_forward(&mut self, new_commit_index: LogIndex) -> bool {
        if let Some(current) = self.commit_index {
            if new_commit_index <= current {
                return false;
            }
        }

        let latest_written = match self.latest_entry_metadata {
            Some((_, index)) => index,
            None => {
                slog::warn!(
                    self.logger,
                    "Ignoring commit index {:?} with an empty local log",
                    new_commit_index,
                );
                return false;
            }
        };
        if new_commit_index > latest_written {
            slog::warn!(
                self.logger,
                "Ignoring commit index {:?} past local log end {:?}",
                new_commit_index,
                latest_written,
            );
            return false;
        }

        self.commit_index.replace(new_commit_index);
        true
    }

    /// Leader-side ratchet: only commits an index whose entry carries the
    /// current term. An index from an older term is never directly committed.
    pub(crate) fn ratchet_commit_if_term_matches(
        &mut self,
        tentative: LogIndex,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(current) if tentative <= current) {
            return Ok(false);
        }

        match self.read(tentative)? {
            Some(entry) if entry.term == current_term => Ok(self.ratchet_commit_forward(tentative)),
            _ => Ok(false),
        }
    }

    /// Publish all committed-but-unapplied entries, in order.
    pub(crate) fn apply_all_committed(&mut self) {
        if let Err(e) = self.try_apply_all_committed() {
            // The log is already persisted; applying is not on the critical
            // path and will be retried on the next commit advancement.
            slog::error!(self.logger, "Failed to apply a committed entry: {:?}", e);
        }
    }

    fn try_apply_all_committed(&mut self) -> Result<(), io::Error> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(()),
        };

        loop {
            let next_to_apply = match self.last_applied_index {
                None => LogIndex::new(0),
                Some(applied) if applied < commit_index => applied.plus(1),
                Some(_) => return Ok(()),
            };

            let entry = match self.read(next_to_apply)? {
                Some(entry) => entry,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("Committed entry {:?} missing from log", next_to_apply),
                    ))
                }
            };

            self.commit_stream.notify_commit(
                &self.logger,
                CommittedEntry {
                    key: EntryKey {
                        term: entry.term,
                        index: next_to_apply,
                    },
                    data: entry.data,
                },
            );
            self.last_applied_index.replace(next_to_apply);
        }
    }
}
