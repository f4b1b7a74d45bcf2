//! The stable-storage contract a group replicates into.

use bytes::Bytes;

use crate::error::StorageError;
use crate::proto::Entry;
use crate::proto::HardState;
use crate::proto::SnapshotMeta;

mod mem;

pub use mem::MemStorage;

/// Error raised by a log read.
///
/// `Compacted` and `Unavailable` are ordinary protocol signals (the leader
/// falls back to a snapshot, a follower asks again); `Storage` is fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("index {index} has been compacted, first index is {first_index}")]
    Compacted { index: u64, first_index: u64 },

    #[error("index {index} is not yet in the log")]
    Unavailable { index: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// State recovered from a store when a group starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialState {
    pub hard_state: HardState,
    /// Index of the first entry present, `snapshot.index + 1` after compaction.
    pub first_index: u64,
    /// Index of the last entry present; `first_index - 1` for an empty log.
    pub last_index: u64,
    pub snapshot: Option<SnapshotMeta>,
}

/// Durable log, hard-state and snapshot metadata for one group.
///
/// A store is private to its group and only ever entered from the group's
/// single-threaded loop, so implementations need no internal ordering beyond
/// durability: when a write returns, it must survive a crash. Any error is
/// propagated upward without retry and halts the group.
pub trait LogStorage: Send + 'static {
    /// Recover hard state and log bounds.
    fn initial_state(&self) -> Result<InitialState, StorageError>;

    /// Entries in `[lo, hi)`, truncated to at most `max_bytes` but always
    /// containing at least one entry when the range is non-empty. Entries are
    /// never partially returned.
    fn entries(&self, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>, LogError>;

    /// Term of the entry at `index`. For `index == snapshot.index` this is
    /// the snapshot's term.
    fn term(&self, index: u64) -> Result<u64, LogError>;

    fn first_index(&self) -> Result<u64, StorageError>;

    fn last_index(&self) -> Result<u64, StorageError>;

    /// Append a batch with contiguous indices starting at `last_index + 1`.
    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError>;

    /// Discard all entries with index strictly greater than `index`.
    fn truncate_above(&mut self, index: u64) -> Result<(), StorageError>;

    /// Discard all entries with index strictly less than `index`.
    fn truncate_below(&mut self, index: u64) -> Result<(), StorageError>;

    fn save_hard_state(&mut self, hs: &HardState) -> Result<(), StorageError>;

    /// Record a snapshot at `meta.index` and discard every entry at or below
    /// it. Entries above `meta.index` survive (log compaction); a restore
    /// from a foreign snapshot truncates them first.
    ///
    /// On a later start the runtime replays the stored snapshot into the
    /// application, then the remaining log suffix.
    fn install_snapshot(&mut self, meta: &SnapshotMeta, data: &Bytes) -> Result<(), StorageError>;

    /// Metadata of the most recent snapshot, if one exists.
    fn snapshot_meta(&self) -> Result<Option<SnapshotMeta>, StorageError>;

    /// The most recent snapshot with its payload.
    fn read_snapshot(&self) -> Result<Option<(SnapshotMeta, Bytes)>, StorageError>;
}
