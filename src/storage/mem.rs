//! An in-memory [`LogStorage`] used by the test suites.

use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::StorageError;
use crate::proto::Entry;
use crate::proto::HardState;
use crate::proto::SnapshotMeta;
use crate::storage::InitialState;
use crate::storage::LogError;
use crate::storage::LogStorage;

#[derive(Debug, Default)]
struct Inner {
    hard_state: HardState,
    /// Entries starting at `offset`; `offset` is `snapshot.index + 1`.
    entries: Vec<Entry>,
    offset: u64,
    snapshot: Option<(SnapshotMeta, Bytes)>,
}

impl Inner {
    fn new() -> Self {
        Self {
            offset: 1,
            ..Default::default()
        }
    }

    fn first_index(&self) -> u64 {
        self.offset
    }

    fn last_index(&self) -> u64 {
        self.offset + self.entries.len() as u64 - 1
    }

    fn snapshot_index(&self) -> u64 {
        self.snapshot.as_ref().map(|(s, _)| s.index).unwrap_or(0)
    }
}

/// In-memory store. Clones share state, which lets a test stop a group and
/// restart it on the surviving "disk".
#[derive(Debug, Clone)]
pub struct MemStorage {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// All stored entries; test helper.
    pub fn all_entries(&self) -> Vec<Entry> {
        self.inner.lock().unwrap().entries.clone()
    }
}

impl LogStorage for MemStorage {
    fn initial_state(&self) -> Result<InitialState, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(InitialState {
            hard_state: inner.hard_state,
            first_index: inner.first_index(),
            last_index: inner.last_index(),
            snapshot: inner.snapshot.as_ref().map(|(meta, _)| meta.clone()),
        })
    }

    fn entries(&self, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>, LogError> {
        let inner = self.inner.lock().unwrap();
        if lo < inner.first_index() {
            return Err(LogError::Compacted {
                index: lo,
                first_index: inner.first_index(),
            });
        }
        if hi > inner.last_index() + 1 {
            return Err(LogError::Unavailable { index: hi - 1 });
        }

        let mut out = Vec::new();
        let mut bytes = 0u64;
        for e in &inner.entries[(lo - inner.offset) as usize..(hi - inner.offset) as usize] {
            bytes += e.size();
            if bytes > max_bytes && !out.is_empty() {
                break;
            }
            out.push(e.clone());
        }
        Ok(out)
    }

    fn term(&self, index: u64) -> Result<u64, LogError> {
        let inner = self.inner.lock().unwrap();
        if index == inner.snapshot_index() {
            return Ok(inner.snapshot.as_ref().map(|(s, _)| s.term).unwrap_or(0));
        }
        if index < inner.first_index() {
            return Err(LogError::Compacted {
                index,
                first_index: inner.first_index(),
            });
        }
        if index > inner.last_index() {
            return Err(LogError::Unavailable { index });
        }
        Ok(inner.entries[(index - inner.offset) as usize].term)
    }

    fn first_index(&self) -> Result<u64, StorageError> {
        Ok(self.inner.lock().unwrap().first_index())
    }

    fn last_index(&self) -> Result<u64, StorageError> {
        Ok(self.inner.lock().unwrap().last_index())
    }

    fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        assert_eq!(
            inner.last_index() + 1,
            entries[0].index,
            "append must be contiguous with the stored log"
        );
        inner.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_above(&mut self, index: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if index < inner.last_index() {
            let keep = (index + 1).saturating_sub(inner.offset) as usize;
            inner.entries.truncate(keep);
        }
        Ok(())
    }

    fn truncate_below(&mut self, index: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if index > inner.first_index() {
            let drop = (index - inner.offset) as usize;
            let drop = drop.min(inner.entries.len());
            inner.entries.drain(..drop);
            inner.offset = index;
        }
        Ok(())
    }

    fn save_hard_state(&mut self, hs: &HardState) -> Result<(), StorageError> {
        self.inner.lock().unwrap().hard_state = *hs;
        Ok(())
    }

    fn install_snapshot(&mut self, meta: &SnapshotMeta, data: &Bytes) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if meta.index + 1 > inner.offset {
            let drop = (meta.index + 1 - inner.offset) as usize;
            let drop = drop.min(inner.entries.len());
            inner.entries.drain(..drop);
            inner.offset = meta.index + 1;
        }
        inner.snapshot = Some((meta.clone(), data.clone()));
        Ok(())
    }

    fn snapshot_meta(&self) -> Result<Option<SnapshotMeta>, StorageError> {
        Ok(self.inner.lock().unwrap().snapshot.as_ref().map(|(meta, _)| meta.clone()))
    }

    fn read_snapshot(&self) -> Result<Option<(SnapshotMeta, Bytes)>, StorageError> {
        Ok(self.inner.lock().unwrap().snapshot.clone())
    }
}
