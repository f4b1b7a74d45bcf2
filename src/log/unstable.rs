//! The not-yet-durable tail of a group's log.

use bytes::Bytes;

use crate::proto::Entry;
use crate::proto::SnapshotMeta;

/// Entries accepted by the leader or a follower that have not reached stable
/// storage yet, plus a staged snapshot awaiting installation.
///
/// `offset` is the index of `entries[0]`. An incoming snapshot displaces the
/// whole log, so `snapshot` and `entries` never overlap: after `restore`,
/// `offset == snapshot.index + 1` and `entries` is empty.
#[derive(Debug, Default)]
pub(crate) struct Unstable {
    pub(crate) snapshot: Option<(SnapshotMeta, Bytes)>,
    pub(crate) entries: Vec<Entry>,
    pub(crate) offset: u64,
}

impl Unstable {
    pub(crate) fn new(offset: u64) -> Self {
        Self {
            snapshot: None,
            entries: Vec::new(),
            offset,
        }
    }

    /// First index held here, if a staged snapshot defines one.
    pub(crate) fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|(meta, _)| meta.index + 1)
    }

    /// Last index held here, if any.
    pub(crate) fn maybe_last_index(&self) -> Option<u64> {
        if !self.entries.is_empty() {
            return Some(self.offset + self.entries.len() as u64 - 1);
        }
        self.snapshot.as_ref().map(|(meta, _)| meta.index)
    }

    /// Term at `index`, if this buffer covers it.
    pub(crate) fn maybe_term(&self, index: u64) -> Option<u64> {
        if let Some((meta, _)) = &self.snapshot {
            if meta.index == index {
                return Some(meta.term);
            }
        }
        if index < self.offset {
            return None;
        }
        let last = self.maybe_last_index()?;
        if index > last {
            return None;
        }
        Some(self.entries[(index - self.offset) as usize].term)
    }

    /// Forget the prefix up to `(index, term)`; it is durable now.
    ///
    /// A mismatched term means the prefix has since been overwritten by a new
    /// leader, in which case nothing is released.
    pub(crate) fn stable_to(&mut self, index: u64, term: u64) {
        let Some(t) = self.maybe_term(index) else {
            return;
        };
        if t == term && index >= self.offset {
            let n = (index + 1 - self.offset) as usize;
            self.entries.drain(..n);
            self.offset = index + 1;
        }
    }

    /// Forget the staged snapshot once it has been installed.
    pub(crate) fn stable_snap_to(&mut self, index: u64) {
        if let Some((meta, _)) = &self.snapshot {
            if meta.index == index {
                self.snapshot = None;
            }
        }
    }

    /// Displace everything with an incoming snapshot.
    pub(crate) fn restore(&mut self, meta: SnapshotMeta, data: Bytes) {
        self.offset = meta.index + 1;
        self.entries.clear();
        self.snapshot = Some((meta, data));
    }

    /// Append `entries`, truncating any conflicting suffix.
    ///
    /// The first new index must not leave a gap above the existing tail.
    pub(crate) fn truncate_and_append(&mut self, entries: &[Entry]) {
        if entries.is_empty() {
            return;
        }
        let first = entries[0].index;

        if first == self.offset + self.entries.len() as u64 {
            // Contiguous with the tail.
        } else if first <= self.offset {
            // The whole buffer is overwritten.
            self.offset = first;
            self.entries.clear();
        } else {
            // Overwrite a suffix.
            self.entries.truncate((first - self.offset) as usize);
        }
        self.entries.extend_from_slice(entries);
    }

    /// Entries in `[lo, hi)`; the caller guarantees the range is in bounds.
    pub(crate) fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        debug_assert!(lo >= self.offset, "slice lo {} below offset {}", lo, self.offset);
        &self.entries[(lo - self.offset) as usize..(hi - self.offset) as usize]
    }
}
