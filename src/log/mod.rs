//! The replicated log: a durable prefix in stable storage plus an unstable tail.

use std::error::Error;

use bytes::Bytes;
use validit::less_equal;
use validit::Validate;

use crate::error::StorageError;
use crate::proto::Entry;
use crate::proto::HardState;
use crate::proto::SnapshotMeta;
use crate::storage::LogError;
use crate::storage::LogStorage;

mod unstable;

pub(crate) use unstable::Unstable;

/// One group's log view, combining the store with entries not yet durable.
///
/// `committed` and `applied` track the usual raft boundaries:
/// `first_index - 1 <= applied <= committed <= last_index`.
pub(crate) struct RaftLog<S> {
    storage: S,
    pub(crate) unstable: Unstable,
    pub(crate) committed: u64,
    pub(crate) applied: u64,
}

impl<S: LogStorage> RaftLog<S> {
    /// Recover the log view from storage.
    pub(crate) fn open(storage: S) -> Result<(Self, HardState), StorageError> {
        let init = storage.initial_state()?;
        let snap_index = init.snapshot.as_ref().map(|s| s.index).unwrap_or(0);

        let log = Self {
            storage,
            unstable: Unstable::new(init.last_index + 1),
            committed: init.hard_state.commit,
            applied: snap_index,
        };
        Ok((log, init.hard_state))
    }

    pub(crate) fn storage(&mut self) -> &mut S {
        &mut self.storage
    }

    /// The configuration recorded by the stored snapshot, if one exists.
    pub(crate) fn storage_snapshot_peers(&self) -> Option<Vec<crate::proto::Peer>> {
        self.storage.snapshot_meta().ok().flatten().map(|m| m.peers)
    }

    pub(crate) fn first_index(&self) -> u64 {
        if let Some(i) = self.unstable.maybe_first_index() {
            return i;
        }
        self.storage.first_index().expect("storage first_index")
    }

    pub(crate) fn last_index(&self) -> u64 {
        if let Some(i) = self.unstable.maybe_last_index() {
            return i;
        }
        self.storage.last_index().expect("storage last_index")
    }

    pub(crate) fn last_term(&self) -> u64 {
        self.term(self.last_index()).unwrap_or(0)
    }

    pub(crate) fn term(&self, index: u64) -> Result<u64, LogError> {
        if let Some(t) = self.unstable.maybe_term(index) {
            return Ok(t);
        }
        if index == 0 {
            return Ok(0);
        }
        self.storage.term(index)
    }

    pub(crate) fn match_term(&self, index: u64, term: u64) -> bool {
        self.term(index).map(|t| t == term).unwrap_or(false)
    }

    /// Whether `(last_term, last_index)` is at least as up-to-date as this log.
    pub(crate) fn is_up_to_date(&self, last_index: u64, term: u64) -> bool {
        term > self.last_term() || (term == self.last_term() && last_index >= self.last_index())
    }

    /// Entries `[lo, hi)` truncated to `max_bytes`, never partially filled.
    pub(crate) fn slice(&self, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>, LogError> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        if lo < self.first_index() {
            return Err(LogError::Compacted {
                index: lo,
                first_index: self.first_index(),
            });
        }
        if hi > self.last_index() + 1 {
            return Err(LogError::Unavailable { index: hi - 1 });
        }

        let mut out: Vec<Entry> = Vec::new();
        let mut budget = max_bytes;

        let stable_hi = hi.min(self.unstable.offset);
        if lo < stable_hi {
            out = self.storage.entries(lo, stable_hi, max_bytes)?;
            let got = out.iter().map(|e| e.size()).sum::<u64>();
            if (out.last().map(|e| e.index + 1).unwrap_or(lo)) < stable_hi {
                // The byte budget cut the stable read short.
                return Ok(out);
            }
            budget = budget.saturating_sub(got);
        }

        if hi > self.unstable.offset {
            let ulo = lo.max(self.unstable.offset);
            for e in self.unstable.slice(ulo, hi) {
                budget = budget.saturating_sub(e.size());
                if budget == 0 && !out.is_empty() {
                    return Ok(out);
                }
                out.push(e.clone());
            }
        }
        Ok(out)
    }

    /// All entries from `lo` to the end of the log.
    pub(crate) fn entries_from(&self, lo: u64, max_bytes: u64) -> Result<Vec<Entry>, LogError> {
        self.slice(lo, self.last_index() + 1, max_bytes)
    }

    /// Leader-side append; entries already carry their index and term.
    pub(crate) fn append(&mut self, entries: &[Entry]) -> u64 {
        if let Some(first) = entries.first() {
            assert!(
                first.index > self.committed,
                "appending index {} at or below commit {}",
                first.index,
                self.committed,
            );
            self.unstable.truncate_and_append(entries);
        }
        self.last_index()
    }

    /// Follower-side conditional append for an AppendEntries message.
    ///
    /// Returns the index of the last new entry when `(prev_index, prev_term)`
    /// matches, after truncating any conflicting suffix strictly above
    /// `committed`. Returns `None` on a mismatch; the caller builds the
    /// conflict hint.
    pub(crate) fn maybe_append(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        leader_commit: u64,
        entries: &[Entry],
    ) -> Option<u64> {
        if !self.match_term(prev_index, prev_term) {
            return None;
        }

        let last_new = prev_index + entries.len() as u64;
        let conflict = self.find_conflict(entries);
        match conflict {
            0 => {}
            c if c <= self.committed => {
                panic!(
                    "entry {} conflicts with committed entry at commit {}",
                    c, self.committed
                );
            }
            c => {
                let start = (c - prev_index - 1) as usize;
                self.append_after_conflict(&entries[start..]);
            }
        }
        self.commit_to(leader_commit.min(last_new));
        Some(last_new)
    }

    fn append_after_conflict(&mut self, entries: &[Entry]) {
        if let Some(first) = entries.first() {
            assert!(
                first.index > self.committed,
                "truncating below commit {} for index {}",
                self.committed,
                first.index,
            );
        }
        self.unstable.truncate_and_append(entries);
    }

    /// The first index whose `(index, term)` differs from the local log.
    ///
    /// 0 means no conflict: every entry is already present. An index past the
    /// local last means the tail is simply new.
    fn find_conflict(&self, entries: &[Entry]) -> u64 {
        for e in entries {
            if !self.match_term(e.index, e.term) {
                if e.index <= self.last_index() {
                    tracing::info!(
                        index = e.index,
                        new_term = e.term,
                        old_term = self.term(e.index).unwrap_or(0),
                        "log conflict, overwriting suffix"
                    );
                }
                return e.index;
            }
        }
        0
    }

    /// The hint pair for a rejecting AppendResponse.
    ///
    /// `conflict_index` is the first index at or after `prev_index` where the
    /// log disagrees; `conflict_term` is the local term there, or 0 when the
    /// log ends before `prev_index`.
    pub(crate) fn conflict_hint(&self, prev_index: u64) -> (u64, u64) {
        let last = self.last_index();
        if prev_index > last {
            return (last + 1, 0);
        }

        let term = self.term(prev_index).unwrap_or(0);
        // The disagreement covers the follower's whole run of this term: jump
        // the hint back to the run's first index so the leader skips it in
        // one round trip.
        let mut index = prev_index;
        while index > self.first_index() {
            match self.term(index - 1) {
                Ok(t) if t == term => index -= 1,
                _ => break,
            }
        }
        (index, term)
    }

    /// The last local index carrying `term`, if the term appears at all.
    pub(crate) fn last_index_of_term(&self, term: u64) -> Option<u64> {
        let mut index = self.last_index();
        while index >= self.first_index() {
            match self.term(index) {
                Ok(t) if t == term => return Some(index),
                Ok(t) if t < term => return None,
                Ok(_) => index -= 1,
                Err(_) => return None,
            }
        }
        None
    }

    pub(crate) fn commit_to(&mut self, index: u64) {
        if index <= self.committed {
            return;
        }
        assert!(
            index <= self.last_index(),
            "commit_to({}) is past the last index {}",
            index,
            self.last_index(),
        );
        self.committed = index;
    }

    pub(crate) fn applied_to(&mut self, index: u64) {
        if index == 0 {
            return;
        }
        assert!(
            index <= self.committed && index >= self.applied,
            "applied_to({}) out of range [{}, {}]",
            index,
            self.applied,
            self.committed,
        );
        self.applied = index;
    }

    /// Entries the unstable buffer currently holds.
    pub(crate) fn unstable_entries(&self) -> &[Entry] {
        &self.unstable.entries
    }

    pub(crate) fn unstable_snapshot(&self) -> Option<&(SnapshotMeta, Bytes)> {
        self.unstable.snapshot.as_ref()
    }

    /// Committed entries not yet handed to the apply worker.
    pub(crate) fn next_committed_entries(&self, max_bytes: u64) -> Result<Vec<Entry>, LogError> {
        let lo = (self.applied + 1).max(self.first_index());
        if self.committed + 1 > lo {
            return self.slice(lo, self.committed + 1, max_bytes);
        }
        Ok(Vec::new())
    }

    pub(crate) fn has_next_committed_entries(&self) -> bool {
        self.committed > self.applied.max(self.first_index() - 1)
    }

    /// Mark the unstable prefix up to `(index, term)` as durable.
    pub(crate) fn stable_to(&mut self, index: u64, term: u64) {
        self.unstable.stable_to(index, term);
    }

    pub(crate) fn stable_snap_to(&mut self, index: u64) {
        self.unstable.stable_snap_to(index);
    }

    /// Stage an incoming snapshot, displacing the whole log view.
    pub(crate) fn restore(&mut self, meta: SnapshotMeta, data: Bytes) {
        tracing::info!(
            index = meta.index,
            term = meta.term,
            "log restores from snapshot"
        );
        self.committed = meta.index;
        self.unstable.restore(meta, data);
    }
}

impl<S: LogStorage> Validate for RaftLog<S> {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        less_equal!(self.first_index() - 1, self.last_index());
        less_equal!(self.applied, self.committed);
        less_equal!(self.committed, self.last_index());
        Ok(())
    }
}
