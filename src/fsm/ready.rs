//! The FSM's output bundle, drained once per group-loop iteration.

use bytes::Bytes;

use crate::fsm::Fsm;
use crate::proto::Entry;
use crate::proto::HardState;
use crate::proto::Message;
use crate::proto::NodeId;
use crate::proto::SnapshotMeta;
use crate::storage::LogStorage;

/// A resolved read barrier: the read correlated by `ctx` may be served once
/// the application has applied through `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    pub index: u64,
    pub ctx: Bytes,
}

/// Everything the runtime must act on after a batch of steps:
/// persist first, then send, then apply.
#[derive(Debug, Default)]
pub(crate) struct Ready {
    /// Changed durable state; persisted before any message below is sent.
    pub(crate) hard_state: Option<HardState>,
    /// Unstable entries to persist.
    pub(crate) entries: Vec<Entry>,
    /// Committed entries for the apply worker, in strict index order.
    pub(crate) committed_entries: Vec<Entry>,
    pub(crate) messages: Vec<Message>,
    /// An incoming snapshot to install and restore.
    pub(crate) snapshot: Option<(SnapshotMeta, Bytes)>,
    /// Peers waiting for an application-produced snapshot.
    pub(crate) snapshot_requests: Vec<NodeId>,
    /// Resolved read barriers.
    pub(crate) read_states: Vec<ReadState>,
}

impl<S: LogStorage> Fsm<S> {
    pub(crate) fn has_ready(&self) -> bool {
        if !self.msgs.is_empty()
            || !self.snapshot_requests.is_empty()
            || !self.read_states.is_empty()
        {
            return true;
        }
        if !self.log.unstable_entries().is_empty() || self.log.unstable_snapshot().is_some() {
            return true;
        }
        if self.log.has_next_committed_entries() {
            return true;
        }
        self.hard_state() != self.prev_hard_state
    }

    /// Drain the pending outputs. The caller persists, sends and applies,
    /// then calls [`Fsm::advance`].
    pub(crate) fn ready(&mut self) -> Ready {
        let hard_state = {
            let hs = self.hard_state();
            (hs != self.prev_hard_state).then_some(hs)
        };

        let committed_entries = self
            .log
            .next_committed_entries(u64::MAX)
            .expect("committed entries are never compacted");

        Ready {
            hard_state,
            entries: self.log.unstable_entries().to_vec(),
            committed_entries,
            messages: std::mem::take(&mut self.msgs),
            snapshot: self.log.unstable_snapshot().cloned(),
            snapshot_requests: std::mem::take(&mut self.snapshot_requests),
            read_states: std::mem::take(&mut self.read_states),
        }
    }

    /// Acknowledge a `Ready` whose outputs have been acted on.
    pub(crate) fn advance(&mut self, ready: &Ready) {
        if let Some(hs) = ready.hard_state {
            self.prev_hard_state = hs;
        }
        if let Some((meta, _)) = &ready.snapshot {
            self.log.stable_snap_to(meta.index);
        }
        if let Some(last) = ready.entries.last() {
            self.log.stable_to(last.index, last.term);
        }
        if let Some(last) = ready.committed_entries.last() {
            // "Applied" here means handed to the apply queue; the worker's
            // own cursor gates reads and compaction.
            self.log.applied_to(last.index);
        }
    }
}
