//! The leader's per-peer replication bookkeeping.

use std::error::Error;
use std::fmt;

use validit::less_equal;
use validit::Validate;

mod inflights;

pub(crate) use inflights::Inflights;

/// How the leader is currently driving one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// One cautious batch at a time until the match point is found.
    Probe,
    /// Pipelined batches, bounded by the inflight window.
    Replicate,
    /// The peer is behind the compaction point; a snapshot is in transit.
    Snapshot,
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Replication state of one peer, owned by the leader's FSM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Progress {
    /// Highest index known to be replicated on the peer.
    pub(crate) matched: u64,
    /// Next index to send.
    pub(crate) next: u64,
    pub(crate) state: ProgressState,
    /// In Probe, true while one batch is outstanding.
    pub(crate) paused: bool,
    /// Index of the snapshot in transit, while in Snapshot state.
    pub(crate) pending_snapshot: u64,
    /// Whether the peer responded since the last quorum check; feeds the
    /// leader's step-down decision and the lease.
    pub(crate) recent_active: bool,
    pub(crate) inflights: Inflights,
    pub(crate) learner: bool,
    pub(crate) priority: u16,
}

impl Progress {
    pub(crate) fn new(next: u64, inflight_capacity: usize) -> Self {
        Self {
            matched: 0,
            next,
            state: ProgressState::Probe,
            paused: false,
            pending_snapshot: 0,
            recent_active: false,
            inflights: Inflights::new(inflight_capacity),
            learner: false,
            priority: 0,
        }
    }

    /// Reset to a fresh state for a new leader term.
    pub(crate) fn reset(&mut self, next: u64) {
        self.matched = 0;
        self.next = next;
        self.state = ProgressState::Probe;
        self.paused = false;
        self.pending_snapshot = 0;
        self.inflights.reset();
    }

    pub(crate) fn become_probe(&mut self) {
        // Leaving Snapshot, the peer is known through the snapshot index.
        if self.state == ProgressState::Snapshot {
            let pending = self.pending_snapshot;
            self.reset_state(ProgressState::Probe);
            self.next = (self.matched + 1).max(pending + 1);
        } else {
            self.reset_state(ProgressState::Probe);
            self.next = self.matched + 1;
        }
    }

    pub(crate) fn become_replicate(&mut self) {
        self.reset_state(ProgressState::Replicate);
        self.next = self.matched + 1;
    }

    pub(crate) fn become_snapshot(&mut self, snapshot_index: u64) {
        self.reset_state(ProgressState::Snapshot);
        self.pending_snapshot = snapshot_index;
    }

    fn reset_state(&mut self, state: ProgressState) {
        self.state = state;
        self.paused = false;
        self.pending_snapshot = 0;
        self.inflights.reset();
    }

    /// An accepted AppendResponse advanced the peer to `index`.
    ///
    /// Returns false for a stale ack that moved nothing.
    pub(crate) fn maybe_update(&mut self, index: u64) -> bool {
        if index <= self.matched {
            return false;
        }
        self.matched = index;
        if self.next < index + 1 {
            self.next = index + 1;
        }
        self.paused = false;
        true
    }

    /// A rejecting AppendResponse for the probe at `rejected`, carrying the
    /// follower's conflict hint as the new `next` candidate.
    ///
    /// Returns false when the reject is stale (the probe has since moved).
    pub(crate) fn maybe_decr_to(&mut self, rejected: u64, hint_next: u64) -> bool {
        if self.state == ProgressState::Replicate {
            if rejected <= self.matched {
                // Stale: the peer has already acked past this point.
                return false;
            }
            self.next = self.matched + 1;
            return true;
        }

        // In Probe exactly one message is outstanding, at next - 1.
        if rejected != self.next - 1 {
            return false;
        }
        self.next = hint_next.max(1).min(rejected);
        self.next = self.next.max(self.matched + 1);
        self.paused = false;
        true
    }

    /// Whether another AppendEntries may be sent now.
    pub(crate) fn is_paused(&self) -> bool {
        match self.state {
            ProgressState::Probe => self.paused,
            ProgressState::Replicate => self.inflights.full(),
            ProgressState::Snapshot => true,
        }
    }

    pub(crate) fn pause(&mut self) {
        self.paused = true;
    }

    /// A snapshot transfer finished or failed.
    pub(crate) fn snapshot_done(&mut self, success: bool) {
        if !success {
            self.pending_snapshot = 0;
        }
        self.become_probe();
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[match:{}, next:{}, inflight:{}{}{}]",
            self.state,
            self.matched,
            self.next,
            self.inflights.count(),
            if self.paused { ", paused" } else { "" },
            if self.learner { ", learner" } else { "" },
        )
    }
}

impl Validate for Progress {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        less_equal!(self.matched + 1, self.next);
        self.inflights.validate()?;
        Ok(())
    }
}
