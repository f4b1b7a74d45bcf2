//! Step handlers and replication drive for the leader role.

use bytes::Bytes;

use crate::error::RaftError;
use crate::fsm::Fsm;
use crate::fsm::Role;
use crate::progress::ProgressState;
use crate::proto::ConfChange;
use crate::proto::Entry;
use crate::proto::EntryKind;
use crate::proto::Message;
use crate::proto::MessageKind;
use crate::proto::NodeId;
use crate::proto::NO_LEADER;
use crate::quorum;
use crate::storage::LogError;
use crate::storage::LogStorage;

impl<S: LogStorage> Fsm<S> {
    pub(crate) fn step_leader(&mut self, m: Message) {
        match m.kind {
            MessageKind::AppendResponse => self.handle_append_response(m),
            MessageKind::HeartbeatResponse => self.handle_heartbeat_response(m),
            MessageKind::SnapshotResponse => self.handle_snapshot_response(m),
            MessageKind::ElectAckResponse => {
                // A late ack; still evidence of liveness.
                if let Some(p) = self.replicas.get_mut(&m.from) {
                    p.recent_active = true;
                }
            }
            MessageKind::VoteResponse | MessageKind::PreVoteResponse => {
                // Stale responses from the election that brought us here.
            }
            _ => {
                tracing::debug!(
                    group = self.group,
                    id = self.id,
                    msg = %m,
                    "leader ignores message"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Proposals.

    /// Accept a proposal, returning the `(index, term)` it was assigned.
    pub(crate) fn propose(&mut self, kind: EntryKind, data: Bytes) -> Result<(u64, u64), RaftError> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                group: self.group,
                leader: (self.leader != NO_LEADER).then_some(self.leader),
            });
        }
        if self.lead_transferee != NO_LEADER {
            // The incumbent stops accepting proposals for the duration of a
            // transfer.
            return Err(RaftError::NotLeader {
                group: self.group,
                leader: None,
            });
        }

        if kind == EntryKind::ConfChange {
            let cc = ConfChange::decode(&data)
                .map_err(|e| RaftError::InvalidConfig(format!("undecodable change: {}", e)))?;
            self.check_conf_change(&cc)?;
        }

        let index = self.log.last_index() + 1;
        let term = self.term;
        self.append_as_leader(vec![Entry {
            index: 0,
            term: 0,
            kind,
            data,
        }]);

        if kind == EntryKind::ConfChange {
            self.pending_conf_index = index;
        }

        self.bcast_append();
        Ok((index, term))
    }

    /// Stamp and append entries at the leader's tail.
    pub(crate) fn append_as_leader(&mut self, mut entries: Vec<Entry>) {
        let mut index = self.log.last_index();
        for e in entries.iter_mut() {
            index += 1;
            e.index = index;
            e.term = self.term;
        }
        self.log.append(&entries);

        let id = self.id;
        if let Some(p) = self.replicas.get_mut(&id) {
            p.maybe_update(index);
        }
        // A single-voter group commits on its own match.
        self.maybe_commit();
    }

    // ------------------------------------------------------------------
    // Replication.

    pub(crate) fn bcast_append(&mut self) {
        for to in self.peer_ids_except_self() {
            self.maybe_send_append(to, true);
        }
    }

    /// Send the next batch to `to` if its progress allows one.
    ///
    /// `allow_empty` lets a commit-index-only append through.
    pub(crate) fn maybe_send_append(&mut self, to: NodeId, allow_empty: bool) {
        let Some(p) = self.replicas.get(&to) else {
            return;
        };
        if p.is_paused() {
            return;
        }
        let next = p.next;
        let prev = next - 1;

        let prev_term = self.log.term(prev);
        let entries = self.log.entries_from(next, self.config.max_msg_bytes);

        let (prev_term, entries) = match (prev_term, entries) {
            (Ok(t), Ok(es)) => (t, es),
            (Err(LogError::Compacted { .. }), _) | (_, Err(LogError::Compacted { .. })) => {
                // The entries the peer needs are gone; fall back to a snapshot.
                self.request_snapshot(to);
                return;
            }
            (pt, es) => {
                tracing::error!(
                    group = self.group,
                    id = self.id,
                    to = to,
                    next = next,
                    prev_term = ?pt.err(),
                    entries = ?es.err(),
                    "replication read failed"
                );
                return;
            }
        };

        if entries.is_empty() && !allow_empty {
            return;
        }

        let last_in_batch = entries.last().map(|e| e.index);
        let mut m = self.message_to(MessageKind::AppendEntries, to);
        m.index = prev;
        m.log_term = prev_term;
        m.commit = self.log.committed;
        m.entries = entries;
        self.send(m);

        let p = self.replicas.get_mut(&to).expect("progress exists");
        match p.state {
            ProgressState::Probe => p.pause(),
            ProgressState::Replicate => {
                if let Some(last) = last_in_batch {
                    // Optimistically slide the window.
                    p.inflights.add(last);
                    p.next = last + 1;
                }
            }
            ProgressState::Snapshot => unreachable!("snapshot progress is always paused"),
        }
    }

    fn request_snapshot(&mut self, to: NodeId) {
        let Some(p) = self.replicas.get_mut(&to) else {
            return;
        };
        if p.state != ProgressState::Snapshot {
            tracing::info!(
                group = self.group,
                id = self.id,
                to = to,
                next = p.next,
                first_index = self.log.first_index(),
                "peer fell behind the compaction point, sending snapshot"
            );
            p.become_snapshot(0);
        }
        if !self.snapshot_requests.contains(&to) {
            self.snapshot_requests.push(to);
        }
    }

    /// The group runtime dispatched the snapshot at `index` to `to`.
    pub(crate) fn snapshot_sent(&mut self, to: NodeId, index: u64) {
        if let Some(p) = self.replicas.get_mut(&to) {
            if p.state == ProgressState::Snapshot {
                p.pending_snapshot = index;
            }
        }
    }

    /// Producing or sending the snapshot for `to` failed; retry via probe.
    pub(crate) fn snapshot_failed(&mut self, to: NodeId) {
        if let Some(p) = self.replicas.get_mut(&to) {
            if p.state == ProgressState::Snapshot {
                p.snapshot_done(false);
                p.pause();
            }
        }
    }

    pub(crate) fn bcast_heartbeat(&mut self) {
        let ctx = self.read_only.last_pending_ctx();
        for to in self.peer_ids_except_self() {
            self.send_heartbeat(to, ctx.clone());
        }
    }

    fn send_heartbeat(&mut self, to: NodeId, ctx: Bytes) {
        // Commit must not outrun what the peer is known to hold.
        let commit = self
            .replicas
            .get(&to)
            .map(|p| p.matched.min(self.log.committed))
            .unwrap_or(0);
        let mut m = self.message_to(MessageKind::Heartbeat, to);
        m.commit = commit;
        m.context = ctx;
        self.send(m);
    }

    // ------------------------------------------------------------------
    // Responses.

    fn handle_append_response(&mut self, m: Message) {
        let Some(p) = self.replicas.get_mut(&m.from) else {
            return;
        };
        p.recent_active = true;

        if m.reject {
            // Fast back-off: jump `next` using the follower's conflict hint.
            let hint_next = if m.log_term > 0 {
                self.log.last_index_of_term(m.log_term).unwrap_or(m.reject_hint)
            } else {
                m.reject_hint
            };

            let p = self.replicas.get_mut(&m.from).expect("progress exists");
            if p.maybe_decr_to(m.index, hint_next) {
                tracing::debug!(
                    group = self.group,
                    id = self.id,
                    from = m.from,
                    rejected = m.index,
                    next = p.next,
                    "append rejected, backing off"
                );
                if p.state == ProgressState::Replicate {
                    p.become_probe();
                }
                self.maybe_send_append(m.from, false);
            }
            return;
        }

        if !p.maybe_update(m.index) {
            return;
        }

        match p.state {
            ProgressState::Probe => p.become_replicate(),
            ProgressState::Replicate => p.inflights.free_to(m.index),
            ProgressState::Snapshot => {
                if p.matched >= p.pending_snapshot {
                    // The ack proves the peer is past the snapshot already.
                    p.become_probe();
                }
            }
        }

        if self.maybe_commit() {
            self.bcast_append();
        } else {
            self.maybe_send_append(m.from, false);
        }

        // A caught-up transfer target gets the handoff immediately.
        if m.from == self.lead_transferee && self.progress_matched(m.from) == self.log.last_index() {
            self.send_timeout_now(m.from);
        }
    }

    fn handle_heartbeat_response(&mut self, m: Message) {
        let last_index = self.log.last_index();
        let Some(p) = self.replicas.get_mut(&m.from) else {
            return;
        };
        p.recent_active = true;
        p.paused = false;

        if p.matched < last_index {
            self.maybe_send_append(m.from, false);
        }

        if !m.context.is_empty() {
            let acks = self.read_only.recv_ack(m.from, &m.context);
            // The leader's own ack is implicit.
            if acks + 1 >= self.quorum() {
                for rs in self.read_only.advance(&m.context) {
                    self.read_states.push(rs);
                }
            }
        }
    }

    fn handle_snapshot_response(&mut self, m: Message) {
        let Some(p) = self.replicas.get_mut(&m.from) else {
            return;
        };
        p.recent_active = true;

        if p.state != ProgressState::Snapshot {
            return;
        }

        if m.reject {
            tracing::warn!(
                group = self.group,
                id = self.id,
                from = m.from,
                "snapshot rejected by peer"
            );
            p.snapshot_done(false);
        } else {
            p.maybe_update(m.index);
            p.snapshot_done(true);
            tracing::info!(
                group = self.group,
                id = self.id,
                from = m.from,
                index = m.index,
                "peer restored from snapshot, resuming replication"
            );
        }
        // Probe cautiously until the next ack confirms the match point.
        if let Some(p) = self.replicas.get_mut(&m.from) {
            p.pause();
        }
        self.maybe_commit();
    }

    fn progress_matched(&self, id: NodeId) -> u64 {
        self.replicas.get(&id).map(|p| p.matched).unwrap_or(0)
    }

    /// Advance the commit index to the largest quorum-matched index of the
    /// current term. Entries from previous terms commit only transitively.
    pub(crate) fn maybe_commit(&mut self) -> bool {
        let mut matches: Vec<u64> = self
            .replicas
            .values()
            .filter(|p| !p.learner)
            .map(|p| p.matched)
            .collect();
        let mci = quorum::committed_index(&mut matches);

        if mci <= self.log.committed {
            return false;
        }
        if self.log.term(mci) != Ok(self.term) {
            // Counting replicas never commits an entry from a previous term.
            return false;
        }
        self.log.commit_to(mci);
        tracing::debug!(
            group = self.group,
            id = self.id,
            term = self.term,
            commit = mci,
            "commit index advanced"
        );
        true
    }

    // ------------------------------------------------------------------
    // Leadership transfer.

    /// Hand leadership to `target`. The incumbent keeps replicating until the
    /// target is caught up, then tells it to campaign immediately.
    pub(crate) fn transfer_leader(&mut self, target: NodeId) -> Result<(), RaftError> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                group: self.group,
                leader: (self.leader != NO_LEADER).then_some(self.leader),
            });
        }
        if target == self.id {
            // Already there.
            return Ok(());
        }
        let Some(p) = self.replicas.get(&target) else {
            return Err(RaftError::InvalidConfig(format!("peer {} does not exist", target)));
        };
        if p.learner {
            return Err(RaftError::InvalidConfig(format!("peer {} is a learner", target)));
        }

        if self.lead_transferee == target {
            return Ok(());
        }

        tracing::info!(
            group = self.group,
            id = self.id,
            target = target,
            "transferring leadership"
        );
        self.lead_transferee = target;
        self.transfer_elapsed = 0;

        if self.progress_matched(target) == self.log.last_index() {
            self.send_timeout_now(target);
        } else {
            self.maybe_send_append(target, false);
        }
        Ok(())
    }

    fn send_timeout_now(&mut self, to: NodeId) {
        let m = self.message_to(MessageKind::TimeoutNow, to);
        self.send(m);
    }

    // ------------------------------------------------------------------
    // Linearizable reads.

    /// Start a linearizable read correlated by `ctx`.
    ///
    /// `Local(index)` means the caller may answer as soon as the application
    /// has applied through `index`; `Queued` resolves later through a
    /// [`ReadState`](crate::fsm::ReadState) or a committed `LeaseRead` entry.
    pub(crate) fn read_index(&mut self, ctx: Bytes) -> Result<ReadProgress, RaftError> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                group: self.group,
                leader: (self.leader != NO_LEADER).then_some(self.leader),
            });
        }

        if self.log.term(self.log.committed) != Ok(self.term) {
            // The no-op of this term has not committed yet; the read rides a
            // barrier entry and resolves with its commit.
            self.append_as_leader(vec![Entry {
                index: 0,
                term: 0,
                kind: EntryKind::LeaseRead,
                data: ctx,
            }]);
            self.bcast_append();
            return Ok(ReadProgress::Queued);
        }

        if self.quorum() == 1 {
            return Ok(ReadProgress::Local(self.log.committed));
        }

        if self.config.lease_check && self.in_lease() {
            // Serving from local state, no round trip: the lease guarantees
            // no other node can have won an election yet.
            return Ok(ReadProgress::Local(self.log.committed));
        }

        self.read_only.add_request(self.log.committed, ctx.clone());
        let commit = self.log.committed;
        for to in self.peer_ids_except_self() {
            let peer_commit = self
                .replicas
                .get(&to)
                .map(|p| p.matched.min(commit))
                .unwrap_or(0);
            let mut m = self.message_to(MessageKind::Heartbeat, to);
            m.commit = peer_commit;
            m.context = ctx.clone();
            self.send(m);
        }
        Ok(ReadProgress::Queued)
    }
}

/// How a read request proceeds after [`Fsm::read_index`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadProgress {
    /// Serve once the apply cursor reaches the index.
    Local(u64),
    /// Resolution arrives later via `Ready`.
    Queued,
}
