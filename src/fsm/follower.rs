//! Step handlers for the follower role.

use crate::fsm::Fsm;
use crate::proto::Message;
use crate::proto::MessageKind;
use crate::storage::LogStorage;

impl<S: LogStorage> Fsm<S> {
    pub(crate) fn step_follower(&mut self, m: Message) {
        match m.kind {
            MessageKind::AppendEntries => {
                self.election_elapsed = 0;
                self.leader = m.from;
                self.handle_append_entries(m);
            }
            MessageKind::Heartbeat => {
                self.election_elapsed = 0;
                self.leader = m.from;
                self.handle_heartbeat(m);
            }
            MessageKind::Snapshot => {
                self.election_elapsed = 0;
                self.leader = m.from;
                self.handle_snapshot(m);
            }
            MessageKind::ElectAck => {
                self.election_elapsed = 0;
                self.leader = m.from;
                let resp = self.message_to(MessageKind::ElectAckResponse, m.from);
                self.send(resp);
            }
            MessageKind::TimeoutNow => {
                if self.promotable() {
                    tracing::info!(
                        group = self.group,
                        id = self.id,
                        from = m.from,
                        term = self.term,
                        "received leadership transfer, campaigning now"
                    );
                    // A transfer overrides both pre-vote and the lease guard.
                    self.campaign(true);
                } else {
                    tracing::debug!(
                        group = self.group,
                        id = self.id,
                        "learner ignores a leadership transfer"
                    );
                }
            }
            _ => {
                tracing::debug!(
                    group = self.group,
                    id = self.id,
                    msg = %m,
                    "follower ignores message"
                );
            }
        }
    }

    /// Append a batch from the leader, answering with either the new match
    /// point or a conflict hint for fast back-off.
    pub(crate) fn handle_append_entries(&mut self, m: Message) {
        if m.index < self.log.committed {
            // Stale probe; answer with the commit point so the leader jumps ahead.
            let mut resp = self.message_to(MessageKind::AppendResponse, m.from);
            resp.index = self.log.committed;
            self.send(resp);
            return;
        }

        match self.log.maybe_append(m.index, m.log_term, m.commit, &m.entries) {
            Some(last_new) => {
                let mut resp = self.message_to(MessageKind::AppendResponse, m.from);
                resp.index = last_new;
                self.send(resp);
            }
            None => {
                let (conflict_index, conflict_term) = self.log.conflict_hint(m.index);
                tracing::debug!(
                    group = self.group,
                    id = self.id,
                    prev_index = m.index,
                    prev_term = m.log_term,
                    local_term = self.log.term(m.index).unwrap_or(0),
                    conflict_index = conflict_index,
                    conflict_term = conflict_term,
                    "rejected append"
                );
                let mut resp = self.message_to(MessageKind::AppendResponse, m.from);
                resp.index = m.index;
                resp.reject = true;
                resp.reject_hint = conflict_index;
                resp.log_term = conflict_term;
                self.send(resp);
            }
        }
    }

    pub(crate) fn handle_heartbeat(&mut self, m: Message) {
        self.log.commit_to(m.commit);
        let mut resp = self.message_to(MessageKind::HeartbeatResponse, m.from);
        resp.context = m.context;
        self.send(resp);
    }

    /// Install an incoming snapshot, displacing the local log.
    pub(crate) fn handle_snapshot(&mut self, m: Message) {
        let Some(meta) = m.snapshot.clone() else {
            tracing::error!(
                group = self.group,
                id = self.id,
                from = m.from,
                "snapshot message without metadata, dropping"
            );
            return;
        };
        let data = m.context.clone();

        if meta.index <= self.log.committed {
            // Already covered; tell the leader where we stand.
            let mut resp = self.message_to(MessageKind::SnapshotResponse, m.from);
            resp.index = self.log.committed;
            self.send(resp);
            return;
        }

        if self.log.match_term(meta.index, meta.term) {
            // The log already contains the snapshot point; just fast-forward
            // the commit index.
            self.log.commit_to(meta.index);
            let mut resp = self.message_to(MessageKind::SnapshotResponse, m.from);
            resp.index = self.log.committed;
            self.send(resp);
            return;
        }

        tracing::info!(
            group = self.group,
            id = self.id,
            index = meta.index,
            term = meta.term,
            bytes = data.len(),
            "installing snapshot from leader"
        );

        let index = meta.index;
        let peers = meta.peers.clone();
        self.log.restore(meta, data);
        self.log.applied = index;

        // The snapshot's configuration replaces the local one.
        self.replicas.retain(|id, _| peers.iter().any(|p| p.id == *id));
        for peer in peers {
            if let Some(p) = self.replicas.get_mut(&peer.id) {
                p.learner = peer.learner;
                p.priority = peer.priority;
            } else {
                self.add_replica_at(peer, index + 1);
            }
        }

        let mut resp = self.message_to(MessageKind::SnapshotResponse, m.from);
        resp.index = index;
        self.send(resp);
    }

    fn add_replica_at(&mut self, peer: crate::proto::Peer, next: u64) {
        let mut progress = crate::progress::Progress::new(next, self.config.max_inflight_msgs);
        progress.learner = peer.learner;
        progress.priority = peer.priority;
        self.replicas.insert(peer.id, progress);
    }
}
