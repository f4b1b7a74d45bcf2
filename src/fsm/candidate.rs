//! Step handlers for the candidate-side roles: pre-candidate, candidate and
//! election-ack.

use crate::fsm::Fsm;
use crate::fsm::Role;
use crate::proto::Message;
use crate::proto::MessageKind;
use crate::proto::NO_LEADER;
use crate::storage::LogStorage;

impl<S: LogStorage> Fsm<S> {
    /// Start an election round.
    ///
    /// `force` marks a campaign triggered by TimeoutNow (leadership
    /// transfer): it skips pre-vote and its vote requests override the
    /// receiver's lease guard.
    pub(crate) fn campaign(&mut self, force: bool) {
        if self.should_yield_campaign() {
            tracing::debug!(
                group = self.group,
                id = self.id,
                term = self.term,
                "deferring to another candidate this round"
            );
            self.become_follower(self.term, NO_LEADER);
            return;
        }

        self.priority_deferred = false;

        if self.config.pre_vote && !force {
            self.campaign_pre_vote();
            return;
        }
        self.campaign_election(force);
    }

    /// Repeatedly colliding candidates stagger deterministically: sorted by
    /// id, the candidate at position `term % n` sits this round out.
    fn should_yield_campaign(&self) -> bool {
        if self.role != Role::Candidate {
            return false;
        }
        let peer_ids: Vec<_> = self.replicas.keys().copied().collect();
        peer_ids[(self.term % peer_ids.len() as u64) as usize] == self.id
    }

    fn campaign_pre_vote(&mut self) {
        self.become_pre_candidate();

        if self.quorum() == self.poll(self.id, true) {
            // Sole voter; skip straight to the real election.
            self.campaign_election(false);
            return;
        }

        let (last_index, last_term) = (self.log.last_index(), self.log.last_term());
        for id in self.campaign_targets() {
            tracing::debug!(
                group = self.group,
                id = self.id,
                to = id,
                term = self.term + 1,
                "sent pre-vote request"
            );
            let mut m = self.message_to(MessageKind::PreVote, id);
            m.term = self.term + 1;
            m.index = last_index;
            m.log_term = last_term;
            self.send(m);
        }
    }

    fn campaign_election(&mut self, force: bool) {
        self.become_candidate();

        if self.quorum() == self.poll(self.id, true) {
            if self.config.lease_check {
                self.become_election_ack();
            } else {
                self.become_leader();
            }
            return;
        }

        let (last_index, last_term) = (self.log.last_index(), self.log.last_term());
        for id in self.campaign_targets() {
            tracing::debug!(
                group = self.group,
                id = self.id,
                to = id,
                term = self.term,
                last_index = last_index,
                last_term = last_term,
                "sent vote request"
            );
            let mut m = self.message_to(MessageKind::RequestVote, id);
            m.index = last_index;
            m.log_term = last_term;
            m.force = force;
            self.send(m);
        }
    }

    fn campaign_targets(&self) -> Vec<u64> {
        self.replicas
            .iter()
            .filter(|(id, p)| **id != self.id && !p.learner)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn step_candidate(&mut self, m: Message) {
        match m.kind {
            MessageKind::AppendEntries => {
                self.become_follower(m.term, m.from);
                self.handle_append_entries(m);
            }
            MessageKind::Heartbeat => {
                self.become_follower(m.term, m.from);
                self.handle_heartbeat(m);
            }
            MessageKind::Snapshot => {
                self.become_follower(m.term, m.from);
                self.handle_snapshot(m);
            }
            MessageKind::ElectAck => {
                self.become_follower(m.term, m.from);
                let resp = self.message_to(MessageKind::ElectAckResponse, m.from);
                self.send(resp);
            }
            MessageKind::PreVoteResponse if self.role == Role::PreCandidate => {
                self.handle_pre_vote_response(m);
            }
            MessageKind::VoteResponse if self.role == Role::Candidate => {
                self.handle_vote_response(m);
            }
            MessageKind::ElectAckResponse if self.role == Role::ElectionAck => {
                self.poll_elect_ack(m.from);
            }
            MessageKind::TimeoutNow => {
                // Already campaigning.
            }
            _ => {
                tracing::debug!(
                    group = self.group,
                    id = self.id,
                    msg = %m,
                    "candidate ignores message"
                );
            }
        }
    }

    fn handle_pre_vote_response(&mut self, m: Message) {
        let granted = self.poll(m.from, !m.reject);
        tracing::debug!(
            group = self.group,
            id = self.id,
            granted = granted,
            rejected = self.votes.len() - granted,
            quorum = self.quorum(),
            "pre-vote tally"
        );

        if granted == self.quorum() {
            self.campaign_election(false);
        } else if self.votes.len() - granted == self.quorum() {
            self.become_follower(self.term, NO_LEADER);
        }
    }

    fn handle_vote_response(&mut self, m: Message) {
        let granted = self.poll(m.from, !m.reject);
        tracing::debug!(
            group = self.group,
            id = self.id,
            granted = granted,
            rejected = self.votes.len() - granted,
            quorum = self.quorum(),
            "vote tally"
        );

        if granted == self.quorum() {
            if self.config.lease_check {
                self.become_election_ack();
            } else {
                self.become_leader();
            }
        } else if self.votes.len() - granted == self.quorum() {
            self.become_follower(self.term, NO_LEADER);
        }
    }

    /// Count one election ack; a quorum establishes the lease and completes
    /// the transition to leader.
    pub(crate) fn poll_elect_ack(&mut self, from: u64) {
        let acked = self.poll(from, true);
        if self.role == Role::ElectionAck && acked == self.quorum() {
            self.become_leader();
        }
    }
}
