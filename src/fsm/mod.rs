//! The consensus state machine.
//!
//! One `Fsm` drives one group. It is a pure state machine: inputs arrive
//! through [`Fsm::step`] and [`Fsm::tick`], outputs accumulate and are
//! drained as a [`Ready`] by the group runtime. It is never entered
//! concurrently, so it holds no locks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::config::Config;
use crate::error::RaftError;
use crate::error::StorageError;
use crate::log::RaftLog;
use crate::progress::Progress;
use crate::progress::ProgressState;
use crate::proto::ConfChange;
use crate::proto::ConfChangeKind;
use crate::proto::Entry;
use crate::proto::GroupId;
use crate::proto::HardState;
use crate::proto::Message;
use crate::proto::MessageKind;
use crate::proto::NodeId;
use crate::proto::Peer;
use crate::proto::NO_LEADER;
use crate::quorum;
use crate::storage::LogStorage;

mod candidate;
mod follower;
mod leader;
mod read_only;
mod ready;

pub use ready::ReadState;
pub(crate) use leader::ReadProgress;
pub(crate) use ready::Ready;

use read_only::ReadOnly;

/// The role a node currently plays in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    /// Running a pre-vote round at `term + 1` without having bumped the term.
    PreCandidate,
    Candidate,
    /// Elected, waiting for a quorum of acks to establish the lease.
    ElectionAck,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub(crate) struct Fsm<S: LogStorage> {
    pub(crate) id: NodeId,
    pub(crate) group: GroupId,
    pub(crate) config: Arc<Config>,

    pub(crate) term: u64,
    pub(crate) vote: NodeId,
    pub(crate) leader: NodeId,
    pub(crate) role: Role,

    pub(crate) log: RaftLog<S>,
    pub(crate) replicas: BTreeMap<NodeId, Progress>,
    pub(crate) votes: BTreeMap<NodeId, bool>,

    /// Outbound messages, drained via `Ready`.
    pub(crate) msgs: Vec<Message>,
    /// Peers that need a snapshot produced by the application, drained via `Ready`.
    pub(crate) snapshot_requests: Vec<NodeId>,
    /// Resolved read barriers, drained via `Ready`.
    pub(crate) read_states: Vec<ReadState>,
    pub(crate) read_only: ReadOnly,

    pub(crate) election_elapsed: u64,
    heartbeat_elapsed: u64,
    randomized_election_tick: u64,
    /// Arms the priority deferral for the next timer roll; consumed by a campaign.
    priority_deferred: bool,
    rng: StdRng,

    /// Index of the latest unapplied ConfChange entry; gates new changes.
    pub(crate) pending_conf_index: u64,
    pub(crate) lead_transferee: NodeId,
    transfer_elapsed: u64,

    /// Hard state as of the last `Ready`, to detect changes.
    prev_hard_state: HardState,
}

impl<S: LogStorage> Fsm<S> {
    /// Recover an FSM from storage.
    ///
    /// `peers` seeds the configuration for a fresh group; once a snapshot
    /// exists its configuration wins.
    pub(crate) fn new(
        id: NodeId,
        group: GroupId,
        peers: &[Peer],
        config: Arc<Config>,
        storage: S,
    ) -> Result<Self, StorageError> {
        let (log, hard_state) = RaftLog::open(storage)?;

        let conf: Vec<Peer> = match log.storage_snapshot_peers() {
            Some(p) if !p.is_empty() => p,
            _ => peers.to_vec(),
        };

        let mut fsm = Self {
            id,
            group,
            config,
            term: hard_state.term,
            vote: hard_state.vote,
            leader: NO_LEADER,
            role: Role::Follower,
            log,
            replicas: BTreeMap::new(),
            votes: BTreeMap::new(),
            msgs: Vec::new(),
            snapshot_requests: Vec::new(),
            read_states: Vec::new(),
            read_only: ReadOnly::default(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_tick: 0,
            priority_deferred: false,
            rng: StdRng::from_entropy(),
            pending_conf_index: 0,
            lead_transferee: NO_LEADER,
            transfer_elapsed: 0,
            prev_hard_state: hard_state,
        };

        for peer in &conf {
            fsm.add_replica(*peer);
        }
        fsm.become_follower(fsm.term, NO_LEADER);
        // The transition above is not a state change worth persisting.
        fsm.prev_hard_state = fsm.hard_state();

        tracing::info!(
            group = group,
            id = id,
            term = fsm.term,
            last_index = fsm.log.last_index(),
            "raft fsm recovered"
        );
        Ok(fsm)
    }

    pub(crate) fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.log.committed,
        }
    }

    /// Whether this node may campaign: it is a voter of the current config.
    pub(crate) fn promotable(&self) -> bool {
        self.replicas.get(&self.id).map(|p| !p.learner).unwrap_or(false)
    }

    pub(crate) fn quorum(&self) -> usize {
        quorum::majority(self.voter_count())
    }

    fn voter_count(&self) -> usize {
        self.replicas.values().filter(|p| !p.learner).count()
    }

    pub(crate) fn peers(&self) -> Vec<Peer> {
        self.replicas
            .iter()
            .map(|(id, p)| Peer {
                id: *id,
                priority: p.priority,
                learner: p.learner,
            })
            .collect()
    }

    fn add_replica(&mut self, peer: Peer) {
        let next = self.log.last_index() + 1;
        let mut progress = Progress::new(next, self.config.max_inflight_msgs);
        progress.learner = peer.learner;
        progress.priority = peer.priority;
        self.replicas.insert(peer.id, progress);
    }

    /// Queue an outbound message, stamping the sender and group.
    pub(crate) fn send(&mut self, mut m: Message) {
        m.from = self.id;
        m.group = self.group;
        debug_assert!(m.term != 0 || m.kind == MessageKind::PreVote, "term must be stamped");
        self.msgs.push(m);
    }

    fn message_to(&self, kind: MessageKind, to: NodeId) -> Message {
        Message::new(kind, self.group, self.id, to, self.term)
    }

    // ------------------------------------------------------------------
    // Timers.

    /// Advance the group's logical clock by one tick.
    pub(crate) fn tick(&mut self) {
        match self.role {
            Role::Leader => self.tick_heartbeat(),
            _ => self.tick_election(),
        }
    }

    fn tick_election(&mut self) {
        self.election_elapsed += 1;
        if !self.promotable() {
            return;
        }
        if self.election_elapsed >= self.randomized_election_tick {
            self.election_elapsed = 0;
            self.campaign(false);
        }
    }

    fn tick_heartbeat(&mut self) {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.lead_transferee != NO_LEADER {
            self.transfer_elapsed += 1;
            if self.transfer_elapsed >= self.config.election_tick {
                // The transfer did not finish within one election timeout.
                tracing::info!(
                    group = self.group,
                    id = self.id,
                    target = self.lead_transferee,
                    "leadership transfer timed out, resuming proposals"
                );
                self.abort_transfer();
            }
        }

        if self.election_elapsed >= self.config.election_tick {
            self.election_elapsed = 0;
            if !self.check_quorum_active() {
                tracing::warn!(
                    group = self.group,
                    id = self.id,
                    term = self.term,
                    "leader lost contact with a quorum, stepping down"
                );
                self.become_follower(self.term, NO_LEADER);
                return;
            }
        }

        if self.heartbeat_elapsed >= self.config.heartbeat_tick {
            self.heartbeat_elapsed = 0;
            self.bcast_heartbeat();
        }
    }

    /// Whether the lease is valid: only a leader that confirmed a quorum
    /// within the last election window may serve local reads, and followers
    /// refuse votes within the same window after leader contact.
    pub(crate) fn in_lease(&self) -> bool {
        self.config.lease_check
            && self.leader != NO_LEADER
            && self.election_elapsed < self.config.election_tick
    }

    fn check_quorum_active(&mut self) -> bool {
        let mut active = 0;
        for (id, p) in self.replicas.iter_mut() {
            if p.learner {
                p.recent_active = false;
                continue;
            }
            if *id == self.id || p.recent_active {
                active += 1;
            }
            p.recent_active = false;
        }
        active >= self.quorum()
    }

    /// Roll a fresh randomized election timeout in `[et, 2*et)`, extended by
    /// the priority deferral when armed.
    fn reset_randomized_election_tick(&mut self) {
        let et = self.config.election_tick;
        let mut timeout = self.rng.gen_range(et..2 * et);
        if self.priority_deferred {
            timeout += self.priority_deferral();
        }
        self.randomized_election_tick = timeout;
    }

    /// Extra ticks a low-priority peer waits before campaigning. Priority
    /// shifts when a campaign starts, never whether a vote is granted. The
    /// deferral is one whole election window per priority step, so it
    /// dominates the randomized spread and lower-priority peers reliably
    /// yield the first attempt.
    fn priority_deferral(&self) -> u64 {
        let max_priority = self.replicas.values().map(|p| p.priority).max().unwrap_or(0);
        let own = self.replicas.get(&self.id).map(|p| p.priority).unwrap_or(0);
        (max_priority - own) as u64 * self.config.election_tick
    }

    // ------------------------------------------------------------------
    // Role transitions.

    fn reset(&mut self, term: u64) {
        if term != self.term {
            self.term = term;
            self.vote = NO_LEADER;
        }
        self.leader = NO_LEADER;
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.votes.clear();
        self.abort_transfer();
        self.read_only.clear();
        self.reset_randomized_election_tick();

        let last_index = self.log.last_index();
        let self_id = self.id;
        for (id, p) in self.replicas.iter_mut() {
            p.reset(last_index + 1);
            if *id == self_id {
                p.matched = last_index;
                p.state = ProgressState::Replicate;
            }
        }
    }

    pub(crate) fn become_follower(&mut self, term: u64, leader: NodeId) {
        self.reset(term);
        self.role = Role::Follower;
        self.leader = leader;
        // Entering follower arms the priority stagger; the next campaign
        // consumes it, so retries within one candidacy are undeferred.
        self.priority_deferred = true;
        self.reset_randomized_election_tick();

        tracing::debug!(
            group = self.group,
            id = self.id,
            term = self.term,
            leader = leader,
            "became follower"
        );
    }

    fn become_pre_candidate(&mut self) {
        assert_ne!(self.role, Role::Leader, "invalid transition [leader -> pre-candidate]");
        // Pre-vote runs at term + 1 without touching term, vote or leader.
        self.role = Role::PreCandidate;
        self.votes.clear();
        self.leader = NO_LEADER;

        tracing::debug!(group = self.group, id = self.id, term = self.term, "became pre-candidate");
    }

    fn become_candidate(&mut self) {
        assert_ne!(self.role, Role::Leader, "invalid transition [leader -> candidate]");
        let term = self.term + 1;
        self.reset(term);
        self.role = Role::Candidate;
        self.vote = self.id;

        tracing::debug!(group = self.group, id = self.id, term = self.term, "became candidate");
    }

    fn become_election_ack(&mut self) {
        assert_eq!(self.role, Role::Candidate, "only a candidate enters election-ack");
        self.role = Role::ElectionAck;
        self.votes.clear();

        tracing::debug!(group = self.group, id = self.id, term = self.term, "became election-ack");

        for id in self.peer_ids_except_self() {
            let m = self.message_to(MessageKind::ElectAck, id);
            self.send(m);
        }
        // A single-voter group has nothing to wait for.
        self.poll_elect_ack(self.id);
    }

    pub(crate) fn become_leader(&mut self) {
        assert_ne!(self.role, Role::Follower, "invalid transition [follower -> leader]");
        let term = self.term;
        self.reset(term);
        self.role = Role::Leader;
        self.leader = self.id;

        // Reinstate the single-inflight-change gate for changes still in the
        // unapplied tail.
        self.pending_conf_index = self.scan_pending_conf_index();

        tracing::info!(
            group = self.group,
            id = self.id,
            term = self.term,
            "became leader"
        );

        // The no-op establishes this term's commitment and flushes reads.
        self.append_as_leader(vec![Entry::noop(0, 0)]);
        self.bcast_append();
    }

    fn scan_pending_conf_index(&self) -> u64 {
        let lo = (self.log.applied + 1).max(self.log.first_index());
        let hi = self.log.last_index() + 1;
        let Ok(entries) = self.log.slice(lo, hi, u64::MAX) else {
            return 0;
        };
        entries
            .iter()
            .rev()
            .find(|e| e.kind == crate::proto::EntryKind::ConfChange)
            .map(|e| e.index)
            .unwrap_or(0)
    }

    pub(crate) fn peer_ids_except_self(&self) -> Vec<NodeId> {
        self.replicas.keys().copied().filter(|id| *id != self.id).collect()
    }

    // ------------------------------------------------------------------
    // The step function.

    /// Process one incoming message. This is the only entry point for
    /// protocol messages; the group runtime serializes all calls.
    pub(crate) fn step(&mut self, m: Message) {
        if m.term > self.term {
            if !self.step_higher_term(&m) {
                return;
            }
        } else if m.term < self.term {
            self.step_lower_term(&m);
            return;
        }

        match m.kind {
            MessageKind::RequestVote | MessageKind::PreVote => {
                self.handle_vote_request(m);
            }
            _ => match self.role {
                Role::Follower => self.step_follower(m),
                Role::PreCandidate | Role::Candidate | Role::ElectionAck => self.step_candidate(m),
                Role::Leader => self.step_leader(m),
            },
        }
    }

    /// The term rule. Returns false when the message must be dropped.
    fn step_higher_term(&mut self, m: &Message) -> bool {
        match m.kind {
            MessageKind::PreVote => {
                // A pre-vote probes at a future term; answering it never
                // disturbs the local term.
                true
            }
            MessageKind::PreVoteResponse if !m.reject => {
                // Grants at term + 1 flow back to the pre-candidate without
                // a term bump; rejections carry a genuine higher term.
                true
            }
            MessageKind::RequestVote => {
                if self.in_lease() && !m.force && m.term <= self.term + 1 {
                    // The lease guard: a live leader exists, and the request
                    // is close enough in term that the requester's view is
                    // merely stale. A force vote (leadership transfer) or a
                    // strictly higher term overrides.
                    tracing::debug!(
                        group = self.group,
                        id = self.id,
                        from = m.from,
                        req_term = m.term,
                        "vote request rejected under leader lease"
                    );
                    let mut resp = self.message_to(MessageKind::VoteResponse, m.from);
                    resp.reject = true;
                    self.send(resp);
                    return false;
                }
                self.become_follower(m.term, NO_LEADER);
                true
            }
            MessageKind::AppendEntries
            | MessageKind::Heartbeat
            | MessageKind::Snapshot
            | MessageKind::ElectAck => {
                self.become_follower(m.term, m.from);
                true
            }
            _ => {
                self.become_follower(m.term, NO_LEADER);
                true
            }
        }
    }

    /// Replying with the local term accelerates a lagging peer's step-down.
    fn step_lower_term(&mut self, m: &Message) {
        let kind = match m.kind {
            MessageKind::AppendEntries => Some(MessageKind::AppendResponse),
            MessageKind::Heartbeat => Some(MessageKind::HeartbeatResponse),
            MessageKind::RequestVote => Some(MessageKind::VoteResponse),
            MessageKind::PreVote => Some(MessageKind::PreVoteResponse),
            _ => None,
        };
        tracing::debug!(
            group = self.group,
            id = self.id,
            term = self.term,
            msg = %m,
            "dropping message from a lower term"
        );
        if let Some(kind) = kind {
            let mut resp = self.message_to(kind, m.from);
            resp.reject = true;
            self.send(resp);
        }
    }

    // ------------------------------------------------------------------
    // Voting.

    fn handle_vote_request(&mut self, m: Message) {
        let is_pre = m.kind == MessageKind::PreVote;

        if !self.promotable() && self.replicas.contains_key(&self.id) {
            // A learner never votes.
            self.send_vote_response(&m, true);
            return;
        }

        if is_pre && self.in_lease() && !m.force && m.term <= self.term + 1 {
            self.send_vote_response(&m, true);
            return;
        }

        let can_vote = if is_pre {
            // A pre-vote is non-binding; grant whenever the log qualifies and
            // the requester is campaigning for a future term.
            m.term > self.term
        } else {
            self.vote == m.from || (self.vote == NO_LEADER && self.leader == NO_LEADER)
        };

        let grant = can_vote && self.log.is_up_to_date(m.index, m.log_term);

        tracing::debug!(
            group = self.group,
            id = self.id,
            from = m.from,
            req_term = m.term,
            last_term = self.log.last_term(),
            last_index = self.log.last_index(),
            grant = grant,
            pre = is_pre,
            "vote request"
        );

        if grant && !is_pre {
            self.vote = m.from;
            self.election_elapsed = 0;
        }
        self.send_vote_response(&m, !grant);
    }

    fn send_vote_response(&mut self, req: &Message, reject: bool) {
        let kind = if req.kind == MessageKind::PreVote {
            MessageKind::PreVoteResponse
        } else {
            MessageKind::VoteResponse
        };
        let mut resp = self.message_to(kind, req.from);
        if kind == MessageKind::PreVoteResponse && !reject {
            // A pre-vote grant echoes the future term it was granted for.
            resp.term = req.term;
        }
        resp.reject = reject;
        self.send(resp);
    }

    /// Record one vote and return the grant tally. The first response from a
    /// peer wins; later duplicates are ignored.
    pub(crate) fn poll(&mut self, id: NodeId, granted: bool) -> usize {
        self.votes.entry(id).or_insert(granted);
        self.votes.values().filter(|v| **v).count()
    }

    // ------------------------------------------------------------------
    // Membership.

    /// Validate a change against the current configuration and the
    /// single-inflight rule.
    pub(crate) fn check_conf_change(&self, cc: &ConfChange) -> Result<(), RaftError> {
        if self.pending_conf_index > self.log.applied {
            return Err(RaftError::InvalidConfig(format!(
                "change at index {} is still in flight",
                self.pending_conf_index
            )));
        }
        match cc.kind {
            ConfChangeKind::AddPeer => {
                if self.replicas.contains_key(&cc.peer.id) && !self.replicas[&cc.peer.id].learner {
                    return Err(RaftError::InvalidConfig(format!(
                        "peer {} already exists",
                        cc.peer.id
                    )));
                }
            }
            ConfChangeKind::RemovePeer => {
                if !self.replicas.contains_key(&cc.peer.id) {
                    return Err(RaftError::InvalidConfig(format!(
                        "peer {} does not exist",
                        cc.peer.id
                    )));
                }
            }
            ConfChangeKind::Promote => {
                match self.replicas.get(&cc.peer.id) {
                    Some(p) if p.learner => {}
                    Some(_) => {
                        return Err(RaftError::InvalidConfig(format!(
                            "peer {} is already a voter",
                            cc.peer.id
                        )));
                    }
                    None => {
                        return Err(RaftError::InvalidConfig(format!(
                            "peer {} does not exist",
                            cc.peer.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply a committed change to the peer set. Called at the apply
    /// boundary, on every node, leader and follower alike.
    pub(crate) fn apply_conf_change(&mut self, cc: &ConfChange, index: u64) {
        tracing::info!(
            group = self.group,
            id = self.id,
            kind = ?cc.kind,
            peer = %cc.peer,
            index = index,
            "applying conf change"
        );

        match cc.kind {
            ConfChangeKind::AddPeer => {
                if !self.replicas.contains_key(&cc.peer.id) {
                    self.add_replica(cc.peer);
                } else if let Some(p) = self.replicas.get_mut(&cc.peer.id) {
                    p.learner = cc.peer.learner;
                    p.priority = cc.peer.priority;
                }
            }
            ConfChangeKind::RemovePeer => {
                self.replicas.remove(&cc.peer.id);
                if cc.peer.id == self.lead_transferee {
                    self.abort_transfer();
                }
            }
            ConfChangeKind::Promote => {
                if let Some(p) = self.replicas.get_mut(&cc.peer.id) {
                    p.learner = false;
                }
            }
        }

        if index >= self.pending_conf_index {
            self.pending_conf_index = 0;
        }

        // A removed quorum member may unblock commitment.
        if self.role == Role::Leader {
            self.maybe_commit();
        }
    }

    pub(crate) fn abort_transfer(&mut self) {
        self.lead_transferee = NO_LEADER;
        self.transfer_elapsed = 0;
    }
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod fsm_test;
