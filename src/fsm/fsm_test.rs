use bytes::Bytes;
use pretty_assertions::assert_eq;

use crate::fsm::leader::ReadProgress;
use crate::fsm::testing::elect_as_leader;
use crate::fsm::testing::new_fsm;
use crate::fsm::testing::new_fsm_with;
use crate::fsm::testing::take_msgs;
use crate::fsm::testing::test_config;
use crate::fsm::Role;
use crate::progress::ProgressState;
use crate::proto::ConfChange;
use crate::proto::ConfChangeKind;
use crate::proto::Entry;
use crate::proto::EntryKind;
use crate::proto::Message;
use crate::proto::MessageKind;
use crate::proto::Peer;
use crate::proto::SnapshotMeta;
use crate::proto::NO_LEADER;
use crate::error::RaftError;
use crate::storage::LogStorage;

fn msg(kind: MessageKind, from: u64, to: u64, term: u64) -> Message {
    Message::new(kind, 1, from, to, term)
}

#[test]
fn test_single_node_becomes_leader_at_once() {
    let mut fsm = new_fsm(1, &[1]);
    fsm.campaign(false);

    assert_eq!(Role::Leader, fsm.role);
    assert_eq!(1, fsm.term);
    assert_eq!(1, fsm.leader);
    // The no-op is appended and committed immediately.
    assert_eq!(1, fsm.log.last_index());
    assert_eq!(1, fsm.log.committed);
}

#[test]
fn test_campaign_sends_vote_requests() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    fsm.campaign(false);

    assert_eq!(Role::Candidate, fsm.role);
    assert_eq!(1, fsm.term);
    assert_eq!(1, fsm.vote, "votes for itself");

    let msgs = take_msgs(&mut fsm);
    let mut targets: Vec<u64> = msgs
        .iter()
        .filter(|m| m.kind == MessageKind::RequestVote)
        .map(|m| m.to)
        .collect();
    targets.sort_unstable();
    assert_eq!(vec![2, 3], targets);
}

#[test]
fn test_quorum_grant_elects_leader() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    fsm.campaign(false);
    take_msgs(&mut fsm);

    fsm.step(msg(MessageKind::VoteResponse, 2, 1, 1));
    assert_eq!(Role::Leader, fsm.role);

    // The no-op broadcast goes out right away.
    let msgs = take_msgs(&mut fsm);
    let appends: Vec<_> = msgs.iter().filter(|m| m.kind == MessageKind::AppendEntries).collect();
    assert_eq!(2, appends.len());
    assert_eq!(1, appends[0].entries.len());
    assert!(appends[0].entries[0].data.is_empty());
}

#[test]
fn test_quorum_rejection_steps_down() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    fsm.campaign(false);
    take_msgs(&mut fsm);

    let mut reject = msg(MessageKind::VoteResponse, 2, 1, 1);
    reject.reject = true;
    fsm.step(reject);
    assert_eq!(Role::Candidate, fsm.role, "one rejection is not a quorum");

    let mut reject = msg(MessageKind::VoteResponse, 3, 1, 1);
    reject.reject = true;
    fsm.step(reject);
    assert_eq!(Role::Follower, fsm.role);
    assert_eq!(NO_LEADER, fsm.leader);
}

#[test]
fn test_vote_granting_rules() {
    // Fresh follower grants an up-to-date candidate.
    let mut fsm = new_fsm(2, &[1, 2, 3]);
    let mut req = msg(MessageKind::RequestVote, 1, 2, 1);
    req.index = 0;
    req.log_term = 0;
    fsm.step(req);

    let msgs = take_msgs(&mut fsm);
    assert_eq!(1, msgs.len());
    assert_eq!(MessageKind::VoteResponse, msgs[0].kind);
    assert!(!msgs[0].reject);
    assert_eq!(1, fsm.vote);

    // Same term, different candidate: rejected.
    let mut req = msg(MessageKind::RequestVote, 3, 2, 1);
    req.index = 5;
    req.log_term = 1;
    fsm.step(req);
    let msgs = take_msgs(&mut fsm);
    assert!(msgs[0].reject, "already voted for 1 in this term");

    // Repeat vote for the same candidate: granted.
    let mut req = msg(MessageKind::RequestVote, 1, 2, 1);
    req.index = 0;
    fsm.step(req);
    let msgs = take_msgs(&mut fsm);
    assert!(!msgs[0].reject);
}

#[test]
fn test_vote_rejects_stale_log() {
    let mut fsm = new_fsm(2, &[1, 2, 3]);
    // Local log: one entry at term 2.
    fsm.term = 2;
    fsm.log.append(&[Entry::noop(1, 2)]);

    let mut req = msg(MessageKind::RequestVote, 1, 2, 3);
    req.index = 5;
    req.log_term = 1;
    fsm.step(req);

    let msgs = take_msgs(&mut fsm);
    assert!(msgs[0].reject, "longer log at a lower term is not up-to-date");
    assert_eq!(3, fsm.term, "term is adopted even when the vote is refused");
}

#[test]
fn test_higher_term_message_steps_down_leader() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);
    assert_eq!(Role::Leader, fsm.role);
    take_msgs(&mut fsm);

    fsm.step(msg(MessageKind::Heartbeat, 3, 1, 9));
    assert_eq!(Role::Follower, fsm.role);
    assert_eq!(9, fsm.term);
    assert_eq!(3, fsm.leader);
}

#[test]
fn test_lower_term_message_answered_with_current_term() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    fsm.term = 5;

    fsm.step(msg(MessageKind::AppendEntries, 2, 1, 3));

    let msgs = take_msgs(&mut fsm);
    assert_eq!(1, msgs.len());
    assert_eq!(MessageKind::AppendResponse, msgs[0].kind);
    assert_eq!(5, msgs[0].term);
    assert!(msgs[0].reject);
}

fn pre_vote_config() -> crate::config::Config {
    crate::config::Config {
        pre_vote: true,
        ..test_config()
    }
}

#[test]
fn test_pre_vote_round_precedes_election() {
    let mut fsm = new_fsm_with(1, &[1, 2, 3], pre_vote_config());

    fsm.campaign(false);
    assert_eq!(Role::PreCandidate, fsm.role);
    assert_eq!(0, fsm.term, "pre-vote does not bump the term");

    let msgs = take_msgs(&mut fsm);
    assert!(msgs.iter().all(|m| m.kind == MessageKind::PreVote));
    assert!(msgs.iter().all(|m| m.term == 1), "pre-vote probes term + 1");

    // One grant reaches quorum; the real election follows.
    let mut resp = msg(MessageKind::PreVoteResponse, 2, 1, 1);
    resp.reject = false;
    fsm.step(resp);
    assert_eq!(Role::Candidate, fsm.role);
    assert_eq!(1, fsm.term);
}

#[test]
fn test_pre_vote_answered_without_term_change() {
    let mut fsm = new_fsm(2, &[1, 2, 3]);
    fsm.term = 4;

    let mut req = msg(MessageKind::PreVote, 1, 2, 5);
    req.index = 9;
    req.log_term = 4;
    fsm.step(req);

    assert_eq!(4, fsm.term, "answering a pre-vote never disturbs the term");
    let msgs = take_msgs(&mut fsm);
    assert_eq!(MessageKind::PreVoteResponse, msgs[0].kind);
    assert!(!msgs[0].reject);
    assert_eq!(5, msgs[0].term, "the grant echoes the probed term");
}

#[test]
fn test_lease_check_election_requires_acks() {
    let config = crate::config::Config {
        lease_check: true,
        ..test_config()
    };
    let mut fsm = new_fsm_with(1, &[1, 2, 3], config);

    fsm.campaign(false);
    take_msgs(&mut fsm);
    fsm.step(msg(MessageKind::VoteResponse, 2, 1, 1));

    assert_eq!(Role::ElectionAck, fsm.role, "winner waits for the lease");
    let msgs = take_msgs(&mut fsm);
    let acks: Vec<_> = msgs.iter().filter(|m| m.kind == MessageKind::ElectAck).collect();
    assert_eq!(2, acks.len());

    fsm.step(msg(MessageKind::ElectAckResponse, 3, 1, 1));
    assert_eq!(Role::Leader, fsm.role);
}

#[test]
fn test_vote_rejected_under_lease() {
    let config = crate::config::Config {
        lease_check: true,
        ..test_config()
    };
    let mut fsm = new_fsm_with(2, &[1, 2, 3], config);

    // Node 2 is a follower under a live leader 3.
    fsm.step(msg(MessageKind::Heartbeat, 3, 2, 1));
    take_msgs(&mut fsm);
    assert_eq!(3, fsm.leader);

    // A vote request one term up is refused without a term bump.
    let mut req = msg(MessageKind::RequestVote, 1, 2, 2);
    req.index = 9;
    req.log_term = 1;
    fsm.step(req);

    assert_eq!(1, fsm.term, "lease guard holds the term");
    let msgs = take_msgs(&mut fsm);
    assert!(msgs[0].reject);

    // A force vote (leadership transfer) overrides the lease.
    let mut req = msg(MessageKind::RequestVote, 1, 2, 2);
    req.index = 9;
    req.log_term = 1;
    req.force = true;
    fsm.step(req);
    assert_eq!(2, fsm.term);
    let msgs = take_msgs(&mut fsm);
    assert!(!msgs[0].reject);

    // A strictly higher term also overrides a fresh lease.
    fsm.step(msg(MessageKind::Heartbeat, 3, 2, 2));
    take_msgs(&mut fsm);
    let mut req = msg(MessageKind::RequestVote, 1, 2, 9);
    req.index = 9;
    req.log_term = 2;
    fsm.step(req);
    assert_eq!(9, fsm.term);
}

#[test]
fn test_follower_append_and_conflict_hint() {
    let mut fsm = new_fsm(2, &[1, 2, 3]);

    // Leader 1 appends entries 1..=3 at term 1.
    let mut m = msg(MessageKind::AppendEntries, 1, 2, 1);
    m.index = 0;
    m.log_term = 0;
    m.entries = vec![Entry::noop(1, 1), Entry::noop(2, 1), Entry::noop(3, 1)];
    m.commit = 2;
    fsm.step(m);

    let msgs = take_msgs(&mut fsm);
    assert_eq!(MessageKind::AppendResponse, msgs[0].kind);
    assert!(!msgs[0].reject);
    assert_eq!(3, msgs[0].index);
    assert_eq!(2, fsm.log.committed);

    // A probe past the end of the log is rejected with a hint.
    let mut m = msg(MessageKind::AppendEntries, 1, 2, 1);
    m.index = 7;
    m.log_term = 1;
    fsm.step(m);

    let msgs = take_msgs(&mut fsm);
    assert!(msgs[0].reject);
    assert_eq!(4, msgs[0].reject_hint, "hint points at last + 1");
    assert_eq!(0, msgs[0].log_term);

    // A probe with a mismatched term backs off a whole term run.
    let mut m = msg(MessageKind::AppendEntries, 1, 2, 2);
    m.index = 3;
    m.log_term = 9;
    fsm.step(m);

    let msgs = take_msgs(&mut fsm);
    assert!(msgs[0].reject);
    assert_eq!(3, msgs[0].index);
    // Entries 1..=3 all carry term 1, but 1..=2 are committed; the hint
    // still reports the conflicting run.
    assert_eq!(1, msgs[0].log_term);
}

#[test]
fn test_leader_replication_and_commit() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);
    take_msgs(&mut fsm);

    let (index, term) = fsm.propose(EntryKind::Normal, Bytes::from_static(b"x")).unwrap();
    assert_eq!((2, 1), (index, term));

    let msgs = take_msgs(&mut fsm);
    assert!(msgs.iter().any(|m| m.kind == MessageKind::AppendEntries));

    assert_eq!(0, fsm.log.committed, "nothing commits before acks");

    let mut ack = msg(MessageKind::AppendResponse, 2, 1, 1);
    ack.index = 2;
    fsm.step(ack);
    assert_eq!(2, fsm.log.committed, "a quorum of matches commits");
}

#[test]
fn test_leader_never_commits_previous_term_by_counting() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);
    take_msgs(&mut fsm);

    // Step down with an uncommitted entry at term 1.
    fsm.propose(EntryKind::Normal, Bytes::from_static(b"x")).unwrap();
    fsm.become_follower(1, NO_LEADER);

    // Win term 3.
    fsm.campaign(false);
    take_msgs(&mut fsm);
    fsm.step(msg(MessageKind::VoteResponse, 2, 1, 2));
    assert_eq!(Role::Leader, fsm.role);
    assert_eq!(2, fsm.term);
    take_msgs(&mut fsm);

    // Peer 2 acks the term-1 entry only: quorum matches index 2, but its
    // term is stale, so the commit index must hold.
    let mut ack = msg(MessageKind::AppendResponse, 2, 1, 2);
    ack.index = 2;
    fsm.step(ack);
    assert_eq!(0, fsm.log.committed);

    // Acking the current-term no-op commits everything transitively.
    let mut ack = msg(MessageKind::AppendResponse, 2, 1, 2);
    ack.index = 3;
    fsm.step(ack);
    assert_eq!(3, fsm.log.committed);
}

#[test]
fn test_append_reject_backs_off_with_hint() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);
    // Grow the leader log: entries 2..=4 at term 1 (1 is the no-op).
    for _ in 0..3 {
        fsm.propose(EntryKind::Normal, Bytes::from_static(b"x")).unwrap();
    }
    take_msgs(&mut fsm);

    {
        let p = fsm.replicas.get_mut(&2).unwrap();
        p.next = 5;
        p.paused = true;
    }

    // Follower 2 rejects the probe at prev=4 with a hint of (2, term 1).
    let mut reject = msg(MessageKind::AppendResponse, 2, 1, 1);
    reject.reject = true;
    reject.index = 4;
    reject.reject_hint = 2;
    reject.log_term = 1;
    fsm.step(reject);

    let p = fsm.replicas.get(&2).unwrap();
    // Term 1 exists locally: next lands on the last local index of term 1.
    assert_eq!(4, p.next);
    let msgs = take_msgs(&mut fsm);
    assert!(msgs.iter().any(|m| m.kind == MessageKind::AppendEntries && m.to == 2));
}

#[test]
fn test_probe_to_replicate_to_snapshot() {
    let mut fsm = new_fsm(1, &[1, 2]);
    elect_as_leader(&mut fsm);
    take_msgs(&mut fsm);

    assert_eq!(ProgressState::Probe, fsm.replicas[&2].state);

    let mut ack = msg(MessageKind::AppendResponse, 2, 1, 1);
    ack.index = 1;
    fsm.step(ack);
    assert_eq!(ProgressState::Replicate, fsm.replicas[&2].state);

    // Compact past the follower's next point; the leader falls back to a
    // snapshot request for the runtime to fulfill.
    fsm.propose(EntryKind::Normal, Bytes::from_static(b"x")).unwrap();
    fsm.log.storage().install_snapshot(
        &SnapshotMeta {
            index: 2,
            term: 1,
            peers: vec![Peer::new(1), Peer::new(2)],
        },
        &Bytes::new(),
    ).unwrap();
    fsm.log.stable_to(2, 1);
    {
        let p = fsm.replicas.get_mut(&2).unwrap();
        p.reset(1);
    }
    take_msgs(&mut fsm);

    fsm.maybe_send_append(2, true);
    assert_eq!(ProgressState::Snapshot, fsm.replicas[&2].state);
    assert_eq!(vec![2], fsm.snapshot_requests);
}

#[test]
fn test_check_quorum_steps_down_silent_leader() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);
    take_msgs(&mut fsm);

    // No responses arrive for a full election window.
    for _ in 0..fsm.config.election_tick {
        fsm.tick();
    }
    assert_eq!(Role::Follower, fsm.role);
    assert_eq!(NO_LEADER, fsm.leader);
}

#[test]
fn test_check_quorum_retains_active_leader() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);
    take_msgs(&mut fsm);

    for _ in 0..3 * fsm.config.election_tick {
        fsm.tick();
        // Peer 2 keeps responding; 2 of 3 voters are alive.
        let mut resp = msg(MessageKind::HeartbeatResponse, 2, 1, 1);
        resp.context = Bytes::new();
        fsm.step(resp);
        take_msgs(&mut fsm);
    }
    assert_eq!(Role::Leader, fsm.role);
}

#[test]
fn test_conf_change_single_inflight_gate() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);
    take_msgs(&mut fsm);

    let add4 = ConfChange {
        kind: ConfChangeKind::AddPeer,
        peer: Peer::learner(4),
        context: Bytes::new(),
    };
    let (index, _) = fsm.propose(EntryKind::ConfChange, add4.encode()).unwrap();
    assert_eq!(index, fsm.pending_conf_index);

    let add5 = ConfChange {
        kind: ConfChangeKind::AddPeer,
        peer: Peer::learner(5),
        context: Bytes::new(),
    };
    let err = fsm.propose(EntryKind::ConfChange, add5.encode()).unwrap_err();
    assert!(matches!(err, RaftError::InvalidConfig(_)));

    // Applying the first change reopens the gate.
    fsm.log.applied_to(0); // no-op; the gate compares against applied
    fsm.apply_conf_change(&add4, index);
    assert_eq!(0, fsm.pending_conf_index);
    assert!(fsm.replicas[&4].learner);

    let promote = ConfChange {
        kind: ConfChangeKind::Promote,
        peer: Peer::new(4),
        context: Bytes::new(),
    };
    fsm.check_conf_change(&promote).unwrap();
    fsm.apply_conf_change(&promote, index + 1);
    assert!(!fsm.replicas[&4].learner);

    let remove = ConfChange {
        kind: ConfChangeKind::RemovePeer,
        peer: Peer::new(4),
        context: Bytes::new(),
    };
    fsm.apply_conf_change(&remove, index + 2);
    assert!(!fsm.replicas.contains_key(&4));
}

#[test]
fn test_learner_never_votes_nor_campaigns() {
    let mut fsm = new_fsm(3, &[1, 2]);
    // Rebuild node 3 as a learner.
    let cc = ConfChange {
        kind: ConfChangeKind::AddPeer,
        peer: Peer::learner(3),
        context: Bytes::new(),
    };
    fsm.apply_conf_change(&cc, 1);
    assert!(!fsm.promotable());

    // Election timers never fire a campaign.
    for _ in 0..100 {
        fsm.tick();
    }
    assert_eq!(Role::Follower, fsm.role);

    // Vote requests are refused outright.
    let mut req = msg(MessageKind::RequestVote, 1, 3, 5);
    req.index = 9;
    req.log_term = 5;
    fsm.step(req);
    let msgs = take_msgs(&mut fsm);
    assert!(msgs[0].reject, "a learner never votes");
}

#[test]
fn test_transfer_leader_sends_timeout_now_when_caught_up() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);
    take_msgs(&mut fsm);

    // Catch peer 2 up to the last index.
    let mut ack = msg(MessageKind::AppendResponse, 2, 1, 1);
    ack.index = fsm.log.last_index();
    fsm.step(ack);
    take_msgs(&mut fsm);

    fsm.transfer_leader(2).unwrap();
    let msgs = take_msgs(&mut fsm);
    assert!(msgs.iter().any(|m| m.kind == MessageKind::TimeoutNow && m.to == 2));

    // Proposals are refused mid-transfer.
    let err = fsm.propose(EntryKind::Normal, Bytes::from_static(b"x")).unwrap_err();
    assert!(matches!(err, RaftError::NotLeader { .. }));
}

#[test]
fn test_timeout_now_campaigns_through_lease() {
    let config = crate::config::Config {
        lease_check: true,
        ..test_config()
    };
    let mut fsm = new_fsm_with(2, &[1, 2, 3], config);
    fsm.step(msg(MessageKind::Heartbeat, 1, 2, 1));
    take_msgs(&mut fsm);

    fsm.step(msg(MessageKind::TimeoutNow, 1, 2, 1));
    assert_eq!(Role::Candidate, fsm.role);
    assert_eq!(2, fsm.term);

    let msgs = take_msgs(&mut fsm);
    let votes: Vec<_> = msgs.iter().filter(|m| m.kind == MessageKind::RequestVote).collect();
    assert_eq!(2, votes.len());
    assert!(votes.iter().all(|m| m.force), "transfer votes override the lease");
}

#[test]
fn test_candidate_self_degrades_on_stagger_slot() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);

    // First campaign at term 1: fine.
    fsm.campaign(false);
    assert_eq!(Role::Candidate, fsm.role);
    take_msgs(&mut fsm);

    // Re-campaigning while already a candidate checks the stagger slot:
    // sorted ids [1, 2, 3], term 3 -> index 0 -> node 1 must yield.
    fsm.term = 3;
    fsm.campaign(false);
    assert_eq!(Role::Follower, fsm.role);
}

#[test]
fn test_read_index_modes() {
    // Lease mode: local reads once the term has committed.
    let config = crate::config::Config {
        lease_check: true,
        ..test_config()
    };
    let mut fsm = new_fsm_with(1, &[1, 2, 3], config);
    fsm.campaign(false);
    take_msgs(&mut fsm);
    fsm.step(msg(MessageKind::VoteResponse, 2, 1, 1));
    fsm.step(msg(MessageKind::ElectAckResponse, 2, 1, 1));
    assert_eq!(Role::Leader, fsm.role);
    take_msgs(&mut fsm);

    // The no-op is not committed yet: the read attaches to a barrier entry.
    let got = fsm.read_index(Bytes::from_static(b"r1")).unwrap();
    assert_eq!(ReadProgress::Queued, got);
    let last = fsm.log.last_index();
    let entries = fsm.log.entries_from(last, u64::MAX).unwrap();
    assert_eq!(EntryKind::LeaseRead, entries[0].kind);

    // Commit through the barrier; lease reads now serve locally.
    let mut ack = msg(MessageKind::AppendResponse, 2, 1, 1);
    ack.index = last;
    fsm.step(ack);
    take_msgs(&mut fsm);
    let got = fsm.read_index(Bytes::from_static(b"r2")).unwrap();
    assert_eq!(ReadProgress::Local(fsm.log.committed), got);

    // Without the lease, a read runs the heartbeat round.
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);
    let mut ack = msg(MessageKind::AppendResponse, 2, 1, 1);
    ack.index = 1;
    fsm.step(ack);
    take_msgs(&mut fsm);

    let got = fsm.read_index(Bytes::from_static(b"r3")).unwrap();
    assert_eq!(ReadProgress::Queued, got);
    let msgs = take_msgs(&mut fsm);
    let beats: Vec<_> = msgs.iter().filter(|m| m.kind == MessageKind::Heartbeat).collect();
    assert_eq!(2, beats.len());
    assert!(beats.iter().all(|m| m.context == Bytes::from_static(b"r3")));

    // A quorum of acks resolves the read.
    let mut resp = msg(MessageKind::HeartbeatResponse, 2, 1, 1);
    resp.context = Bytes::from_static(b"r3");
    fsm.step(resp);
    assert_eq!(1, fsm.read_states.len());
    assert_eq!(Bytes::from_static(b"r3"), fsm.read_states[0].ctx);
}

#[test]
fn test_heartbeat_commit_capped_by_match() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);
    take_msgs(&mut fsm);

    // Commit the no-op with peer 2's ack; peer 3 has matched nothing.
    let mut ack = msg(MessageKind::AppendResponse, 2, 1, 1);
    ack.index = 1;
    fsm.step(ack);
    assert_eq!(1, fsm.log.committed);
    take_msgs(&mut fsm);

    fsm.bcast_heartbeat();
    let msgs = take_msgs(&mut fsm);
    let to2 = msgs.iter().find(|m| m.to == 2 && m.kind == MessageKind::Heartbeat).unwrap();
    let to3 = msgs.iter().find(|m| m.to == 3 && m.kind == MessageKind::Heartbeat).unwrap();
    assert_eq!(1, to2.commit);
    assert_eq!(0, to3.commit, "commit never outruns the peer's match");
}

#[test]
fn test_snapshot_install_on_follower() {
    let mut fsm = new_fsm(2, &[1, 2, 3]);

    let meta = SnapshotMeta {
        index: 10,
        term: 3,
        peers: vec![Peer::new(1), Peer::new(2), Peer::new(3), Peer::learner(4)],
    };
    let mut m = msg(MessageKind::Snapshot, 1, 2, 3);
    m.snapshot = Some(meta);
    m.context = Bytes::from_static(b"state");
    fsm.step(m);

    assert_eq!(10, fsm.log.committed);
    assert_eq!(10, fsm.log.last_index());
    assert_eq!(3, fsm.term);
    assert!(fsm.replicas[&4].learner, "configuration follows the snapshot");

    let msgs = take_msgs(&mut fsm);
    let resp = msgs.iter().find(|m| m.kind == MessageKind::SnapshotResponse).unwrap();
    assert_eq!(10, resp.index);

    // A stale snapshot is acknowledged with the current commit point.
    let meta = SnapshotMeta {
        index: 4,
        term: 2,
        peers: vec![Peer::new(1), Peer::new(2)],
    };
    let mut m = msg(MessageKind::Snapshot, 1, 2, 3);
    m.snapshot = Some(meta);
    fsm.step(m);
    let msgs = take_msgs(&mut fsm);
    let resp = msgs.iter().find(|m| m.kind == MessageKind::SnapshotResponse).unwrap();
    assert_eq!(10, resp.index);
}

#[test]
fn test_ready_and_advance_cycle() {
    let mut fsm = new_fsm(1, &[1, 2, 3]);
    elect_as_leader(&mut fsm);

    assert!(fsm.has_ready());
    let ready = fsm.ready();
    assert!(ready.hard_state.is_some(), "term and vote changed");
    assert_eq!(1, ready.entries.len(), "the no-op awaits persistence");
    assert!(!ready.messages.is_empty());

    // Persist as the group runtime would, then acknowledge.
    fsm.log.storage().append(&ready.entries).unwrap();
    fsm.advance(&ready);
    assert!(fsm.log.unstable_entries().is_empty());
    assert!(!fsm.has_ready());

    // Committing produces apply work on the next ready.
    let mut ack = msg(MessageKind::AppendResponse, 2, 1, 1);
    ack.index = 1;
    fsm.step(ack);
    assert!(fsm.has_ready());
    let ready = fsm.ready();
    assert_eq!(1, ready.committed_entries.len());
    fsm.advance(&ready);
    assert_eq!(1, fsm.log.applied);
}
