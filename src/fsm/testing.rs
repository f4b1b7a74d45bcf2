//! Helpers for driving an FSM directly in unit tests.

use std::sync::Arc;

use crate::config::Config;
use crate::fsm::Fsm;
use crate::proto::Message;
use crate::proto::Peer;
use crate::storage::MemStorage;

pub(crate) fn test_config() -> Config {
    Config {
        tick_interval_ms: 10,
        election_tick: 10,
        heartbeat_tick: 1,
        ..Default::default()
    }
    .validate()
    .unwrap()
}

/// A voter-only FSM over an empty in-memory store.
pub(crate) fn new_fsm(id: u64, voters: &[u64]) -> Fsm<MemStorage> {
    new_fsm_with(id, voters, test_config())
}

pub(crate) fn new_fsm_with(id: u64, voters: &[u64], config: Config) -> Fsm<MemStorage> {
    let peers: Vec<Peer> = voters.iter().map(|id| Peer::new(*id)).collect();
    Fsm::new(id, 1, &peers, Arc::new(config), MemStorage::new()).unwrap()
}

/// Drain the FSM's outbound queue.
pub(crate) fn take_msgs(fsm: &mut Fsm<MemStorage>) -> Vec<Message> {
    std::mem::take(&mut fsm.msgs)
}

/// Campaign and feed back enough grants to win, without lease acks.
pub(crate) fn elect_as_leader(fsm: &mut Fsm<MemStorage>) {
    use crate::proto::MessageKind;

    fsm.campaign(false);
    let msgs = take_msgs(fsm);
    for m in msgs {
        if m.kind == MessageKind::RequestVote {
            let mut resp = Message::new(MessageKind::VoteResponse, m.group, m.to, m.from, m.term);
            resp.reject = false;
            fsm.step(resp);
        }
    }
}
