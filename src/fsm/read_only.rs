//! The leader's read-only request queue.
//!
//! Non-lease ("read index") reads record the commit index, ride a heartbeat
//! round for quorum confirmation, and resolve in arrival order: confirming
//! one request confirms everything queued before it.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use bytes::Bytes;

use crate::fsm::ready::ReadState;
use crate::proto::NodeId;

#[derive(Debug)]
struct ReadIndexStatus {
    ctx: Bytes,
    index: u64,
    acks: HashSet<NodeId>,
}

#[derive(Debug, Default)]
pub(crate) struct ReadOnly {
    pending: HashMap<Bytes, ReadIndexStatus>,
    queue: VecDeque<Bytes>,
}

impl ReadOnly {
    /// Track a read at commit index `index`, correlated by `ctx`.
    pub(crate) fn add_request(&mut self, index: u64, ctx: Bytes) {
        if self.pending.contains_key(&ctx) {
            return;
        }
        self.pending.insert(
            ctx.clone(),
            ReadIndexStatus {
                ctx: ctx.clone(),
                index,
                acks: HashSet::new(),
            },
        );
        self.queue.push_back(ctx);
    }

    /// Record a heartbeat ack carrying `ctx`. Returns the ack count for that
    /// request, not counting the leader itself.
    pub(crate) fn recv_ack(&mut self, from: NodeId, ctx: &Bytes) -> usize {
        match self.pending.get_mut(ctx) {
            Some(status) => {
                status.acks.insert(from);
                status.acks.len()
            }
            None => 0,
        }
    }

    /// Pop every request queued up to and including `ctx`, resolved.
    pub(crate) fn advance(&mut self, ctx: &Bytes) -> Vec<ReadState> {
        let mut resolved = Vec::new();
        if !self.queue.contains(ctx) {
            return resolved;
        }

        while let Some(queued) = self.queue.pop_front() {
            let status = self.pending.remove(&queued).expect("queued request is pending");
            let done = queued == *ctx;
            resolved.push(ReadState {
                index: status.index,
                ctx: status.ctx,
            });
            if done {
                break;
            }
        }
        resolved
    }

    /// The newest pending context, attached to outgoing heartbeats.
    pub(crate) fn last_pending_ctx(&self) -> Bytes {
        self.queue.back().cloned().unwrap_or_default()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.queue.clear();
    }
}
