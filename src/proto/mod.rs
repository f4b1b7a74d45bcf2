//! The data model shared by the state machine, the log store and the wire.

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

mod codec;

pub use codec::read_frame;
pub use codec::write_frame;
pub use codec::CodecError;

/// Stable non-zero identifier of a host.
pub type NodeId = u64;

/// Identifier of one raft group (one replicated partition).
pub type GroupId = u64;

/// The leader id a node reports when it knows of no leader.
pub const NO_LEADER: NodeId = 0;

/// The durable part of a group's state.
///
/// It is written to stable storage before any message that depends on it is
/// sent. `commit` is persisted as an optimization; it is recoverable from the
/// leader after a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: NodeId,
    pub commit: u64,
}

/// A member of a group.
///
/// `learner` peers receive entries but never vote and never count in a
/// quorum. `priority` shifts when a peer starts campaigning after a leader
/// loss; it never affects vote granting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    #[serde(default)]
    pub priority: u16,
    #[serde(default)]
    pub learner: bool,
}

impl Peer {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            priority: 0,
            learner: false,
        }
    }

    pub fn with_priority(id: NodeId, priority: u16) -> Self {
        Self {
            id,
            priority,
            learner: false,
        }
    }

    pub fn learner(id: NodeId) -> Self {
        Self {
            id,
            priority: 0,
            learner: true,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if self.priority != 0 {
            write!(f, "(pri:{})", self.priority)?;
        }
        if self.learner {
            write!(f, "(learner)")?;
        }
        Ok(())
    }
}

/// What an entry's payload means to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Opaque application data, or the empty no-op a new leader appends.
    Normal,
    /// A serialized [`ConfChange`]; takes effect when applied.
    ConfChange,
    /// A read barrier: commits release the reads attached to it, the
    /// application never sees it.
    LeaseRead,
}

/// One record of the replicated log.
///
/// An entry is immutable once durably stored under the index it claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Bytes,
}

impl Entry {
    pub fn normal(index: u64, term: u64, data: Bytes) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Normal,
            data,
        }
    }

    /// The empty entry a new leader appends to establish its term's commitment.
    pub fn noop(index: u64, term: u64) -> Self {
        Self::normal(index, term, Bytes::new())
    }

    /// Approximate wire size, used for `max_msg_bytes` budgeting.
    pub fn size(&self) -> u64 {
        // index + term + kind tag + payload
        8 + 8 + 4 + self.data.len() as u64
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}:{:?}({}B)", self.term, self.index, self.kind, self.data.len())
    }
}

/// The kind of a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    AddPeer,
    RemovePeer,
    /// Promote a learner to voter. A separate change from AddPeer.
    Promote,
}

/// A membership change carried by a [`EntryKind::ConfChange`] entry.
///
/// Takes effect at the moment the entry passes the apply boundary, on every
/// node independently. Only one change may be uncommitted at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub kind: ConfChangeKind,
    pub peer: Peer,
    /// Opaque application context, e.g. the peer's address.
    #[serde(default)]
    pub context: Bytes,
}

impl ConfChange {
    pub fn encode(&self) -> Bytes {
        Bytes::from(bincode::serialize(self).expect("ConfChange is always serializable"))
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Metadata describing a snapshot of the log prefix `[1..index]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
    /// The configuration in effect at `index`.
    pub peers: Vec<Peer>,
}

/// Message types exchanged between peers of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    AppendEntries,
    AppendResponse,
    RequestVote,
    VoteResponse,
    PreVote,
    PreVoteResponse,
    Heartbeat,
    HeartbeatResponse,
    ElectAck,
    ElectAckResponse,
    Snapshot,
    SnapshotResponse,
    TimeoutNow,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One protocol message.
///
/// A single struct carries every kind; the meaning of `index`/`log_term`
/// depends on the kind (prev log position for appends, last log position for
/// votes, conflict hint in a rejecting append response).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub group: GroupId,
    pub from: NodeId,
    pub to: NodeId,
    pub term: u64,
    pub log_term: u64,
    pub index: u64,
    pub entries: Vec<Entry>,
    pub commit: u64,
    pub reject: bool,
    /// Conflict hint accompanying a rejecting AppendResponse: the first index
    /// at which the follower's log disagrees.
    pub reject_hint: u64,
    /// Set on a RequestVote issued for an explicit leadership transfer; it
    /// overrides the lease guard.
    pub force: bool,
    /// Snapshot metadata, set on `Snapshot` messages; the opaque payload
    /// rides in `context`.
    pub snapshot: Option<SnapshotMeta>,
    /// Correlation context: a read-index id on heartbeats, the snapshot
    /// payload on `Snapshot`.
    pub context: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, group: GroupId, from: NodeId, to: NodeId, term: u64) -> Self {
        Self {
            kind,
            group,
            from,
            to,
            term,
            log_term: 0,
            index: 0,
            entries: Vec::new(),
            commit: 0,
            reject: false,
            reject_hint: 0,
            force: false,
            snapshot: None,
            context: Bytes::new(),
        }
    }

    /// Whether this kind is sent through the heartbeat sender class.
    pub fn is_heartbeat_class(&self) -> bool {
        matches!(self.kind, MessageKind::Heartbeat | MessageKind::HeartbeatResponse)
    }

    /// Whether this is a response kind, i.e. it never initiates work.
    pub fn is_response(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::AppendResponse
                | MessageKind::VoteResponse
                | MessageKind::PreVoteResponse
                | MessageKind::HeartbeatResponse
                | MessageKind::ElectAckResponse
                | MessageKind::SnapshotResponse
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[g:{}, {}->{}, term:{}, log_term:{}, index:{}, commit:{}",
            self.kind, self.group, self.from, self.to, self.term, self.log_term, self.index, self.commit
        )?;
        if self.reject {
            write!(f, ", reject(hint:{})", self.reject_hint)?;
        }
        if !self.entries.is_empty() {
            write!(f, ", {} entries", self.entries.len())?;
        }
        write!(f, "]")
    }
}

/// One group's heartbeat signal inside a coalesced batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBeat {
    pub group: GroupId,
    pub term: u64,
    pub commit: u64,
}

/// All heartbeats between one pair of hosts for one tick, coalesced into a
/// single wire message. Each beat still carries the full correctness signal
/// (term for step-down, commit for catch-up) and is applied independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatBatch {
    pub from: NodeId,
    pub to: NodeId,
    /// False for leader→follower beats, true for the response direction.
    pub reply: bool,
    pub beats: Vec<GroupBeat>,
}

/// The unit of transmission on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Message(Message),
    Heartbeats(HeartbeatBatch),
}

impl Frame {
    /// The destination host.
    pub fn to(&self) -> NodeId {
        match self {
            Frame::Message(m) => m.to,
            Frame::Heartbeats(b) => b.to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_change_codec() -> anyhow::Result<()> {
        let cc = ConfChange {
            kind: ConfChangeKind::Promote,
            peer: Peer::learner(7),
            context: Bytes::from_static(b"addr"),
        };
        let got = ConfChange::decode(&cc.encode())?;
        assert_eq!(cc, got);
        Ok(())
    }

    #[test]
    fn test_message_display() {
        let mut m = Message::new(MessageKind::AppendResponse, 3, 2, 1, 9);
        m.reject = true;
        m.reject_hint = 17;
        let s = m.to_string();
        assert!(s.contains("AppendResponse"));
        assert!(s.contains("reject(hint:17)"));
    }

    #[test]
    fn test_entry_size_counts_payload() {
        let e = Entry::normal(1, 1, Bytes::from_static(b"xyz"));
        assert_eq!(23, e.size());
        assert!(Entry::noop(1, 1).data.is_empty());
    }
}
