//! Error types surfaced by this crate.

use std::fmt;

use anyerror::AnyError;

use crate::proto::GroupId;
use crate::proto::NodeId;

/// Errors returned to callers of the group/server API.
///
/// Peer-level and transport-level failures are recovered internally (retry,
/// back-off, step-down) and never reach this type. Storage and application
/// failures abort the group and surface as [`RaftError::Fatal`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RaftError {
    /// The operation was submitted to a node that is not the leader of the group.
    ///
    /// `leader` is a hint: the leader known to this node, if any.
    #[error("node is not leader of group {group}, leader hint: {leader:?}")]
    NotLeader { group: GroupId, leader: Option<NodeId> },

    /// The group has been shut down.
    #[error("raft group {0} is stopped")]
    Stopped(GroupId),

    /// The operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The proposal's entry was overwritten by a conflicting suffix from a new leader.
    #[error("proposed entry at index {index} was overwritten at a higher term")]
    Overwritten { index: u64 },

    /// The requested index lies below the snapshot boundary.
    #[error("index {index} is compacted, first index is {first_index}")]
    Compacted { index: u64, first_index: u64 },

    /// A membership change is malformed or conflicts with an in-flight change.
    #[error("invalid config change: {0}")]
    InvalidConfig(String),

    /// The proposal was dropped before reaching the log, e.g. the input queue overflowed.
    #[error("proposal dropped")]
    ProposalDropped,

    /// The group has self-aborted; see the cause.
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl RaftError {
    /// Whether the group is gone for good; anything else is worth a retry,
    /// possibly against a different node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Fatal(_) | RaftError::Stopped(_))
    }

    /// The leader this request should be retried against, when known.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            RaftError::NotLeader { leader, .. } => *leader,
            _ => None,
        }
    }

    /// Return a reference to the fatal cause, if that is what this is.
    pub fn fatal(&self) -> Option<&FatalError> {
        match self {
            RaftError::Fatal(f) => Some(f),
            _ => None,
        }
    }
}

/// Unrecoverable failure; the group halts itself and notifies the application
/// through `StateMachine::on_fatal`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The application's apply function failed; determinism is violated.
    #[error("state machine error: {0}")]
    StateMachine(AnyError),
}

/// What the store was operating on when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSubject {
    Store,
    HardState,
    Logs,
    LogIndex(u64),
    Snapshot,
}

/// What the store was doing when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerb {
    Read,
    Write,
    Delete,
}

/// Error raised by a [`LogStorage`](crate::storage::LogStorage) implementation.
///
/// It indicates a data crash; the owning group shuts down immediately to
/// prevent further damage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct StorageError {
    subject: ErrorSubject,
    verb: ErrorVerb,
    source: Box<AnyError>,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "when {:?} {:?}: {}", self.verb, self.subject, self.source)
    }
}

impl StorageError {
    pub fn new(subject: ErrorSubject, verb: ErrorVerb, source: impl Into<AnyError>) -> Self {
        Self {
            subject,
            verb,
            source: Box::new(source.into()),
        }
    }

    pub fn read_logs(source: impl Into<AnyError>) -> Self {
        Self::new(ErrorSubject::Logs, ErrorVerb::Read, source)
    }

    pub fn write_logs(source: impl Into<AnyError>) -> Self {
        Self::new(ErrorSubject::Logs, ErrorVerb::Write, source)
    }

    pub fn read_log_at_index(index: u64, source: impl Into<AnyError>) -> Self {
        Self::new(ErrorSubject::LogIndex(index), ErrorVerb::Read, source)
    }

    pub fn write_hard_state(source: impl Into<AnyError>) -> Self {
        Self::new(ErrorSubject::HardState, ErrorVerb::Write, source)
    }

    pub fn write_snapshot(source: impl Into<AnyError>) -> Self {
        Self::new(ErrorSubject::Snapshot, ErrorVerb::Write, source)
    }

    pub fn read_snapshot(source: impl Into<AnyError>) -> Self {
        Self::new(ErrorSubject::Snapshot, ErrorVerb::Read, source)
    }

    pub fn from_io_error(subject: ErrorSubject, verb: ErrorVerb, io_error: std::io::Error) -> Self {
        Self::new(subject, verb, AnyError::new(&io_error))
    }
}

/// Error raised while validating a [`Config`](crate::config::Config).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("election_tick({election_tick}) must be greater than heartbeat_tick({heartbeat_tick})")]
    ElectionTickTooSmall { election_tick: u64, heartbeat_tick: u64 },

    #[error("heartbeat_tick must be greater than 0")]
    HeartbeatTickIsZero,

    #[error("max_inflight_msgs must be greater than 0")]
    MaxInflightIsZero,

    #[error("{invalid} is not a valid size string: {reason}")]
    InvalidNumber { invalid: String, reason: String },

    #[error("failed to parse arguments {args:?}: {source}")]
    ParseError { source: AnyError, args: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::read_log_at_index(5, AnyError::error("disk gone"));
        let s = err.to_string();
        assert!(s.contains("Read"));
        assert!(s.contains("LogIndex(5)"));
        assert!(s.contains("disk gone"));
    }

    #[test]
    fn test_fatal_from_storage() {
        let err = StorageError::write_logs(AnyError::error("enospc"));
        let raft_err = RaftError::from(FatalError::from(err));
        assert!(matches!(raft_err, RaftError::Fatal(FatalError::Storage(_))));
        assert!(raft_err.is_fatal());
        assert!(raft_err.fatal().is_some());
    }

    #[test]
    fn test_leader_hint() {
        let err = RaftError::NotLeader { group: 7, leader: Some(3) };
        assert_eq!(Some(3), err.leader_hint());
        assert!(!err.is_fatal());
        assert_eq!(None, RaftError::Timeout.leader_hint());
    }
}
