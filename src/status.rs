//! Introspection view of a group, polled through the admin surface.

use std::collections::BTreeMap;
use std::fmt;

use crate::fsm::Fsm;
use crate::fsm::Role;
use crate::progress::ProgressState;
use crate::proto::GroupId;
use crate::proto::NodeId;
use crate::storage::LogStorage;

/// A point-in-time view of one group on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: NodeId,
    pub group: GroupId,
    pub term: u64,
    pub leader: NodeId,
    pub role: Role,
    pub commit: u64,
    /// The apply worker's cursor: everything at or below is in the
    /// application's state.
    pub applied: u64,
    pub first_index: u64,
    pub last_index: u64,
    /// Per-peer replication state; populated on the leader only.
    pub replicas: BTreeMap<NodeId, ReplicaStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub matched: u64,
    pub next: u64,
    pub state: ProgressState,
    pub recent_active: bool,
    pub learner: bool,
    pub priority: u16,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "group {} node {}: {} at term {}, leader {}, log [{}, {}], commit {}, applied {}",
            self.group,
            self.id,
            self.role,
            self.term,
            self.leader,
            self.first_index,
            self.last_index,
            self.commit,
            self.applied,
        )?;
        for (id, r) in &self.replicas {
            write!(
                f,
                "; {} {}[match:{}, next:{}{}]",
                id,
                r.state,
                r.matched,
                r.next,
                if r.learner { ", learner" } else { "" },
            )?;
        }
        Ok(())
    }
}

impl<S: LogStorage> Fsm<S> {
    pub(crate) fn status(&self, applied: u64) -> Status {
        let replicas = if self.role == Role::Leader {
            self.replicas
                .iter()
                .map(|(id, p)| {
                    (*id, ReplicaStatus {
                        matched: p.matched,
                        next: p.next,
                        state: p.state,
                        recent_active: p.recent_active,
                        learner: p.learner,
                        priority: p.priority,
                    })
                })
                .collect()
        } else {
            BTreeMap::new()
        };

        Status {
            id: self.id,
            group: self.group,
            term: self.term,
            leader: self.leader,
            role: self.role,
            commit: self.log.committed,
            applied,
            first_index: self.log.first_index(),
            last_index: self.log.last_index(),
            replicas,
        }
    }
}
