//! The per-group apply worker and the application callback contract.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyerror::AnyError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::error::FatalError;
use crate::error::RaftError;
use crate::group::Feedback;
use crate::proto::Entry;
use crate::proto::EntryKind;
use crate::proto::NodeId;
use crate::proto::Peer;
use crate::proto::SnapshotMeta;

/// The deterministic application a group replicates for.
///
/// `apply` runs on the group's apply worker, strictly in index order; its
/// result must depend only on the sequence of applied entries. An error from
/// `apply` or `restore_snapshot` means determinism is broken and aborts the
/// group.
#[async_trait]
pub trait StateMachine: Send + 'static {
    /// Apply one committed entry. Empty entries and read barriers are
    /// filtered out before this is called.
    async fn apply(&mut self, entry: &Entry) -> Result<(), AnyError>;

    /// The membership changed at `index`; `peers` is the configuration now
    /// in effect.
    async fn apply_member_change(&mut self, peers: &[Peer], index: u64) -> Result<(), AnyError>;

    /// Produce a consistent byte view of everything applied so far.
    async fn snapshot(&self) -> Result<Bytes, AnyError>;

    /// Replace all state from a snapshot.
    async fn restore_snapshot(&mut self, meta: &SnapshotMeta, data: Bytes) -> Result<(), AnyError>;

    /// Advisory: the group observed a new leader.
    fn on_leader_change(&mut self, _leader: NodeId, _term: u64) {}

    /// The group has aborted; no further callbacks will arrive.
    fn on_fatal(&mut self, _err: &RaftError) {}
}

/// Work items handed to the apply worker, in strict log order.
#[derive(Debug)]
pub(crate) enum ApplyTask {
    /// A run of committed entries without membership changes.
    Entries(Vec<Entry>),
    /// A committed membership change, with the resulting configuration.
    MemberChange { peers: Vec<Peer>, index: u64 },
    /// Replace the application state from an installed snapshot.
    Restore { meta: SnapshotMeta, data: Bytes },
}

/// The worker: owns the state machine together with the snapshot worker
/// (through the mutex) and reports each advance of the apply cursor.
pub(crate) async fn apply_loop<M: StateMachine>(
    sm: Arc<Mutex<M>>,
    applied: Arc<AtomicU64>,
    mut rx: mpsc::Receiver<ApplyTask>,
    feedback: mpsc::UnboundedSender<Feedback>,
) {
    while let Some(task) = rx.recv().await {
        let index = match run_task(&sm, task).await {
            Ok(index) => index,
            Err(e) => {
                let _ = feedback.send(Feedback::Fatal {
                    err: RaftError::Fatal(FatalError::StateMachine(e)),
                });
                return;
            }
        };

        if let Some(index) = index {
            applied.store(index, Ordering::Release);
            if feedback.send(Feedback::Applied { index }).is_err() {
                return;
            }
        }
    }
}

async fn run_task<M: StateMachine>(sm: &Mutex<M>, task: ApplyTask) -> Result<Option<u64>, AnyError> {
    match task {
        ApplyTask::Entries(entries) => {
            let Some(last) = entries.last().map(|e| e.index) else {
                return Ok(None);
            };
            let mut sm = sm.lock().await;
            for entry in &entries {
                // Barriers and the leader's no-op advance the cursor without
                // touching the application.
                if entry.kind != EntryKind::Normal || entry.data.is_empty() {
                    continue;
                }
                sm.apply(entry).await?;
            }
            Ok(Some(last))
        }
        ApplyTask::MemberChange { peers, index } => {
            let mut sm = sm.lock().await;
            sm.apply_member_change(&peers, index).await?;
            Ok(Some(index))
        }
        ApplyTask::Restore { meta, data } => {
            let mut sm = sm.lock().await;
            sm.restore_snapshot(&meta, data).await?;
            Ok(Some(meta.index))
        }
    }
}
