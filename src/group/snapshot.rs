//! The per-group snapshot worker.
//!
//! Snapshot production shares the state machine with the apply worker
//! through a mutex: while the worker holds the lock, the apply cursor is
//! frozen at a batch boundary, so the captured bytes are consistent with the
//! `applied` index read under the lock.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::group::apply::StateMachine;
use crate::group::Feedback;
use crate::proto::NodeId;

/// Why a snapshot is being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SnapshotPurpose {
    /// A peer fell behind the compaction point and must be re-seeded.
    ForPeer(NodeId),
    /// Log growth crossed the threshold (or an admin asked); compact after.
    Compact,
}

pub(crate) async fn snapshot_loop<M: StateMachine>(
    sm: Arc<Mutex<M>>,
    applied: Arc<AtomicU64>,
    mut rx: mpsc::Receiver<SnapshotPurpose>,
    feedback: mpsc::UnboundedSender<Feedback>,
) {
    while let Some(purpose) = rx.recv().await {
        let (index, result) = {
            let sm = sm.lock().await;
            let index = applied.load(Ordering::Acquire);
            (index, sm.snapshot().await)
        };

        let fb = match result {
            Ok(data) => {
                tracing::info!(
                    index = index,
                    bytes = data.len(),
                    purpose = ?purpose,
                    "snapshot produced"
                );
                Feedback::SnapshotTaken { purpose, index, data }
            }
            Err(err) => Feedback::SnapshotFailed { purpose, err },
        };
        if feedback.send(fb).is_err() {
            return;
        }
    }
}
