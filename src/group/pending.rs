//! Tracking of in-flight proposals on the leader.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::proto::Entry;

type Responder = oneshot::Sender<Result<u64, RaftError>>;

/// Proposals the local node appended as leader, keyed by index.
///
/// A proposal moves through two stages: waiting for commit (where a
/// conflicting entry at the same index fails it as overwritten), then
/// waiting for the apply cursor (commit precedes apply precedes reply).
#[derive(Default)]
pub(crate) struct Proposals {
    uncommitted: BTreeMap<u64, (u64, Responder)>,
    unapplied: BTreeMap<u64, Responder>,
}

impl Proposals {
    pub(crate) fn insert(&mut self, index: u64, term: u64, tx: Responder) {
        self.uncommitted.insert(index, (term, tx));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.uncommitted.is_empty() && self.unapplied.is_empty()
    }

    /// An entry reached the commit boundary.
    pub(crate) fn on_committed(&mut self, entry: &Entry) {
        let Some((term, tx)) = self.uncommitted.remove(&entry.index) else {
            return;
        };
        if term == entry.term {
            self.unapplied.insert(entry.index, tx);
        } else {
            let _ = tx.send(Err(RaftError::Overwritten { index: entry.index }));
        }
    }

    /// The apply cursor advanced through `index`.
    pub(crate) fn on_applied(&mut self, index: u64) {
        let done: Vec<u64> = self.unapplied.range(..=index).map(|(i, _)| *i).collect();
        for i in done {
            if let Some(tx) = self.unapplied.remove(&i) {
                let _ = tx.send(Ok(i));
            }
        }
    }

    /// Fail every uncommitted proposal, e.g. the leader stepped down.
    ///
    /// Proposals already past the commit boundary stay: they will apply
    /// regardless of who leads now.
    pub(crate) fn fail_uncommitted(&mut self, err: RaftError) {
        for (_, (_, tx)) in std::mem::take(&mut self.uncommitted) {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Fail everything, for shutdown and fatal errors.
    pub(crate) fn fail_all(&mut self, err: RaftError) {
        self.fail_uncommitted(err.clone());
        for (_, tx) in std::mem::take(&mut self.unapplied) {
            let _ = tx.send(Err(err.clone()));
        }
    }
}
