//! The per-group runtime: one cooperative actor owning one FSM.
//!
//! Every input (ticks, protocol messages, proposals, membership changes,
//! reads, admin commands) funnels into one bounded channel and is applied
//! to the FSM serially. Cross-cutting concurrency lives in the apply worker,
//! the snapshot worker and the transport, never inside the FSM.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyerror::AnyError;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;

use crate::coalesce::HeartbeatCoalescer;
use crate::config::Config;
use crate::error::FatalError;
use crate::error::RaftError;
use crate::error::StorageError;
use crate::fsm::Fsm;
use crate::fsm::ReadProgress;
use crate::fsm::Ready;
use crate::fsm::Role;
use crate::proto::ConfChange;
use crate::proto::Entry;
use crate::proto::EntryKind;
use crate::proto::Frame;
use crate::proto::GroupBeat;
use crate::proto::GroupId;
use crate::proto::Message;
use crate::proto::MessageKind;
use crate::proto::NodeId;
use crate::proto::Peer;
use crate::proto::SnapshotMeta;
use crate::status::Status;
use crate::storage::LogStorage;
use crate::transport::Transport;

mod apply;
mod pending;
mod snapshot;

pub use apply::StateMachine;

use apply::apply_loop;
use apply::ApplyTask;
use pending::Proposals;
use snapshot::snapshot_loop;
use snapshot::SnapshotPurpose;

/// How many queued inputs one loop iteration drains before producing a Ready.
const INPUT_BATCH: usize = 64;
/// Capacity of the apply-task channel; bounds group -> worker buffering.
const APPLY_QUEUE: usize = 64;

pub(crate) enum GroupInput {
    Tick,
    Message(Message),
    Propose {
        data: Bytes,
        tx: oneshot::Sender<Result<u64, RaftError>>,
    },
    ChangeMember {
        cc: ConfChange,
        tx: oneshot::Sender<Result<u64, RaftError>>,
    },
    Read {
        tx: oneshot::Sender<Result<u64, RaftError>>,
    },
    TransferLeader {
        target: NodeId,
        tx: oneshot::Sender<Result<(), RaftError>>,
    },
    Status {
        tx: oneshot::Sender<Status>,
    },
    Snapshot {
        tx: oneshot::Sender<Result<u64, RaftError>>,
    },
    Stop,
}

/// Feedback from the apply and snapshot workers into the group loop.
#[derive(Debug)]
pub(crate) enum Feedback {
    Applied { index: u64 },
    SnapshotTaken {
        purpose: SnapshotPurpose,
        index: u64,
        data: Bytes,
    },
    SnapshotFailed {
        purpose: SnapshotPurpose,
        err: AnyError,
    },
    Fatal { err: RaftError },
}

/// The caller-facing handle of one group. Cheap to clone; all methods
/// enqueue onto the group's input channel and await a response.
#[derive(Clone)]
pub struct RaftGroup {
    id: GroupId,
    config: Arc<Config>,
    tx: mpsc::Sender<GroupInput>,
}

impl RaftGroup {
    /// Propose an entry; resolves with its index once committed and applied.
    pub async fn propose(&self, data: Bytes) -> Result<u64, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.request(GroupInput::Propose { data, tx }, rx).await
    }

    /// Propose a membership change; resolves once the change is applied.
    pub async fn change_member(&self, cc: ConfChange) -> Result<u64, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.request(GroupInput::ChangeMember { cc, tx }, rx).await
    }

    /// Linearizable read barrier: resolves with the read index once local
    /// state is at least as fresh as the commit point at call time.
    pub async fn read_index(&self) -> Result<u64, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.request(GroupInput::Read { tx }, rx).await
    }

    pub async fn transfer_leader(&self, target: NodeId) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.request(GroupInput::TransferLeader { target, tx }, rx).await
    }

    /// Trigger a snapshot and compact the log; resolves with the snapshot index.
    pub async fn snapshot(&self) -> Result<u64, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.request(GroupInput::Snapshot { tx }, rx).await
    }

    pub async fn status(&self) -> Result<Status, RaftError> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(GroupInput::Status { tx }).await.is_err() {
            return Err(RaftError::Stopped(self.id));
        }
        rx.await.map_err(|_| RaftError::Stopped(self.id))
    }

    /// Ask the group to shut down; pending work drains best-effort.
    pub async fn stop(&self) {
        let _ = self.tx.send(GroupInput::Stop).await;
    }

    /// Deliver a protocol message; overflow drops it (the protocol retries).
    pub(crate) fn deliver(&self, m: Message) {
        if let Err(e) = self.tx.try_send(GroupInput::Message(m)) {
            tracing::debug!(group = self.id, error = %e, "input queue full, dropping message");
        }
    }

    pub(crate) fn tick(&self) {
        let _ = self.tx.try_send(GroupInput::Tick);
    }

    async fn request<T>(
        &self,
        input: GroupInput,
        rx: oneshot::Receiver<Result<T, RaftError>>,
    ) -> Result<T, RaftError> {
        match self.tx.try_send(input) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The input queue is the back-pressure boundary; callers
                // retry on their own schedule.
                return Err(RaftError::ProposalDropped);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(RaftError::Stopped(self.id));
            }
        }
        match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(RaftError::Stopped(self.id)),
            Err(_) => Err(RaftError::Timeout),
        }
    }
}

/// Create the FSM, the workers and the loop task for one group.
pub(crate) fn spawn_group<S, M>(
    id: NodeId,
    group: GroupId,
    peers: &[Peer],
    config: Arc<Config>,
    storage: S,
    state_machine: M,
    transport: Arc<dyn Transport>,
    coalescer: Arc<HeartbeatCoalescer>,
) -> Result<RaftGroup, StorageError>
where
    S: LogStorage,
    M: StateMachine,
{
    let mut fsm = Fsm::new(id, group, peers, config.clone(), storage)?;

    let (input_tx, input_rx) = mpsc::channel(config.group_queue_size);
    let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
    let (apply_tx, apply_rx) = mpsc::channel(APPLY_QUEUE);
    let (snap_tx, snap_rx) = mpsc::channel(4);

    let sm = Arc::new(Mutex::new(state_machine));
    let applied = Arc::new(AtomicU64::new(0));

    tokio::spawn(apply_loop(sm.clone(), applied.clone(), apply_rx, feedback_tx.clone()));
    tokio::spawn(snapshot_loop(sm.clone(), applied.clone(), snap_rx, feedback_tx));

    // Recovery replays the stored snapshot into the application before any
    // log suffix; the queue preserves the order.
    if let Some((meta, data)) = fsm.log.storage().read_snapshot()? {
        if meta.index > 0 {
            let _ = apply_tx.try_send(ApplyTask::Restore { meta, data });
        }
    }

    let core = GroupCore {
        fsm,
        config: config.clone(),
        rx: input_rx,
        feedback_rx,
        apply_tx,
        snap_tx,
        transport,
        coalescer,
        sm,
        last_applied: 0,
        proposals: Proposals::default(),
        pending_reads: HashMap::new(),
        read_waiters: Vec::new(),
        next_read_ctx: 0,
        snapshotting: false,
        queued_snapshots: Vec::new(),
        compact_waiters: Vec::new(),
        prev_leader: (crate::proto::NO_LEADER, 0),
        stopped: false,
    };

    tokio::spawn(core.run());

    Ok(RaftGroup {
        id: group,
        config,
        tx: input_tx,
    })
}

struct GroupCore<S: LogStorage, M: StateMachine> {
    fsm: Fsm<S>,
    config: Arc<Config>,
    rx: mpsc::Receiver<GroupInput>,
    feedback_rx: mpsc::UnboundedReceiver<Feedback>,
    apply_tx: mpsc::Sender<ApplyTask>,
    snap_tx: mpsc::Sender<SnapshotPurpose>,
    transport: Arc<dyn Transport>,
    coalescer: Arc<HeartbeatCoalescer>,
    sm: Arc<Mutex<M>>,
    /// Mirror of the apply worker's cursor, read in the loop.
    last_applied: u64,

    proposals: Proposals,
    /// Reads awaiting resolution, keyed by the context id.
    pending_reads: HashMap<u64, oneshot::Sender<Result<u64, RaftError>>>,
    /// Resolved reads waiting for the apply cursor: `(read_index, ctx_id)`.
    read_waiters: Vec<(u64, u64)>,
    next_read_ctx: u64,

    snapshotting: bool,
    queued_snapshots: Vec<SnapshotPurpose>,
    compact_waiters: Vec<oneshot::Sender<Result<u64, RaftError>>>,

    prev_leader: (NodeId, u64),
    stopped: bool,
}

impl<S: LogStorage, M: StateMachine> GroupCore<S, M> {
    async fn run(mut self) {
        tracing::debug!(group = self.fsm.group, id = self.fsm.id, "group loop started");

        loop {
            tokio::select! {
                input = self.rx.recv() => {
                    let Some(input) = input else { break };
                    self.handle_input(input);
                    // Drain what queued behind it before producing a Ready.
                    for _ in 0..INPUT_BATCH {
                        match self.rx.try_recv() {
                            Ok(input) => self.handle_input(input),
                            Err(_) => break,
                        }
                    }
                }
                feedback = self.feedback_rx.recv() => {
                    let Some(feedback) = feedback else { break };
                    if !self.handle_feedback(feedback).await {
                        return;
                    }
                }
            }

            if let Err(err) = self.process_ready().await {
                self.abort(RaftError::Fatal(FatalError::Storage(err))).await;
                return;
            }
            self.after_ready().await;

            if self.stopped {
                break;
            }
        }

        self.shutdown().await;
    }

    fn handle_input(&mut self, input: GroupInput) {
        match input {
            GroupInput::Tick => self.fsm.tick(),
            GroupInput::Message(m) => self.fsm.step(m),
            GroupInput::Propose { data, tx } => {
                match self.fsm.propose(EntryKind::Normal, data) {
                    Ok((index, term)) => self.proposals.insert(index, term, tx),
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            }
            GroupInput::ChangeMember { cc, tx } => {
                match self.fsm.propose(EntryKind::ConfChange, cc.encode()) {
                    Ok((index, term)) => self.proposals.insert(index, term, tx),
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            }
            GroupInput::Read { tx } => self.handle_read(tx),
            GroupInput::TransferLeader { target, tx } => {
                let _ = tx.send(self.fsm.transfer_leader(target));
            }
            GroupInput::Status { tx } => {
                let _ = tx.send(self.fsm.status(self.last_applied));
            }
            GroupInput::Snapshot { tx } => {
                self.compact_waiters.push(tx);
                self.schedule_snapshot(SnapshotPurpose::Compact);
            }
            GroupInput::Stop => self.stopped = true,
        }
    }

    fn handle_read(&mut self, tx: oneshot::Sender<Result<u64, RaftError>>) {
        let ctx_id = self.next_read_ctx;
        self.next_read_ctx += 1;
        let ctx = Bytes::copy_from_slice(&ctx_id.to_be_bytes());

        match self.fsm.read_index(ctx) {
            Ok(ReadProgress::Local(index)) => {
                if self.last_applied >= index {
                    let _ = tx.send(Ok(index));
                } else {
                    self.pending_reads.insert(ctx_id, tx);
                    self.read_waiters.push((index, ctx_id));
                }
            }
            Ok(ReadProgress::Queued) => {
                self.pending_reads.insert(ctx_id, tx);
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    }

    /// Returns false when the group must terminate.
    async fn handle_feedback(&mut self, feedback: Feedback) -> bool {
        match feedback {
            Feedback::Applied { index } => {
                self.last_applied = index;
                self.proposals.on_applied(index);
                self.resolve_reads();
                self.maybe_compact();
            }
            Feedback::SnapshotTaken { purpose, index, data } => {
                self.snapshotting = false;
                if let Err(e) = self.on_snapshot_taken(purpose, index, data) {
                    self.abort(RaftError::Fatal(FatalError::Storage(e))).await;
                    return false;
                }
                self.drain_queued_snapshots();
            }
            Feedback::SnapshotFailed { purpose, err } => {
                tracing::error!(
                    group = self.fsm.group,
                    id = self.fsm.id,
                    purpose = ?purpose,
                    error = %err,
                    "snapshot production failed"
                );
                self.abort(RaftError::Fatal(FatalError::StateMachine(err))).await;
                return false;
            }
            Feedback::Fatal { err } => {
                self.abort(err).await;
                return false;
            }
        }
        true
    }

    fn resolve_reads(&mut self) {
        let applied = self.last_applied;
        let mut rest = Vec::new();
        for (index, ctx_id) in self.read_waiters.drain(..) {
            if index <= applied {
                if let Some(tx) = self.pending_reads.remove(&ctx_id) {
                    let _ = tx.send(Ok(index));
                }
            } else {
                rest.push((index, ctx_id));
            }
        }
        self.read_waiters = rest;
    }

    fn maybe_compact(&mut self) {
        let first = self.fsm.log.first_index();
        if self.last_applied + 1 > first
            && self.last_applied + 1 - first >= self.config.snapshot_threshold
        {
            self.schedule_snapshot(SnapshotPurpose::Compact);
        }
    }

    fn schedule_snapshot(&mut self, purpose: SnapshotPurpose) {
        if !self.snapshotting && self.snap_tx.try_send(purpose).is_ok() {
            self.snapshotting = true;
            return;
        }
        if !self.queued_snapshots.contains(&purpose) {
            self.queued_snapshots.push(purpose);
        }
    }

    fn drain_queued_snapshots(&mut self) {
        if let Some(purpose) = self.queued_snapshots.pop() {
            self.schedule_snapshot(purpose);
        }
    }

    fn on_snapshot_taken(
        &mut self,
        purpose: SnapshotPurpose,
        index: u64,
        data: Bytes,
    ) -> Result<(), StorageError> {
        if index == 0 {
            // Nothing applied yet; nothing worth snapshotting.
            for tx in self.compact_waiters.drain(..) {
                let _ = tx.send(Ok(0));
            }
            return Ok(());
        }

        let term = self.fsm.log.term(index).unwrap_or(0);
        let meta = SnapshotMeta {
            index,
            term,
            peers: self.fsm.peers(),
        };

        match purpose {
            SnapshotPurpose::ForPeer(peer) => {
                if data.len() as u64 > self.config.snapshot_max_bytes {
                    tracing::error!(
                        group = self.fsm.group,
                        bytes = data.len(),
                        limit = self.config.snapshot_max_bytes,
                        "snapshot exceeds the transfer limit"
                    );
                    self.fsm.snapshot_failed(peer);
                    return Ok(());
                }
                let mut m = Message::new(
                    MessageKind::Snapshot,
                    self.fsm.group,
                    self.fsm.id,
                    peer,
                    self.fsm.term,
                );
                m.snapshot = Some(meta);
                m.context = data;
                self.transport.send(Frame::Message(m));
                self.fsm.snapshot_sent(peer, index);
            }
            SnapshotPurpose::Compact => {
                self.fsm.log.storage().install_snapshot(&meta, &data)?;
                tracing::info!(
                    group = self.fsm.group,
                    id = self.fsm.id,
                    index = index,
                    "log compacted up to snapshot"
                );
                for tx in self.compact_waiters.drain(..) {
                    let _ = tx.send(Ok(index));
                }
            }
        }
        Ok(())
    }

    /// Persist, send, apply and resolve one `Ready`.
    async fn process_ready(&mut self) -> Result<(), StorageError> {
        if !self.fsm.has_ready() {
            return Ok(());
        }
        let ready = self.fsm.ready();

        self.persist(&ready)?;

        for m in &ready.messages {
            self.route_message(m);
        }

        self.hand_off_committed(&ready).await;

        if let Some((meta, data)) = &ready.snapshot {
            // Ordered behind earlier entry batches through the same queue.
            let _ = self
                .apply_tx
                .send(ApplyTask::Restore {
                    meta: meta.clone(),
                    data: data.clone(),
                })
                .await;
        }

        for peer in &ready.snapshot_requests {
            self.schedule_snapshot(SnapshotPurpose::ForPeer(*peer));
        }

        for rs in &ready.read_states {
            if rs.ctx.len() == 8 {
                let ctx_id = u64::from_be_bytes(rs.ctx[..8].try_into().expect("8 bytes"));
                self.read_waiters.push((rs.index, ctx_id));
            }
        }

        self.fsm.advance(&ready);
        self.resolve_reads();
        Ok(())
    }

    /// Durability first: hard state and entries reach the store before any
    /// message that depends on them is sent.
    fn persist(&mut self, ready: &Ready) -> Result<(), StorageError> {
        if let Some((meta, data)) = &ready.snapshot {
            let storage = self.fsm.log.storage();
            storage.truncate_above(meta.index)?;
            storage.install_snapshot(meta, data)?;
        }
        if let Some(hs) = &ready.hard_state {
            self.fsm.log.storage().save_hard_state(hs)?;
        }
        if !ready.entries.is_empty() {
            let storage = self.fsm.log.storage();
            let first = ready.entries[0].index;
            if first <= storage.last_index()? {
                // A new leader's suffix overwrites ours.
                storage.truncate_above(first - 1)?;
            }
            storage.append(&ready.entries)?;
        }
        Ok(())
    }

    fn route_message(&self, m: &Message) {
        // Plain heartbeats coalesce; everything else (including read-index
        // heartbeats, which carry a context) goes out directly.
        match m.kind {
            MessageKind::Heartbeat | MessageKind::HeartbeatResponse if m.context.is_empty() => {
                self.coalescer.add(
                    m.to,
                    m.kind == MessageKind::HeartbeatResponse,
                    GroupBeat {
                        group: m.group,
                        term: m.term,
                        commit: m.commit,
                    },
                );
            }
            _ => self.transport.send(Frame::Message(m.clone())),
        }
    }

    /// Split the committed batch into apply tasks, applying membership
    /// changes to the FSM as they cross the apply boundary.
    async fn hand_off_committed(&mut self, ready: &Ready) {
        if ready.committed_entries.is_empty() {
            return;
        }

        let mut run: Vec<Entry> = Vec::new();
        for entry in &ready.committed_entries {
            self.proposals.on_committed(entry);

            match entry.kind {
                EntryKind::ConfChange => {
                    if !run.is_empty() {
                        let _ = self.apply_tx.send(ApplyTask::Entries(std::mem::take(&mut run))).await;
                    }
                    match ConfChange::decode(&entry.data) {
                        Ok(cc) => {
                            self.fsm.apply_conf_change(&cc, entry.index);
                            let _ = self
                                .apply_tx
                                .send(ApplyTask::MemberChange {
                                    peers: self.fsm.peers(),
                                    index: entry.index,
                                })
                                .await;
                        }
                        Err(e) => {
                            tracing::error!(
                                group = self.fsm.group,
                                index = entry.index,
                                error = %e,
                                "undecodable conf change entry, skipping"
                            );
                            run.push(entry.clone());
                        }
                    }
                }
                EntryKind::LeaseRead => {
                    // The barrier commit is the quorum round: gate the read
                    // on the apply cursor reaching it.
                    if entry.data.len() == 8 {
                        let ctx_id = u64::from_be_bytes(entry.data[..8].try_into().expect("8 bytes"));
                        self.read_waiters.push((entry.index, ctx_id));
                    }
                    run.push(entry.clone());
                }
                EntryKind::Normal => run.push(entry.clone()),
            }
        }
        if !run.is_empty() {
            let _ = self.apply_tx.send(ApplyTask::Entries(run)).await;
        }
    }

    /// Post-Ready bookkeeping: leadership notifications and step-down fallout.
    async fn after_ready(&mut self) {
        let now = (self.fsm.leader, self.fsm.term);
        if now != self.prev_leader {
            self.prev_leader = now;
            tracing::info!(
                group = self.fsm.group,
                id = self.fsm.id,
                leader = now.0,
                term = now.1,
                "leader changed"
            );
            self.sm.lock().await.on_leader_change(now.0, now.1);
        }

        if self.fsm.role != Role::Leader {
            if !self.proposals.is_empty() {
                self.proposals.fail_uncommitted(RaftError::NotLeader {
                    group: self.fsm.group,
                    leader: (self.fsm.leader != crate::proto::NO_LEADER).then_some(self.fsm.leader),
                });
            }
            // Reads that never reached an index cannot be served here anymore.
            let resolvable: Vec<u64> = self.read_waiters.iter().map(|(_, id)| *id).collect();
            let orphaned: Vec<u64> = self
                .pending_reads
                .keys()
                .filter(|id| !resolvable.contains(id))
                .copied()
                .collect();
            for id in orphaned {
                if let Some(tx) = self.pending_reads.remove(&id) {
                    let _ = tx.send(Err(RaftError::NotLeader {
                        group: self.fsm.group,
                        leader: (self.fsm.leader != crate::proto::NO_LEADER).then_some(self.fsm.leader),
                    }));
                }
            }
        }
    }

    async fn abort(&mut self, err: RaftError) {
        tracing::error!(
            group = self.fsm.group,
            id = self.fsm.id,
            error = %err,
            "group aborting"
        );
        self.proposals.fail_all(err.clone());
        for (_, tx) in self.pending_reads.drain() {
            let _ = tx.send(Err(err.clone()));
        }
        for tx in self.compact_waiters.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
        self.sm.lock().await.on_fatal(&err);
        self.rx.close();
    }

    async fn shutdown(&mut self) {
        tracing::info!(group = self.fsm.group, id = self.fsm.id, "group stopped");
        let err = RaftError::Stopped(self.fsm.group);
        self.proposals.fail_all(err.clone());
        for (_, tx) in self.pending_reads.drain() {
            let _ = tx.send(Err(err.clone()));
        }
        for tx in self.compact_waiters.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
        // Dropping the task channels lets both workers run down their queues
        // and exit.
        self.rx.close();
    }
}
