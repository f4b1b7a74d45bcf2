//! The host-level shell: group registry, shared tick, frame dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::coalesce::HeartbeatCoalescer;
use crate::config::Config;
use crate::error::ConfigError;
use crate::error::FatalError;
use crate::error::RaftError;
use crate::group::spawn_group;
use crate::group::RaftGroup;
use crate::group::StateMachine;
use crate::proto::ConfChange;
use crate::proto::Frame;
use crate::proto::GroupId;
use crate::proto::Message;
use crate::proto::MessageKind;
use crate::proto::NodeId;
use crate::proto::Peer;
use crate::status::Status;
use crate::storage::LogStorage;
use crate::transport::FrameHandler;
use crate::transport::Transport;

/// One raft host: a registry of groups sharing a tick source, a transport
/// and a heartbeat coalescer.
///
/// Wiring order: build the server, register [`RaftServer::handler`] with the
/// transport's receive side, then create groups.
#[derive(Clone)]
pub struct RaftServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    node_id: NodeId,
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    coalescer: Arc<HeartbeatCoalescer>,
    groups: RwLock<HashMap<GroupId, RaftGroup>>,
    /// Frames for groups that may still be loading, kept briefly.
    unknown: Mutex<Vec<(Instant, Frame)>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl RaftServer {
    pub fn new(
        node_id: NodeId,
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        assert_ne!(node_id, 0, "node id 0 is reserved");
        let config = Arc::new(config.validate()?);

        let inner = Arc::new(ServerInner {
            node_id,
            config: config.clone(),
            transport,
            coalescer: Arc::new(HeartbeatCoalescer::new(node_id)),
            groups: RwLock::new(HashMap::new()),
            unknown: Mutex::new(Vec::new()),
            tick_task: Mutex::new(None),
        });

        let tick_handle = tokio::spawn(tick_loop(inner.clone()));
        *inner.tick_task.lock().unwrap() = Some(tick_handle);

        tracing::info!(node = node_id, "raft server started");
        Ok(Self { inner })
    }

    /// The receive side to plug into the transport listener.
    pub fn handler(&self) -> Arc<dyn FrameHandler> {
        self.inner.clone()
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// Start replicating one partition on this host.
    pub fn create_group<S, M>(
        &self,
        group: GroupId,
        peers: &[Peer],
        storage: S,
        state_machine: M,
    ) -> Result<RaftGroup, RaftError>
    where
        S: LogStorage,
        M: StateMachine,
    {
        let mut groups = self.inner.groups.write().unwrap();
        if groups.contains_key(&group) {
            return Err(RaftError::InvalidConfig(format!("group {} already exists", group)));
        }

        let handle = spawn_group(
            self.inner.node_id,
            group,
            peers,
            self.inner.config.clone(),
            storage,
            state_machine,
            self.inner.transport.clone(),
            self.inner.coalescer.clone(),
        )
        .map_err(|e| RaftError::Fatal(FatalError::Storage(e)))?;

        groups.insert(group, handle.clone());
        tracing::info!(node = self.inner.node_id, group = group, "group created");
        Ok(handle)
    }

    /// Stop a group and drop it from the registry. Deleting its stable state
    /// is the caller's decision.
    pub async fn remove_group(&self, group: GroupId) {
        let handle = self.inner.groups.write().unwrap().remove(&group);
        if let Some(handle) = handle {
            handle.stop().await;
            tracing::info!(node = self.inner.node_id, group = group, "group removed");
        }
    }

    pub fn group(&self, group: GroupId) -> Option<RaftGroup> {
        self.inner.groups.read().unwrap().get(&group).cloned()
    }

    fn require_group(&self, group: GroupId) -> Result<RaftGroup, RaftError> {
        self.group(group).ok_or(RaftError::Stopped(group))
    }

    pub async fn propose(&self, group: GroupId, data: Bytes) -> Result<u64, RaftError> {
        self.require_group(group)?.propose(data).await
    }

    pub async fn change_member(&self, group: GroupId, cc: ConfChange) -> Result<u64, RaftError> {
        self.require_group(group)?.change_member(cc).await
    }

    pub async fn read_index(&self, group: GroupId) -> Result<u64, RaftError> {
        self.require_group(group)?.read_index().await
    }

    pub async fn transfer_leader(&self, group: GroupId, target: NodeId) -> Result<(), RaftError> {
        self.require_group(group)?.transfer_leader(target).await
    }

    pub async fn status(&self, group: GroupId) -> Result<Status, RaftError> {
        self.require_group(group)?.status().await
    }

    pub async fn snapshot(&self, group: GroupId) -> Result<u64, RaftError> {
        self.require_group(group)?.snapshot().await
    }

    /// Stop every group and the shared tick.
    pub async fn stop(&self) {
        if let Some(handle) = self.inner.tick_task.lock().unwrap().take() {
            handle.abort();
        }

        let handles: Vec<RaftGroup> = {
            let mut groups = self.inner.groups.write().unwrap();
            groups.drain().map(|(_, g)| g).collect()
        };
        futures::future::join_all(handles.iter().map(|g| g.stop())).await;
        tracing::info!(node = self.inner.node_id, "raft server stopped");
    }
}

impl ServerInner {
    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Message(m) => self.dispatch_message(m),
            Frame::Heartbeats(batch) => {
                // Each beat is applied to its group independently; one stale
                // term must not short-circuit the rest of the batch.
                let kind = if batch.reply {
                    MessageKind::HeartbeatResponse
                } else {
                    MessageKind::Heartbeat
                };
                for beat in batch.beats {
                    let mut m = Message::new(kind, beat.group, batch.from, batch.to, beat.term);
                    m.commit = beat.commit;
                    self.dispatch_message(m);
                }
            }
        }
    }

    fn dispatch_message(&self, m: Message) {
        let group = self.groups.read().unwrap().get(&m.group).cloned();
        match group {
            Some(g) => g.deliver(m),
            None => {
                tracing::debug!(group = m.group, kind = %m.kind, "message for unknown group, buffering");
                let mut unknown = self.unknown.lock().unwrap();
                // Bounded: this buffer only papers over group-load races.
                if unknown.len() < 1024 {
                    unknown.push((Instant::now(), Frame::Message(m)));
                }
            }
        }
    }

    /// Re-dispatch buffered frames for groups that have appeared, dropping
    /// what has outlived the grace window.
    fn retry_unknown(&self) {
        let deadline = self.config.tick_interval() * self.config.unknown_group_ticks as u32;
        let drained: Vec<(Instant, Frame)> = {
            let mut unknown = self.unknown.lock().unwrap();
            if unknown.is_empty() {
                return;
            }
            std::mem::take(&mut *unknown)
        };

        for (at, frame) in drained {
            let Frame::Message(m) = frame else { continue };
            let group = self.groups.read().unwrap().get(&m.group).cloned();
            match group {
                Some(g) => g.deliver(m),
                None if at.elapsed() < deadline => {
                    self.unknown.lock().unwrap().push((at, Frame::Message(m)));
                }
                None => {
                    tracing::debug!(group = m.group, "dropping message for unknown group");
                }
            }
        }
    }
}

impl FrameHandler for ServerInner {
    fn handle(&self, _from: NodeId, frame: Frame) {
        self.dispatch(frame);
    }
}

/// One shared clock: tick every group, then flush the coalesced heartbeats
/// the leaders among them produced this tick.
async fn tick_loop(inner: Arc<ServerInner>) {
    let mut interval = tokio::time::interval(inner.config.tick_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let groups: Vec<RaftGroup> = inner.groups.read().unwrap().values().cloned().collect();
        for group in &groups {
            group.tick();
        }

        inner.coalescer.flush(inner.transport.as_ref());
        inner.retry_unknown();
    }
}
