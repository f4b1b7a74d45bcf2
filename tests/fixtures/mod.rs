//! Fixtures for cluster tests: an in-memory router transport, a register
//! state machine and a multi-node harness.

#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use anyerror::AnyError;
use async_trait::async_trait;
use bytes::Bytes;
use polyraft::proto::Frame;
use polyraft::proto::GroupId;
use polyraft::proto::NodeId;
use polyraft::proto::Peer;
use polyraft::proto::SnapshotMeta;
use polyraft::transport::FrameHandler;
use polyraft::Config;
use polyraft::MemStorage;
use polyraft::RaftError;
use polyraft::RaftServer;
use polyraft::Role;
use polyraft::StateMachine;
use polyraft::Status;
use polyraft::Transport;
use serde::Deserialize;
use serde::Serialize;

pub fn init_tracing() {
    static START: Once = Once::new();
    START.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn test_config() -> Config {
    Config {
        tick_interval_ms: 10,
        election_tick: 10,
        heartbeat_tick: 1,
        ..Default::default()
    }
}

// ----------------------------------------------------------------------
// Router transport.

#[derive(Default)]
struct RouterInner {
    handlers: RwLock<HashMap<NodeId, Arc<dyn FrameHandler>>>,
    down: RwLock<HashSet<NodeId>>,
    isolated: RwLock<HashSet<NodeId>>,
}

/// Delivers frames between in-process nodes, dropping traffic to and from
/// stopped ones.
#[derive(Clone, Default)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, handler: Arc<dyn FrameHandler>) {
        self.inner.handlers.write().unwrap().insert(node, handler);
        self.inner.down.write().unwrap().remove(&node);
    }

    pub fn deregister(&self, node: NodeId) {
        self.inner.handlers.write().unwrap().remove(&node);
        self.inner.down.write().unwrap().insert(node);
    }

    /// Cut a live node off from everyone without stopping it.
    pub fn isolate(&self, node: NodeId) {
        self.inner.isolated.write().unwrap().insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        self.inner.isolated.write().unwrap().remove(&node);
    }

    pub fn transport_for(&self, node: NodeId) -> Arc<RouterTransport> {
        Arc::new(RouterTransport {
            node,
            router: self.clone(),
        })
    }
}

pub struct RouterTransport {
    node: NodeId,
    router: Router,
}

impl Transport for RouterTransport {
    fn send(&self, frame: Frame) {
        let inner = &self.router.inner;
        if inner.down.read().unwrap().contains(&self.node) {
            return;
        }
        {
            let isolated = inner.isolated.read().unwrap();
            if isolated.contains(&self.node) || isolated.contains(&frame.to()) {
                return;
            }
        }
        let handler = inner.handlers.read().unwrap().get(&frame.to()).cloned();
        if let Some(handler) = handler {
            let from = self.node;
            handler.handle(from, frame);
        }
    }
}

// ----------------------------------------------------------------------
// Test state machine.

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SmState {
    pub data: Vec<Vec<u8>>,
    pub applied: u64,
    #[serde(skip)]
    pub leader: (NodeId, u64),
    #[serde(skip)]
    pub members: Vec<Peer>,
    #[serde(skip)]
    pub fatal: Option<String>,
    #[serde(skip)]
    pub restored_from: Option<u64>,
}

/// Appends every applied payload to a vector; snapshots are the bincoded
/// vector.
pub struct RegisterSm {
    state: Arc<Mutex<SmState>>,
}

impl RegisterSm {
    pub fn new() -> (Self, Arc<Mutex<SmState>>) {
        let state = Arc::new(Mutex::new(SmState::default()));
        (Self { state: state.clone() }, state)
    }
}

#[async_trait]
impl StateMachine for RegisterSm {
    async fn apply(&mut self, entry: &polyraft::proto::Entry) -> Result<(), AnyError> {
        let mut state = self.state.lock().unwrap();
        state.data.push(entry.data.to_vec());
        state.applied = entry.index;
        Ok(())
    }

    async fn apply_member_change(&mut self, peers: &[Peer], index: u64) -> Result<(), AnyError> {
        let mut state = self.state.lock().unwrap();
        state.members = peers.to_vec();
        state.applied = index;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Bytes, AnyError> {
        let state = self.state.lock().unwrap();
        let bytes = bincode::serialize(&*state).map_err(|e| AnyError::new(&e))?;
        Ok(Bytes::from(bytes))
    }

    async fn restore_snapshot(&mut self, meta: &SnapshotMeta, data: Bytes) -> Result<(), AnyError> {
        let restored: SmState = bincode::deserialize(&data).map_err(|e| AnyError::new(&e))?;
        let mut state = self.state.lock().unwrap();
        state.data = restored.data;
        state.applied = meta.index;
        state.restored_from = Some(meta.index);
        Ok(())
    }

    fn on_leader_change(&mut self, leader: NodeId, term: u64) {
        self.state.lock().unwrap().leader = (leader, term);
    }

    fn on_fatal(&mut self, err: &RaftError) {
        self.state.lock().unwrap().fatal = Some(err.to_string());
    }
}

// ----------------------------------------------------------------------
// Cluster harness.

pub const GROUP: GroupId = 1;

pub struct TestNode {
    pub id: NodeId,
    pub server: RaftServer,
    pub storage: MemStorage,
    pub sm: Arc<Mutex<SmState>>,
}

pub struct TestCluster {
    pub config: Config,
    pub router: Router,
    pub peers: Vec<Peer>,
    pub nodes: HashMap<NodeId, TestNode>,
}

impl TestCluster {
    /// `n` voters with ids `1..=n`, one group, all started.
    pub async fn new(n: u64, config: Config) -> Self {
        let peers: Vec<Peer> = (1..=n).map(Peer::new).collect();
        Self::with_peers(&peers, config).await
    }

    pub async fn with_peers(peers: &[Peer], config: Config) -> Self {
        init_tracing();
        let mut cluster = Self {
            config,
            router: Router::new(),
            peers: peers.to_vec(),
            nodes: HashMap::new(),
        };
        for peer in peers {
            cluster.start_node(peer.id, MemStorage::new());
        }
        cluster
    }

    /// Boot a node against `storage` and register it with the router.
    pub fn start_node(&mut self, id: NodeId, storage: MemStorage) {
        let transport = self.router.transport_for(id);
        let server = RaftServer::new(id, self.config.clone(), transport).unwrap();
        self.router.register(id, server.handler());

        let (sm, sm_state) = RegisterSm::new();
        server.create_group(GROUP, &self.peers, storage.clone(), sm).unwrap();

        self.nodes.insert(id, TestNode {
            id,
            server,
            storage,
            sm: sm_state,
        });
    }

    /// Stop a node, keeping its "disk" for a later restart.
    pub async fn stop_node(&mut self, id: NodeId) -> MemStorage {
        self.router.deregister(id);
        let node = self.nodes.remove(&id).expect("node exists");
        node.server.stop().await;
        node.storage
    }

    pub async fn restart_node(&mut self, id: NodeId, storage: MemStorage) {
        self.start_node(id, storage);
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[&id]
    }

    pub async fn status(&self, id: NodeId) -> Status {
        self.nodes[&id].server.status(GROUP).await.unwrap()
    }

    /// Wait until exactly one live node leads the group; panics on timeout.
    pub async fn wait_leader(&self) -> NodeId {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let mut leaders = Vec::new();
            let mut known = Vec::new();
            for node in self.nodes.values() {
                if let Ok(status) = node.server.status(GROUP).await {
                    if status.role == Role::Leader {
                        leaders.push((node.id, status.term));
                    }
                    known.push((node.id, status.leader, status.term));
                }
            }

            if leaders.len() == 1 {
                let (leader, term) = leaders[0];
                // Settled once every live node agrees.
                if known.iter().all(|(_, l, t)| *l == leader && *t == term) {
                    return leader;
                }
            }
            if Instant::now() > deadline {
                panic!("no settled leader; observed: {:?}", known);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until `id` reports no leader (stepped down, lost quorum).
    pub async fn wait_no_leader(&self, id: NodeId) -> Duration {
        let start = Instant::now();
        let deadline = start + Duration::from_secs(10);
        loop {
            let status = self.status(id).await;
            if status.leader == 0 && status.role != Role::Leader {
                return start.elapsed();
            }
            if Instant::now() > deadline {
                panic!("node {} still sees leader {}", id, status.leader);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the node's applied data equals `want`.
    pub async fn wait_applied(&self, id: NodeId, want: &[&[u8]]) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            {
                let state = self.nodes[&id].sm.lock().unwrap();
                if state.data == want.iter().map(|d| d.to_vec()).collect::<Vec<_>>() {
                    return;
                }
                if Instant::now() > deadline {
                    panic!("node {} applied {:?}, want {:?}", id, state.data, want);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the node's apply cursor reaches `index`.
    pub async fn wait_applied_index(&self, id: NodeId, index: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = self.status(id).await;
            if status.applied >= index {
                return;
            }
            if Instant::now() > deadline {
                panic!("node {} applied {} < {}", id, status.applied, index);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn applied_data(&self, id: NodeId) -> Vec<Vec<u8>> {
        self.nodes[&id].sm.lock().unwrap().data.clone()
    }

    pub async fn stop_all(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.stop_node(id).await;
        }
    }
}
