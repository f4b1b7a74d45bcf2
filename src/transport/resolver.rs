//! Node-id to network-address resolution.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use crate::proto::NodeId;
use crate::transport::SenderClass;

/// Resolve a peer's listening address for one sender class.
///
/// The deployment layer implements this against its own membership store;
/// hosts may expose separate heartbeat and replication ports, and a resolver
/// may return different addresses over time as peers move.
pub trait AddressResolver: Send + Sync + 'static {
    fn node_address(&self, node: NodeId, class: SenderClass) -> Option<SocketAddr>;
}

/// A fixed table, for tests and single-file deployments.
#[derive(Debug, Default)]
pub struct StaticResolver {
    addrs: RwLock<HashMap<(NodeId, SenderClass), SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one address for both sender classes.
    pub fn register(&self, node: NodeId, addr: SocketAddr) {
        let mut addrs = self.addrs.write().unwrap();
        addrs.insert((node, SenderClass::Heartbeat), addr);
        addrs.insert((node, SenderClass::Replicate), addr);
    }

    /// Register a class-specific address, e.g. a dedicated heartbeat port.
    pub fn register_class(&self, node: NodeId, class: SenderClass, addr: SocketAddr) {
        self.addrs.write().unwrap().insert((node, class), addr);
    }
}

impl AddressResolver for StaticResolver {
    fn node_address(&self, node: NodeId, class: SenderClass) -> Option<SocketAddr> {
        self.addrs.read().unwrap().get(&(node, class)).copied()
    }
}
