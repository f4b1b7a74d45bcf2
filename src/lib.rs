//! Multi-group Raft consensus for replicated storage partitions.
//!
//! One host runs many independent raft groups (one per partition) over a
//! shared transport. Each group replicates a log into a [`LogStorage`] and
//! applies committed entries to a [`StateMachine`]; heartbeats between the
//! same pair of hosts are coalesced across groups.
//!
//! The crate is layered leaves-first:
//!
//! - [`storage`]: the stable-store contract and an in-memory store
//! - `log`: stable prefix plus unstable tail, conflict handling
//! - `progress`: the leader's per-peer replication window
//! - `fsm`: the consensus state machine (elections, replication, commit,
//!   membership, lease reads, leadership transfer)
//! - `group`: the per-group runtime actor and its apply/snapshot workers
//! - [`transport`]: framed TCP with per-peer sender classes
//! - `server`: the per-host registry, shared tick and admin surface
//!
//! ```ignore
//! let config = Config { election_tick: 10, heartbeat_tick: 1, ..Default::default() };
//! let resolver = Arc::new(StaticResolver::new());
//! let transport = Arc::new(TcpTransport::new(resolver.clone(), 1024));
//! let server = RaftServer::new(1, config, transport.clone())?;
//! transport.listen(listen_addr, server.handler()).await?;
//!
//! let group = server.create_group(7, &peers, storage, state_machine)?;
//! let index = group.propose(Bytes::from("put k v")).await?;
//! ```

#![deny(unused_qualifications)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::type_complexity)]

mod coalesce;
mod config;
mod error;
mod fsm;
mod group;
mod log;
mod progress;
mod quorum;
mod server;
mod status;

pub mod proto;
pub mod storage;
pub mod transport;

pub use anyerror;
pub use anyerror::AnyError;

pub use crate::coalesce::HeartbeatCoalescer;
pub use crate::config::Config;
pub use crate::error::ConfigError;
pub use crate::error::ErrorSubject;
pub use crate::error::ErrorVerb;
pub use crate::error::FatalError;
pub use crate::error::RaftError;
pub use crate::error::StorageError;
pub use crate::fsm::ReadState;
pub use crate::fsm::Role;
pub use crate::group::RaftGroup;
pub use crate::group::StateMachine;
pub use crate::progress::ProgressState;
pub use crate::server::RaftServer;
pub use crate::status::ReplicaStatus;
pub use crate::status::Status;
pub use crate::storage::LogStorage;
pub use crate::storage::MemStorage;
pub use crate::transport::AddressResolver;
pub use crate::transport::SenderClass;
pub use crate::transport::StaticResolver;
pub use crate::transport::TcpTransport;
pub use crate::transport::Transport;
