//! Many groups on one host sharing a transport and coalesced heartbeats.

mod fixtures;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use fixtures::test_config;
use fixtures::RegisterSm;
use fixtures::Router;
use fixtures::SmState;
use polyraft::proto::GroupId;
use polyraft::proto::NodeId;
use polyraft::proto::Peer;
use polyraft::MemStorage;
use polyraft::RaftServer;
use polyraft::Role;

const GROUPS: [GroupId; 4] = [10, 11, 12, 13];

struct Host {
    server: RaftServer,
    sms: HashMap<GroupId, Arc<Mutex<SmState>>>,
}

async fn status_of(host: &Host, group: GroupId) -> polyraft::Status {
    host.server.status(group).await.unwrap()
}

/// Every group elects independently; proposals in each land only in that
/// group's state machine. Heartbeats between host pairs ride the coalescer.
#[tokio::test(flavor = "multi_thread")]
async fn test_independent_groups_share_one_transport() {
    fixtures::init_tracing();
    let router = Router::new();
    let peers: Vec<Peer> = (1..=3).map(Peer::new).collect();

    let mut hosts: HashMap<NodeId, Host> = HashMap::new();
    for id in 1..=3 {
        let transport = router.transport_for(id);
        let server = RaftServer::new(id, test_config(), transport).unwrap();
        router.register(id, server.handler());

        let mut sms = HashMap::new();
        for group in GROUPS {
            let (sm, state) = RegisterSm::new();
            server.create_group(group, &peers, MemStorage::new(), sm).unwrap();
            sms.insert(group, state);
        }
        hosts.insert(id, Host { server, sms });
    }

    // One leader per group, possibly on different hosts.
    let mut leaders: HashMap<GroupId, NodeId> = HashMap::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while leaders.len() < GROUPS.len() {
        assert!(Instant::now() < deadline, "leaders: {:?}", leaders);
        for group in GROUPS {
            if leaders.contains_key(&group) {
                continue;
            }
            for host in hosts.values() {
                let status = status_of(host, group).await;
                if status.role == Role::Leader {
                    leaders.insert(group, status.id);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Propose distinct payloads per group.
    for group in GROUPS {
        let leader = leaders[&group];
        let payload = format!("g{}", group);
        hosts[&leader]
            .server
            .propose(group, Bytes::from(payload))
            .await
            .unwrap();
    }

    // Each payload lands in exactly its group's state machine, on all hosts.
    for group in GROUPS {
        let want = format!("g{}", group).into_bytes();
        let deadline = Instant::now() + Duration::from_secs(5);
        for host in hosts.values() {
            loop {
                let data = host.sms[&group].lock().unwrap().data.clone();
                if data == vec![want.clone()] {
                    break;
                }
                assert!(
                    Instant::now() < deadline,
                    "group {} data {:?}",
                    group,
                    data,
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    // Leaders keep their leases across many ticks: coalesced heartbeats are
    // reaching every follower group.
    tokio::time::sleep(Duration::from_millis(500)).await;
    for group in GROUPS {
        let leader = leaders[&group];
        let status = status_of(&hosts[&leader], group).await;
        assert_eq!(Role::Leader, status.role, "group {} lost its leader", group);
    }

    for host in hosts.values() {
        host.server.stop().await;
    }
}

/// Removing one group leaves the others undisturbed.
#[tokio::test(flavor = "multi_thread")]
async fn test_remove_group_is_isolated() {
    fixtures::init_tracing();
    let router = Router::new();
    let peers: Vec<Peer> = (1..=3).map(Peer::new).collect();

    let mut servers: HashMap<NodeId, RaftServer> = HashMap::new();
    for id in 1..=3 {
        let transport = router.transport_for(id);
        let server = RaftServer::new(id, test_config(), transport).unwrap();
        router.register(id, server.handler());
        for group in [20u64, 21] {
            let (sm, _) = RegisterSm::new();
            server.create_group(group, &peers, MemStorage::new(), sm).unwrap();
        }
        servers.insert(id, server);
    }

    // Wait for both groups to settle.
    for group in [20u64, 21] {
        let deadline = Instant::now() + Duration::from_secs(10);
        'outer: loop {
            assert!(Instant::now() < deadline);
            for server in servers.values() {
                if server.status(group).await.unwrap().role == Role::Leader {
                    break 'outer;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    for server in servers.values() {
        server.remove_group(20).await;
        assert!(server.group(20).is_none());
    }

    // Group 21 still commits.
    let mut done = false;
    for server in servers.values() {
        if let Ok(index) = server.propose(21, Bytes::from_static(b"x")).await {
            assert!(index > 0);
            done = true;
            break;
        }
    }
    assert!(done, "no live leader accepted the proposal for group 21");

    for server in servers.values() {
        server.stop().await;
    }
}
