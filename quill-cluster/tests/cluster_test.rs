//! Three-node cluster tests: replication, membership, and divergence.

use std::time::Duration;

use quill_cluster::{Config, DistributedLog, RaftConfig, StreamLayer};
use quill_proto::Record;
use tempfile::TempDir;
use tokio::net::TcpListener;

struct Node {
    log: DistributedLog,
    addr: String,
    _dir: TempDir,
}

async fn start_node(id: u64, bootstrap: bool) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let layer = StreamLayer::new(listener, None, None).unwrap();
    let addr = layer.local_addr().to_string();

    let config = Config {
        log: quill_log::Config::default(),
        raft: RaftConfig {
            heartbeat_timeout: Some(Duration::from_millis(50)),
            election_timeout: Some(Duration::from_millis(150)),
            leader_lease_timeout: None,
            commit_timeout: Some(Duration::from_millis(5)),
            ..RaftConfig::new(id, layer)
        }
        .with_bootstrap(bootstrap),
    };

    let log = DistributedLog::new(dir.path(), config).await.unwrap();
    Node {
        log,
        addr,
        _dir: dir,
    }
}

fn record(value: &str) -> Record {
    Record {
        value: value.as_bytes().to_vec(),
        ..Default::default()
    }
}

/// Polls `check` every 50 ms until it passes or the deadline expires.
async fn eventually(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multiple_nodes() {
    let mut nodes: Vec<Node> = Vec::new();
    for id in 1..=3u64 {
        let node = start_node(id, id == 1).await;
        if id == 1 {
            node.log
                .wait_for_leader(Duration::from_secs(3))
                .await
                .unwrap();
        } else {
            nodes[0].log.join(id, &node.addr).await.unwrap();
        }
        nodes.push(node);
    }

    // Appends on the leader become readable on every replica.
    for (i, value) in ["first", "second"].iter().enumerate() {
        let offset = nodes[0].log.append(record(value)).await.unwrap();
        assert_eq!(offset, i as u64);

        let replicated = eventually(Duration::from_millis(500), || {
            nodes.iter().all(|node| {
                node.log
                    .read(offset)
                    .is_ok_and(|got| got.value == value.as_bytes() && got.offset == offset)
            })
        })
        .await;
        assert!(replicated, "offset {offset} did not replicate in time");
    }

    // The leader reports all three servers, itself as the only leader.
    let servers = nodes[0].log.get_servers();
    assert_eq!(servers.len(), 3);
    for server in &servers {
        assert_eq!(server.is_leader, server.id == "1");
    }

    // Drop replica 2 from the cluster.
    nodes[0].log.leave(2).await.unwrap();
    let shrunk = eventually(Duration::from_millis(500), || {
        nodes[0].log.get_servers().len() == 2
    })
    .await;
    assert!(shrunk, "membership did not shrink after leave");

    // New appends reach the remaining replica but not the removed one.
    let offset = nodes[0].log.append(record("third")).await.unwrap();
    assert_eq!(offset, 2);

    let caught_up = eventually(Duration::from_millis(500), || {
        nodes[2]
            .log
            .read(offset)
            .is_ok_and(|got| got.value == b"third" && got.offset == offset)
    })
    .await;
    assert!(caught_up, "replica 3 did not receive the append");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = nodes[1].log.read(offset).unwrap_err();
    assert!(err.is_out_of_range(), "removed replica should lag: {err}");

    for node in &nodes {
        node.log.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_append_on_follower_fails() {
    let mut nodes: Vec<Node> = Vec::new();
    for id in 1..=2u64 {
        let node = start_node(id, id == 1).await;
        if id == 1 {
            node.log
                .wait_for_leader(Duration::from_secs(3))
                .await
                .unwrap();
        } else {
            nodes[0].log.join(id, &node.addr).await.unwrap();
        }
        nodes.push(node);
    }

    let err = nodes[1].log.append(record("nope")).await.unwrap_err();
    assert!(
        matches!(err, quill_cluster::ClusterError::NotLeader { .. }),
        "append on follower returned {err}"
    );

    for node in &nodes {
        node.log.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_durability() {
    let dir = tempfile::tempdir().unwrap();

    let build_config = |layer: StreamLayer| Config {
        log: quill_log::Config::default(),
        raft: RaftConfig {
            heartbeat_timeout: Some(Duration::from_millis(50)),
            election_timeout: Some(Duration::from_millis(150)),
            ..RaftConfig::new(1, layer)
        }
        .with_bootstrap(true),
    };

    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let layer = StreamLayer::new(listener, None, None).unwrap();
        let log = DistributedLog::new(dir.path(), build_config(layer))
            .await
            .unwrap();
        log.wait_for_leader(Duration::from_secs(3)).await.unwrap();

        for value in ["one", "two", "three"] {
            log.append(record(value)).await.unwrap();
        }
        log.shutdown().await.unwrap();
    }

    // A restarted replica re-applies its consensus log and serves the same
    // offsets.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let layer = StreamLayer::new(listener, None, None).unwrap();
    let log = DistributedLog::new(dir.path(), build_config(layer))
        .await
        .unwrap();
    log.wait_for_leader(Duration::from_secs(3)).await.unwrap();

    let recovered = eventually(Duration::from_secs(2), || {
        (0..3u64).all(|offset| log.read(offset).is_ok())
    })
    .await;
    assert!(recovered, "records were not recovered after restart");
    assert_eq!(log.read(1).unwrap().value, b"two");

    log.shutdown().await.unwrap();
}
