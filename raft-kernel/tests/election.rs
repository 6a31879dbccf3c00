//! Leader election on simulated and TCP clusters.

use std::time::Duration;

use anyhow::Result;
use raft_kernel::meta::Meta;
use raft_kernel::role::RoleKind;
use raft_kernel::runtime::{start_tcp_node, LocalCluster};
use raft_kernel::transport::{self, TransportConfig};

const SETTLE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_five_nodes_elect_a_single_leader() -> Result<()> {
    let cluster = LocalCluster::start(5, |_| {})?;
    let leader = cluster.wait_for_leader(SETTLE).await?;

    let statuses = cluster.statuses().await;
    assert_eq!(statuses.len(), 5);
    let term = statuses[leader as usize].term;
    assert!(term >= 1, "a leader is only elected after a term bump");
    for status in &statuses {
        assert_eq!(status.term, term);
        if status.id != leader {
            assert_eq!(status.role, RoleKind::Follower);
        }
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_leader_failure_elects_a_replacement() -> Result<()> {
    let cluster = LocalCluster::start(5, |_| {})?;
    let old = cluster.wait_for_leader(SETTLE).await?;
    let old_term = cluster.node(old).status().await?.term;

    cluster.network().isolate(old);
    let new = cluster.wait_for_leader(SETTLE).await?;
    assert_ne!(new, old);
    let new_term = cluster.node(new).status().await?.term;
    assert!(new_term > old_term);

    // The old leader still believes it leads until it hears the new term.
    cluster.network().heal(old);
    let settled = cluster.wait_for_leader(SETTLE).await?;
    assert_eq!(settled, new);
    let rejoined = cluster.node(old).status().await?;
    assert_eq!(rejoined.role, RoleKind::Follower);
    assert_eq!(rejoined.term, new_term);

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_isolated_node_does_not_inflate_its_term() -> Result<()> {
    let cluster = LocalCluster::start(5, |_| {})?;
    let leader = cluster.wait_for_leader(SETTLE).await?;
    let lonely = (leader + 1) % 5;
    let before = cluster.node(lonely).status().await?.term;

    cluster.network().isolate(lonely);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Pre-vote never reaches a quorum, so no election is ever started.
    let status = cluster.node(lonely).status().await?;
    assert_eq!(status.role, RoleKind::Candidate);
    assert_eq!(status.term, before);

    cluster.network().heal(lonely);
    cluster.wait_for_leader(SETTLE).await?;
    assert_eq!(cluster.statuses().await.len(), 5);

    cluster.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_tcp_cluster_elects_and_serves_sync_writes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dns: Vec<String> = (0..3).map(|i| format!("127.0.0.1:{}", 17410 + i)).collect();

    let mut nodes = Vec::new();
    for id in 0..3u64 {
        let meta = Meta {
            dns: dns.clone(),
            ..Meta::for_member(id, 3)
        };
        let meta_path = dir.path().join(format!("node{id}.json"));
        std::fs::write(&meta_path, meta.to_json()?)?;
        let log_path = dir.path().join(format!("node{id}.log"));
        nodes.push(start_tcp_node(meta_path, log_path, None, TransportConfig::default()).await?);
    }

    let deadline = tokio::time::Instant::now() + SETTLE;
    let leader = loop {
        let mut leaders = Vec::new();
        for node in &nodes {
            let status = node.handle.status().await?;
            if status.role == RoleKind::Leader {
                leaders.push(status.id);
            }
        }
        if leaders.len() == 1 {
            break leaders[0];
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "no single leader over TCP"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let reply = transport::request(&dns[leader as usize], true, "set a 1").await?;
    assert!(reply.ok, "sync write failed: {}", reply.output);
    assert_eq!(reply.output, "a = 1");

    let follower = (leader + 1) % 3;
    let refused = transport::request(&dns[follower as usize], true, "set b 2").await?;
    assert!(!refused.ok);

    // Storage flushes on its own thread, shortly after the reply.
    let log_file = dir.path().join(format!("node{leader}.log"));
    let mut persisted = String::new();
    for _ in 0..40 {
        persisted = std::fs::read_to_string(&log_file).unwrap_or_default();
        if !persisted.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(persisted.ends_with("^set a 1\n"), "log file: {persisted:?}");

    for node in &nodes {
        node.handle.shutdown()?;
    }
    Ok(())
}
