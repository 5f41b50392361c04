mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use confraft::error::CommandStatus;
use confraft::State;
use fixtures::Router;

/// Single-server cluster life cycle.
///
/// - create a cluster with one member and an initial `{}` snapshot.
/// - the node elects itself and commits a command after one durability
///   cycle, landing at index 2.
/// - the application stream starts with the snapshot, then the command.
///
/// RUST_LOG=confraft,single_node=trace cargo test --test single_node
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn single_node_commits() -> Result<()> {
    fixtures::init_tracing();
    let router = Arc::new(Router::new(fixtures::test_config()));

    tracing::info!("--- creating single node cluster");
    let s1 = router.new_cluster_node(6641).await?;
    router.wait_for_state(&s1, State::Leader, "seed becomes leader").await?;

    tracing::info!("--- application restores the initial snapshot");
    let snap = router.expect_entry(s1).await?;
    assert!(snap.is_snapshot);
    assert_eq!(snap.data, b"{}".to_vec());
    assert_eq!(snap.index, 1);

    tracing::info!("--- committing the first command");
    let status = router.client_request(s1, b"cmd1").await?;
    assert_eq!(status, CommandStatus::Success);

    router
        .wait(&s1, None)
        .await?
        .metrics(
            |m| m.commit_index == 2 && m.last_applied == 2,
            "first command at index 2",
        )
        .await?;

    let entry = router.expect_entry(s1).await?;
    assert!(!entry.is_snapshot);
    assert_eq!(entry.data, b"cmd1".to_vec());
    assert_eq!(entry.index, 2);

    Ok(())
}

/// A command with a stale prerequisite is refused without touching the log.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn bad_prereq_is_refused() -> Result<()> {
    fixtures::init_tracing();
    let router = Arc::new(Router::new(fixtures::test_config()));

    let s1 = router.new_cluster_node(6651).await?;
    router.wait_for_state(&s1, State::Leader, "seed becomes leader").await?;
    let before = router.metrics_of(&s1).await?.last_log_index;

    let raft = router.raft_handle(&s1).await?;
    let mut command = raft.execute(b"cmd".to_vec(), Some(999)).await?;
    assert_eq!(command.wait().await, CommandStatus::BadPrereq);
    assert_eq!(router.metrics_of(&s1).await?.last_log_index, before);

    Ok(())
}

/// Restarting a node replays its store: the log, the snapshot, and the
/// membership all survive, and committed commands are re-delivered to the
/// application in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn restart_replays_the_store() -> Result<()> {
    fixtures::init_tracing();
    let router = Arc::new(Router::new(fixtures::test_config()));

    let s1 = router.new_cluster_node(6661).await?;
    router.wait_for_state(&s1, State::Leader, "seed becomes leader").await?;
    assert_eq!(router.client_request(s1, b"alpha").await?, CommandStatus::Success);
    assert_eq!(router.client_request(s1, b"beta").await?, CommandStatus::Success);

    let before = router
        .wait(&s1, None)
        .await?
        .metrics(|m| m.last_applied == 3, "both commands applied")
        .await?;

    tracing::info!("--- restarting");
    router.shutdown_node(s1).await?;
    router.restart_node(s1).await?;
    router.wait_for_state(&s1, State::Leader, "leads again after restart").await?;
    router.wait_for_applied(&s1, before.last_applied, "recommits the recovered log").await?;

    let after = router.metrics_of(&s1).await?;
    assert!(after.current_term > before.current_term, "a restart elects a fresh term");
    assert_eq!(after.membership, before.membership);
    assert_eq!(after.snapshot_index, before.snapshot_index);

    tracing::info!("--- the application sees the same history");
    let snap = router.expect_entry(s1).await?;
    assert!(snap.is_snapshot);
    let first = router.expect_data(s1, b"alpha").await?;
    assert_eq!(first.index, 2);
    let second = router.expect_data(s1, b"beta").await?;
    assert_eq!(second.index, 3);

    Ok(())
}
