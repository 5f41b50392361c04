mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use confraft::error::CommandStatus;
use confraft::Config;
use confraft::State;
use fixtures::Router;

/// Compaction keeps the applied prefix as a snapshot and survives restart.
///
/// RUST_LOG=confraft,snapshot=trace cargo test --test snapshot
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn compaction_survives_restart() -> Result<()> {
    fixtures::init_tracing();
    let router = Arc::new(Router::new(fixtures::test_config()));

    let s1 = router.new_cluster_node(6750).await?;
    router.wait_for_state(&s1, State::Leader, "seed becomes leader").await?;
    for cmd in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
        assert_eq!(router.client_request(s1, cmd).await?, CommandStatus::Success);
    }

    tracing::info!("--- compacting through the applied log");
    let raft = router.raft_handle(&s1).await?;
    raft.store_snapshot(b"state@c".to_vec()).await?;

    let metrics = router
        .wait(&s1, None)
        .await?
        .metrics(
            |m| m.snapshot_index == m.last_applied && m.snapshot_index > 1,
            "compaction visible",
        )
        .await?;

    tracing::info!("--- restart restores from the snapshot");
    router.shutdown_node(s1).await?;
    router.restart_node(s1).await?;
    router.wait_for_state(&s1, State::Leader, "leads again").await?;

    let snap = router.expect_entry(s1).await?;
    assert!(snap.is_snapshot);
    assert_eq!(snap.data, b"state@c".to_vec());
    assert_eq!(snap.index, metrics.snapshot_index);

    let after = router.metrics_of(&s1).await?;
    assert_eq!(after.snapshot_index, metrics.snapshot_index);

    Ok(())
}

/// The engine suggests a snapshot once enough entries were applied, and
/// stops suggesting after one is stored.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn snapshot_is_suggested_by_threshold() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("test".into())
            .election_timeout_base(100)
            .election_timeout_range(100)
            .snapshot_log_threshold(2)
            .snapshot_min_interval(Duration::from_millis(0))
            .validate()?,
    );
    let router = Arc::new(Router::new(config));

    let s1 = router.new_cluster_node(6760).await?;
    router.wait_for_state(&s1, State::Leader, "seed becomes leader").await?;
    let raft = router.raft_handle(&s1).await?;
    assert!(!raft.should_snapshot());

    for cmd in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
        assert_eq!(router.client_request(s1, cmd).await?, CommandStatus::Success);
    }
    router
        .wait(&s1, None)
        .await?
        .metrics(|m| m.should_snapshot, "threshold crossed")
        .await?;

    raft.store_snapshot(b"img".to_vec()).await?;
    router
        .wait(&s1, None)
        .await?
        .metrics(|m| !m.should_snapshot, "suggestion cleared")
        .await?;

    Ok(())
}

/// A follower that fell behind the leader's compacted log is caught up with
/// a chunked snapshot transfer, then regular replication resumes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_gets_a_snapshot() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("test".into())
            .election_timeout_base(100)
            .election_timeout_range(100)
            // Force several chunks per transfer.
            .snapshot_chunk_size(4)
            .validate()?,
    );
    let router = Arc::new(Router::new(config));

    let ids = fixtures::form_cluster(&router, 6770, 3).await?;
    let leader = router.wait_for_leader("cluster formed").await?;
    let lagger = *ids.iter().find(|sid| **sid != leader).expect("a follower exists");

    tracing::info!("--- cutting {} off and moving the log past it", lagger);
    router.isolate_node(lagger).await;
    for i in 0..5u8 {
        let status = router.client_request(leader, &[b'k', i]).await?;
        assert_eq!(status, CommandStatus::Success);
    }

    let raft = router.raft_handle(&leader).await?;
    raft.store_snapshot(b"snapshot-state".to_vec()).await?;
    let leader_metrics = router
        .wait(&leader, None)
        .await?
        .metrics(|m| m.snapshot_index > 1, "leader compacted")
        .await?;

    tracing::info!("--- healing; the follower must install the snapshot");
    router.restore_node(lagger).await;
    router
        .wait_for_applied(&lagger, leader_metrics.last_applied, "lagger catches up")
        .await?;

    let lagger_metrics = router.metrics_of(&lagger).await?;
    assert_eq!(lagger_metrics.snapshot_index, leader_metrics.snapshot_index);

    tracing::info!("--- the application got the full image");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "snapshot never delivered");
        let entry = router.expect_entry(lagger).await?;
        if entry.is_snapshot && entry.data == b"snapshot-state".to_vec() {
            assert_eq!(entry.index, leader_metrics.snapshot_index);
            break;
        }
    }

    tracing::info!("--- replication continues past the snapshot");
    let status = router.client_request(leader, b"after-snap").await?;
    assert_eq!(status, CommandStatus::Success);
    router.expect_data(lagger, b"after-snap").await?;

    Ok(())
}
