mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use confraft::error::CommandStatus;
use fixtures::Router;

/// Normal-case replication across three servers.
///
/// - form a three-member cluster.
/// - a command submitted to the leader commits once a majority holds it.
/// - every member delivers it to its state machine, and follower commit
///   indexes catch up on the next heartbeat.
///
/// RUST_LOG=confraft,replication=trace cargo test --test replication
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_commit() -> Result<()> {
    fixtures::init_tracing();
    let router = Arc::new(Router::new(fixtures::test_config()));

    tracing::info!("--- forming a 3 node cluster");
    let ids = fixtures::form_cluster(&router, 6700, 3).await?;
    let leader = router.wait_for_leader("cluster formed").await?;

    tracing::info!("--- committing through the leader");
    let status = router.client_request(leader, b"x").await?;
    assert_eq!(status, CommandStatus::Success);

    let leader_metrics = router
        .wait(&leader, None)
        .await?
        .metrics(
            |m| m.commit_index == m.last_log_index && m.last_applied == m.commit_index,
            "leader fully applied",
        )
        .await?;
    let commit = leader_metrics.commit_index;

    tracing::info!("--- every member applies the command");
    for sid in &ids {
        router.wait_for_applied(sid, commit, "command applied everywhere").await?;
        router.expect_data(*sid, b"x").await?;
    }

    Ok(())
}

/// A command submitted to a follower is refused with NotLeader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn followers_refuse_commands() -> Result<()> {
    fixtures::init_tracing();
    let router = Arc::new(Router::new(fixtures::test_config()));

    let ids = fixtures::form_cluster(&router, 6710, 3).await?;
    let leader = router.wait_for_leader("cluster formed").await?;
    let follower = *ids.iter().find(|sid| **sid != leader).expect("a follower exists");

    let status = router.client_request(follower, b"nope").await?;
    assert_eq!(status, CommandStatus::NotLeader);

    Ok(())
}
