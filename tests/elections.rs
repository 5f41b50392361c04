mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use confraft::error::CommandStatus;
use confraft::State;
use fixtures::Router;

/// A partitioned leader is deposed by a new election and steps down on heal.
///
/// - form a three-member cluster, isolate the leader.
/// - the remaining members elect a new leader in a higher term.
/// - once the partition heals, the old leader adopts the new term and
///   becomes a follower of the new leader.
///
/// RUST_LOG=confraft,elections=trace cargo test --test elections
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_partition_and_heal() -> Result<()> {
    fixtures::init_tracing();
    let router = Arc::new(Router::new(fixtures::test_config()));

    let _ids = fixtures::form_cluster(&router, 6720, 3).await?;
    let old_leader = router.wait_for_leader("cluster formed").await?;
    let old_term = router.metrics_of(&old_leader).await?.current_term;

    tracing::info!("--- isolating the leader {}", old_leader);
    router.isolate_node(old_leader).await;

    let new_leader = router.wait_for_leader("majority side elects").await?;
    assert_ne!(new_leader, old_leader);
    let new_term = router.metrics_of(&new_leader).await?.current_term;
    assert!(new_term > old_term, "the new leadership is in a newer term");

    tracing::info!("--- healing the partition");
    router.restore_node(old_leader).await;

    router
        .wait_for_state(&old_leader, State::Follower, "old leader steps down")
        .await?;
    router
        .wait(&old_leader, None)
        .await?
        .metrics(
            |m| m.current_term >= new_term && m.current_leader == Some(new_leader),
            "old leader adopts the new term and leader",
        )
        .await?;

    tracing::info!("--- the healed cluster still commits");
    let leader = router.wait_for_leader("post-heal leader").await?;
    let status = router.client_request(leader, b"after-heal").await?;
    assert_eq!(status, CommandStatus::Success);

    Ok(())
}

/// take_leadership moves the leadership to the asking member.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_can_be_taken() -> Result<()> {
    fixtures::init_tracing();
    let router = Arc::new(Router::new(fixtures::test_config()));

    let ids = fixtures::form_cluster(&router, 6730, 3).await?;
    let leader = router.wait_for_leader("cluster formed").await?;
    let target = *ids.iter().find(|sid| **sid != leader).expect("a follower exists");

    tracing::info!("--- {} takes leadership", target);
    let raft = router.raft_handle(&target).await?;
    raft.take_leadership().await?;
    router.wait_for_state(&target, State::Leader, "taker becomes leader").await?;

    Ok(())
}
