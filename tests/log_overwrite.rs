mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use confraft::error::CommandStatus;
use confraft::State;
use fixtures::Router;

/// An uncommitted entry on a deposed leader is overwritten by the new
/// leader's log.
///
/// - the leader is cut off and accepts a command it can no longer
///   replicate.
/// - the majority side elects a new leader and commits its own entry at
///   the same index.
/// - on heal, the old leader truncates its conflicting entry, adopts the
///   new one, and the stranded command resolves as LostLeadership.
///
/// RUST_LOG=confraft,log_overwrite=trace cargo test --test log_overwrite
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn divergent_suffix_is_overwritten() -> Result<()> {
    fixtures::init_tracing();
    let router = Arc::new(Router::new(fixtures::test_config()));

    let _ids = fixtures::form_cluster(&router, 6740, 3).await?;
    let old_leader = router.wait_for_leader("cluster formed").await?;

    tracing::info!("--- isolating the leader and stranding a command on it");
    router.isolate_node(old_leader).await;
    let old_raft = router.raft_handle(&old_leader).await?;
    let mut stranded = old_raft.execute(b"x".to_vec(), None).await?;
    assert_eq!(stranded.status(), CommandStatus::Incomplete);

    tracing::info!("--- the majority elects and commits around it");
    let new_leader = router.wait_for_leader("majority side elects").await?;
    assert_ne!(new_leader, old_leader);
    let status = router.client_request(new_leader, b"y").await?;
    assert_eq!(status, CommandStatus::Success);

    tracing::info!("--- healing; the old leader must converge");
    router.restore_node(old_leader).await;
    router
        .wait_for_state(&old_leader, State::Follower, "old leader steps down")
        .await?;
    assert_eq!(stranded.wait().await, CommandStatus::LostLeadership);

    let target = router
        .wait(&new_leader, None)
        .await?
        .metrics(
            |m| m.last_applied == m.commit_index && m.commit_index == m.last_log_index,
            "new leader fully applied",
        )
        .await?
        .last_applied;
    router.wait_for_applied(&old_leader, target, "old leader catches up").await?;

    tracing::info!("--- the old leader applied y and never x");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "y never showed up");
        let entry = router.expect_entry(old_leader).await?;
        if entry.is_snapshot {
            continue;
        }
        assert_ne!(entry.data, b"x".to_vec(), "a truncated entry must never apply");
        if entry.data == b"y".to_vec() {
            break;
        }
    }

    Ok(())
}
