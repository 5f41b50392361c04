//! Observability for a running Raft node.
//!
//! The core publishes a [`RaftMetrics`] snapshot on a watch channel whenever
//! externally observable state changes. [`Wait`] turns that channel into a
//! small awaiting DSL that tests and embedding applications use to block
//! until the node reaches some condition.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::State;
use crate::ClusterId;
use crate::Index;
use crate::ServerId;
use crate::ServerSet;
use crate::Term;

/// A snapshot of a Raft node's externally observable state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// This node's ID.
    pub id: ServerId,
    /// The cluster id, once known.
    pub cluster: Option<ClusterId>,
    /// This node's current role.
    pub state: State,
    /// The current term.
    pub current_term: Term,
    /// The index of the last entry in the log.
    pub last_log_index: Index,
    /// The highest index known committed.
    pub commit_index: Index,
    /// The highest index delivered to the state machine.
    pub last_applied: Index,
    /// The server currently believed to be leader.
    pub current_leader: Option<ServerId>,
    /// The latest cluster configuration found in the log.
    pub membership: ServerSet,
    /// The index covered by the current snapshot.
    pub snapshot_index: Index,
    /// Whether the engine suggests taking a snapshot now.
    pub should_snapshot: bool,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: ServerId) -> Self {
        Self {
            id,
            cluster: None,
            state: State::NonVoter,
            current_term: 0,
            last_log_index: crate::SENTINEL_INDEX,
            commit_index: crate::SENTINEL_INDEX,
            last_applied: crate::SENTINEL_INDEX,
            current_leader: None,
            membership: ServerSet::new(),
            snapshot_index: crate::SENTINEL_INDEX,
            should_snapshot: false,
        }
    }
}

/// Error returned by [`Wait`] operations.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// A handle for awaiting a metrics condition, cheap to create and drop.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until `func` holds for the latest metrics, or time out.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let mut rx = self.rx.clone();
        let fut = async {
            loop {
                let latest = rx.borrow().clone();
                tracing::debug!(
                    "id={} wait for {:} latest: {:?}",
                    latest.id,
                    msg.to_string(),
                    latest
                );
                if func(&latest) {
                    return Ok(latest);
                }
                if rx.changed().await.is_err() {
                    return Err(WaitError::ShuttingDown);
                }
            }
        };
        match timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(WaitError::Timeout(self.timeout, msg.to_string())),
        }
    }

    /// Wait for `last_applied` to reach `want_log`.
    pub async fn log(&self, want_log: Index, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index >= want_log && x.last_applied >= want_log,
            format!("{} .last_log_index+last_applied >= {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait for the node to enter `want_state`.
    pub async fn state(&self, want_state: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.state == want_state,
            format!("{} .state -> {:?}", msg.to_string(), want_state),
        )
        .await
    }

    /// Wait for the node to observe `leader` as the current leader.
    pub async fn current_leader(&self, leader: ServerId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.current_leader == Some(leader),
            format!("{} .current_leader -> {}", msg.to_string(), leader),
        )
        .await
    }

    /// Wait for the membership to become exactly `want`.
    pub async fn members(&self, want: Vec<ServerId>, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.membership.keys().cloned().collect::<Vec<_>>() == want,
            format!("{} .membership -> {:?}", msg.to_string(), want),
        )
        .await
    }
}
