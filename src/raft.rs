//! Public Raft interface and wire types.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeStatus;
use crate::error::CommandStatus;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::StoreError;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::Transport;
use crate::storage::Metadata;
use crate::storage::StorageBackend;
use crate::storage::Store;
use crate::Address;
use crate::ClusterId;
use crate::Entry;
use crate::Index;
use crate::ServerId;
use crate::ServerSet;
use crate::Summary;
use crate::Term;

struct RaftInner {
    id: ServerId,
    tx_api: mpsc::UnboundedSender<RaftMsg>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    rx_apply: Mutex<mpsc::UnboundedReceiver<ApplyEntry>>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The interface to a running Raft node.
///
/// Cloning is cheap; clones all talk to the same spawned consensus task.
/// The embedding application feeds incoming peer envelopes through
/// [`Raft::deliver`], submits commands through [`Raft::execute`], and
/// consumes the committed command stream through [`Raft::next_entry`].
pub struct Raft {
    inner: Arc<RaftInner>,
}

impl Raft {
    /// Initialize a brand new single-server cluster in `backend`.
    ///
    /// Writes the identity header and the initial snapshot; does not start
    /// the engine. Follow up with [`Raft::open`].
    pub fn create_cluster<B: StorageBackend>(
        backend: &B,
        name: impl Into<String>,
        local: Address,
        initial_snapshot: Vec<u8>,
    ) -> Result<Metadata, StoreError> {
        Store::create_cluster(backend, name, local, initial_snapshot)
    }

    /// Initialize a store for a server that will join an existing cluster
    /// via the given remotes. The engine drives the join after `open`.
    pub fn join_cluster<B: StorageBackend>(
        backend: &B,
        name: impl Into<String>,
        local: Address,
        remotes: Vec<Address>,
        cid: Option<ClusterId>,
    ) -> Result<Metadata, StoreError> {
        Store::join_cluster(backend, name, local, remotes, cid)
    }

    /// Read a store's identity without starting an engine.
    pub fn read_metadata<B: StorageBackend>(backend: &B) -> Result<Metadata, StoreError> {
        Store::read_metadata(backend)
    }

    /// Resume the server persisted in `backend` and spawn its consensus
    /// task.
    ///
    /// Fails if the store cannot be replayed, or if it holds a snapshot
    /// whose configuration no longer contains this server.
    pub fn open<T: Transport, B: StorageBackend>(
        config: Arc<Config>,
        transport: Arc<T>,
        backend: Arc<B>,
    ) -> RaftResult<Raft> {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_apply, rx_apply) = mpsc::unbounded_channel();
        let (tx_shutdown, rx_shutdown) = oneshot::channel();

        let (id, tx_metrics_rx, raft_handle) =
            RaftCore::spawn(config, transport, backend, rx_api, tx_apply, rx_shutdown)?;

        let inner = RaftInner {
            id,
            tx_api,
            rx_metrics: tx_metrics_rx,
            rx_apply: Mutex::new(rx_apply),
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        Ok(Raft { inner: Arc::new(inner) })
    }

    /// This server's id.
    pub fn id(&self) -> ServerId {
        self.inner.id
    }

    /// Hand an incoming envelope from the session layer to the consensus
    /// task. Malformed or stale envelopes are dropped there, never here.
    pub fn deliver(&self, env: Envelope) -> RaftResult<()> {
        self.inner
            .tx_api
            .send(RaftMsg::Envelope(env))
            .map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit a command for replication.
    ///
    /// Returns quickly with a [`Command`] handle; replication and commit
    /// proceed in the background. If this server is not the leader the
    /// command comes back already completed as
    /// [`CommandStatus::NotLeader`]. `prereq`, when given, must equal the
    /// engine's last applied entry id or the command completes as
    /// [`CommandStatus::BadPrereq`].
    pub async fn execute(&self, data: Vec<u8>, prereq: Option<Index>) -> RaftResult<Command> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::Execute { data, prereq, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Whether a committed entry is ready for [`Raft::next_entry`].
    pub async fn has_next_entry(&self) -> bool {
        !self.inner.rx_apply.lock().await.is_empty()
    }

    /// The next committed item for the application, in log order.
    ///
    /// Items with `is_snapshot` set replace the application's whole state;
    /// all others are commands to apply incrementally. Returns `None` once
    /// the engine has shut down and the stream is drained.
    pub async fn next_entry(&self) -> Option<ApplyEntry> {
        self.inner.rx_apply.lock().await.recv().await
    }

    /// Whether the engine suggests compacting the log now.
    pub fn should_snapshot(&self) -> bool {
        self.inner.rx_metrics.borrow().should_snapshot
    }

    /// Compact the log through the last applied entry, using `data` as the
    /// state machine image covering it.
    pub async fn store_snapshot(&self, data: Vec<u8>) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::StoreSnapshot { data, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Ask the leader to add `sid` at `address` to the cluster. Resolves
    /// once the new configuration commits.
    pub async fn add_server(&self, sid: ServerId, address: Address) -> RaftResult<ChangeStatus> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::AddServer { sid, address, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Ask the leader to remove `sid` from the cluster.
    pub async fn remove_server(&self, sid: ServerId) -> RaftResult<ChangeStatus> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::RemoveServer { sid, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Start an election immediately instead of waiting for the timer.
    pub async fn take_leadership(&self) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::TakeLeadership { tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Step down if leading, letting another member win the next election.
    /// In-flight commands complete as [`CommandStatus::LostLeadership`].
    pub async fn transfer_leadership(&self) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::TransferLeadership { tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Gracefully withdraw this server from the cluster. The engine keeps
    /// asking the leader to remove it until a configuration without it
    /// commits; observe progress through [`Raft::metrics`].
    pub async fn leave(&self) -> RaftResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::Leave { tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = timeout.unwrap_or_else(|| Duration::from_millis(500));
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut the node down: complete outstanding commands as
    /// [`CommandStatus::Shutdown`], stop the durability worker, and join the
    /// consensus task.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl Clone for Raft {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// One item of the committed stream handed to the application.
#[derive(Clone, Debug, PartialEq)]
pub struct ApplyEntry {
    /// Command bytes, or a full state machine image when `is_snapshot`.
    pub data: Vec<u8>,
    /// The log index this item covers through.
    pub index: Index,
    /// Whether `data` replaces the whole application state.
    pub is_snapshot: bool,
}

/// A handle to a submitted command.
///
/// Cheap to clone; dropping every clone releases the handle without
/// affecting the command itself.
#[derive(Clone)]
pub struct Command {
    index: Option<Index>,
    rx: watch::Receiver<CommandStatus>,
}

impl Command {
    pub(crate) fn pending(index: Index, rx: watch::Receiver<CommandStatus>) -> Self {
        Self {
            index: Some(index),
            rx,
        }
    }

    /// A command that never entered the log.
    pub(crate) fn completed(status: CommandStatus) -> Self {
        let (tx, rx) = watch::channel(status);
        drop(tx);
        Self { index: None, rx }
    }

    /// The log index assigned to this command, if it entered the log.
    pub fn index(&self) -> Option<Index> {
        self.index
    }

    /// The current status, without blocking.
    pub fn status(&self) -> CommandStatus {
        *self.rx.borrow()
    }

    /// Wait for the command to reach a final status.
    pub async fn wait(&mut self) -> CommandStatus {
        loop {
            let status = *self.rx.borrow_and_update();
            if status.is_final() {
                return status;
            }
            if self.rx.changed().await.is_err() {
                // The engine dropped the sender without completing us.
                return CommandStatus::Shutdown;
            }
        }
    }
}

/// A message coming from the Raft API.
pub(crate) enum RaftMsg {
    Envelope(Envelope),
    Execute {
        data: Vec<u8>,
        prereq: Option<Index>,
        tx: oneshot::Sender<Command>,
    },
    AddServer {
        sid: ServerId,
        address: Address,
        tx: oneshot::Sender<ChangeStatus>,
    },
    RemoveServer {
        sid: ServerId,
        tx: oneshot::Sender<ChangeStatus>,
    },
    StoreSnapshot {
        data: Vec<u8>,
        tx: oneshot::Sender<RaftResult<()>>,
    },
    TakeLeadership {
        tx: oneshot::Sender<()>,
    },
    TransferLeadership {
        tx: oneshot::Sender<()>,
    },
    Leave {
        tx: oneshot::Sender<()>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The envelope wrapped around every RPC on the wire.
///
/// `to` is checked against the receiver's id and mismatches are dropped.
/// `cluster` is adopted by a receiver that has none yet and must match
/// otherwise; only [`Payload::Hello`] and [`Payload::AddServerRequest`] may
/// arrive without it. The sender's id is learned from `from` on first
/// contact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub to: Option<ServerId>,
    pub from: ServerId,
    pub cluster: Option<ClusterId>,
    pub payload: Payload,
}

impl Summary for Envelope {
    fn summary(&self) -> String {
        format!("from={} {}", self.from, self.payload.summary())
    }
}

/// Every RPC the engine speaks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Introduces the sender on a fresh connection.
    Hello,
    AppendRequest(AppendRequest),
    AppendReply(AppendReply),
    VoteRequest(VoteRequest),
    VoteReply(VoteReply),
    AddServerRequest(AddServerRequest),
    AddServerReply(AddServerReply),
    RemoveServerRequest(RemoveServerRequest),
    RemoveServerReply(RemoveServerReply),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotReply(InstallSnapshotReply),
}

impl Payload {
    /// The term carried by consensus RPCs; membership and hello traffic is
    /// termless.
    pub fn term(&self) -> Option<Term> {
        match self {
            Payload::AppendRequest(r) => Some(r.term),
            Payload::AppendReply(r) => Some(r.term),
            Payload::VoteRequest(r) => Some(r.term),
            Payload::VoteReply(r) => Some(r.term),
            Payload::InstallSnapshotRequest(r) => Some(r.term),
            Payload::InstallSnapshotReply(r) => Some(r.term),
            Payload::Hello
            | Payload::AddServerRequest(_)
            | Payload::AddServerReply(_)
            | Payload::RemoveServerRequest(_)
            | Payload::RemoveServerReply(_) => None,
        }
    }

    /// Whether this payload may arrive without a cluster id.
    pub fn tolerates_missing_cluster(&self) -> bool {
        matches!(self, Payload::Hello | Payload::AddServerRequest(_))
    }

    /// Whether the engine should answer a stale-term copy of this payload.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Payload::AppendRequest(_) | Payload::VoteRequest(_) | Payload::InstallSnapshotRequest(_)
        )
    }
}

impl Summary for Payload {
    fn summary(&self) -> String {
        match self {
            Payload::Hello => "Hello".to_string(),
            Payload::AppendRequest(r) => format!(
                "AppendRequest term={} prev={}-{} commit={} n={}",
                r.term,
                r.prev_log_term,
                r.prev_log_index,
                r.leader_commit,
                r.entries.len()
            ),
            Payload::AppendReply(r) => format!(
                "AppendReply term={} log_end={} success={}",
                r.term, r.log_end, r.success
            ),
            Payload::VoteRequest(r) => format!(
                "VoteRequest term={} last={}-{}",
                r.term, r.last_log_term, r.last_log_index
            ),
            Payload::VoteReply(r) => {
                format!("VoteReply term={} granted={}", r.term, r.vote_granted)
            }
            Payload::AddServerRequest(r) => format!("AddServerRequest sid={}", r.sid),
            Payload::AddServerReply(r) => format!("AddServerReply status={:?}", r.status),
            Payload::RemoveServerRequest(r) => format!("RemoveServerRequest sid={}", r.sid),
            Payload::RemoveServerReply(r) => format!("RemoveServerReply status={:?}", r.status),
            Payload::InstallSnapshotRequest(r) => format!(
                "InstallSnapshotRequest term={} last={}-{} offset={} len={}",
                r.term,
                r.last_term,
                r.last_index,
                r.offset,
                r.chunk.len()
            ),
            Payload::InstallSnapshotReply(r) => format!(
                "InstallSnapshotReply term={} next_offset={}",
                r.term, r.next_offset
            ),
        }
    }
}

/// Sent by the leader to replicate log entries (§5.3) and as a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendRequest {
    /// The leader's current term.
    pub term: Term,
    /// The leader's id, so followers can redirect clients.
    pub leader_sid: ServerId,
    /// The index of the entry immediately preceding `entries`.
    pub prev_log_index: Index,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// The leader's commit index.
    pub leader_commit: Index,
    /// Entries for `prev_log_index + 1` onward. Empty for heartbeats.
    pub entries: Vec<Entry>,
}

/// The follower's answer to an [`AppendRequest`].
///
/// Successful answers are sent only after the appended entries are durable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendReply {
    /// The responder's current term.
    pub term: Term,
    /// The responder's log end, so a rejected leader can jump `next_index`
    /// back in one step.
    pub log_end: Index,
    /// Echo of the request's `prev_log_index`.
    pub prev_log_index: Index,
    /// Echo of the request's `prev_log_term`.
    pub prev_log_term: Term,
    /// Echo of the request's entry count.
    pub n_entries: u64,
    /// Whether the entries were accepted.
    pub success: bool,
}

/// Sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    /// The index of the candidate's last log entry (§5.4).
    pub last_log_index: Index,
    /// The term of the candidate's last log entry (§5.4).
    pub last_log_term: Term,
}

/// The answer to a [`VoteRequest`]. Grants are persisted before they are
/// sent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// Asks the leader to add a server to the cluster. Usually sent by the
/// joining server itself, repeatedly, until it succeeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddServerRequest {
    pub sid: ServerId,
    pub address: Address,
}

/// The outcome of an add request, with a leader hint when the receiver was
/// not the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddServerReply {
    pub status: ChangeStatus,
    pub leader_sid: Option<ServerId>,
    pub leader_address: Option<Address>,
}

/// Asks the leader to remove a server from the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveServerRequest {
    pub sid: ServerId,
}

/// The outcome of a remove request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveServerReply {
    pub status: ChangeStatus,
    pub leader_sid: Option<ServerId>,
    pub leader_address: Option<Address>,
}

/// One chunk of a snapshot streamed from the leader to a lagging follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    /// The last index the snapshot covers.
    pub last_index: Index,
    /// The term at `last_index`.
    pub last_term: Term,
    /// The membership in force at `last_index`.
    pub last_servers: ServerSet,
    /// Total snapshot length in bytes.
    pub length: u64,
    /// Where this chunk starts.
    pub offset: u64,
    pub chunk: Vec<u8>,
}

/// The follower's progress answer to a snapshot chunk. `next_offset` is
/// where the leader should resume; a mismatched `last_index`/`last_term`
/// tells the leader to restart from zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
    pub last_index: Index,
    pub last_term: Term,
    pub next_offset: u64,
}
