//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::install_snapshot::SnapshotDownload;
use crate::error::ChangeStatus;
use crate::error::CommandStatus;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::RaftLog;
use crate::membership::Membership;
use crate::metrics::RaftMetrics;
use crate::network::Transport;
use crate::raft::ApplyEntry;
use crate::raft::Envelope;
use crate::raft::Payload;
use crate::raft::RaftMsg;
use crate::raft::VoteReply;
use crate::storage::durability;
use crate::storage::durability::DurabilityHandle;
use crate::storage::Metadata;
use crate::storage::Record;
use crate::storage::StorageBackend;
use crate::storage::Store;
use crate::Address;
use crate::EntryPayload;
use crate::Index;
use crate::ServerId;
use crate::Summary;
use crate::Term;

/// A deferred action gated on a durability sequence number. Fired by the
/// core once the durability worker reports the sequence as synced.
pub(crate) enum Waiter {
    /// An entry this server appended as leader is now durable, so its own
    /// replication bookkeeping may advance.
    LocalAppend { index: Index },
    /// A reply whose content depends on persisted state; held back until
    /// that state is on disk.
    Reply { to: ServerId, payload: Payload },
    /// A granted vote is durable and may now be announced.
    GrantedVote { to: ServerId, term: Term },
    /// Our own candidacy (term and self-vote) is durable; vote requests may
    /// go out.
    ElectionStarted { term: Term },
}

/// The core type implementing the Raft protocol.
pub struct RaftCore<T: Transport, B: StorageBackend> {
    /// This node's ID.
    id: ServerId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// Identity as persisted in the store header; the cluster id starts
    /// absent on joining servers.
    metadata: Metadata,
    /// The session layer.
    transport: Arc<T>,
    /// The persistent record store.
    store: Store<B>,
    /// The in-memory log with its snapshot prefix.
    log: RaftLog,
    /// The membership view derived from the log, plus leader bookkeeping.
    membership: Membership,

    /// The target state of the system.
    target_state: State,

    /// The current term. Increases monotonically; always at least as large
    /// as any term in the log.
    current_term: Term,
    /// The candidate this node voted for in `current_term`.
    voted_for: Option<ServerId>,
    /// The server currently believed to be leader.
    current_leader: Option<ServerId>,
    /// The last known leader address, used to redirect joiners.
    leader_address: Option<Address>,

    /// The highest log index known committed.
    commit_index: Index,
    /// The highest log index delivered to the application.
    last_applied: Index,

    /// True while this server is trying to get itself added to a cluster.
    joining: bool,
    /// True while this server is trying to get itself removed.
    leaving: bool,

    /// A vote grant has been persisted but its reply not yet sent.
    vote_persist_pending: bool,
    /// An InstallSnapshot transfer being received, if any.
    download: Option<SnapshotDownload>,

    /// The durability handshake with the fsync worker.
    durability: DurabilityHandle,
    rx_durable: watch::Receiver<u64>,
    durability_join: Option<JoinHandle<()>>,
    /// The highest durability sequence requested so far.
    last_durability_seq: u64,
    /// Deferred actions keyed by the durability sequence they wait for.
    waiters: BTreeMap<u64, Vec<Waiter>>,
    /// Waiters whose sequence is already durable, awaiting dispatch at the
    /// top of the loop.
    ready_waiters: Vec<Waiter>,

    /// Completion channels for commands this leader has in flight.
    commands: BTreeMap<Index, watch::Sender<CommandStatus>>,

    /// When the last snapshot was taken, for pacing suggestions.
    last_snapshot_time: Instant,

    /// The time after which a follower or candidate acts on silence.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg>,
    tx_apply: mpsc::UnboundedSender<ApplyEntry>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<T: Transport, B: StorageBackend> RaftCore<T, B> {
    /// Replay the store, verify this server may run, and spawn the
    /// consensus task.
    pub(crate) fn spawn(
        config: Arc<Config>,
        transport: Arc<T>,
        backend: Arc<B>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg>,
        tx_apply: mpsc::UnboundedSender<ApplyEntry>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> RaftResult<(ServerId, watch::Receiver<RaftMetrics>, JoinHandle<RaftResult<()>>)> {
        let (store, recovered) = Store::open(backend.clone())?;
        if recovered.dropped_tail {
            tracing::warn!("dropped a truncated final record during log replay");
        }

        let id = recovered.metadata.sid;
        let log = RaftLog::from_recovered(&recovered);
        let membership = Membership::from_config(log.latest_servers());
        let joining = !recovered.has_snapshot;

        if !joining && !membership.contains(&id) {
            return Err(RaftError::NotInMembership { sid: id });
        }

        // The current term can never trail the log.
        let current_term = recovered.current_term.max(log.last_term());
        let voted_for = if recovered.current_term == current_term {
            recovered.voted_for
        } else {
            None
        };

        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (durability, rx_durable, durability_join) = durability::spawn(backend);

        let commit_index = log.prev_index();
        let this = Self {
            id,
            config,
            metadata: recovered.metadata,
            transport,
            store,
            log,
            membership,
            target_state: State::Follower,
            current_term,
            voted_for,
            current_leader: None,
            leader_address: None,
            commit_index,
            last_applied: commit_index,
            joining,
            leaving: false,
            vote_persist_pending: false,
            download: None,
            durability,
            rx_durable,
            durability_join: Some(durability_join),
            last_durability_seq: 0,
            waiters: BTreeMap::new(),
            ready_waiters: Vec::new(),
            commands: BTreeMap::new(),
            last_snapshot_time: Instant::now(),
            next_election_timeout: None,
            rx_api,
            tx_apply,
            tx_metrics,
            rx_shutdown,
        };
        let handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));
        Ok((id, rx_metrics, handle))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        // Hand the application its starting state before any entries.
        if !self.log.snapshot_data().is_empty() {
            let _ = self.tx_apply.send(ApplyEntry {
                data: self.log.snapshot_data().to_vec(),
                index: self.log.prev_index(),
                is_snapshot: true,
            });
        }

        let is_member = self.membership.contains(&self.id);
        let single = self.membership.len() == 1;
        self.target_state = if self.joining || !is_member {
            State::NonVoter
        } else if single {
            // Alone in the configuration there is nobody to wait for.
            State::Candidate
        } else {
            State::Follower
        };

        tracing::debug!("id={} target_state: {:?}", self.id, self.target_state);
        self.report_metrics();

        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::NonVoter => NonVoterState::new(&mut self).run().await?,
                State::Shutdown => {
                    self.shutdown_sequence().await;
                    self.report_metrics();
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Complete outstanding work and stop the durability worker.
    async fn shutdown_sequence(&mut self) {
        self.complete_all_commands(CommandStatus::Shutdown);
        self.fail_pending_changes(ChangeStatus::LostLeadership).await;
        self.waiters.clear();
        self.durability.shutdown();
        if let Some(handle) = self.durability_join.take() {
            let _ = handle.await;
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    fn report_metrics(&mut self) {
        let snapshot_index = self.log.prev_index();
        let applied_since_snapshot = self.last_applied.saturating_sub(snapshot_index);
        let should_snapshot = applied_since_snapshot >= self.config.snapshot_log_threshold
            && self.last_snapshot_time.elapsed() >= self.config.snapshot_min_interval
            && self.last_applied > snapshot_index;

        let metrics = RaftMetrics {
            id: self.id,
            cluster: self.metadata.cid,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.log.last_index(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            membership: self.log.latest_servers().clone(),
            snapshot_index,
            should_snapshot,
        };
        self.tx_metrics.send_if_modified(|current| {
            if *current != metrics {
                *current = metrics;
                true
            } else {
                false
            }
        });
    }

    /// Update core's target state, ensuring all invariants are upheld.
    fn set_target_state(&mut self, target_state: State) {
        if target_state == State::Follower && !self.membership.contains(&self.id) {
            self.target_state = State::NonVoter;
        } else {
            self.target_state = target_state;
        }
    }

    /// Get the next election timeout, generating a new value if not set.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = self.config.new_rand_election_timeout();
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Push the election timeout out by a fresh random interval.
    fn update_next_election_timeout(&mut self) {
        let t = self.config.new_rand_election_timeout();
        self.next_election_timeout = Some(Instant::now() + t);
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the
    /// storage layer.
    fn map_fatal_storage_error(&mut self, err: crate::error::StoreError) -> RaftError {
        tracing::error!(error=%err, id=%self.id, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::Store(err)
    }

    /// Persist a term advance (with the vote cast in it, if any) and adopt
    /// it in memory. The caller decides how to treat failures.
    fn persist_term(&mut self, term: Term, vote: Option<ServerId>) -> RaftResult<u64> {
        self.store.append(&Record::Term { term, vote })?;
        let seq = self.request_durability();
        if term > self.current_term {
            self.membership.clear_votes();
        }
        self.current_term = term;
        self.voted_for = vote;
        Ok(seq)
    }

    /// Ask the durability worker to sync everything appended so far.
    fn request_durability(&mut self) -> u64 {
        let seq = self.durability.request();
        self.last_durability_seq = seq;
        seq
    }

    /// Register `waiter` to fire once `seq` is durable. An already durable
    /// sequence queues it for the next [`RaftCore::drain_ready_waiters`];
    /// queueing instead of dispatching inline keeps the waiter machinery
    /// from re-entering itself.
    fn register_waiter(&mut self, seq: u64, waiter: Waiter) {
        if self.durability.committed() >= seq {
            self.ready_waiters.push(waiter);
        } else {
            self.waiters.entry(seq).or_insert_with(Vec::new).push(waiter);
        }
    }

    /// Fire every waiter covered by the durability worker's progress.
    async fn fire_ready_waiters(&mut self) {
        let committed = *self.rx_durable.borrow_and_update();
        let ready: Vec<u64> = self.waiters.range(..=committed).map(|(k, _)| *k).collect();
        for seq in ready {
            if let Some(waiters) = self.waiters.remove(&seq) {
                self.ready_waiters.extend(waiters);
            }
        }
        self.drain_ready_waiters().await;
    }

    /// Dispatch queued waiters until none remain. Dispatching one waiter may
    /// queue more; the loop picks those up too.
    async fn drain_ready_waiters(&mut self) {
        while !self.ready_waiters.is_empty() {
            let waiter = self.ready_waiters.remove(0);
            self.dispatch_waiter(waiter).await;
        }
    }

    async fn dispatch_waiter(&mut self, waiter: Waiter) {
        match waiter {
            Waiter::LocalAppend { index } => {
                self.record_local_match(index).await;
            }
            Waiter::Reply { to, payload } => {
                self.send_to_peer(to, payload).await;
            }
            Waiter::GrantedVote { to, term } => {
                self.vote_persist_pending = false;
                if term == self.current_term {
                    self.send_to_peer(
                        to,
                        Payload::VoteReply(VoteReply {
                            term,
                            vote_granted: true,
                        }),
                    )
                    .await;
                }
            }
            Waiter::ElectionStarted { term } => {
                self.on_election_durable(term).await;
            }
        }
    }

    /// Send a payload to an identified peer. Addressing ourselves is a bug.
    async fn send_to_peer(&self, to: ServerId, payload: Payload) {
        if to == self.id {
            debug_assert!(false, "attempt to send an RPC to ourselves");
            tracing::error!(to=%to, "dropping RPC addressed to ourselves");
            return;
        }
        let env = Envelope {
            to: Some(to),
            from: self.id,
            cluster: self.metadata.cid,
            payload,
        };
        if let Err(err) = self.transport.send_to_peer(to, env).await {
            tracing::debug!(to=%to, error=%err, "dropping RPC to unreachable peer");
        }
    }

    /// Send a payload to a raw address, before the peer behind it is known.
    async fn send_to_address(&self, addr: &Address, payload: Payload) {
        let env = Envelope {
            to: None,
            from: self.id,
            cluster: self.metadata.cid,
            payload,
        };
        if let Err(err) = self.transport.send_to_address(addr, env).await {
            tracing::debug!(addr=%addr, error=%err, "dropping RPC to unreachable address");
        }
    }

    /// Validate an envelope's addressing and cluster fields. Returns false
    /// when the envelope must be dropped.
    fn check_envelope(&mut self, env: &Envelope) -> bool {
        if let Some(to) = env.to {
            if to != self.id {
                tracing::warn!(to=%to, from=%env.from, "dropping envelope addressed to another server");
                return false;
            }
        }
        match (self.metadata.cid, env.cluster) {
            (Some(ours), Some(theirs)) if ours != theirs => {
                tracing::warn!(ours=%ours, theirs=%theirs, "dropping envelope from another cluster");
                false
            }
            (Some(_), None) => {
                if env.payload.tolerates_missing_cluster() {
                    true
                } else {
                    tracing::warn!(from=%env.from, "dropping envelope without a cluster id");
                    false
                }
            }
            (None, Some(theirs)) => {
                // First contact with the cluster proper: adopt and persist
                // its id.
                tracing::info!(cluster=%theirs, "adopting cluster id");
                self.metadata.cid = Some(theirs);
                if let Err(err) = self.store.append(&crate::storage::header_record(&self.metadata)) {
                    tracing::error!(error=%err, "failed to persist adopted cluster id");
                    self.metadata.cid = None;
                    return false;
                }
                self.request_durability();
                true
            }
            _ => true,
        }
    }

    /// The universal term rule followed by payload dispatch.
    #[tracing::instrument(level = "trace", skip(self, env), fields(env=%env.summary()))]
    async fn handle_envelope(&mut self, env: Envelope) -> RaftResult<()> {
        if !self.check_envelope(&env) {
            return Ok(());
        }
        let from = env.from;

        if let Some(term) = env.payload.term() {
            if term > self.current_term {
                tracing::debug!(term, from=%from, "observed a newer term");
                if let Err(err) = self.persist_term(term, None) {
                    // Without the term on disk we cannot take part in it.
                    tracing::error!(error=%err, "failed to persist term advance, shutting down");
                    self.set_target_state(State::Shutdown);
                    return Err(err);
                }
                if self.target_state == State::Leader {
                    self.leadership_lost().await;
                }
                self.current_leader = None;
                self.set_target_state(State::Follower);
            } else if term < self.current_term {
                self.reject_stale(from, &env.payload).await;
                return Ok(());
            }
        }

        match env.payload {
            Payload::Hello => {
                tracing::debug!(from=%from, "peer introduced itself");
            }
            Payload::AppendRequest(req) => self.handle_append_request(from, req).await?,
            Payload::AppendReply(rep) => self.handle_append_reply(from, rep).await?,
            Payload::VoteRequest(req) => self.handle_vote_request(from, req).await,
            Payload::VoteReply(rep) => self.handle_vote_reply(from, rep).await?,
            Payload::InstallSnapshotRequest(req) => {
                self.handle_install_snapshot_request(from, req).await?
            }
            Payload::InstallSnapshotReply(rep) => {
                self.handle_install_snapshot_reply(from, rep).await?
            }
            Payload::AddServerRequest(req) => {
                self.handle_add_server_request(crate::membership::Originator::Peer(from, req.address.clone()), req.sid, req.address)
                    .await?
            }
            Payload::AddServerReply(rep) => self.handle_add_server_reply(rep).await,
            Payload::RemoveServerRequest(req) => {
                self.handle_remove_server_request(crate::membership::Originator::Peer(from, self.peer_address(&from)), req.sid)
                    .await?
            }
            Payload::RemoveServerReply(rep) => self.handle_remove_server_reply(rep).await,
        }
        Ok(())
    }

    fn peer_address(&self, sid: &ServerId) -> Address {
        self.membership
            .get(sid)
            .map(|s| s.address.clone())
            .unwrap_or_else(|| self.metadata.local.clone())
    }

    /// Answer a stale-term request with our term so the sender can catch up.
    async fn reject_stale(&mut self, from: ServerId, payload: &Payload) {
        let reply = match payload {
            Payload::AppendRequest(req) => Some(Payload::AppendReply(crate::raft::AppendReply {
                term: self.current_term,
                log_end: self.log.log_end(),
                prev_log_index: req.prev_log_index,
                prev_log_term: req.prev_log_term,
                n_entries: req.entries.len() as u64,
                success: false,
            })),
            Payload::VoteRequest(_) => Some(Payload::VoteReply(VoteReply {
                term: self.current_term,
                vote_granted: false,
            })),
            Payload::InstallSnapshotRequest(req) => {
                Some(Payload::InstallSnapshotReply(crate::raft::InstallSnapshotReply {
                    term: self.current_term,
                    last_index: req.last_index,
                    last_term: req.last_term,
                    next_offset: 0,
                }))
            }
            _ => None,
        };
        if let Some(reply) = reply {
            self.send_to_peer(from, reply).await;
        }
    }

    /// Handle one message from the API channel, in whatever role.
    async fn handle_msg(&mut self, msg: RaftMsg) -> RaftResult<()> {
        match msg {
            RaftMsg::Envelope(env) => self.handle_envelope(env).await?,
            RaftMsg::Execute { data, prereq, tx } => {
                let command = self.handle_execute(data, prereq).await;
                let _ = tx.send(command);
            }
            RaftMsg::AddServer { sid, address, tx } => {
                self.handle_add_server_request(crate::membership::Originator::Api(tx), sid, address)
                    .await?;
            }
            RaftMsg::RemoveServer { sid, tx } => {
                self.handle_remove_server_request(crate::membership::Originator::Api(tx), sid)
                    .await?;
            }
            RaftMsg::StoreSnapshot { data, tx } => {
                let res = self.handle_store_snapshot(data);
                let _ = tx.send(res);
            }
            RaftMsg::TakeLeadership { tx } => {
                if self.target_state != State::Leader
                    && !self.joining
                    && self.membership.contains(&self.id)
                {
                    tracing::info!(id=%self.id, "taking leadership on request");
                    self.set_target_state(State::Candidate);
                }
                let _ = tx.send(());
            }
            RaftMsg::TransferLeadership { tx } => {
                if self.target_state == State::Leader {
                    tracing::info!(id=%self.id, "stepping down to transfer leadership");
                    self.leadership_lost().await;
                    self.current_leader = None;
                    self.update_next_election_timeout();
                    self.set_target_state(State::Follower);
                }
                let _ = tx.send(());
            }
            RaftMsg::Leave { tx } => {
                self.leaving = true;
                let _ = tx.send(());
                self.leave_tick().await;
            }
        }
        self.drain_ready_waiters().await;
        self.report_metrics();
        Ok(())
    }

    /// Compact the log through `last_applied` with the application-provided
    /// state image.
    fn handle_store_snapshot(&mut self, data: Vec<u8>) -> RaftResult<()> {
        if self.last_applied <= self.log.prev_index() {
            return Err(RaftError::NothingToCompact {
                last_applied: self.last_applied,
            });
        }
        let servers = self.log.latest_servers_at_or_below(self.last_applied).clone();
        self.log.compact(self.last_applied, servers, data);
        if let Err(err) = self.rewrite_store() {
            return Err(self.map_fatal_storage_error(err));
        }
        self.last_snapshot_time = Instant::now();
        tracing::info!(prev_index = self.log.prev_index(), "log compacted");
        Ok(())
    }

    /// Rewrite the store file from current in-memory state. Used by
    /// compaction and snapshot installation; durable on return.
    fn rewrite_store(&mut self) -> Result<(), crate::error::StoreError> {
        self.store.rewrite(
            &self.metadata,
            self.log.prev_term(),
            self.log.prev_index(),
            self.log.prev_servers(),
            self.log.snapshot_data(),
            self.log.entries_from(self.log.log_start()),
            self.current_term,
            self.voted_for,
        )
    }

    /// Deliver every newly committed entry to the application, in order.
    async fn apply_committed(&mut self) -> RaftResult<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = match self.log.entry(index) {
                Some(entry) => entry.clone(),
                None => {
                    tracing::error!(index, "committed entry missing from the log");
                    break;
                }
            };
            self.last_applied = index;
            match entry.payload {
                EntryPayload::Data(data) => {
                    let _ = self.tx_apply.send(ApplyEntry {
                        data,
                        index,
                        is_snapshot: false,
                    });
                    self.complete_command(index, CommandStatus::Success);
                }
                EntryPayload::Servers(config) => {
                    tracing::info!(index, "configuration committed: {}", config_summary(&config));
                    if !config.contains_key(&self.id) {
                        if self.leaving {
                            tracing::info!(id=%self.id, "removal from the cluster committed");
                            self.leaving = false;
                        }
                        if self.target_state != State::Leader {
                            self.set_target_state(State::NonVoter);
                        }
                    }
                    if self.target_state == State::Leader {
                        self.reconfig_driver().await?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn config_summary(config: &crate::ServerSet) -> String {
    let ids = config.keys().map(|sid| sid.to_string()).collect::<Vec<_>>();
    ids.join(" ")
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// The role a server currently plays in its cluster.
///
/// Transitions are driven by the election timers and the term rule;
/// `Shutdown` is terminal and only ever entered deliberately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Accepts replicated entries and snapshots but holds no vote and runs
    /// no election timer. Servers still joining the cluster, and servers
    /// whose removal has committed, sit here.
    NonVoter,
    /// A voting member tracking the leader's log, ready to campaign the
    /// moment the leader goes quiet.
    Follower,
    /// Campaigning for the term it just opened, waiting on vote replies.
    Candidate,
    /// The one server that may append commands and configuration entries in
    /// the current term.
    Leader,
    /// Tearing down: outstanding commands fail and the durability worker is
    /// joined.
    Shutdown,
}

impl State {
    pub fn is_non_voter(&self) -> bool {
        *self == State::NonVoter
    }

    pub fn is_follower(&self) -> bool {
        *self == State::Follower
    }

    pub fn is_candidate(&self) -> bool {
        *self == State::Candidate
    }

    pub fn is_leader(&self) -> bool {
        *self == State::Leader
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, T: Transport, B: StorageBackend> {
    core: &'a mut RaftCore<T, B>,
}

impl<'a, T: Transport, B: StorageBackend> LeaderState<'a, T, B> {
    pub(self) fn new(core: &'a mut RaftCore<T, B>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="leader"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.establish_leadership().await?;
        self.core.report_metrics();

        let mut heartbeat = interval(self.core.config.heartbeat_interval());
        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);
                return Ok(());
            }

            tokio::select! {
                _ = heartbeat.tick() => {
                    self.core.expire_stalled_changes().await;
                    self.core.send_heartbeats().await;
                }
                Some(msg) = self.core.rx_api.recv() => {
                    if let Err(err) = self.core.handle_msg(msg).await {
                        // A fatal error has already moved us to Shutdown.
                        tracing::error!(error=%err, "error handling message");
                    }
                }
                res = self.core.rx_durable.changed() => {
                    if res.is_ok() {
                        self.core.fire_ready_waiters().await;
                        self.core.report_metrics();
                    }
                }
                _ = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, T: Transport, B: StorageBackend> {
    core: &'a mut RaftCore<T, B>,
}

impl<'a, T: Transport, B: StorageBackend> CandidateState<'a, T, B> {
    pub(self) fn new(core: &'a mut RaftCore<T, B>) -> Self {
        Self { core }
    }

    /// Run the candidate loop. Each iteration of the outer loop represents
    /// a new term.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="candidate"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            self.core.start_election().await?;
            self.core.report_metrics();

            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // This election timed out. Break to the outer loop,
                    // which starts a new term.
                    _ = timeout_fut => break,
                    Some(msg) = self.core.rx_api.recv() => {
                        if let Err(err) = self.core.handle_msg(msg).await {
                            // A fatal error has already moved us to Shutdown.
                            tracing::error!(error=%err, "error handling message");
                        }
                    }
                    res = self.core.rx_durable.changed() => {
                        if res.is_ok() {
                            self.core.fire_ready_waiters().await;
                            self.core.report_metrics();
                        }
                    }
                    _ = &mut self.core.rx_shutdown => {
                        self.core.set_target_state(State::Shutdown);
                    }
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub struct FollowerState<'a, T: Transport, B: StorageBackend> {
    core: &'a mut RaftCore<T, B>,
}

impl<'a, T: Transport, B: StorageBackend> FollowerState<'a, T, B> {
    pub(self) fn new(core: &'a mut RaftCore<T, B>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            // The deadline moves as valid leader traffic arrives.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                _ = election_timeout => {
                    self.core.next_election_timeout = None;
                    if self.core.leaving {
                        self.core.leave_tick().await;
                    } else {
                        tracing::info!(id=%self.core.id, "election timeout, becoming candidate");
                        self.core.set_target_state(State::Candidate);
                    }
                }
                Some(msg) = self.core.rx_api.recv() => {
                    if let Err(err) = self.core.handle_msg(msg).await {
                        // A fatal error has already moved us to Shutdown.
                        tracing::error!(error=%err, "error handling message");
                    }
                }
                res = self.core.rx_durable.changed() => {
                    if res.is_ok() {
                        self.core.fire_ready_waiters().await;
                        self.core.report_metrics();
                    }
                }
                _ = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in non-voter state.
///
/// Non-voters never start elections; their timer drives the join and leave
/// request loops instead.
pub struct NonVoterState<'a, T: Transport, B: StorageBackend> {
    core: &'a mut RaftCore<T, B>,
}

impl<'a, T: Transport, B: StorageBackend> NonVoterState<'a, T, B> {
    pub(self) fn new(core: &'a mut RaftCore<T, B>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=%self.core.id, raft_state="non-voter"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        if self.core.joining {
            self.core.join_tick().await;
        }
        loop {
            if !self.core.target_state.is_non_voter() {
                return Ok(());
            }
            let retry_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                _ = retry_timeout => {
                    self.core.next_election_timeout = None;
                    if self.core.joining {
                        self.core.join_tick().await;
                    } else if self.core.leaving {
                        self.core.leave_tick().await;
                    }
                }
                Some(msg) = self.core.rx_api.recv() => {
                    if let Err(err) = self.core.handle_msg(msg).await {
                        // A fatal error has already moved us to Shutdown.
                        tracing::error!(error=%err, "error handling message");
                    }
                }
                res = self.core.rx_durable.changed() => {
                    if res.is_ok() {
                        self.core.fire_ready_waiters().await;
                        self.core.report_metrics();
                    }
                }
                _ = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}
