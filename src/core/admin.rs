//! Cluster membership changes, one server at a time, plus the join and
//! leave drivers a server runs on its own behalf.

use tokio::time::Instant;

use crate::core::RaftCore;
use crate::core::State;
use crate::error::ChangeStatus;
use crate::error::CommandStatus;
use crate::error::RaftResult;
use crate::membership::Originator;
use crate::membership::Phase;
use crate::membership::Server;
use crate::network::Transport;
use crate::raft::AddServerReply;
use crate::raft::AddServerRequest;
use crate::raft::Payload;
use crate::raft::RemoveServerReply;
use crate::raft::RemoveServerRequest;
use crate::storage::StorageBackend;
use crate::Address;
use crate::EntryPayload;
use crate::ServerId;

impl<T: Transport, B: StorageBackend> RaftCore<T, B> {
    /// Answer an add-server request (§4 of the membership change design:
    /// only one uncommitted configuration change may exist at a time).
    #[tracing::instrument(level = "debug", skip(self, origin), fields(sid=%sid))]
    pub(super) async fn handle_add_server_request(
        &mut self,
        origin: Originator,
        sid: ServerId,
        address: Address,
    ) -> RaftResult<()> {
        if !self.target_state.is_leader() {
            self.respond_add(origin, ChangeStatus::NotLeader).await;
            return Ok(());
        }

        if sid == self.id || self.membership.contains(&sid) {
            // Adding a member scheduled for removal cancels the removal.
            let was_removing = self
                .membership
                .get(&sid)
                .map(|s| s.phase == Phase::Remove)
                .unwrap_or(false);
            if was_removing {
                let old_origin = {
                    let server = self.membership.get_mut(&sid).expect("member exists");
                    server.phase = Phase::Stable;
                    server.reply_to.take()
                };
                if let Some(old_origin) = old_origin {
                    self.respond_remove(old_origin, ChangeStatus::Canceled).await;
                }
                self.respond_add(origin, ChangeStatus::Ok).await;
            } else {
                self.respond_add(origin, ChangeStatus::NoOp).await;
            }
            return Ok(());
        }

        if self.membership.pending_add.contains_key(&sid) {
            self.respond_add(origin, ChangeStatus::InProgress).await;
            return Ok(());
        }
        if self.membership.pending_remove.as_ref().map(|s| s.sid) == Some(sid) {
            // Its removal is appended and awaiting commit.
            self.respond_add(origin, ChangeStatus::Committing).await;
            return Ok(());
        }

        tracing::info!(sid=%sid, address=%address, "catching up a new server");
        let mut server = Server::new(sid, address, Phase::Catchup);
        server.reset_replication(self.log.log_end());
        server.reply_to = Some(origin);
        server.catchup_deadline = Some(Instant::now() + self.config.change_timeout);
        self.membership.pending_add.insert(sid, server);

        // Probe immediately; the reply walks next_index back and usually
        // degenerates into a snapshot transfer.
        self.replicate_to(sid, true).await;
        Ok(())
    }

    /// Answer a remove-server request.
    #[tracing::instrument(level = "debug", skip(self, origin), fields(sid=%sid))]
    pub(super) async fn handle_remove_server_request(
        &mut self,
        origin: Originator,
        sid: ServerId,
    ) -> RaftResult<()> {
        if !self.target_state.is_leader() {
            self.respond_remove(origin, ChangeStatus::NotLeader).await;
            return Ok(());
        }
        if sid == self.id {
            // Removing the leader needs a leadership transfer first.
            tracing::warn!("refusing to remove ourselves while leading");
            self.respond_remove(origin, ChangeStatus::Canceled).await;
            return Ok(());
        }

        if let Some(mut server) = self.membership.pending_add.remove(&sid) {
            // Never made it in; cancel the catch-up instead.
            if let Some(add_origin) = server.reply_to.take() {
                self.respond_add(add_origin, ChangeStatus::Canceled).await;
            }
            self.respond_remove(origin, ChangeStatus::Ok).await;
            return Ok(());
        }

        if !self.membership.contains(&sid) {
            let status = if self.membership.pending_remove.as_ref().map(|s| s.sid) == Some(sid) {
                ChangeStatus::InProgress
            } else {
                ChangeStatus::NoOp
            };
            self.respond_remove(origin, status).await;
            return Ok(());
        }

        // Pending additions do not count toward the survivors.
        if self.membership.len() <= 1 {
            self.respond_remove(origin, ChangeStatus::Empty).await;
            return Ok(());
        }

        {
            let server = self.membership.get_mut(&sid).expect("member exists");
            if server.phase == Phase::Remove {
                self.respond_remove(origin, ChangeStatus::InProgress).await;
                return Ok(());
            }
            tracing::info!(sid=%sid, "scheduling removal");
            server.phase = Phase::Remove;
            server.reply_to = Some(origin);
        }
        self.reconfig_driver().await
    }

    /// The reconfiguration driver. Runs whenever a configuration entry
    /// commits or a catch-up completes; carries at most one change at a
    /// time from scheduled to committed.
    pub(super) async fn reconfig_driver(&mut self) -> RaftResult<()> {
        if !self.target_state.is_leader() {
            return Ok(());
        }

        // A configuration entry still in flight blocks everything else.
        for index in (self.commit_index + 1)..self.log.log_end() {
            if let Some(entry) = self.log.entry(index) {
                if entry.payload.is_servers() {
                    return Ok(());
                }
            }
        }

        // Changes whose entry has committed are final; tell the originators.
        let committed: Vec<ServerId> = self
            .membership
            .iter()
            .filter(|s| s.phase == Phase::Committing)
            .map(|s| s.sid)
            .collect();
        for sid in committed {
            let origin = {
                let server = self.membership.get_mut(&sid).expect("member exists");
                server.phase = Phase::Stable;
                server.reply_to.take()
            };
            tracing::info!(sid=%sid, "server addition committed");
            if let Some(origin) = origin {
                self.respond_add(origin, ChangeStatus::Ok).await;
            }
        }
        if let Some(mut removed) = self.membership.pending_remove.take() {
            tracing::info!(sid=%removed.sid, "server removal committed");
            if let Some(origin) = removed.reply_to.take() {
                self.respond_remove(origin, ChangeStatus::Ok).await;
            }
        }

        // Promote one caught-up addition into the configuration.
        let next_add = self
            .membership
            .pending_add
            .iter()
            .find(|(_, s)| s.phase == Phase::CaughtUp)
            .map(|(sid, s)| (*sid, s.address.clone()));
        if let Some((sid, address)) = next_add {
            tracing::info!(sid=%sid, "committing server addition");
            let mut config = self.membership.to_config();
            config.insert(sid, address);
            return self.append_config(config).await;
        }

        // Otherwise start one scheduled removal. The configuration entry is
        // required: without it the shrunk cluster could elect a leader
        // missing the removal.
        let next_remove = self
            .membership
            .iter()
            .find(|s| s.phase == Phase::Remove)
            .map(|s| s.sid);
        if let Some(sid) = next_remove {
            tracing::info!(sid=%sid, "committing server removal");
            let mut config = self.membership.to_config();
            config.remove(&sid);
            // Hold the record aside so the originator hears the outcome.
            self.membership.pending_remove = self.membership.take_server(&sid);
            return self.append_config(config).await;
        }
        Ok(())
    }

    async fn append_config(&mut self, config: crate::ServerSet) -> RaftResult<()> {
        if let Err(err) = self.leader_append(EntryPayload::Servers(config)).await {
            tracing::error!(error=%err, "could not append configuration entry, stepping down");
            self.leadership_lost().await;
            self.current_leader = None;
            self.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Abandon catch-ups that blew through their window, so a server that
    /// never answers cannot leave its originator waiting forever. Checked
    /// from the leader's heartbeat tick.
    pub(super) async fn expire_stalled_changes(&mut self) {
        if !self.target_state.is_leader() {
            return;
        }
        let now = Instant::now();
        let expired: Vec<ServerId> = self
            .membership
            .pending_add
            .iter()
            .filter(|(_, s)| s.phase == Phase::Catchup)
            .filter(|(_, s)| s.catchup_deadline.map(|d| d <= now).unwrap_or(false))
            .map(|(sid, _)| *sid)
            .collect();
        for sid in expired {
            if let Some(mut server) = self.membership.pending_add.remove(&sid) {
                tracing::warn!(sid=%sid, "catch-up did not finish in time, abandoning the addition");
                if let Some(origin) = server.reply_to.take() {
                    self.respond_add(origin, ChangeStatus::Timeout).await;
                }
            }
        }
    }

    /// Leadership ended mid-term: fail what only a leader can finish.
    pub(super) async fn leadership_lost(&mut self) {
        self.complete_all_commands(CommandStatus::LostLeadership);
        self.fail_pending_changes(ChangeStatus::LostLeadership).await;
    }

    /// Report `status` to everyone awaiting a membership change outcome and
    /// reset the change machinery.
    pub(super) async fn fail_pending_changes(&mut self, status: ChangeStatus) {
        let pending: Vec<Server> = {
            let drained: Vec<ServerId> = self.membership.pending_add.keys().cloned().collect();
            drained
                .into_iter()
                .filter_map(|sid| self.membership.pending_add.remove(&sid))
                .collect()
        };
        for mut server in pending {
            if let Some(origin) = server.reply_to.take() {
                self.respond_add(origin, status).await;
            }
        }
        if let Some(mut removed) = self.membership.pending_remove.take() {
            if let Some(origin) = removed.reply_to.take() {
                self.respond_remove(origin, status).await;
            }
        }

        let with_replies: Vec<ServerId> = self
            .membership
            .iter()
            .filter(|s| s.phase != Phase::Stable)
            .map(|s| s.sid)
            .collect();
        for sid in with_replies {
            let (origin, was_remove) = {
                let server = self.membership.get_mut(&sid).expect("member exists");
                let was_remove = server.phase == Phase::Remove;
                server.phase = Phase::Stable;
                server.snapshot_offset = None;
                (server.reply_to.take(), was_remove)
            };
            if let Some(origin) = origin {
                if was_remove {
                    self.respond_remove(origin, status).await;
                } else {
                    self.respond_add(origin, status).await;
                }
            }
        }
    }

    async fn respond_add(&mut self, origin: Originator, status: ChangeStatus) {
        match origin {
            Originator::Api(tx) => {
                let _ = tx.send(status);
            }
            Originator::Peer(sid, address) => {
                let payload = Payload::AddServerReply(AddServerReply {
                    status,
                    leader_sid: self.current_leader,
                    leader_address: self.leader_address.clone(),
                });
                self.reply_to_address(sid, &address, payload).await;
            }
        }
    }

    async fn respond_remove(&mut self, origin: Originator, status: ChangeStatus) {
        match origin {
            Originator::Api(tx) => {
                let _ = tx.send(status);
            }
            Originator::Peer(sid, address) => {
                let payload = Payload::RemoveServerReply(RemoveServerReply {
                    status,
                    leader_sid: self.current_leader,
                    leader_address: self.leader_address.clone(),
                });
                self.reply_to_address(sid, &address, payload).await;
            }
        }
    }

    /// Reply to a server that may not have an established session keyed by
    /// its id yet, addressing the raw endpoint it told us about.
    async fn reply_to_address(&self, sid: ServerId, address: &Address, payload: Payload) {
        if sid == self.id {
            tracing::error!(to=%sid, "dropping reply addressed to ourselves");
            return;
        }
        let env = crate::raft::Envelope {
            to: Some(sid),
            from: self.id,
            cluster: self.metadata.cid,
            payload,
        };
        if let Err(err) = self.transport.send_to_address(address, env).await {
            tracing::debug!(addr=%address, error=%err, "dropping change reply to unreachable address");
        }
    }

    /// Periodically ask to be let into the cluster we were pointed at.
    pub(super) async fn join_tick(&mut self) {
        let payload = Payload::AddServerRequest(AddServerRequest {
            sid: self.id,
            address: self.metadata.local.clone(),
        });
        if let Some(addr) = self.leader_address.clone() {
            tracing::debug!(addr=%addr, "asking the leader to add us");
            self.send_to_address(&addr, payload).await;
            return;
        }
        let remotes = self.metadata.remotes.clone();
        for addr in remotes {
            tracing::debug!(addr=%addr, "asking a remote to add us");
            self.send_to_address(&addr, payload.clone()).await;
        }
    }

    /// Periodically ask the leader to remove us.
    pub(super) async fn leave_tick(&mut self) {
        if self.target_state.is_leader() {
            // Hand leadership off first; the next tick asks the new leader.
            tracing::info!("stepping down before leaving the cluster");
            self.leadership_lost().await;
            self.current_leader = None;
            self.update_next_election_timeout();
            self.set_target_state(State::Follower);
            return;
        }
        if let Some(leader) = self.current_leader {
            if leader != self.id {
                self.send_to_peer(
                    leader,
                    Payload::RemoveServerRequest(RemoveServerRequest { sid: self.id }),
                )
                .await;
            }
        }
    }

    /// A reply to one of our join requests.
    pub(super) async fn handle_add_server_reply(&mut self, rep: AddServerReply) {
        tracing::debug!(status=?rep.status, "add-server reply");
        match rep.status {
            ChangeStatus::NotLeader => {
                if rep.leader_address.is_some() {
                    self.leader_address = rep.leader_address;
                    self.current_leader = rep.leader_sid;
                    // Retry against the hinted leader without waiting out
                    // the full interval.
                    if self.joining {
                        self.join_tick().await;
                    }
                }
            }
            ChangeStatus::Ok | ChangeStatus::NoOp => {
                // Membership catches up through replication; nothing to do.
            }
            _ => {}
        }
    }

    /// A reply to one of our leave requests.
    pub(super) async fn handle_remove_server_reply(&mut self, rep: RemoveServerReply) {
        tracing::debug!(status=?rep.status, "remove-server reply");
        match rep.status {
            ChangeStatus::NotLeader => {
                if rep.leader_address.is_some() {
                    self.leader_address = rep.leader_address;
                    self.current_leader = rep.leader_sid;
                }
            }
            ChangeStatus::Ok | ChangeStatus::NoOp => {
                if self.leaving {
                    tracing::info!(id=%self.id, "left the cluster");
                    self.leaving = false;
                    self.set_target_state(State::NonVoter);
                }
            }
            _ => {}
        }
    }
}
