//! Log replication: the follower-side consistency check and splice, and the
//! leader-side pacing that reacts to replies.

use crate::core::RaftCore;
use crate::core::State;
use crate::core::Waiter;
use crate::error::RaftResult;
use crate::log::AppendPlan;
use crate::membership::Phase;
use crate::network::Transport;
use crate::raft::AppendReply;
use crate::raft::AppendRequest;
use crate::raft::Payload;
use crate::storage::Record;
use crate::storage::StorageBackend;
use crate::Index;
use crate::ServerId;

impl<T: Transport, B: StorageBackend> RaftCore<T, B> {
    /// Handle an AppendEntries request from the current-term leader (§5.3).
    ///
    /// The term rule has already run, so `req.term == current_term`.
    #[tracing::instrument(level = "trace", skip(self, req), fields(from=%from))]
    pub(super) async fn handle_append_request(
        &mut self,
        from: ServerId,
        req: AppendRequest,
    ) -> RaftResult<()> {
        if self.target_state.is_leader() {
            // Election Safety says this cannot happen.
            tracing::error!(from=%from, term=self.current_term, "second leader claims our term");
            return Ok(());
        }
        if self.target_state.is_candidate() {
            // Somebody else won this term.
            self.set_target_state(State::Follower);
        }
        self.current_leader = Some(req.leader_sid);
        self.leader_address = self.membership.get(&req.leader_sid).map(|s| s.address.clone());
        self.update_next_election_timeout();

        let n_entries = req.entries.len() as u64;
        let plan = self.log.plan_append(req.prev_log_index, req.prev_log_term, &req.entries);

        match plan {
            AppendPlan::Reject => {
                let reply = AppendReply {
                    term: self.current_term,
                    log_end: self.log.log_end(),
                    prev_log_index: req.prev_log_index,
                    prev_log_term: req.prev_log_term,
                    n_entries,
                    success: false,
                };
                self.send_to_peer(from, Payload::AppendReply(reply)).await;
                return Ok(());
            }
            AppendPlan::Vacuous | AppendPlan::AlreadyPresent => {
                self.accept_append(from, &req, n_entries, None).await?;
            }
            AppendPlan::Splice {
                truncate_to,
                append_from,
            } => {
                if let Some(at) = truncate_to {
                    if at <= self.commit_index {
                        // Log Matching guarantees committed entries never
                        // conflict; a request asking otherwise is broken.
                        tracing::error!(at, commit = self.commit_index, "refusing to truncate committed entries");
                        debug_assert!(false, "truncation below the commit index");
                        return Ok(());
                    }
                    if self.log.truncate(at) {
                        let config = self.log.latest_servers().clone();
                        self.membership.apply_config(&config);
                    }
                }

                let mut wrote_servers = false;
                for entry in &req.entries[append_from..] {
                    if let Err(err) = self.log.check_writable(self.current_term) {
                        tracing::error!(error=%err, "append refused by sticky write failure");
                        self.reply_append_failure(from, &req, n_entries).await;
                        return Ok(());
                    }
                    wrote_servers |= entry.payload.is_servers();
                    let index = self.log.push(entry.clone());
                    let record = Record::Entry {
                        index,
                        term: entry.term,
                        payload: entry.payload.clone(),
                    };
                    if let Err(err) = self.store.append(&record) {
                        tracing::error!(error=%err, index, "failed to persist replicated entry");
                        self.log.pop();
                        self.log.mark_write_failed(self.current_term);
                        self.reply_append_failure(from, &req, n_entries).await;
                        return Ok(());
                    }
                }

                if wrote_servers {
                    let config = self.log.latest_servers().clone();
                    self.membership.apply_config(&config);
                    self.note_config_observed();
                }

                let seq = self.request_durability();
                self.accept_append(from, &req, n_entries, Some(seq)).await?;
            }
        }
        Ok(())
    }

    /// The tail of a successful append: advance the commit index, apply, and
    /// schedule the durability-gated success reply.
    async fn accept_append(
        &mut self,
        from: ServerId,
        req: &AppendRequest,
        n_entries: u64,
        seq: Option<u64>,
    ) -> RaftResult<()> {
        let new_commit = req.leader_commit.min(req.prev_log_index + n_entries);
        if new_commit > self.commit_index {
            self.commit_index = new_commit.min(self.log.last_index());
            self.apply_committed().await?;
        }

        let reply = AppendReply {
            term: self.current_term,
            log_end: self.log.log_end(),
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            n_entries,
            success: true,
        };
        // Nothing new was written when `seq` is absent, but earlier writes
        // may still be syncing; gate on the latest requested sequence.
        let seq = seq.unwrap_or(self.last_durability_seq);
        self.register_waiter(
            seq,
            Waiter::Reply {
                to: from,
                payload: Payload::AppendReply(reply),
            },
        );
        Ok(())
    }

    async fn reply_append_failure(&mut self, from: ServerId, req: &AppendRequest, n_entries: u64) {
        let reply = AppendReply {
            term: self.current_term,
            log_end: self.log.log_end(),
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            n_entries,
            success: false,
        };
        self.send_to_peer(from, Payload::AppendReply(reply)).await;
    }

    /// A newly replicated configuration may end our joining phase or, when
    /// it no longer names us, park us as a non-voter.
    pub(super) fn note_config_observed(&mut self) {
        let am_member = self.membership.contains(&self.id);
        if self.joining && am_member {
            tracing::info!(id=%self.id, "joined the cluster");
            self.joining = false;
        }
        if am_member && self.target_state.is_non_voter() && !self.joining {
            self.set_target_state(State::Follower);
        }
    }

    /// Handle a follower's reply to one of our AppendEntries requests.
    #[tracing::instrument(level = "trace", skip(self, rep), fields(from=%from))]
    pub(super) async fn handle_append_reply(
        &mut self,
        from: ServerId,
        rep: AppendReply,
    ) -> RaftResult<()> {
        if !self.target_state.is_leader() || rep.term != self.current_term {
            return Ok(());
        }
        let log_start = self.log.log_start();
        let log_end = self.log.log_end();

        let server = match self.membership.any_mut(&from) {
            Some(server) => server,
            None => return Ok(()),
        };

        if rep.success {
            let matched = rep.prev_log_index + rep.n_entries;
            server.match_index = server.match_index.max(matched);
            server.next_index = server.next_index.max(matched + 1);
            let next = server.next_index;
            let phase = server.phase;

            if next < log_start {
                self.send_snapshot_chunk(from).await;
            } else if next < log_end {
                self.replicate_to(from, false).await;
            } else if phase == Phase::Catchup {
                if let Some(server) = self.membership.any_mut(&from) {
                    tracing::info!(sid=%from, "new server caught up");
                    server.phase = Phase::CaughtUp;
                }
                self.reconfig_driver().await?;
            }
            self.leader_advance_commit().await?;
        } else {
            // Walk next_index back, at most to the follower's own log end.
            server.next_index = server.next_index.saturating_sub(1).min(rep.log_end).max(1);
            self.replicate_to(from, false).await;
        }
        Ok(())
    }

    /// Send to one replication target: a snapshot chunk if it is behind our
    /// snapshot, otherwise an AppendEntries request. With `heartbeat` the
    /// request is empty; otherwise it carries the single entry at
    /// `next_index`, the one-in-flight pacing unit.
    pub(super) async fn replicate_to(&mut self, sid: ServerId, heartbeat: bool) {
        let next = match self.membership.any_mut(&sid) {
            Some(server) => server.next_index,
            None => return,
        };
        if next < self.log.log_start() {
            self.send_snapshot_chunk(sid).await;
            return;
        }

        let entries = if heartbeat || next >= self.log.log_end() {
            if !heartbeat {
                return;
            }
            Vec::new()
        } else {
            vec![self.log.entry(next).expect("next_index is in range").clone()]
        };

        let prev_log_index = next - 1;
        let prev_log_term = match self.log.term(prev_log_index) {
            Some(term) => term,
            None => {
                self.send_snapshot_chunk(sid).await;
                return;
            }
        };
        let req = AppendRequest {
            term: self.current_term,
            leader_sid: self.id,
            prev_log_index,
            prev_log_term,
            leader_commit: self.commit_index,
            entries,
        };
        self.send_to_peer(sid, Payload::AppendRequest(req)).await;
    }

    /// The periodic empty AppendEntries that suppresses follower elections.
    pub(super) async fn send_heartbeats(&mut self) {
        for sid in self.membership.replication_ids(&self.id) {
            self.replicate_to(sid, true).await;
        }
    }

    /// One of our own appends became durable; our replication slot counts
    /// toward majorities now.
    pub(super) async fn record_local_match(&mut self, index: Index) {
        if !self.target_state.is_leader() {
            return;
        }
        let me = self.id;
        if let Some(server) = self.membership.get_mut(&me) {
            server.match_index = server.match_index.max(index);
        }
        if let Err(err) = self.leader_advance_commit().await {
            tracing::error!(error=%err, "error advancing commit after local append");
        }
    }

    /// Advance the commit index to the highest current-term entry held by a
    /// majority of the configuration (§3.6). Entries from earlier terms
    /// commit only by implication, so the scan must not stop at the first
    /// index that lacks a majority.
    pub(super) async fn leader_advance_commit(&mut self) -> RaftResult<()> {
        let mut new_commit = self.commit_index;
        for n in (self.commit_index + 1)..self.log.log_end() {
            if self.log.term(n) != Some(self.current_term) {
                continue;
            }
            let replicated = self.membership.iter().filter(|s| s.match_index >= n).count();
            if replicated >= self.membership.majority() {
                new_commit = n;
            }
        }
        if new_commit > self.commit_index {
            tracing::debug!(from = self.commit_index, to = new_commit, "commit index advances");
            self.commit_index = new_commit;
            self.apply_committed().await?;
        }
        Ok(())
    }
}
