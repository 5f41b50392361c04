//! Elections: candidacy, the vote grant rules, and the transition to
//! leadership.

use crate::core::RaftCore;
use crate::core::State;
use crate::core::Waiter;
use crate::error::RaftResult;
use crate::network::Transport;
use crate::raft::Payload;
use crate::raft::VoteReply;
use crate::raft::VoteRequest;
use crate::storage::StorageBackend;
use crate::EntryPayload;
use crate::LogId;
use crate::ServerId;
use crate::Term;

impl<T: Transport, B: StorageBackend> RaftCore<T, B> {
    /// Open a new term as candidate: persist the term bump and our own vote,
    /// then campaign once both are durable.
    #[tracing::instrument(level = "debug", skip(self), fields(id=%self.id))]
    pub(super) async fn start_election(&mut self) -> RaftResult<()> {
        let new_term = self.current_term + 1;
        self.update_next_election_timeout();
        self.current_leader = None;

        match self.persist_term(new_term, Some(self.id)) {
            Ok(seq) => {
                tracing::info!(term = new_term, id=%self.id, "starting election");
                self.register_waiter(seq, Waiter::ElectionStarted { term: new_term });
                self.drain_ready_waiters().await;
                Ok(())
            }
            Err(err) => {
                // The candidacy never happened without the term on disk.
                // Fall back to follower and let the timer try again.
                tracing::error!(error=%err, "could not persist candidacy");
                self.set_target_state(State::Follower);
                Ok(())
            }
        }
    }

    /// Our candidacy record is durable: count our own vote and ask the rest
    /// of the configuration for theirs.
    pub(super) async fn on_election_durable(&mut self, term: Term) {
        if !self.target_state.is_candidate() || term != self.current_term {
            return;
        }
        let me = self.id;
        if let Some(server) = self.membership.get_mut(&me) {
            server.voted = Some(true);
        }
        if self.membership.granted_votes() >= self.membership.majority() {
            // A single-server configuration elects itself.
            self.set_target_state(State::Leader);
            return;
        }

        let req = VoteRequest {
            term,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for sid in self.membership.peer_ids(&me) {
            self.send_to_peer(sid, Payload::VoteRequest(req.clone())).await;
        }
    }

    /// Decide a vote request (§5.2, §5.4.1). The term rule has already run,
    /// so `req.term == current_term`.
    #[tracing::instrument(level = "trace", skip(self, req), fields(from=%from))]
    pub(super) async fn handle_vote_request(&mut self, from: ServerId, req: VoteRequest) {
        let candidate_last = LogId {
            term: req.last_log_term,
            index: req.last_log_index,
        };
        let up_to_date = candidate_last >= self.log.last_log_id();
        let vote_free = self.voted_for.is_none() || self.voted_for == Some(from);

        if !(up_to_date && vote_free) {
            self.send_to_peer(
                from,
                Payload::VoteReply(VoteReply {
                    term: self.current_term,
                    vote_granted: false,
                }),
            )
            .await;
            return;
        }

        if self.voted_for == Some(from) {
            if self.vote_persist_pending {
                // The grant is already on its way to disk; its waiter will
                // answer. Replying twice here could grant before persisting.
                return;
            }
            // Duplicate request for a vote already persisted.
            self.update_next_election_timeout();
            self.send_to_peer(
                from,
                Payload::VoteReply(VoteReply {
                    term: self.current_term,
                    vote_granted: true,
                }),
            )
            .await;
            return;
        }

        match self.persist_term(self.current_term, Some(from)) {
            Ok(seq) => {
                tracing::debug!(term = self.current_term, candidate=%from, "granting vote");
                self.vote_persist_pending = true;
                self.update_next_election_timeout();
                self.register_waiter(
                    seq,
                    Waiter::GrantedVote {
                        to: from,
                        term: self.current_term,
                    },
                );
            }
            Err(err) => {
                // An unpersisted grant is no grant at all; stay silent and
                // let the candidate's timer retry.
                tracing::error!(error=%err, "could not persist vote, withholding it");
            }
        }
    }

    /// Tally a vote reply while campaigning.
    pub(super) async fn handle_vote_reply(&mut self, from: ServerId, rep: VoteReply) -> RaftResult<()> {
        if !self.target_state.is_candidate() || rep.term != self.current_term {
            return Ok(());
        }
        if let Some(server) = self.membership.get_mut(&from) {
            if server.voted.is_none() {
                server.voted = Some(rep.vote_granted);
            }
        }
        if self.membership.granted_votes() >= self.membership.majority() {
            tracing::info!(term = self.current_term, id=%self.id, "won the election");
            self.set_target_state(State::Leader);
        }
        Ok(())
    }

    /// Set up leader volatile state and announce ourselves.
    pub(super) async fn establish_leadership(&mut self) -> RaftResult<()> {
        tracing::info!(term = self.current_term, id=%self.id, "assuming leadership");
        self.current_leader = Some(self.id);
        self.leader_address = Some(self.metadata.local.clone());
        self.next_election_timeout = None;
        self.membership.reset_replication(self.log.log_end());

        // Entries already persisted start counting toward majorities as
        // soon as the outstanding sync covers them.
        let me = self.id;
        if let Some(server) = self.membership.get_mut(&me) {
            server.match_index = self.commit_index;
        }
        let last = self.log.last_index();
        let seq = self.last_durability_seq;
        self.register_waiter(seq, Waiter::LocalAppend { index: last });

        // Write our configuration as the term's first entry. It is the
        // current-term entry that lets earlier-term entries commit, and it
        // finishes any half-replicated membership change. A lone fresh
        // server has nothing to catch up and skips it.
        if self.membership.len() > 1 || self.log.last_index() > self.commit_index {
            let config = self.log.latest_servers().clone();
            if let Err(err) = self.leader_append(EntryPayload::Servers(config)).await {
                tracing::error!(error=%err, "could not write the leadership configuration entry");
                self.leadership_lost().await;
                self.current_leader = None;
                self.set_target_state(State::Follower);
                return Ok(());
            }
        }

        self.send_heartbeats().await;
        self.drain_ready_waiters().await;
        Ok(())
    }
}
