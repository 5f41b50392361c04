//! Command submission and completion.

use tokio::sync::watch;

use crate::core::RaftCore;
use crate::core::State;
use crate::core::Waiter;
use crate::error::CommandStatus;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::network::Transport;
use crate::raft::Command;
use crate::storage::Record;
use crate::storage::StorageBackend;
use crate::Entry;
use crate::EntryPayload;
use crate::Index;

impl<T: Transport, B: StorageBackend> RaftCore<T, B> {
    /// Submit a command: append it, arm its completion, and push it to every
    /// peer already sitting at the tip of the log.
    #[tracing::instrument(level = "debug", skip(self, data, prereq))]
    pub(super) async fn handle_execute(&mut self, data: Vec<u8>, prereq: Option<Index>) -> Command {
        if !self.target_state.is_leader() {
            return Command::completed(CommandStatus::NotLeader);
        }
        if let Some(prereq) = prereq {
            if prereq != self.last_applied {
                tracing::debug!(prereq, last_applied = self.last_applied, "command prerequisite failed");
                return Command::completed(CommandStatus::BadPrereq);
            }
        }

        match self.leader_append(EntryPayload::Data(data)).await {
            Ok(index) => {
                let (tx, rx) = watch::channel(CommandStatus::Incomplete);
                self.commands.insert(index, tx);
                Command::pending(index, rx)
            }
            Err(err) => {
                // The log cannot take writes; a leader that cannot append
                // has nothing to offer.
                tracing::error!(error=%err, "command append failed, stepping down");
                self.leadership_lost().await;
                self.current_leader = None;
                self.set_target_state(State::Follower);
                Command::completed(CommandStatus::Failed)
            }
        }
    }

    /// Append an entry as leader: into memory, into the store, onto the
    /// durability queue, and out to every caught-up peer.
    pub(super) async fn leader_append(&mut self, payload: EntryPayload) -> RaftResult<Index> {
        self.log.check_writable(self.current_term)?;

        let is_servers = payload.is_servers();
        let entry = Entry {
            term: self.current_term,
            payload,
        };
        let index = self.log.push(entry.clone());
        let record = Record::Entry {
            index,
            term: entry.term,
            payload: entry.payload,
        };
        if let Err(err) = self.store.append(&record) {
            self.log.pop();
            self.log.mark_write_failed(self.current_term);
            return Err(RaftError::Store(err));
        }

        if is_servers {
            let config = self.log.latest_servers().clone();
            self.membership.apply_config(&config);
        }

        let seq = self.request_durability();
        self.register_waiter(seq, Waiter::LocalAppend { index });

        for sid in self.membership.replication_ids(&self.id) {
            let at_tip = self
                .membership
                .any_mut(&sid)
                .map(|s| s.next_index == index)
                .unwrap_or(false);
            if at_tip {
                self.replicate_to(sid, false).await;
            }
        }
        Ok(index)
    }

    /// Resolve the command completed by the entry at `index`, if any.
    pub(super) fn complete_command(&mut self, index: Index, status: CommandStatus) {
        if let Some(tx) = self.commands.remove(&index) {
            let _ = tx.send(status);
        }
    }

    /// Resolve every outstanding command, used at step-down and shutdown.
    pub(super) fn complete_all_commands(&mut self, status: CommandStatus) {
        let pending = std::mem::take(&mut self.commands);
        for (_, tx) in pending {
            let _ = tx.send(status);
        }
    }
}
