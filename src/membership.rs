//! Cluster membership bookkeeping.
//!
//! The membership is a reactive view over the log: the configuration in
//! force is the latest `Servers` entry, committed or not, falling back to
//! the snapshot's membership. On top of that view sit the leader-only
//! pieces: per-server replication bookkeeping, the set of servers being
//! caught up before they join, and the one removal allowed in flight.

use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ChangeStatus;
use crate::Address;
use crate::Index;
use crate::ServerId;
use crate::ServerSet;

/// Where a server stands in the membership-change lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// An ordinary member.
    Stable,
    /// Being added; still replaying the log.
    Catchup,
    /// Being added; fully caught up, waiting for the driver to commit it.
    CaughtUp,
    /// Its configuration entry is appended and awaiting commit.
    Committing,
    /// Scheduled for removal.
    Remove,
}

/// Who asked for a membership change, so the outcome can be reported.
#[derive(Debug)]
pub enum Originator {
    /// A local API call.
    Api(oneshot::Sender<ChangeStatus>),
    /// A peer, typically the joining server itself.
    Peer(ServerId, Address),
}

/// One known server: identity plus the leader-side replication state.
#[derive(Debug)]
pub struct Server {
    pub sid: ServerId,
    pub address: Address,
    pub phase: Phase,
    /// The next log index to send. Leader-only.
    pub next_index: Index,
    /// The highest index known replicated. Leader-only.
    pub match_index: Index,
    /// Whether this peer granted its vote in the current election.
    pub voted: Option<bool>,
    /// When a snapshot transfer is under way, the next byte offset to send.
    pub snapshot_offset: Option<u64>,
    /// Who to notify when the change involving this server resolves.
    pub reply_to: Option<Originator>,
    /// For a server being added, when its catch-up must have completed.
    pub catchup_deadline: Option<Instant>,
}

impl Server {
    pub fn new(sid: ServerId, address: Address, phase: Phase) -> Self {
        Self {
            sid,
            address,
            phase,
            next_index: 0,
            match_index: 0,
            voted: None,
            snapshot_offset: None,
            reply_to: None,
            catchup_deadline: None,
        }
    }

    /// Reset the leader-side bookkeeping when a new leadership term starts.
    pub fn reset_replication(&mut self, log_end: Index) {
        self.next_index = log_end;
        self.match_index = 0;
        self.snapshot_offset = None;
    }
}

/// The full membership state of one node.
#[derive(Debug, Default)]
pub struct Membership {
    /// The configuration in force, keyed by server id.
    servers: BTreeMap<ServerId, Server>,
    /// Servers being caught up before they can be added. Leader-only.
    pub pending_add: BTreeMap<ServerId, Server>,
    /// The one removal that may be in flight. Leader-only.
    pub pending_remove: Option<Server>,
}

impl Membership {
    pub fn from_config(config: &ServerSet) -> Self {
        let mut membership = Self::default();
        membership.apply_config(config);
        membership
    }

    pub fn contains(&self, sid: &ServerId) -> bool {
        self.servers.contains_key(sid)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Votes needed to win an election or commit an entry.
    pub fn majority(&self) -> usize {
        self.servers.len() / 2 + 1
    }

    pub fn get(&self, sid: &ServerId) -> Option<&Server> {
        self.servers.get(sid)
    }

    pub fn get_mut(&mut self, sid: &ServerId) -> Option<&mut Server> {
        self.servers.get_mut(sid)
    }

    /// Remove a member's record outright, keeping its bookkeeping and
    /// originator with it.
    pub fn take_server(&mut self, sid: &ServerId) -> Option<Server> {
        self.servers.remove(sid)
    }

    /// Look a server up among members and pending additions alike.
    pub fn any_mut(&mut self, sid: &ServerId) -> Option<&mut Server> {
        if self.servers.contains_key(sid) {
            return self.servers.get_mut(sid);
        }
        self.pending_add.get_mut(sid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Server> {
        self.servers.values_mut()
    }

    /// The ids of every member except `me`.
    pub fn peer_ids(&self, me: &ServerId) -> Vec<ServerId> {
        self.servers.keys().filter(|sid| *sid != me).cloned().collect()
    }

    /// Every server the leader replicates to: members plus pending
    /// additions, excluding `me`.
    pub fn replication_ids(&self, me: &ServerId) -> Vec<ServerId> {
        self.servers
            .keys()
            .chain(self.pending_add.keys())
            .filter(|sid| *sid != me)
            .cloned()
            .collect()
    }

    /// The configuration as a plain id-to-address set.
    pub fn to_config(&self) -> ServerSet {
        self.servers.iter().map(|(sid, s)| (*sid, s.address.clone())).collect()
    }

    /// Reconcile the member table with a configuration read from the log,
    /// preserving bookkeeping for servers that stay.
    pub fn apply_config(&mut self, config: &ServerSet) {
        let mut old = std::mem::take(&mut self.servers);
        for (sid, address) in config {
            let server = match old.remove(sid) {
                Some(mut server) => {
                    server.address = address.clone();
                    server
                }
                None => match self.pending_add.remove(sid) {
                    // A pending addition whose configuration entry reached
                    // the log graduates with its catch-up state intact.
                    Some(mut server) => {
                        server.phase = Phase::Committing;
                        server
                    }
                    None => Server::new(*sid, address.clone(), Phase::Stable),
                },
            };
            self.servers.insert(*sid, server);
        }
    }

    /// Count the votes granted this term, including our own if recorded.
    pub fn granted_votes(&self) -> usize {
        self.servers.values().filter(|s| s.voted == Some(true)).count()
    }

    pub fn clear_votes(&mut self) {
        for server in self.servers.values_mut() {
            server.voted = None;
        }
    }

    /// Reset all leader-side replication state at the start of a term.
    pub fn reset_replication(&mut self, log_end: Index) {
        for server in self.servers.values_mut() {
            server.reset_replication(log_end);
        }
        for server in self.pending_add.values_mut() {
            server.reset_replication(log_end);
        }
    }

    /// Indices replicated on members, for majority commit checks. Includes
    /// a slot for every member; `me` must have been kept current through
    /// its own durability acknowledgements.
    pub fn match_indexes(&self) -> Vec<Index> {
        self.servers.values().map(|s| s.match_index).collect()
    }
}
