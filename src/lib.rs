//! A Raft consensus engine for replicating a configuration database's
//! command log across a small set of peer servers.
//!
//! The engine exposes a single-writer, majority-commit log. Every node runs
//! an identical state machine driven by the entries the engine delivers in
//! log order through [`Raft::next_entry`].
//!
//! The crate is organized around one spawned core task which owns all
//! consensus state (see the `core` module), a durability worker which owns
//! fsync (see `storage::durability`), and two seams the embedding
//! application provides: a [`Transport`] carrying envelopes between peers
//! and a [`StorageBackend`] holding the append-only record file.

pub use async_trait;

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod membership;
pub mod metrics;
pub mod network;
pub mod raft;
pub mod storage;

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

pub use crate::config::Config;
pub use crate::core::State;
pub use crate::error::ChangeStatus;
pub use crate::error::CommandStatus;
pub use crate::error::RaftError;
pub use crate::error::StoreError;
pub use crate::metrics::RaftMetrics;
pub use crate::network::Address;
pub use crate::network::Transport;
pub use crate::raft::Command;
pub use crate::raft::Raft;
pub use crate::storage::StorageBackend;

/// A Raft election term.
///
/// Terms act as a logical clock; they only ever grow within a server's
/// persisted state.
pub type Term = u64;

/// A position in the replicated log.
///
/// Indices are dense. Index 1 is a sentinel meaning "prior to any entry";
/// the first real entry of a cluster sits at index 2.
pub type Index = u64;

/// The sentinel index preceding any real log entry.
pub const SENTINEL_INDEX: Index = 1;

/// The unique ID of a server, stable for the life of its data directory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    /// Generate a fresh random ID.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ServerId {
    /// Servers print as the first four hex digits of their UUID, which is
    /// plenty to tell 3-7 peers apart in a log line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..4])
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self.0)
    }
}

/// The unique ID of a cluster, generated once at cluster creation and
/// adopted by every server that joins.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub Uuid);

impl ClusterId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..4])
    }
}

impl fmt::Debug for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterId({})", self.0)
    }
}

/// The id of a log entry: its term and index together.
///
/// Log up-to-dateness comparisons (§5.4.1 of the Raft spec) are exactly the
/// derived lexicographic order on `(term, index)`.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: Term,
    pub index: Index,
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// The set of servers forming a cluster configuration, keyed by id.
pub type ServerSet = BTreeMap<ServerId, Address>;

/// A Raft log entry.
///
/// An entry's index is implied by its position in the log; only the term
/// travels with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub term: Term,
    pub payload: EntryPayload,
}

impl Summary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.term, self.payload.summary())
    }
}

impl Summary for &[Entry] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            res.push(x.summary());
        }
        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An application command, opaque to the engine.
    Data(Vec<u8>),
    /// A cluster configuration change.
    Servers(ServerSet),
}

impl EntryPayload {
    pub fn is_servers(&self) -> bool {
        matches!(self, EntryPayload::Servers(_))
    }
}

impl Summary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Data(d) => format!("data({}B)", d.len()),
            EntryPayload::Servers(s) => {
                let ids = s.keys().map(|sid| sid.to_string()).collect::<Vec<_>>();
                format!("servers({})", ids.join(" "))
            }
        }
    }
}

/// A compact, single-line rendering of a message for log output.
pub trait Summary {
    fn summary(&self) -> String;
}
