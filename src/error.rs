//! Error types and protocol status codes.

use serde::Deserialize;
use serde::Serialize;

use crate::Index;
use crate::ServerId;

/// Errors surfaced by the public Raft API.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// The engine is shutting down and can no longer accept work.
    #[error("raft is shutting down")]
    ShuttingDown,
    /// An error coming from the storage layer.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    /// The store on disk does not describe a cluster this server belongs to.
    #[error("server {sid} is not a member of the recovered configuration")]
    NotInMembership { sid: ServerId },
    /// A snapshot was requested at a point where nothing can be compacted.
    #[error("nothing to compact: last applied index is {last_applied}")]
    NothingToCompact { last_applied: Index },
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors from the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The file exists but does not start with the expected magic line.
    #[error("not a raft log file (bad magic)")]
    BadMagic,
    /// A record in the interior of the file failed to parse. Unlike a
    /// truncated final record, this cannot be explained by a crash during
    /// append and makes the store unusable.
    #[error("corrupt record at line {line}: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },
    /// The record stream is well formed but semantically impossible, for
    /// example a log record before any snapshot.
    #[error("malformed record stream: {0}")]
    Malformed(&'static str),
    /// A previous append in this term failed, so the log can accept no more
    /// writes until a new term begins.
    #[error("log writes disabled after earlier failure in term {term}")]
    Sticky { term: u64 },
}

/// Errors detected while validating a [`crate::Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("election timeout base is too short")]
    ElectionTimeoutTooShort,
    #[error("election timeout randomization window must be non-empty")]
    ElectionTimeoutRangeEmpty,
    #[error("snapshot chunk size must be non-zero")]
    SnapshotChunkSizeZero,
}

/// Errors parsing a peer [`crate::Address`].
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum AddressError {
    #[error("unknown scheme in address `{0}`")]
    UnknownScheme(String),
    #[error("missing host in address `{0}`")]
    MissingHost(String),
    #[error("invalid port in address `{0}`")]
    InvalidPort(String),
}

/// The lifecycle status of a submitted command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Still replicating; not yet committed.
    Incomplete,
    /// Committed and delivered to the state machine.
    Success,
    /// This server was not the leader at submission time.
    NotLeader,
    /// This server lost leadership before the command committed. The command
    /// may or may not survive under the new leader.
    LostLeadership,
    /// The engine shut down before the command committed.
    Shutdown,
    /// The submitted prerequisite did not match the applied log.
    BadPrereq,
    /// The command could not be appended to the local log.
    Failed,
}

impl CommandStatus {
    /// Whether this status is terminal.
    pub fn is_final(&self) -> bool {
        !matches!(self, CommandStatus::Incomplete)
    }
}

/// The outcome of an add-server or remove-server request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeStatus {
    /// The change committed.
    Ok,
    /// The change would not alter the configuration.
    NoOp,
    /// The same change is already being carried out.
    InProgress,
    /// The server being added could not be caught up within the configured
    /// window; the leader abandoned the change.
    Timeout,
    /// The receiving server is not the leader.
    NotLeader,
    /// Leadership was lost while the change was in flight.
    LostLeadership,
    /// The request was withdrawn or refused.
    Canceled,
    /// The change is appended and awaiting commit.
    Committing,
    /// Removing the server would leave the cluster empty.
    Empty,
}
