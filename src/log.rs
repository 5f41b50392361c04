//! The in-memory log with its snapshot prefix.
//!
//! A [`RaftLog`] holds the dense entry range `[log_start, log_end)` plus a
//! summary of everything before it: `prev_index`/`prev_term` describe the
//! entry immediately preceding `log_start`, `prev_servers` is the membership
//! in force at that point, and `snapshot_data` is the state machine image
//! covering it. `prev_index + 1 == log_start` always.

use crate::error::StoreError;
use crate::Entry;
use crate::EntryPayload;
use crate::Index;
use crate::LogId;
use crate::ServerSet;
use crate::storage::Recovered;
use crate::Term;

pub struct RaftLog {
    prev_term: Term,
    prev_index: Index,
    prev_servers: ServerSet,
    snapshot_data: Vec<u8>,
    entries: Vec<Entry>,
    /// Set when an append failed to persist. Later appends in the same term
    /// are refused so a partially written suffix can never grow.
    failed_term: Option<Term>,
}

impl RaftLog {
    pub fn from_recovered(rec: &Recovered) -> Self {
        Self {
            prev_term: rec.prev_term,
            prev_index: rec.prev_index,
            prev_servers: rec.prev_servers.clone(),
            snapshot_data: rec.snapshot_data.clone(),
            entries: rec.entries.clone(),
            failed_term: None,
        }
    }

    pub fn prev_index(&self) -> Index {
        self.prev_index
    }

    pub fn prev_term(&self) -> Term {
        self.prev_term
    }

    pub fn prev_servers(&self) -> &ServerSet {
        &self.prev_servers
    }

    pub fn snapshot_data(&self) -> &[u8] {
        &self.snapshot_data
    }

    /// The first in-memory index.
    pub fn log_start(&self) -> Index {
        self.prev_index + 1
    }

    /// One past the last appended index.
    pub fn log_end(&self) -> Index {
        self.log_start() + self.entries.len() as u64
    }

    /// The last appended index, or `prev_index` when empty.
    pub fn last_index(&self) -> Index {
        self.log_end() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: Index) -> Option<&Entry> {
        if index < self.log_start() || index >= self.log_end() {
            return None;
        }
        Some(&self.entries[(index - self.log_start()) as usize])
    }

    /// The term at `index`. Defined for `prev_index` itself and for every
    /// in-memory entry.
    pub fn term(&self, index: Index) -> Option<Term> {
        if index == self.prev_index {
            return Some(self.prev_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(self.prev_term)
    }

    pub fn last_log_id(&self) -> LogId {
        LogId {
            term: self.last_term(),
            index: self.last_index(),
        }
    }

    /// Entries from `index` to the end.
    pub fn entries_from(&self, index: Index) -> &[Entry] {
        let start = index.max(self.log_start());
        if start >= self.log_end() {
            return &[];
        }
        &self.entries[(start - self.log_start()) as usize..]
    }

    /// Refuse writes after an earlier persist failure in the same term.
    pub fn check_writable(&self, term: Term) -> Result<(), StoreError> {
        match self.failed_term {
            Some(failed) if failed == term => Err(StoreError::Sticky { term }),
            _ => Ok(()),
        }
    }

    pub fn mark_write_failed(&mut self, term: Term) {
        self.failed_term = Some(term);
    }

    /// Append one entry in memory and return its index. The caller persists
    /// the matching record and rolls back with [`RaftLog::pop`] on failure.
    pub fn push(&mut self, entry: Entry) -> Index {
        self.entries.push(entry);
        self.last_index()
    }

    pub fn pop(&mut self) {
        self.entries.pop();
    }

    /// Drop all entries at and above `new_end`. Returns whether any removed
    /// entry carried a configuration, in which case the caller must
    /// recompute membership.
    pub fn truncate(&mut self, new_end: Index) -> bool {
        assert!(new_end >= self.log_start(), "cannot truncate into the snapshot");
        if new_end >= self.log_end() {
            return false;
        }
        let keep = (new_end - self.log_start()) as usize;
        let removed_servers = self.entries[keep..].iter().any(|e| e.payload.is_servers());
        self.entries.truncate(keep);
        removed_servers
    }

    /// The latest configuration in the log, committed or not.
    pub fn latest_servers(&self) -> &ServerSet {
        self.latest_servers_at_or_below(self.last_index())
    }

    /// The latest configuration at or below `index`. Falls back to the
    /// snapshot's membership when no configuration entry qualifies.
    pub fn latest_servers_at_or_below(&self, index: Index) -> &ServerSet {
        let end = (index + 1).min(self.log_end());
        if end > self.log_start() {
            let upto = (end - self.log_start()) as usize;
            for entry in self.entries[..upto].iter().rev() {
                if let EntryPayload::Servers(servers) = &entry.payload {
                    return servers;
                }
            }
        }
        &self.prev_servers
    }

    /// Advance the snapshot prefix to cover everything through `new_prev`,
    /// discarding the entries it subsumes. `new_prev` must be an in-memory
    /// index whose entries have been applied.
    pub fn compact(&mut self, new_prev: Index, servers: ServerSet, data: Vec<u8>) {
        assert!(new_prev >= self.log_start() && new_prev < self.log_end());
        let new_prev_term = self.term(new_prev).expect("compaction point must be in the log");
        let covered = (new_prev + 1 - self.log_start()) as usize;
        self.entries.drain(..covered);
        self.prev_index = new_prev;
        self.prev_term = new_prev_term;
        self.prev_servers = servers;
        self.snapshot_data = data;
    }

    /// Replace the prefix with a snapshot received from the leader, keeping
    /// any in-memory entries strictly above `last_index`.
    pub fn install_snapshot(
        &mut self,
        last_term: Term,
        last_index: Index,
        servers: ServerSet,
        data: Vec<u8>,
    ) {
        if last_index + 1 > self.log_start() {
            let covered = ((last_index + 1 - self.log_start()) as usize).min(self.entries.len());
            self.entries.drain(..covered);
        }
        // An entry left at last_index + 1 whose own consistency depended on
        // a conflicting predecessor is overwritten later by replication; the
        // snapshot itself is authoritative through last_index.
        self.prev_index = last_index;
        self.prev_term = last_term;
        self.prev_servers = servers;
        self.snapshot_data = data;
    }

    /// Decide how an AppendEntries request applies to this log.
    pub fn plan_append(
        &self,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: &[Entry],
    ) -> AppendPlan {
        let mut prev_log_index = prev_log_index;
        let mut prev_log_term = prev_log_term;
        let mut offset = 0usize;

        if prev_log_index < self.prev_index {
            let request_last = prev_log_index + entries.len() as u64;
            if request_last < self.prev_index {
                // Entirely inside the compacted, committed prefix.
                return AppendPlan::Vacuous;
            }
            // The element at prev_index is kept only to validate its term
            // against the snapshot; the consistency check resumes there.
            let at_prev = &entries[(self.prev_index - prev_log_index - 1) as usize];
            if at_prev.term != self.prev_term {
                return AppendPlan::Reject;
            }
            offset = (self.prev_index - prev_log_index) as usize;
            prev_log_term = at_prev.term;
            prev_log_index = self.prev_index;
        }

        if prev_log_index == self.prev_index {
            if prev_log_term != self.prev_term {
                return AppendPlan::Reject;
            }
        } else if prev_log_index < self.log_end() {
            if self.term(prev_log_index) != Some(prev_log_term) {
                return AppendPlan::Reject;
            }
        } else {
            // A gap: the leader is ahead of everything we hold.
            return AppendPlan::Reject;
        }

        // Walk the remaining entries looking for the first divergence.
        let mut truncate_to = None;
        let mut append_from = entries.len();
        for (i, entry) in entries.iter().enumerate().skip(offset) {
            let index = prev_log_index + 1 + (i - offset) as u64;
            if index >= self.log_end() {
                append_from = i;
                break;
            }
            if self.term(index) != Some(entry.term) {
                truncate_to = Some(index);
                append_from = i;
                break;
            }
        }

        if truncate_to.is_none() && append_from == entries.len() {
            return AppendPlan::AlreadyPresent;
        }
        AppendPlan::Splice {
            truncate_to,
            append_from,
        }
    }
}

/// The outcome of checking an AppendEntries request against the log.
#[derive(Debug, PartialEq)]
pub enum AppendPlan {
    /// The consistency check failed; the request must be rejected.
    Reject,
    /// The request concerns only data already compacted into the snapshot.
    Vacuous,
    /// Every entry in the request is already in the log.
    AlreadyPresent,
    /// Accept: truncate to `truncate_to` if set, then append the request's
    /// entries starting at position `append_from`.
    Splice {
        truncate_to: Option<Index>,
        append_from: usize,
    },
}
