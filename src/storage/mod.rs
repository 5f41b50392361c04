//! The persistent store: an append-only stream of self-describing records.
//!
//! A store file begins with a magic line and continues with one JSON record
//! per line. Three groups of records exist: the header (identity of the
//! server and its cluster), at most one snapshot (the compacted log prefix),
//! and log records (entries plus term/vote advances). Recovery replays the
//! stream front to back, folding every record into in-memory state; a
//! truncated final record is treated as a crash during append and dropped.
//!
//! The engine appends records as state changes and asks the durability
//! worker (see [`durability`]) to make them stick. Compaction rewrites the
//! whole file through [`Store::rewrite`].

pub mod durability;

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::error::StoreError;
use crate::Address;
use crate::ClusterId;
use crate::Entry;
use crate::EntryPayload;
use crate::Index;
use crate::ServerId;
use crate::ServerSet;
use crate::Term;
use crate::SENTINEL_INDEX;

/// The first line of every store file.
pub const MAGIC: &str = "RAFTDB 1";

/// The byte-level home of a store: something that can hold an append-only
/// byte stream, extend it, atomically replace it, and make it durable.
///
/// All methods take `&self`; implementations carry their own interior
/// locking so the consensus task can append while the durability worker
/// syncs.
pub trait StorageBackend: Send + Sync + 'static {
    fn read_all(&self) -> io::Result<Vec<u8>>;
    fn append(&self, data: &[u8]) -> io::Result<()>;
    fn replace(&self, data: &[u8]) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

/// A store backed by a single file on disk.
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileBackend {
    /// Create a new, empty store file. Fails if the path already exists.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).append(true).create_new(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Open an existing store file.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut file = File::open(&self.path)?;
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn append(&self, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.write_all(data)
    }

    fn replace(&self, data: &[u8]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
            tmp.write_all(data)?;
            tmp.sync_all()?;
        }
        // Swap the live handle only after the rename cannot fail anymore.
        let mut file = self.file.lock().unwrap();
        fs::rename(&tmp_path, &self.path)?;
        *file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        let file = self.file.lock().unwrap();
        file.sync_all()
    }
}

/// A store held entirely in memory, for tests and ephemeral clusters.
///
/// Survives engine restarts as long as the same `Arc<MemBackend>` is reused,
/// which is exactly what recovery tests need.
#[derive(Default)]
pub struct MemBackend {
    buf: Mutex<Vec<u8>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chop off the tail of the stored bytes, simulating a torn final write.
    pub fn truncate_tail(&self, n: usize) {
        let mut buf = self.buf.lock().unwrap();
        let new_len = buf.len().saturating_sub(n);
        buf.truncate(new_len);
    }
}

impl StorageBackend for MemBackend {
    fn read_all(&self) -> io::Result<Vec<u8>> {
        Ok(self.buf.lock().unwrap().clone())
    }

    fn append(&self, data: &[u8]) -> io::Result<()> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn replace(&self, data: &[u8]) -> io::Result<()> {
        *self.buf.lock().unwrap() = data.to_vec();
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

/// One record in the store file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    /// Who this server is and which cluster it belongs to. Appended at
    /// creation and again whenever the cluster id is first learned; recovery
    /// folds later headers over earlier ones.
    Header {
        cluster_id: Option<ClusterId>,
        server_id: ServerId,
        name: String,
        local: Address,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        remotes: Vec<Address>,
    },
    /// The compacted log prefix: everything up to and including
    /// `prev_index`, summarized as state machine bytes plus the membership
    /// in force at that point.
    Snapshot {
        prev_term: Term,
        prev_index: Index,
        prev_servers: ServerSet,
        data: Vec<u8>,
    },
    /// A log entry at `index`. A record whose index falls inside the
    /// recovered log replays an earlier truncation before appending.
    Entry {
        index: Index,
        term: Term,
        payload: EntryPayload,
    },
    /// A term advance, with the vote cast in that term if any.
    Term { term: Term, vote: Option<ServerId> },
}

impl Record {
    fn encode(&self) -> Vec<u8> {
        // Record values contain no raw strings with newlines, so one record
        // per line holds.
        let mut line = serde_json::to_vec(self).expect("record serialization cannot fail");
        line.push(b'\n');
        line
    }
}

/// Identity fields recovered from the header records.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub sid: ServerId,
    pub cid: Option<ClusterId>,
    pub name: String,
    pub local: Address,
    pub remotes: Vec<Address>,
}

/// Everything recovered from replaying a store file.
#[derive(Clone, Debug)]
pub struct Recovered {
    pub metadata: Metadata,
    /// Whether a snapshot record was present. Absent only on a server that
    /// is still joining a cluster.
    pub has_snapshot: bool,
    pub prev_term: Term,
    pub prev_index: Index,
    pub prev_servers: ServerSet,
    pub snapshot_data: Vec<u8>,
    /// Entries for indices `prev_index + 1 ..`.
    pub entries: Vec<Entry>,
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    /// Whether a truncated final record was dropped.
    pub dropped_tail: bool,
}

/// Replay a raw byte image of a store file.
pub fn recover(bytes: &[u8]) -> Result<Recovered, StoreError> {
    let mut lines = split_lines(bytes);

    match lines.next() {
        Some(LineItem::Complete(first)) if first == MAGIC.as_bytes() => {}
        _ => return Err(StoreError::BadMagic),
    }

    let mut metadata: Option<Metadata> = None;
    let mut has_snapshot = false;
    // The sentinel entry at index 1 carries term 1 on every server, so even
    // a store with no snapshot yet can pass append consistency checks.
    let mut prev_term: Term = 1;
    let mut prev_index: Index = SENTINEL_INDEX;
    let mut prev_servers = ServerSet::new();
    let mut snapshot_data = Vec::new();
    let mut entries: Vec<Entry> = Vec::new();
    let mut current_term: Term = 0;
    let mut voted_for: Option<ServerId> = None;
    let mut dropped_tail = false;

    let mut line_no = 1;
    let mut pending: Vec<(usize, &[u8])> = Vec::new();
    for item in lines {
        line_no += 1;
        match item {
            LineItem::Complete(line) => pending.push((line_no, line)),
            LineItem::Partial(_) => {
                // Bytes after the final newline: a record interrupted by a
                // crash. Dropped, never an error.
                dropped_tail = true;
            }
        }
    }

    let n = pending.len();
    for (i, (line_no, line)) in pending.into_iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        let record: Record = match serde_json::from_slice(line) {
            Ok(record) => record,
            Err(source) => {
                if i + 1 == n {
                    // A final line that fails to parse is indistinguishable
                    // from a torn append of a longer record.
                    dropped_tail = true;
                    break;
                }
                return Err(StoreError::Corrupt { line: line_no, source });
            }
        };

        match record {
            Record::Header {
                cluster_id,
                server_id,
                name,
                local,
                remotes,
            } => {
                metadata = Some(Metadata {
                    sid: server_id,
                    cid: cluster_id.or(metadata.as_ref().and_then(|m| m.cid)),
                    name,
                    local,
                    remotes,
                });
            }
            Record::Snapshot {
                prev_term: new_term,
                prev_index: new_index,
                prev_servers: new_servers,
                data,
            } => {
                if metadata.is_none() {
                    return Err(StoreError::Malformed("snapshot record before header"));
                }
                // Keep any entries strictly above the snapshot's coverage.
                let old_start = prev_index + 1;
                if new_index + 1 > old_start {
                    let covered = ((new_index + 1 - old_start) as usize).min(entries.len());
                    entries.drain(..covered);
                }
                has_snapshot = true;
                prev_term = new_term;
                prev_index = new_index;
                prev_servers = new_servers;
                snapshot_data = data;
            }
            Record::Entry { index, term, payload } => {
                if metadata.is_none() {
                    return Err(StoreError::Malformed("log record before header"));
                }
                let log_start = prev_index + 1;
                let next = log_start + entries.len() as u64;
                if index < log_start {
                    return Err(StoreError::Malformed("log record below the snapshot"));
                }
                if index > next {
                    return Err(StoreError::Malformed("gap in log records"));
                }
                // An index inside the recovered range replays a truncation.
                entries.truncate((index - log_start) as usize);
                entries.push(Entry { term, payload });
            }
            Record::Term { term, vote } => {
                current_term = current_term.max(term);
                voted_for = vote;
            }
        }
    }

    let metadata = metadata.ok_or(StoreError::Malformed("missing header record"))?;
    Ok(Recovered {
        metadata,
        has_snapshot,
        prev_term,
        prev_index,
        prev_servers,
        snapshot_data,
        entries,
        current_term,
        voted_for,
        dropped_tail,
    })
}

enum LineItem<'a> {
    Complete(&'a [u8]),
    Partial(&'a [u8]),
}

fn split_lines(bytes: &[u8]) -> impl Iterator<Item = LineItem<'_>> {
    let mut rest = bytes;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match rest.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line = &rest[..pos];
                rest = &rest[pos + 1..];
                Some(LineItem::Complete(line))
            }
            None => {
                let tail = rest;
                rest = &rest[rest.len()..];
                Some(LineItem::Partial(tail))
            }
        }
    })
}

/// A handle to a store file: typed record appends over a [`StorageBackend`].
pub struct Store<B> {
    backend: Arc<B>,
}

impl<B: StorageBackend> Store<B> {
    /// Initialize a brand new single-server cluster in `backend`: a header
    /// with fresh ids plus a snapshot placing this server alone in the
    /// configuration with `data` as the initial state machine image.
    pub fn create_cluster(
        backend: &B,
        name: impl Into<String>,
        local: Address,
        data: Vec<u8>,
    ) -> Result<Metadata, StoreError> {
        let metadata = Metadata {
            sid: ServerId::random(),
            cid: Some(ClusterId::random()),
            name: name.into(),
            local,
            remotes: Vec::new(),
        };
        let mut image = Vec::new();
        image.extend_from_slice(MAGIC.as_bytes());
        image.push(b'\n');
        image.extend_from_slice(&header_record(&metadata).encode());

        let mut prev_servers = ServerSet::new();
        prev_servers.insert(metadata.sid, metadata.local.clone());
        image.extend_from_slice(
            &Record::Snapshot {
                prev_term: 1,
                prev_index: SENTINEL_INDEX,
                prev_servers,
                data,
            }
            .encode(),
        );
        backend.append(&image)?;
        backend.sync()?;
        Ok(metadata)
    }

    /// Initialize a store for a server that will join an existing cluster
    /// through the servers at `remotes`. Only the header is written; the
    /// snapshot arrives from the leader during catch-up.
    pub fn join_cluster(
        backend: &B,
        name: impl Into<String>,
        local: Address,
        remotes: Vec<Address>,
        cid: Option<ClusterId>,
    ) -> Result<Metadata, StoreError> {
        let metadata = Metadata {
            sid: ServerId::random(),
            cid,
            name: name.into(),
            local,
            remotes,
        };
        let mut image = Vec::new();
        image.extend_from_slice(MAGIC.as_bytes());
        image.push(b'\n');
        image.extend_from_slice(&header_record(&metadata).encode());
        backend.append(&image)?;
        backend.sync()?;
        Ok(metadata)
    }

    /// Read identity fields without opening the engine.
    pub fn read_metadata(backend: &B) -> Result<Metadata, StoreError> {
        let bytes = backend.read_all()?;
        Ok(recover(&bytes)?.metadata)
    }

    /// Replay the backend and wrap it for appending.
    pub fn open(backend: Arc<B>) -> Result<(Self, Recovered), StoreError> {
        let bytes = backend.read_all()?;
        let recovered = recover(&bytes)?;
        Ok((Self { backend }, recovered))
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Append one record. Durability is the caller's business: pair this
    /// with a request to the durability worker.
    pub fn append(&self, record: &Record) -> Result<(), StoreError> {
        self.backend.append(&record.encode())?;
        Ok(())
    }

    /// Atomically replace the file with a compacted image: header, snapshot,
    /// the surviving entries starting at `prev_index + 1`, and the current
    /// term and vote. The replacement is durable when this returns.
    #[allow(clippy::too_many_arguments)]
    pub fn rewrite(
        &self,
        metadata: &Metadata,
        prev_term: Term,
        prev_index: Index,
        prev_servers: &ServerSet,
        snapshot_data: &[u8],
        entries: &[Entry],
        current_term: Term,
        voted_for: Option<ServerId>,
    ) -> Result<(), StoreError> {
        let mut image = Vec::new();
        image.extend_from_slice(MAGIC.as_bytes());
        image.push(b'\n');
        image.extend_from_slice(&header_record(metadata).encode());
        image.extend_from_slice(
            &Record::Snapshot {
                prev_term,
                prev_index,
                prev_servers: prev_servers.clone(),
                data: snapshot_data.to_vec(),
            }
            .encode(),
        );
        for (i, entry) in entries.iter().enumerate() {
            image.extend_from_slice(
                &Record::Entry {
                    index: prev_index + 1 + i as u64,
                    term: entry.term,
                    payload: entry.payload.clone(),
                }
                .encode(),
            );
        }
        image.extend_from_slice(
            &Record::Term {
                term: current_term,
                vote: voted_for,
            }
            .encode(),
        );
        self.backend.replace(&image)?;
        Ok(())
    }
}

pub(crate) fn header_record(metadata: &Metadata) -> Record {
    Record::Header {
        cluster_id: metadata.cid,
        server_id: metadata.sid,
        name: metadata.name.clone(),
        local: metadata.local.clone(),
        remotes: metadata.remotes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Scheme;

    fn addr(port: u16) -> Address {
        Address::new(Scheme::Tcp, "127.0.0.1", port)
    }

    #[test]
    fn create_then_recover() {
        let backend = MemBackend::new();
        let meta = Store::create_cluster(&backend, "conf", addr(6641), b"{}".to_vec()).unwrap();

        let rec = recover(&backend.read_all().unwrap()).unwrap();
        assert_eq!(rec.metadata, meta);
        assert!(rec.has_snapshot);
        assert_eq!(rec.prev_index, SENTINEL_INDEX);
        assert_eq!(rec.prev_term, 1);
        assert_eq!(rec.snapshot_data, b"{}".to_vec());
        assert_eq!(rec.prev_servers.len(), 1);
        assert!(rec.entries.is_empty());
        assert!(!rec.dropped_tail);
    }

    #[test]
    fn join_store_has_no_snapshot() {
        let backend = MemBackend::new();
        let meta =
            Store::join_cluster(&backend, "conf", addr(6642), vec![addr(6641)], None).unwrap();
        let rec = recover(&backend.read_all().unwrap()).unwrap();
        assert_eq!(rec.metadata.sid, meta.sid);
        assert_eq!(rec.metadata.remotes, vec![addr(6641)]);
        assert!(!rec.has_snapshot);
        assert!(rec.metadata.cid.is_none());
    }

    #[test]
    fn entry_records_fold_and_truncate() {
        let backend = Arc::new(MemBackend::new());
        Store::create_cluster(backend.as_ref(), "conf", addr(6641), Vec::new()).unwrap();
        let (store, _) = Store::open(backend.clone()).unwrap();

        for (index, term) in [(2u64, 2u64), (3, 2), (4, 2)] {
            store
                .append(&Record::Entry {
                    index,
                    term,
                    payload: EntryPayload::Data(format!("e{}", index).into_bytes()),
                })
                .unwrap();
        }
        // Overwrite index 3 in a later term, as a follower truncation would.
        store
            .append(&Record::Entry {
                index: 3,
                term: 3,
                payload: EntryPayload::Data(b"e3b".to_vec()),
            })
            .unwrap();
        store.append(&Record::Term { term: 3, vote: None }).unwrap();

        let rec = recover(&backend.read_all().unwrap()).unwrap();
        assert_eq!(rec.entries.len(), 2);
        assert_eq!(rec.entries[0].term, 2);
        assert_eq!(rec.entries[1].term, 3);
        assert_eq!(rec.entries[1].payload, EntryPayload::Data(b"e3b".to_vec()));
        assert_eq!(rec.current_term, 3);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let backend = Arc::new(MemBackend::new());
        Store::create_cluster(backend.as_ref(), "conf", addr(6641), Vec::new()).unwrap();
        let (store, _) = Store::open(backend.clone()).unwrap();
        store
            .append(&Record::Entry {
                index: 2,
                term: 2,
                payload: EntryPayload::Data(b"keep".to_vec()),
            })
            .unwrap();
        store
            .append(&Record::Entry {
                index: 3,
                term: 2,
                payload: EntryPayload::Data(b"torn".to_vec()),
            })
            .unwrap();
        backend.truncate_tail(10);

        let rec = recover(&backend.read_all().unwrap()).unwrap();
        assert!(rec.dropped_tail);
        assert_eq!(rec.entries.len(), 1);
        assert_eq!(rec.entries[0].payload, EntryPayload::Data(b"keep".to_vec()));
    }

    #[test]
    fn interior_corruption_is_fatal() {
        let backend = MemBackend::new();
        Store::create_cluster(&backend, "conf", addr(6641), Vec::new()).unwrap();
        backend.append(b"{\"record\":\"bogus\"}\n").unwrap();
        backend
            .append(&Record::Term { term: 5, vote: None }.encode())
            .unwrap();

        match recover(&backend.read_all().unwrap()) {
            Err(StoreError::Corrupt { .. }) => {}
            other => panic!("expected corrupt record error, got {:?}", other),
        }
    }

    #[test]
    fn missing_magic_is_rejected() {
        let backend = MemBackend::new();
        backend.append(b"not a raft log\n").unwrap();
        match recover(&backend.read_all().unwrap()) {
            Err(StoreError::BadMagic) => {}
            other => panic!("expected bad magic, got {:?}", other),
        }
    }

    #[test]
    fn file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.db");
        {
            let backend = FileBackend::create(&path).unwrap();
            Store::create_cluster(&backend, "conf", addr(6641), b"{}".to_vec()).unwrap();
        }

        let backend = Arc::new(FileBackend::open(&path).unwrap());
        let (store, rec) = Store::open(backend.clone()).unwrap();
        assert!(rec.has_snapshot);
        assert_eq!(rec.snapshot_data, b"{}".to_vec());

        store
            .append(&Record::Entry {
                index: 2,
                term: 2,
                payload: EntryPayload::Data(b"x".to_vec()),
            })
            .unwrap();
        backend.sync().unwrap();
        let rec = recover(&backend.read_all().unwrap()).unwrap();
        assert_eq!(rec.entries.len(), 1);

        // A rewrite atomically replaces the file on disk.
        store
            .rewrite(&rec.metadata, 2, 2, &rec.prev_servers, b"s@2", &[], 2, None)
            .unwrap();
        let rec = recover(&backend.read_all().unwrap()).unwrap();
        assert_eq!(rec.prev_index, 2);
        assert_eq!(rec.snapshot_data, b"s@2".to_vec());
        assert!(rec.entries.is_empty());
    }

    #[test]
    fn rewrite_compacts() {
        let backend = Arc::new(MemBackend::new());
        let meta = Store::create_cluster(backend.as_ref(), "conf", addr(6641), Vec::new()).unwrap();
        let (store, rec) = Store::open(backend.clone()).unwrap();
        for index in 2..=5u64 {
            store
                .append(&Record::Entry {
                    index,
                    term: 2,
                    payload: EntryPayload::Data(vec![index as u8]),
                })
                .unwrap();
        }

        // Compact through index 4; entry 5 survives.
        let survivors = vec![Entry {
            term: 2,
            payload: EntryPayload::Data(vec![5]),
        }];
        store
            .rewrite(&meta, 2, 4, &rec.prev_servers, b"state@4", &survivors, 2, Some(meta.sid))
            .unwrap();

        let rec = recover(&backend.read_all().unwrap()).unwrap();
        assert_eq!(rec.prev_index, 4);
        assert_eq!(rec.prev_term, 2);
        assert_eq!(rec.snapshot_data, b"state@4".to_vec());
        assert_eq!(rec.entries.len(), 1);
        assert_eq!(rec.current_term, 2);
        assert_eq!(rec.voted_for, Some(meta.sid));
    }
}
