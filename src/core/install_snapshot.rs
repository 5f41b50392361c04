//! Snapshot transfer: the leader streams its compacted prefix to followers
//! that have fallen behind it, in bounded chunks with byte-offset resume.

use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftResult;
use crate::network::Transport;
use crate::raft::ApplyEntry;
use crate::raft::InstallSnapshotReply;
use crate::raft::InstallSnapshotRequest;
use crate::raft::Payload;
use crate::membership::Phase;
use crate::storage::StorageBackend;
use crate::Index;
use crate::ServerId;
use crate::ServerSet;
use crate::Term;

/// A snapshot being received from the leader, accumulated chunk by chunk.
pub(crate) struct SnapshotDownload {
    pub last_term: Term,
    pub last_index: Index,
    pub last_servers: ServerSet,
    pub length: u64,
    pub buffer: Vec<u8>,
}

/// Pick the end of the chunk starting at `offset`: at most `max` bytes, and
/// never splitting a codepoint when the snapshot is valid UTF-8 text.
pub(crate) fn chunk_end(data: &[u8], offset: usize, max: usize) -> usize {
    let mut end = offset.saturating_add(max).min(data.len());
    if end < data.len() {
        if let Ok(text) = std::str::from_utf8(data) {
            while end > offset && !text.is_char_boundary(end) {
                end -= 1;
            }
        }
    }
    end
}

impl<T: Transport, B: StorageBackend> RaftCore<T, B> {
    /// Send the next chunk of our snapshot to `sid` (§7).
    pub(super) async fn send_snapshot_chunk(&mut self, sid: ServerId) {
        let offset = match self.membership.any_mut(&sid) {
            Some(server) => *server.snapshot_offset.get_or_insert(0) as usize,
            None => return,
        };
        let data = self.log.snapshot_data();
        let offset = offset.min(data.len());
        let end = chunk_end(data, offset, self.config.snapshot_chunk_size);

        let req = InstallSnapshotRequest {
            term: self.current_term,
            last_index: self.log.prev_index(),
            last_term: self.log.prev_term(),
            last_servers: self.log.prev_servers().clone(),
            length: data.len() as u64,
            offset: offset as u64,
            chunk: data[offset..end].to_vec(),
        };
        self.send_to_peer(sid, Payload::InstallSnapshotRequest(req)).await;
    }

    /// Accumulate one chunk from the leader, installing the snapshot once
    /// the buffer is complete.
    ///
    /// The term rule has already run, so this comes from the current-term
    /// leader.
    #[tracing::instrument(level = "trace", skip(self, req), fields(from=%from))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        from: ServerId,
        req: InstallSnapshotRequest,
    ) -> RaftResult<()> {
        if self.target_state.is_candidate() {
            self.set_target_state(State::Follower);
        }
        self.current_leader = Some(from);
        self.update_next_election_timeout();

        if req.last_index <= self.log.prev_index() {
            // Our own snapshot already covers this; report completion so
            // the leader moves on to AppendEntries.
            let reply = InstallSnapshotReply {
                term: self.current_term,
                last_index: req.last_index,
                last_term: req.last_term,
                next_offset: req.length,
            };
            self.send_to_peer(from, Payload::InstallSnapshotReply(reply)).await;
            return Ok(());
        }

        let matches = self
            .download
            .as_ref()
            .map(|d| d.last_index == req.last_index && d.last_term == req.last_term)
            .unwrap_or(false);

        if !matches {
            if req.offset != 0 {
                // A chunk for a snapshot we are not collecting. Report what
                // we are collecting, if anything, so the leader restarts.
                let reply = match &self.download {
                    Some(d) => InstallSnapshotReply {
                        term: self.current_term,
                        last_index: d.last_index,
                        last_term: d.last_term,
                        next_offset: d.buffer.len() as u64,
                    },
                    None => InstallSnapshotReply {
                        term: self.current_term,
                        last_index: req.last_index,
                        last_term: req.last_term,
                        next_offset: 0,
                    },
                };
                self.send_to_peer(from, Payload::InstallSnapshotReply(reply)).await;
                return Ok(());
            }
            tracing::info!(last_index = req.last_index, length = req.length, "receiving snapshot");
            self.download = Some(SnapshotDownload {
                last_term: req.last_term,
                last_index: req.last_index,
                last_servers: req.last_servers.clone(),
                length: req.length,
                buffer: Vec::with_capacity(req.length as usize),
            });
        }

        let (buffered, length) = {
            let download = self.download.as_mut().expect("download exists here");
            let offset = req.offset as usize;
            if offset <= download.buffer.len() {
                // Contiguous, or a resend from an earlier resume point;
                // either way the bytes from `offset` on are authoritative.
                download.buffer.truncate(offset);
                download.buffer.extend_from_slice(&req.chunk);
            } else {
                tracing::debug!(
                    offset,
                    have = download.buffer.len(),
                    "discarding out-of-order snapshot chunk"
                );
            }
            (download.buffer.len() as u64, download.length)
        };

        if buffered == length {
            self.finish_snapshot_download(from).await?;
            return Ok(());
        }

        let reply = InstallSnapshotReply {
            term: self.current_term,
            last_index: req.last_index,
            last_term: req.last_term,
            next_offset: buffered,
        };
        self.send_to_peer(from, Payload::InstallSnapshotReply(reply)).await;
        Ok(())
    }

    /// Install a fully received snapshot: splice it under the log, catch the
    /// application up, persist, and acknowledge.
    async fn finish_snapshot_download(&mut self, from: ServerId) -> RaftResult<()> {
        let download = self.download.take().expect("complete download present");
        let SnapshotDownload {
            last_term,
            last_index,
            last_servers,
            length,
            buffer,
        } = download;
        tracing::info!(last_index, length, "installing snapshot");

        self.log.install_snapshot(last_term, last_index, last_servers, buffer.clone());
        let config = self.log.latest_servers().clone();
        self.membership.apply_config(&config);
        self.note_config_observed();

        self.commit_index = self.commit_index.max(last_index);
        if self.last_applied < last_index {
            let _ = self.tx_apply.send(ApplyEntry {
                data: buffer,
                index: last_index,
                is_snapshot: true,
            });
            self.last_applied = last_index;
        }
        self.apply_committed().await?;

        // The rewrite is durable on return, so the acknowledgement below
        // never claims state a crash could lose.
        if let Err(err) = self.rewrite_store() {
            return Err(self.map_fatal_storage_error(err));
        }

        let reply = InstallSnapshotReply {
            term: self.current_term,
            last_index,
            last_term,
            next_offset: length,
        };
        self.send_to_peer(from, Payload::InstallSnapshotReply(reply)).await;
        Ok(())
    }

    /// Drive the transfer from the follower's progress report.
    pub(super) async fn handle_install_snapshot_reply(
        &mut self,
        from: ServerId,
        rep: InstallSnapshotReply,
    ) -> RaftResult<()> {
        if !self.target_state.is_leader() || rep.term != self.current_term {
            return Ok(());
        }
        if self.membership.any_mut(&from).is_none() {
            return Ok(());
        }

        if rep.last_index != self.log.prev_index() || rep.last_term != self.log.prev_term() {
            // The follower is reporting progress against a snapshot we no
            // longer hold. Start over with the current one.
            if let Some(server) = self.membership.any_mut(&from) {
                server.snapshot_offset = Some(0);
            }
            self.send_snapshot_chunk(from).await;
            return Ok(());
        }

        let length = self.log.snapshot_data().len() as u64;
        if rep.next_offset >= length {
            // Transfer complete; resume normal replication from the entry
            // after the snapshot.
            let prev_index = self.log.prev_index();
            let log_end = self.log.log_end();
            let phase = {
                let server = match self.membership.any_mut(&from) {
                    Some(server) => server,
                    None => return Ok(()),
                };
                server.snapshot_offset = None;
                server.match_index = server.match_index.max(prev_index);
                server.next_index = server.next_index.max(prev_index + 1);
                server.phase
            };
            if prev_index + 1 < log_end {
                self.replicate_to(from, false).await;
            } else if phase == Phase::Catchup {
                if let Some(server) = self.membership.any_mut(&from) {
                    tracing::info!(sid=%from, "new server caught up via snapshot");
                    server.phase = Phase::CaughtUp;
                }
                self.reconfig_driver().await?;
            }
        } else {
            if let Some(server) = self.membership.any_mut(&from) {
                server.snapshot_offset = Some(rep.next_offset);
            }
            self.send_snapshot_chunk(from).await;
        }
        Ok(())
    }
}
