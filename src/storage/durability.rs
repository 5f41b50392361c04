//! The durability worker.
//!
//! The consensus task never calls fsync. Whenever it appends records that
//! must become durable it bumps the shared `requested` counter; this worker
//! owns the only sync path to the backend, advances `committed` after each
//! successful fsync, and publishes the new value on a watch channel. The
//! consensus task selects on that channel and fires the waiters whose
//! sequence numbers are now covered.
//!
//! An fsync failure does not advance `committed`; it is logged and the
//! request stays pending until the next wake retries it.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::storage::StorageBackend;

/// Setting `requested` to this value tells the worker to exit.
const SHUTDOWN_SEQ: u64 = u64::MAX;

#[derive(Default)]
struct Counters {
    requested: u64,
    committed: u64,
}

struct Shared {
    counters: Mutex<Counters>,
    wake: Notify,
}

/// The consensus task's side of the durability handshake.
#[derive(Clone)]
pub struct DurabilityHandle {
    shared: Arc<Shared>,
}

impl DurabilityHandle {
    /// Register that everything appended so far must become durable.
    /// Returns the sequence number to gate waiters on.
    pub fn request(&self) -> u64 {
        let mut counters = self.shared.counters.lock().unwrap();
        if counters.requested != SHUTDOWN_SEQ {
            counters.requested += 1;
        }
        let seq = counters.requested;
        drop(counters);
        self.shared.wake.notify_one();
        seq
    }

    /// The highest sequence number known durable.
    pub fn committed(&self) -> u64 {
        self.shared.counters.lock().unwrap().committed
    }

    /// Ask the worker to exit after finishing its current fsync.
    pub fn shutdown(&self) {
        let mut counters = self.shared.counters.lock().unwrap();
        counters.requested = SHUTDOWN_SEQ;
        drop(counters);
        self.shared.wake.notify_one();
    }
}

/// Spawn the worker for `backend`.
///
/// Returns the handle used to request durability, the watch channel carrying
/// the committed sequence, and the worker's join handle for shutdown.
pub fn spawn<B: StorageBackend>(
    backend: Arc<B>,
) -> (DurabilityHandle, watch::Receiver<u64>, JoinHandle<()>) {
    let shared = Arc::new(Shared {
        counters: Mutex::new(Counters::default()),
        wake: Notify::new(),
    });
    let (tx_committed, rx_committed) = watch::channel(0u64);

    let worker_shared = shared.clone();
    let handle = tokio::spawn(
        async move {
            loop {
                let target = {
                    let counters = worker_shared.counters.lock().unwrap();
                    if counters.requested == SHUTDOWN_SEQ {
                        break;
                    }
                    if counters.requested > counters.committed {
                        Some(counters.requested)
                    } else {
                        None
                    }
                };

                let target = match target {
                    Some(target) => target,
                    None => {
                        worker_shared.wake.notified().await;
                        continue;
                    }
                };

                let sync_backend = backend.clone();
                let res = tokio::task::spawn_blocking(move || sync_backend.sync()).await;
                match res {
                    Ok(Ok(())) => {
                        let committed = {
                            let mut counters = worker_shared.counters.lock().unwrap();
                            counters.committed = counters.committed.max(target);
                            counters.committed
                        };
                        let _ = tx_committed.send(committed);
                    }
                    Ok(Err(err)) => {
                        tracing::error!(error=%err, "fsync failed; durability request stays pending");
                        worker_shared.wake.notified().await;
                    }
                    Err(err) => {
                        tracing::error!(error=%err, "fsync task panicked; durability request stays pending");
                        worker_shared.wake.notified().await;
                    }
                }
            }
            tracing::debug!("durability worker exiting");
        }
        .instrument(tracing::debug_span!("durability")),
    );

    (DurabilityHandle { shared }, rx_committed, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemBackend;

    #[tokio::test]
    async fn committed_follows_requested() {
        let backend = Arc::new(MemBackend::new());
        let (handle, mut rx, worker) = spawn(backend);

        let seq = handle.request();
        assert_eq!(seq, 1);
        while *rx.borrow() < seq {
            rx.changed().await.unwrap();
        }
        assert_eq!(handle.committed(), 1);

        let seq = handle.request();
        let seq = handle.request().max(seq);
        while *rx.borrow() < seq {
            rx.changed().await.unwrap();
        }
        assert!(handle.committed() >= 3);

        handle.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_without_requests() {
        let backend = Arc::new(MemBackend::new());
        let (handle, _rx, worker) = spawn(backend);
        handle.shutdown();
        worker.await.unwrap();
    }
}
