//! Fixtures for testing the Raft engine.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use confraft::async_trait::async_trait;
use confraft::error::CommandStatus;
use confraft::metrics::Wait;
use confraft::network::Scheme;
use confraft::raft::ApplyEntry;
use confraft::raft::Envelope;
use confraft::storage::MemBackend;
use confraft::Address;
use confraft::Config;
use confraft::Raft;
use confraft::RaftMetrics;
use confraft::ServerId;
use confraft::State;
use confraft::Transport;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A config with timers short enough for tests.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout_base(100)
            .election_timeout_range(100)
            .validate()
            .expect("failed to build config"),
    )
}

pub fn addr(port: u16) -> Address {
    Address::new(Scheme::Tcp, "127.0.0.1", port)
}

struct Node {
    raft: Raft,
    backend: Arc<MemBackend>,
    address: Address,
}

/// An in-process session layer: routes envelopes between registered nodes
/// and can cut any of them off to emulate a partition.
pub struct Router {
    config: Arc<Config>,
    table: RwLock<BTreeMap<ServerId, Node>>,
    by_addr: RwLock<BTreeMap<Address, ServerId>>,
    isolated: RwLock<HashSet<ServerId>>,
}

impl Router {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            table: RwLock::new(BTreeMap::new()),
            by_addr: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(HashSet::new()),
        }
    }

    /// Create a brand new single-server cluster and start its node.
    pub async fn new_cluster_node(self: &Arc<Self>, port: u16) -> Result<ServerId> {
        let backend = Arc::new(MemBackend::new());
        let meta = Raft::create_cluster(backend.as_ref(), "test", addr(port), b"{}".to_vec())?;
        self.start_node(backend, addr(port)).await?;
        Ok(meta.sid)
    }

    /// Create a node that joins the cluster through the given remote ports.
    pub async fn new_joining_node(self: &Arc<Self>, port: u16, remotes: &[u16]) -> Result<ServerId> {
        let backend = Arc::new(MemBackend::new());
        let remotes = remotes.iter().map(|p| addr(*p)).collect();
        let meta = Raft::join_cluster(backend.as_ref(), "test", addr(port), remotes, None)?;
        self.start_node(backend, addr(port)).await?;
        Ok(meta.sid)
    }

    async fn start_node(self: &Arc<Self>, backend: Arc<MemBackend>, address: Address) -> Result<ServerId> {
        let raft = Raft::open(self.config.clone(), self.clone(), backend.clone())?;
        let sid = raft.id();
        self.table.write().await.insert(
            sid,
            Node {
                raft,
                backend,
                address: address.clone(),
            },
        );
        self.by_addr.write().await.insert(address, sid);
        Ok(sid)
    }

    /// Stop a node, keeping its storage around for a later restart.
    pub async fn shutdown_node(&self, sid: ServerId) -> Result<()> {
        let raft = self.raft_handle(&sid).await?;
        raft.shutdown().await?;
        Ok(())
    }

    /// Restart a node from the storage it left behind.
    pub async fn restart_node(self: &Arc<Self>, sid: ServerId) -> Result<()> {
        let (backend, address) = {
            let table = self.table.read().await;
            let node = table.get(&sid).context("node not registered")?;
            (node.backend.clone(), node.address.clone())
        };
        let started = self.start_node(backend, address).await?;
        assert_eq!(started, sid, "restart changed the server id");
        Ok(())
    }

    pub async fn raft_handle(&self, sid: &ServerId) -> Result<Raft> {
        let table = self.table.read().await;
        let node = table.get(sid).with_context(|| format!("node {} not registered", sid))?;
        Ok(node.raft.clone())
    }

    /// Cut a node off from everyone else.
    pub async fn isolate_node(&self, sid: ServerId) {
        self.isolated.write().await.insert(sid);
    }

    /// Reconnect a previously isolated node.
    pub async fn restore_node(&self, sid: ServerId) {
        self.isolated.write().await.remove(&sid);
    }

    pub async fn metrics_of(&self, sid: &ServerId) -> Result<RaftMetrics> {
        let raft = self.raft_handle(sid).await?;
        Ok(raft.metrics().borrow().clone())
    }

    pub async fn wait(&self, sid: &ServerId, timeout: Option<Duration>) -> Result<Wait> {
        let raft = self.raft_handle(sid).await?;
        Ok(raft.wait(timeout.or(Some(Duration::from_secs(5)))))
    }

    pub async fn wait_for_state(&self, sid: &ServerId, want: State, msg: &str) -> Result<RaftMetrics> {
        Ok(self.wait(sid, None).await?.state(want, msg).await?)
    }

    pub async fn wait_for_applied(&self, sid: &ServerId, want: u64, msg: &str) -> Result<RaftMetrics> {
        Ok(self.wait(sid, None).await?.log(want, msg).await?)
    }

    /// The id of the non-isolated node currently leading, if any.
    pub async fn leader(&self) -> Option<ServerId> {
        let isolated = self.isolated.read().await.clone();
        let table = self.table.read().await;
        for (sid, node) in table.iter() {
            if isolated.contains(sid) {
                continue;
            }
            if node.raft.metrics().borrow().state == State::Leader {
                return Some(*sid);
            }
        }
        None
    }

    /// Wait until some non-isolated node is leader.
    pub async fn wait_for_leader(&self, msg: &str) -> Result<ServerId> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for a leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Submit a command to the given node and wait for its final status.
    pub async fn client_request(&self, sid: ServerId, data: &[u8]) -> Result<CommandStatus> {
        let raft = self.raft_handle(&sid).await?;
        let mut command = raft.execute(data.to_vec(), None).await?;
        Ok(command.wait().await)
    }

    /// Pull the next committed item from a node's apply stream, failing the
    /// test if none shows up in time.
    pub async fn expect_entry(&self, sid: ServerId) -> Result<ApplyEntry> {
        let raft = self.raft_handle(&sid).await?;
        tokio::time::timeout(Duration::from_secs(5), raft.next_entry())
            .await
            .context("timeout waiting for a committed entry")?
            .context("apply stream ended")
    }

    /// Pull items from the apply stream until a data entry with the given
    /// payload shows up; snapshot items along the way are fine.
    pub async fn expect_data(&self, sid: ServerId, want: &[u8]) -> Result<ApplyEntry> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for data entry"));
            }
            let entry = self.expect_entry(sid).await?;
            if !entry.is_snapshot && entry.data == want {
                return Ok(entry);
            }
        }
    }

    async fn blocked(&self, a: &ServerId, b: &ServerId) -> bool {
        let isolated = self.isolated.read().await;
        isolated.contains(a) || isolated.contains(b)
    }

    async fn deliver_to(&self, to: ServerId, env: Envelope) -> Result<()> {
        if self.blocked(&env.from, &to).await {
            return Err(anyhow!("node {} is unreachable", to));
        }
        let raft = self.raft_handle(&to).await?;
        raft.deliver(env)?;
        Ok(())
    }
}

#[async_trait]
impl Transport for Router {
    async fn send_to_peer(&self, to: ServerId, env: Envelope) -> Result<()> {
        self.deliver_to(to, env).await
    }

    async fn send_to_address(&self, addr: &Address, env: Envelope) -> Result<()> {
        let to = {
            let by_addr = self.by_addr.read().await;
            *by_addr.get(addr).with_context(|| format!("no node listens on {}", addr))?
        };
        self.deliver_to(to, env).await
    }
}

/// Bring up a cluster of `n` voting members; the first node seeds it and the
/// rest join one by one. Returns the ids in creation order.
pub async fn form_cluster(router: &Arc<Router>, base_port: u16, n: usize) -> Result<Vec<ServerId>> {
    let mut ids = Vec::with_capacity(n);
    let seed = router.new_cluster_node(base_port).await?;
    ids.push(seed);
    router.wait_for_state(&seed, State::Leader, "seed node leads").await?;

    for i in 1..n {
        let port = base_port + i as u16;
        let sid = router.new_joining_node(port, &[base_port]).await?;
        ids.push(sid);
        router
            .wait(&sid, None)
            .await?
            .metrics(
                |m| m.membership.len() == i + 1 && m.membership.contains_key(&sid),
                format!("node {} joined", sid),
            )
            .await?;
    }

    // Everyone agrees on the final configuration.
    for sid in &ids {
        router
            .wait(sid, None)
            .await?
            .metrics(|m| m.membership.len() == n, "full membership everywhere")
            .await?;
    }
    Ok(ids)
}
