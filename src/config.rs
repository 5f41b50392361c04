//! Raft runtime configuration.

use std::time::Duration;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default lower bound of the election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_BASE: u64 = 1024;
/// Default width of the election timeout randomization window, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_RANGE: u64 = 1024;
/// Default maximum snapshot chunk carried by one InstallSnapshot request.
pub const DEFAULT_SNAPSHOT_CHUNK_SIZE: usize = 4096;
/// Default number of applied entries after which compaction is suggested.
pub const DEFAULT_SNAPSHOT_LOG_THRESHOLD: u64 = 100;
/// Default minimum spacing between suggested compactions.
pub const DEFAULT_SNAPSHOT_MIN_INTERVAL: Duration = Duration::from_secs(600);
/// Default window for catching up a server being added before the change
/// fails with a timeout.
pub const DEFAULT_CHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// The runtime configuration of a Raft node.
///
/// Obtained from the builder:
///
/// ```
/// use confraft::Config;
///
/// let config = Config::build("cluster0".into())
///     .election_timeout_base(150)
///     .validate()
///     .expect("config is invalid");
/// assert_eq!(config.heartbeat_interval(), std::time::Duration::from_millis(50));
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The name of the cluster this node belongs to.
    pub cluster_name: String,
    /// Lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_base: u64,
    /// Width of the randomization window added on top of the base, in milliseconds.
    pub election_timeout_range: u64,
    /// Maximum number of snapshot bytes per InstallSnapshot request.
    pub snapshot_chunk_size: usize,
    /// Suggest compaction once this many entries were applied since the last snapshot.
    pub snapshot_log_threshold: u64,
    /// Do not suggest compaction more often than this.
    pub snapshot_min_interval: Duration,
    /// How long the leader keeps catching up a server being added before it
    /// abandons the change.
    pub change_timeout: Duration,
}

impl Config {
    /// Start a builder holding the default values.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_base: DEFAULT_ELECTION_TIMEOUT_BASE,
            election_timeout_range: DEFAULT_ELECTION_TIMEOUT_RANGE,
            snapshot_chunk_size: DEFAULT_SNAPSHOT_CHUNK_SIZE,
            snapshot_log_threshold: DEFAULT_SNAPSHOT_LOG_THRESHOLD,
            snapshot_min_interval: DEFAULT_SNAPSHOT_MIN_INTERVAL,
            change_timeout: DEFAULT_CHANGE_TIMEOUT,
        }
    }

    /// Generate a new election timeout within `[base, base + range)`.
    pub fn new_rand_election_timeout(&self) -> Duration {
        let ms = thread_rng().gen_range(
            self.election_timeout_base..self.election_timeout_base + self.election_timeout_range,
        );
        Duration::from_millis(ms)
    }

    /// The leader's heartbeat interval, fixed at a third of the election base
    /// so a healthy leader gets three chances to suppress each follower's
    /// election timer.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.election_timeout_base / 3)
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_base: u64,
    election_timeout_range: u64,
    snapshot_chunk_size: usize,
    snapshot_log_threshold: u64,
    snapshot_min_interval: Duration,
    change_timeout: Duration,
}

impl ConfigBuilder {
    pub fn election_timeout_base(mut self, ms: u64) -> Self {
        self.election_timeout_base = ms;
        self
    }

    pub fn election_timeout_range(mut self, ms: u64) -> Self {
        self.election_timeout_range = ms;
        self
    }

    pub fn snapshot_chunk_size(mut self, bytes: usize) -> Self {
        self.snapshot_chunk_size = bytes;
        self
    }

    pub fn snapshot_log_threshold(mut self, entries: u64) -> Self {
        self.snapshot_log_threshold = entries;
        self
    }

    pub fn snapshot_min_interval(mut self, interval: Duration) -> Self {
        self.snapshot_min_interval = interval;
        self
    }

    pub fn change_timeout(mut self, timeout: Duration) -> Self {
        self.change_timeout = timeout;
        self
    }

    /// Check the invariants between the configured values and produce the
    /// final `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.election_timeout_base < 3 {
            return Err(ConfigError::ElectionTimeoutTooShort);
        }
        if self.election_timeout_range == 0 {
            return Err(ConfigError::ElectionTimeoutRangeEmpty);
        }
        if self.snapshot_chunk_size == 0 {
            return Err(ConfigError::SnapshotChunkSizeZero);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_base: self.election_timeout_base,
            election_timeout_range: self.election_timeout_range,
            snapshot_chunk_size: self.snapshot_chunk_size,
            snapshot_log_threshold: self.snapshot_log_threshold,
            snapshot_min_interval: self.snapshot_min_interval,
            change_timeout: self.change_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::build("test".into()).validate().unwrap();
        assert_eq!(config.election_timeout_base, DEFAULT_ELECTION_TIMEOUT_BASE);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(341));
    }

    #[test]
    fn rand_timeout_stays_in_window() {
        let config = Config::build("test".into())
            .election_timeout_base(100)
            .election_timeout_range(50)
            .validate()
            .unwrap();
        for _ in 0..64 {
            let t = config.new_rand_election_timeout();
            assert!(t >= Duration::from_millis(100));
            assert!(t < Duration::from_millis(150));
        }
    }

    #[test]
    fn rejects_zero_chunk() {
        let res = Config::build("test".into()).snapshot_chunk_size(0).validate();
        assert!(res.is_err());
    }
}
