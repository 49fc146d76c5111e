//! Raft timing configuration

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between AppendEntries sent by the leader to each peer (default: 100ms)
    pub heartbeat_interval: Duration,
    /// Lower bound of the election timeout, inclusive (default: 150ms)
    pub election_timeout_min: Duration,
    /// Upper bound of the election timeout, exclusive (default: 300ms)
    pub election_timeout_max: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
        }
    }
}

impl RaftConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Draw a fresh election timeout, uniform in [min, max)
    pub fn random_election_timeout(&self) -> Duration {
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        if max_ms <= min_ms {
            return self.election_timeout_min;
        }
        Duration::from_millis(rand::rng().random_range(min_ms..max_ms))
    }
}
