use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CACHE_SIZE: usize = 10000;

/// Commit events a slow subscriber may fall behind by before it lags.
pub const EVENT_BUFFER: usize = 1024;

/// Reserved name of the implicit per-organisation collection.
pub const LOCAL_COLLECTION: &str = "+local";

/// Bounded retry with exponential backoff.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after attempt number `attempt` (1-based) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let delay = (self.initial_delay_ms as f64) * self.multiplier.powi(exp);
        let delay = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DisseminationConfig {
    pub retry: RetryPolicy,
    pub ack_timeout_ms: u64,
}

impl Default for DisseminationConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            ack_timeout_ms: 500,
        }
    }
}

impl DisseminationConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_ms: u64,
    pub pull_timeout_ms: u64,
    // max_attempts bounds how many peers are asked per entry per round
    pub retry: RetryPolicy,
    pub batch_size: usize,
    // None: keep trying forever
    pub max_failed_rounds: Option<u32>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            pull_timeout_ms: 500,
            retry: RetryPolicy::default(),
            batch_size: 100,
            max_failed_rounds: None,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub name: String,
    pub org: String,
    pub channel: String,
    // temporary database when absent
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default = "default_transient_retention")]
    pub transient_retention_blocks: u64,
    #[serde(default)]
    pub dissemination: DisseminationConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

fn default_transient_retention() -> u64 {
    1000
}

impl PeerConfig {
    pub fn new(name: &str, org: &str, channel: &str) -> Self {
        Self {
            name: name.into(),
            org: org.into(),
            channel: channel.into(),
            db_path: None,
            transient_retention_blocks: default_transient_retention(),
            dissemination: DisseminationConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
