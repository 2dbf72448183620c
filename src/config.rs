use std::time::Duration;

use serde::Deserialize;

/// Process configuration, read from `SQLOJ_*` environment variables.
///
/// `db_path`, `queue_path` and `node_number` have no defaults: a process
/// without them must not start.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub db_path: String,
    pub queue_path: String,
    pub node_number: i64,

    pub consumer_group: Option<String>,
    pub store_timeout_ms: Option<u64>,

    pub dispatch_workers: Option<usize>,
    pub dispatch_poll_ms: Option<u64>,
    pub dispatch_lease_secs: Option<u64>,
    pub dispatch_max_attempts: Option<u32>,

    pub reclaim_interval_secs: Option<u64>,
    pub reclaim_min_idle_secs: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("SQLOJ_").from_env::<Self>()?)
    }

    /// Minimal configuration for the given store locations. Everything else
    /// takes its default.
    pub fn new(
        db_path: impl Into<String>,
        queue_path: impl Into<String>,
        node_number: i64,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            queue_path: queue_path.into(),
            node_number,
            consumer_group: None,
            store_timeout_ms: None,
            dispatch_workers: None,
            dispatch_poll_ms: None,
            dispatch_lease_secs: None,
            dispatch_max_attempts: None,
            reclaim_interval_secs: None,
            reclaim_min_idle_secs: None,
        }
    }

    pub fn consumer_group(&self) -> &str {
        self.consumer_group.as_deref().unwrap_or("sqloj")
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.unwrap_or(5000))
    }

    pub fn dispatch_workers(&self) -> usize {
        self.dispatch_workers.unwrap_or(4).max(1)
    }

    pub fn dispatch_poll(&self) -> Duration {
        Duration::from_millis(self.dispatch_poll_ms.unwrap_or(500))
    }

    pub fn dispatch_lease(&self) -> Duration {
        Duration::from_secs(self.dispatch_lease_secs.unwrap_or(30))
    }

    pub fn dispatch_max_attempts(&self) -> u32 {
        self.dispatch_max_attempts.unwrap_or(5).max(1)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs.unwrap_or(30))
    }

    pub fn reclaim_min_idle(&self) -> Duration {
        Duration::from_secs(self.reclaim_min_idle_secs.unwrap_or(300))
    }
}
