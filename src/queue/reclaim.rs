//! Periodic release of entries left pending by consumers that went away.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

use super::QueueStore;

pub struct Reclaimer {
    store: Arc<dyn QueueStore>,
    queues: Vec<String>,
    interval: Duration,
    min_idle: Duration,
}

impl Reclaimer {
    pub fn new(
        store: Arc<dyn QueueStore>,
        queues: impl IntoIterator<Item = impl Into<String>>,
        interval: Duration,
        min_idle: Duration,
    ) -> Self {
        Self {
            store,
            queues: queues.into_iter().map(Into::into).collect(),
            interval,
            min_idle,
        }
    }

    /// Runs one pass over every watched queue: releases stale entries, then
    /// trims what every group is done with. A failing queue is logged and
    /// skipped so the others are still handled. Returns how many entries
    /// were released.
    pub async fn pass(&self) -> u64 {
        let mut total = 0;

        for queue in &self.queues {
            match self.store.release_stale(queue, self.min_idle).await {
                Ok(0) => {}
                Ok(released) => {
                    tracing::warn!(
                        queue = %queue,
                        released,
                        "released stale pending entries for redelivery"
                    );
                    total += released;
                }
                Err(Error::QueueNotFound { .. }) => {
                    tracing::debug!(queue = %queue, "skipping reclaim for missing queue");
                    continue;
                }
                Err(e) => {
                    tracing::error!(queue = %queue, "reclaim pass failed: {e}");
                }
            }

            match self.store.trim(queue).await {
                Ok(0) => {}
                Ok(trimmed) => {
                    tracing::debug!(queue = %queue, trimmed, "trimmed consumed entries");
                }
                Err(e) => {
                    tracing::error!(queue = %queue, "trim failed: {e}");
                }
            }
        }

        total
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            queues = ?self.queues,
            interval_secs = self.interval.as_secs(),
            min_idle_secs = self.min_idle.as_secs(),
            "reclaimer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.pass().await;
                }
            }
        }

        tracing::info!("reclaimer stopped");
    }
}
