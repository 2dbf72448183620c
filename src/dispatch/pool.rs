use std::time::Duration;

use rand::distributions::{Alphanumeric, DistString};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Dispatcher;

/// A fixed number of workers draining the dispatch outbox.
///
/// Workers wake on each new dispatch and, failing that, every `poll`
/// interval, so rows whose lease or backoff has run out are picked up too.
pub struct DispatchPool {
    dispatcher: Dispatcher,
    workers: usize,
    poll: Duration,
    prefix: String,
}

impl DispatchPool {
    pub fn new(dispatcher: Dispatcher, workers: usize, poll: Duration) -> Self {
        let suffix = Alphanumeric.sample_string(&mut rand::thread_rng(), 8);

        Self {
            dispatcher,
            workers: workers.max(1),
            poll,
            prefix: format!("dispatch-{suffix}"),
        }
    }

    /// Runs the workers until `cancel` fires, then waits for them to finish
    /// the row they are working on.
    pub async fn run(self, cancel: CancellationToken) {
        let mut workers = JoinSet::new();
        let mut spawned = 0;

        for _ in 0..self.workers {
            workers.spawn(self.worker(spawned, &cancel));
            spawned += 1;
        }

        tracing::info!(
            workers = self.workers,
            poll_ms = self.poll.as_millis() as u64,
            "dispatch pool started"
        );

        while let Some(res) = workers.join_next().await {
            let Err(e) = res else {
                continue;
            };

            tracing::error!("dispatch worker panicked: {e}");

            // The row it held is picked up again once its lease runs out.
            if !cancel.is_cancelled() {
                workers.spawn(self.worker(spawned, &cancel));
                spawned += 1;
            }
        }

        tracing::info!("dispatch pool stopped");
    }

    fn worker(
        &self,
        n: usize,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        drain(
            self.dispatcher.clone(),
            format!("{}-{n}", self.prefix),
            self.poll,
            cancel.clone(),
        )
    }
}

async fn drain(dispatcher: Dispatcher, worker: String, poll: Duration, cancel: CancellationToken) {
    let notify = dispatcher.notify().clone();

    loop {
        while !cancel.is_cancelled() {
            match dispatcher.process_next(&worker).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(worker = %worker, "failed to process outbox: {e}");
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = notify.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }

    tracing::debug!(worker = %worker, "dispatch worker stopped");
}
