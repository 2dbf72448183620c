//! Named durable queues with consumer-group delivery.
//!
//! A queue is an append-only log of opaque string payloads. Each queue carries
//! one consumer group per deployment; consumers in the group share a delivery
//! cursor, and every delivered entry stays *pending* for its consumer until it
//! is acknowledged. Entries left pending by a consumer that went away are
//! released by the [`reclaim`] pass and handed to the next reader.

use std::{fmt, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub mod reclaim;
pub mod service;
pub mod sqlite;

pub use service::{DequeueArgs, QueueService};
pub use sqlite::SqliteQueueStore;

pub const ANSWER_GENERATE: &str = "answer_generate";
pub const ANSWER_OUTPUT: &str = "answer_output";
pub const SUBMISSION: &str = "submission";
pub const JUDGE_RESULT: &str = "judge_result";

/// Queues provisioned at startup, before any traffic flows.
pub const WELL_KNOWN: [&str; 4] = [ANSWER_GENERATE, ANSWER_OUTPUT, SUBMISSION, JUDGE_RESULT];

/// Log-assigned identifier of an entry. Increases with append order within a
/// queue.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An entry handed to a consumer by [`QueueStore::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: MessageId,
    pub data: String,
    /// 1 on first delivery, incremented on every redelivery after a reclaim.
    pub delivery_count: i64,
}

/// One row of a group's pending-entry list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingEntry {
    pub message_id: i64,
    /// `None` once the entry has been released for redelivery.
    pub consumer: Option<String>,
    pub delivered_at: i64,
    pub delivery_count: i64,
}

/// Storage primitive behind [`QueueService`].
///
/// Implementations must make [`read`](QueueStore::read) exclusive within the
/// group: concurrent readers never receive the same pending entry.
pub trait QueueStore: Send + Sync + 'static {
    /// Whether `name` denotes a queue, together with its consumer group.
    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, Error>>;

    /// Creates the log and registers the consumer group at its start, in one
    /// step. Fails with [`Error::QueueAlreadyExists`] if it already exists.
    fn create<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    fn append<'a>(&'a self, name: &'a str, payload: &'a str)
        -> BoxFuture<'a, Result<MessageId, Error>>;

    /// Fetches at most one entry for `consumer` without blocking. Released
    /// entries are redelivered before never-delivered ones.
    fn read<'a>(
        &'a self,
        name: &'a str,
        consumer: &'a str,
    ) -> BoxFuture<'a, Result<Option<Delivery>, Error>>;

    /// Removes `id` from the pending set. Fails with [`Error::NotPending`] if
    /// it is unknown or already acknowledged.
    fn acknowledge<'a>(&'a self, name: &'a str, id: MessageId)
        -> BoxFuture<'a, Result<(), Error>>;

    fn pending<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<PendingEntry>, Error>>;

    /// Releases entries delivered more than `min_idle` ago so the next reader
    /// picks them up. Returns how many were released.
    fn release_stale<'a>(
        &'a self,
        name: &'a str,
        min_idle: Duration,
    ) -> BoxFuture<'a, Result<u64, Error>>;

    /// Drops entries every group on `name` has read past and none holds
    /// pending. Returns how many were dropped.
    fn trim<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<u64, Error>>;
}

/// A dequeued entry. Call [`Message::ack`] once the payload has been durably
/// taken over; until then it stays pending for the consumer that read it.
pub struct Message {
    id: MessageId,
    data: String,
    queue: String,
    delivery_count: i64,
    store: Arc<dyn QueueStore>,
}

impl Message {
    pub(crate) fn new(queue: &str, delivery: Delivery, store: Arc<dyn QueueStore>) -> Self {
        Self {
            id: delivery.id,
            data: delivery.data,
            queue: queue.to_owned(),
            delivery_count: delivery.delivery_count,
            store,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn delivery_count(&self) -> i64 {
        self.delivery_count
    }

    pub async fn ack(&self) -> Result<(), Error> {
        self.store.acknowledge(&self.queue, self.id).await.map_err(|e| {
            tracing::error!(
                queue = %self.queue,
                message_id = %self.id,
                "failed to ack message: {e}"
            );
            e
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("data", &self.data)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}
