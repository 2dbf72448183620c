use std::sync::Arc;

use crate::error::Error;

use super::{Message, MessageId, PendingEntry, QueueStore};

/// Loosely typed arguments for [`QueueService::dequeue`].
pub type DequeueArgs = serde_json::Map<String, serde_json::Value>;

/// Key in [`DequeueArgs`] naming the calling consumer.
pub const CONSUMER_NAME: &str = "consumerName";

/// Builds the arguments for a dequeue on behalf of `consumer`.
pub fn consumer_args(consumer: impl Into<String>) -> DequeueArgs {
    let mut args = DequeueArgs::new();
    args.insert(
        CONSUMER_NAME.to_owned(),
        serde_json::Value::String(consumer.into()),
    );
    args
}

/// Validating front for a [`QueueStore`]. This is the only queue API
/// collaborators call.
#[derive(Clone)]
pub struct QueueService {
    store: Arc<dyn QueueStore>,
}

impl QueueService {
    pub fn new(store: impl QueueStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn with_store(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub async fn queue_exists(&self, name: &str) -> Result<bool, Error> {
        if name.trim().is_empty() {
            tracing::error!("queue name is empty");
            return Err(Error::EmptyName);
        }

        self.store.exists(name).await.map_err(|e| {
            tracing::error!(queue = name, "failed to check if queue exists: {e}");
            e
        })
    }

    pub async fn create_queue(&self, name: &str) -> Result<(), Error> {
        if self.queue_exists(name).await? {
            tracing::error!(queue = name, "queue already exists");
            return Err(Error::QueueAlreadyExists {
                queue: name.to_owned(),
            });
        }

        self.store.create(name).await.map_err(|e| {
            tracing::error!(queue = name, "failed to create queue: {e}");
            e
        })
    }

    /// Appends `payload` to `name`. The queue is expected to have been
    /// provisioned already; there is no existence check on this path.
    pub async fn enqueue(&self, name: &str, payload: &str) -> Result<MessageId, Error> {
        self.store.append(name, payload).await.map_err(|e| {
            tracing::error!(queue = name, "failed to enqueue message: {e}");
            e
        })
    }

    /// Fetches one message for the consumer named in `args`.
    ///
    /// An empty queue yields [`Error::NoMessageToDequeue`], which pollers
    /// should treat as a normal outcome.
    pub async fn dequeue(&self, name: &str, args: &DequeueArgs) -> Result<Message, Error> {
        let consumer = match args.get(CONSUMER_NAME) {
            None => return Err(Error::ConsumerNameNotProvided),
            Some(serde_json::Value::String(consumer)) => consumer.as_str(),
            Some(_) => return Err(Error::ConsumerNameNotString),
        };

        let delivery = self.store.read(name, consumer).await.map_err(|e| {
            tracing::error!(queue = name, consumer, "failed to dequeue message: {e}");
            e
        })?;

        match delivery {
            Some(delivery) => {
                tracing::debug!(
                    queue = name,
                    consumer,
                    message_id = %delivery.id,
                    delivery_count = delivery.delivery_count,
                    "dequeued message"
                );
                Ok(Message::new(name, delivery, self.store.clone()))
            }
            None => {
                tracing::debug!(queue = name, consumer, "no message to dequeue");
                Err(Error::NoMessageToDequeue {
                    queue: name.to_owned(),
                })
            }
        }
    }

    pub async fn pending(&self, name: &str) -> Result<Vec<PendingEntry>, Error> {
        if name.trim().is_empty() {
            return Err(Error::EmptyName);
        }

        self.store.pending(name).await
    }

    /// Creates every queue in `names` that does not exist yet.
    pub async fn provision(&self, names: &[&str]) -> Result<(), Error> {
        for name in names {
            if self.queue_exists(name).await? {
                continue;
            }

            self.create_queue(name).await?;

            tracing::info!(queue = name, "successfully created queue");
        }

        Ok(())
    }
}
