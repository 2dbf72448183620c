//! SQLite-backed [`QueueStore`].
//!
//! Each queue is a row in `sqloj_queues` plus exactly one consumer-group row
//! for this deployment's group, both written in the same transaction. The
//! group row holds the delivery cursor (`last_delivered`); deliveries not yet
//! acknowledged live in `sqloj_pending_entries`.
//!
//! Every read that hands out an entry starts its transaction with a write, so
//! SQLite serializes concurrent readers and no entry can be delivered twice.

use std::time::Duration;

use futures_util::future::BoxFuture;
use sqlx::{prelude::FromRow, sqlite::SqlitePoolOptions, SqlitePool};
use tokio_stream::StreamExt;

use crate::{
    error::Error,
    utils::{now_millis, sqlite_options, with_deadline},
};

use super::{Delivery, MessageId, PendingEntry, QueueStore};

// The queue backend is pluggable, so its tables are provisioned by the store
// itself rather than by the document store migrations.
const SCHEMA: [&str; 5] = [
    "
    CREATE TABLE IF NOT EXISTS sqloj_queues (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT UNIQUE NOT NULL,
        created_at INTEGER NOT NULL
    )
    ",
    "
    CREATE TABLE IF NOT EXISTS sqloj_consumer_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue INTEGER NOT NULL REFERENCES sqloj_queues (id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        last_delivered INTEGER NOT NULL DEFAULT 0,

        UNIQUE (queue, name)
    )
    ",
    "
    CREATE TABLE IF NOT EXISTS sqloj_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue INTEGER NOT NULL REFERENCES sqloj_queues (id) ON DELETE CASCADE,
        body TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS sqloj_messages_queue_id ON sqloj_messages (queue, id)",
    "
    CREATE TABLE IF NOT EXISTS sqloj_pending_entries (
        consumer_group INTEGER NOT NULL REFERENCES sqloj_consumer_groups (id) ON DELETE CASCADE,
        message INTEGER NOT NULL REFERENCES sqloj_messages (id) ON DELETE CASCADE,
        consumer TEXT,
        delivered_at INTEGER NOT NULL,
        delivery_count INTEGER NOT NULL DEFAULT 1,

        PRIMARY KEY (consumer_group, message)
    )
    ",
];

/// The log and the group registration of one queue, resolved together.
#[derive(Debug, Clone, Copy, FromRow)]
struct QueueHandle {
    queue_id: i64,
    group_id: i64,
}

#[derive(Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
    group: String,
    timeout: Duration,
}

impl SqliteQueueStore {
    /// Connects to the queue backend at `path` and provisions its tables.
    pub async fn connect(
        path: &str,
        group: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .connect_with(sqlite_options(path)?)
            .await?;

        Self::with_pool(pool, group, timeout).await
    }

    pub async fn with_pool(
        pool: SqlitePool,
        group: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            group: group.into(),
            timeout,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Names of every queue in the backend, in creation order.
    pub async fn list(&self) -> Result<Vec<String>, Error> {
        with_deadline(self.timeout, "list", "queues", async {
            let mut stream =
                sqlx::query_scalar("SELECT name FROM sqloj_queues ORDER BY id").fetch(&self.pool);

            let mut names: Vec<String> = Vec::new();

            while let Some(name) = stream.next().await.transpose()? {
                names.push(name);
            }

            Ok(names)
        })
        .await
    }

    async fn resolve(&self, name: &str) -> Result<QueueHandle, Error> {
        sqlx::query_as::<_, QueueHandle>(
            "
            SELECT q.id AS queue_id, g.id AS group_id
            FROM sqloj_queues q
            JOIN sqloj_consumer_groups g ON g.queue = q.id
            WHERE q.name = $1 AND g.name = $2
            ",
        )
        .bind(name)
        .bind(&self.group)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::queue_not_found(name))
    }

    async fn create_inner(&self, name: &str) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        let queue_id: i64 = sqlx::query_scalar(
            "
            INSERT INTO sqloj_queues (name, created_at)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET name = excluded.name
            RETURNING id
            ",
        )
        .bind(name)
        .bind(now_millis())
        .fetch_one(tx.as_mut())
        .await?;

        let registered = sqlx::query(
            "
            INSERT INTO sqloj_consumer_groups (queue, name, last_delivered)
            VALUES ($1, $2, 0)
            ",
        )
        .bind(queue_id)
        .bind(&self.group)
        .execute(tx.as_mut())
        .await
        .map_err(Error::from);

        match registered {
            Ok(_) => {}
            Err(e) if e.is_unique_violation() => {
                return Err(Error::QueueAlreadyExists {
                    queue: name.to_owned(),
                })
            }
            Err(e) => return Err(e),
        }

        tx.commit().await?;

        tracing::debug!(queue = name, group = %self.group, "created queue");

        Ok(())
    }

    async fn append_inner(&self, name: &str, payload: &str) -> Result<MessageId, Error> {
        let id: Option<i64> = sqlx::query_scalar(
            "
            INSERT INTO sqloj_messages (queue, body, created_at)
            SELECT id, $2, $3 FROM sqloj_queues WHERE name = $1
            RETURNING id
            ",
        )
        .bind(name)
        .bind(payload)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        id.map(MessageId).ok_or_else(|| Error::queue_not_found(name))
    }

    async fn read_inner(&self, name: &str, consumer: &str) -> Result<Option<Delivery>, Error> {
        let handle = self.resolve(name).await?;
        let now = now_millis();

        let mut tx = self.pool.begin().await?;

        let released: Option<(i64, i64)> = sqlx::query_as(
            "
            UPDATE sqloj_pending_entries
            SET consumer = $1, delivered_at = $2, delivery_count = delivery_count + 1
            WHERE consumer_group = $3 AND message = (
                SELECT message FROM sqloj_pending_entries
                WHERE consumer_group = $3 AND consumer IS NULL
                ORDER BY message
                LIMIT 1
            )
            RETURNING message, delivery_count
            ",
        )
        .bind(consumer)
        .bind(now)
        .bind(handle.group_id)
        .fetch_optional(tx.as_mut())
        .await?;

        let (message_id, delivery_count) = match released {
            Some(entry) => entry,
            None => {
                let next: Option<i64> = sqlx::query_scalar(
                    "
                    UPDATE sqloj_consumer_groups
                    SET last_delivered = (
                        SELECT MIN(m.id) FROM sqloj_messages m
                        WHERE m.queue = $2 AND m.id > sqloj_consumer_groups.last_delivered
                    )
                    WHERE id = $1 AND EXISTS (
                        SELECT 1 FROM sqloj_messages m
                        WHERE m.queue = $2 AND m.id > sqloj_consumer_groups.last_delivered
                    )
                    RETURNING last_delivered
                    ",
                )
                .bind(handle.group_id)
                .bind(handle.queue_id)
                .fetch_optional(tx.as_mut())
                .await?;

                let Some(message_id) = next else {
                    return Ok(None);
                };

                sqlx::query(
                    "
                    INSERT INTO sqloj_pending_entries
                        (consumer_group, message, consumer, delivered_at, delivery_count)
                    VALUES ($1, $2, $3, $4, 1)
                    ",
                )
                .bind(handle.group_id)
                .bind(message_id)
                .bind(consumer)
                .bind(now)
                .execute(tx.as_mut())
                .await?;

                (message_id, 1)
            }
        };

        let data: String = sqlx::query_scalar("SELECT body FROM sqloj_messages WHERE id = $1")
            .bind(message_id)
            .fetch_one(tx.as_mut())
            .await?;

        tx.commit().await?;

        Ok(Some(Delivery {
            id: MessageId(message_id),
            data,
            delivery_count,
        }))
    }

    async fn acknowledge_inner(&self, name: &str, id: MessageId) -> Result<(), Error> {
        let handle = self.resolve(name).await?;

        let res = sqlx::query(
            "DELETE FROM sqloj_pending_entries WHERE consumer_group = $1 AND message = $2",
        )
        .bind(handle.group_id)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::NotPending {
                queue: name.to_owned(),
                message_id: id.0,
            });
        }

        Ok(())
    }

    async fn pending_inner(&self, name: &str) -> Result<Vec<PendingEntry>, Error> {
        let handle = self.resolve(name).await?;

        let mut stream = sqlx::query_as::<_, PendingEntry>(
            "
            SELECT message AS message_id, consumer, delivered_at, delivery_count
            FROM sqloj_pending_entries
            WHERE consumer_group = $1
            ORDER BY message
            ",
        )
        .bind(handle.group_id)
        .fetch(&self.pool);

        let mut entries = Vec::new();

        while let Some(entry) = stream.next().await.transpose()? {
            entries.push(entry);
        }

        Ok(entries)
    }

    async fn release_stale_inner(&self, name: &str, min_idle: Duration) -> Result<u64, Error> {
        let handle = self.resolve(name).await?;
        let cutoff = now_millis() - min_idle.as_millis() as i64;

        let res = sqlx::query(
            "
            UPDATE sqloj_pending_entries
            SET consumer = NULL
            WHERE consumer_group = $1 AND consumer IS NOT NULL AND delivered_at <= $2
            ",
        )
        .bind(handle.group_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn trim_inner(&self, name: &str) -> Result<u64, Error> {
        let handle = self.resolve(name).await?;

        // Groups of other deployments share the log, so the slowest cursor
        // over all of them bounds what can go.
        let res = sqlx::query(
            "
            DELETE FROM sqloj_messages
            WHERE queue = $1
                AND id <= (
                    SELECT MIN(last_delivered) FROM sqloj_consumer_groups WHERE queue = $1
                )
                AND NOT EXISTS (
                    SELECT 1 FROM sqloj_pending_entries p WHERE p.message = sqloj_messages.id
                )
            ",
        )
        .bind(handle.queue_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

impl QueueStore for SqliteQueueStore {
    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(with_deadline(self.timeout, "exists", name, async move {
            let exists: bool = sqlx::query_scalar(
                "
                SELECT EXISTS(
                    SELECT 1 FROM sqloj_queues q
                    JOIN sqloj_consumer_groups g ON g.queue = q.id
                    WHERE q.name = $1 AND g.name = $2
                )
                ",
            )
            .bind(name)
            .bind(&self.group)
            .fetch_one(&self.pool)
            .await?;

            Ok(exists)
        }))
    }

    fn create<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(with_deadline(
            self.timeout,
            "create",
            name,
            self.create_inner(name),
        ))
    }

    fn append<'a>(
        &'a self,
        name: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<MessageId, Error>> {
        Box::pin(with_deadline(
            self.timeout,
            "append",
            name,
            self.append_inner(name, payload),
        ))
    }

    fn read<'a>(
        &'a self,
        name: &'a str,
        consumer: &'a str,
    ) -> BoxFuture<'a, Result<Option<Delivery>, Error>> {
        Box::pin(with_deadline(
            self.timeout,
            "read",
            name,
            self.read_inner(name, consumer),
        ))
    }

    fn acknowledge<'a>(
        &'a self,
        name: &'a str,
        id: MessageId,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(with_deadline(
            self.timeout,
            "acknowledge",
            name,
            self.acknowledge_inner(name, id),
        ))
    }

    fn pending<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<PendingEntry>, Error>> {
        Box::pin(with_deadline(
            self.timeout,
            "pending",
            name,
            self.pending_inner(name),
        ))
    }

    fn release_stale<'a>(
        &'a self,
        name: &'a str,
        min_idle: Duration,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(with_deadline(
            self.timeout,
            "release_stale",
            name,
            self.release_stale_inner(name, min_idle),
        ))
    }

    fn trim<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(with_deadline(self.timeout, "trim", name, self.trim_inner(name)))
    }
}
