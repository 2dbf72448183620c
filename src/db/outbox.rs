//! Pending dispatch work, written in the same transaction as its submission.
//!
//! Rows are claimed under a lease: a worker that dies mid-dispatch leaves its
//! row claimed until `claimed_until` passes, after which any worker may take
//! it again.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};

use crate::{error::Error, utils::now_millis};

#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::AsRefStr,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutboxState {
    /// Waiting for a worker.
    Ready,
    /// The matching answer is missing or not ready. Left alone until
    /// explicitly re-dispatched.
    Stalled,
    /// Gave up on the row. Left alone until explicitly re-dispatched.
    Failed,
}

#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub submission_id: i64,
    pub state: OutboxState,
    pub attempts: i64,
    pub available_at: i64,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl OutboxEntry {
    pub async fn insert(db: &mut SqliteConnection, submission_id: i64) -> Result<(), Error> {
        let now = now_millis();

        sqlx::query(
            "
            INSERT INTO dispatch_outbox (submission_id, state, available_at, created_at)
            VALUES ($1, $2, $3, $3)
            ",
        )
        .bind(submission_id)
        .bind(OutboxState::Ready)
        .bind(now)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Takes the oldest ready row whose lease is free, holding it for
    /// `worker` until `lease` elapses.
    pub async fn claim(
        db: &mut SqliteConnection,
        worker: &str,
        lease: Duration,
    ) -> Result<Option<Self>, Error> {
        let now = now_millis();

        Ok(sqlx::query_as(
            "
            UPDATE dispatch_outbox
            SET claimed_by = $1, claimed_until = $2
            WHERE submission_id = (
                SELECT submission_id FROM dispatch_outbox
                WHERE state = $3
                    AND available_at <= $4
                    AND (claimed_until IS NULL OR claimed_until <= $4)
                ORDER BY available_at, submission_id
                LIMIT 1
            )
            RETURNING *
            ",
        )
        .bind(worker)
        .bind(now.saturating_add(millis(lease)))
        .bind(OutboxState::Ready)
        .bind(now)
        .fetch_optional(db)
        .await?)
    }

    /// Removes a row once its submission has been handed off. Returns false
    /// if `worker` no longer holds it.
    pub async fn complete(
        db: &mut SqliteConnection,
        submission_id: i64,
        worker: &str,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "DELETE FROM dispatch_outbox WHERE submission_id = $1 AND claimed_by = $2",
        )
        .bind(submission_id)
        .bind(worker)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn stall(
        db: &mut SqliteConnection,
        submission_id: i64,
        worker: &str,
        reason: &str,
    ) -> Result<bool, Error> {
        Self::settle(db, submission_id, worker, OutboxState::Stalled, reason, 0).await
    }

    pub async fn fail(
        db: &mut SqliteConnection,
        submission_id: i64,
        worker: &str,
        reason: &str,
    ) -> Result<bool, Error> {
        Self::settle(db, submission_id, worker, OutboxState::Failed, reason, 1).await
    }

    async fn settle(
        db: &mut SqliteConnection,
        submission_id: i64,
        worker: &str,
        state: OutboxState,
        reason: &str,
        attempted: i64,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE dispatch_outbox
            SET state = $3, last_error = $4, attempts = attempts + $5,
                claimed_by = NULL, claimed_until = NULL
            WHERE submission_id = $1 AND claimed_by = $2
            ",
        )
        .bind(submission_id)
        .bind(worker)
        .bind(state)
        .bind(reason)
        .bind(attempted)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Hands a row back after a transient failure. It becomes claimable
    /// again once `backoff` has passed.
    pub async fn release_with_error(
        db: &mut SqliteConnection,
        submission_id: i64,
        worker: &str,
        error: &str,
        backoff: Duration,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE dispatch_outbox
            SET attempts = attempts + 1, last_error = $3, available_at = $4,
                claimed_by = NULL, claimed_until = NULL
            WHERE submission_id = $1 AND claimed_by = $2
            ",
        )
        .bind(submission_id)
        .bind(worker)
        .bind(error)
        .bind(now_millis().saturating_add(millis(backoff)))
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Moves stalled rows whose submission targets `(problem_id, db_name)`
    /// back to ready. Returns how many were moved.
    pub async fn requeue_stalled(
        db: &mut SqliteConnection,
        problem_id: i64,
        db_name: &str,
    ) -> Result<u64, Error> {
        let res = sqlx::query(
            "
            UPDATE dispatch_outbox
            SET state = $1, available_at = $2, last_error = NULL
            WHERE state = $3 AND submission_id IN (
                SELECT submission_id FROM submissions
                WHERE problem_id = $4 AND db_name = $5
            )
            ",
        )
        .bind(OutboxState::Ready)
        .bind(now_millis())
        .bind(OutboxState::Stalled)
        .bind(problem_id)
        .bind(db_name)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    /// Moves every failed row back to ready with a fresh attempt budget.
    /// `last_error` is kept until the row settles again.
    pub async fn requeue_failed(db: &mut SqliteConnection) -> Result<u64, Error> {
        let res = sqlx::query(
            "
            UPDATE dispatch_outbox
            SET state = $1, attempts = 0, available_at = $2
            WHERE state = $3
            ",
        )
        .bind(OutboxState::Ready)
        .bind(now_millis())
        .bind(OutboxState::Failed)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    pub async fn find(
        db: &mut SqliteConnection,
        submission_id: i64,
    ) -> Result<Option<Self>, Error> {
        Ok(
            sqlx::query_as("SELECT * FROM dispatch_outbox WHERE submission_id = $1")
                .bind(submission_id)
                .fetch_optional(db)
                .await?,
        )
    }

    pub async fn list(db: &mut SqliteConnection, state: OutboxState) -> Result<Vec<Self>, Error> {
        Ok(sqlx::query_as(
            "SELECT * FROM dispatch_outbox WHERE state = $1 ORDER BY created_at, submission_id",
        )
        .bind(state)
        .fetch_all(db)
        .await?)
    }
}
