//! Document store: problems, answers, tasks, submissions and the dispatch
//! outbox, kept in one SQLite database.

use std::time::Duration;

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::{error::Error, utils::sqlite_options};

pub mod answer;
pub mod outbox;
pub mod problem;
pub mod submission;
pub mod task;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    timeout: Duration,
}

impl Database {
    pub async fn connect(path: &str, timeout: Duration) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .connect_with(sqlite_options(path)?)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!(path, "connected to document store");

        Ok(Self { pool, timeout })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Deadline applied to each document-store call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
