use std::{future::Future, str::FromStr, time::Duration};

use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
};

use crate::error::Error;

/// Runs one store call under `limit`, mapping expiry to [`Error::Timeout`].
pub async fn with_deadline<T, F>(
    limit: Duration,
    operation: &'static str,
    resource: impl AsRef<str>,
    fut: F,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!(
                operation,
                resource = resource.as_ref(),
                "store call exceeded its deadline"
            );
            Err(Error::Timeout {
                operation,
                resource: resource.as_ref().to_owned(),
                millis: limit.as_millis(),
            })
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Connection options shared by the document store and the queue store.
///
/// Accepts either a bare file path or a `sqlite:` URL.
pub fn sqlite_options(path: &str) -> Result<SqliteConnectOptions, Error> {
    let opts = if path.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(path)?
    } else {
        SqliteConnectOptions::new().filename(path)
    };

    Ok(opts
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .busy_timeout(Duration::from_secs(5))
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full))
}
