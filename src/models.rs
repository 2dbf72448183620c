//! Document-store entities touched by the judge pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::error::Error;

/// Database engines a problem can carry an answer for.
pub const DB_NAMES: [&str; 2] = ["mysql", "opengauss"];

const MIN_SQL_CHARS: usize = 2;
const MAX_SQL_CHARS: usize = 65536;

pub fn is_valid_db_name(db_name: &str) -> bool {
    DB_NAMES.contains(&db_name)
}

fn is_valid_sql(sql: &str) -> bool {
    (MIN_SQL_CHARS..=MAX_SQL_CHARS).contains(&sql.chars().count())
}

/// Lifecycle label on a [`Submission`].
///
/// `Pending` → `Queued` happens inside this crate. Everything after `Queued`
/// belongs to the grading workers and the result consumer.
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
    strum::EnumString,
    strum::AsRefStr,
)]
#[sqlx(type_name = "text")]
pub enum JudgeStatus {
    #[serde(rename = "Pending")]
    #[sqlx(rename = "Pending")]
    #[strum(serialize = "Pending")]
    Pending,
    #[serde(rename = "Queued")]
    #[sqlx(rename = "Queued")]
    #[strum(serialize = "Queued")]
    Queued,
    #[serde(rename = "Judging")]
    #[sqlx(rename = "Judging")]
    #[strum(serialize = "Judging")]
    Judging,
    #[serde(rename = "Accepted")]
    #[sqlx(rename = "Accepted")]
    #[strum(serialize = "Accepted")]
    Accepted,
    #[serde(rename = "Wrong Answer")]
    #[sqlx(rename = "Wrong Answer")]
    #[strum(serialize = "Wrong Answer")]
    WrongAnswer,
    #[serde(rename = "Time Limit Exceeded")]
    #[sqlx(rename = "Time Limit Exceeded")]
    #[strum(serialize = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Runtime Error")]
    #[sqlx(rename = "Runtime Error")]
    #[strum(serialize = "Runtime Error")]
    RuntimeError,
    #[serde(rename = "System Error")]
    #[sqlx(rename = "System Error")]
    #[strum(serialize = "System Error")]
    SystemError,
}

impl JudgeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Queued | Self::Judging)
    }
}

#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct Submission {
    pub submission_id: i64,
    pub submitter_id: i64,
    pub submit_time: DateTime<Utc>,
    pub task_id: i64,
    pub problem_id: i64,
    pub db_name: String,
    pub submitted_sql: String,
    pub judge_status: JudgeStatus,
    pub time_cost: i32,
    pub judger_output: String,
}

/// What a submitter hands in. Identity, timestamp and status are assigned on
/// dispatch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewSubmission {
    pub submitter_id: i64,
    pub task_id: i64,
    pub problem_id: i64,
    pub db_name: String,
    pub submitted_sql: String,
}

impl NewSubmission {
    pub fn validate(&self) -> Result<(), Error> {
        if !is_valid_db_name(&self.db_name) {
            return Err(Error::invalid_parameter(format!(
                "unsupported database {}",
                self.db_name
            )));
        }

        if !is_valid_sql(&self.submitted_sql) {
            return Err(Error::invalid_parameter(format!(
                "submitted SQL must be between {MIN_SQL_CHARS} and {MAX_SQL_CHARS} characters"
            )));
        }

        Ok(())
    }
}

/// The reference solution of a problem for one database engine.
///
/// `is_ready` is cleared whenever the answer is edited and set again once
/// `answer_output` has been regenerated. Submissions are only handed to
/// workers while it is set.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub answer_id: i64,
    pub problem_id: i64,
    pub db_name: String,
    pub prepare_sql: String,
    pub answer_sql: String,
    pub judge_sql: String,
    pub answer_output: String,
    pub is_ready: bool,
    pub deleted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewAnswer {
    pub problem_id: i64,
    pub db_name: String,
    pub prepare_sql: String,
    pub answer_sql: String,
    pub judge_sql: String,
}

impl NewAnswer {
    pub fn validate(&self) -> Result<(), Error> {
        if !is_valid_db_name(&self.db_name) {
            return Err(Error::invalid_parameter(format!(
                "unsupported database {}",
                self.db_name
            )));
        }

        if !is_valid_sql(&self.prepare_sql) || !is_valid_sql(&self.answer_sql) {
            return Err(Error::invalid_parameter(format!(
                "prepare and answer SQL must be between {MIN_SQL_CHARS} and {MAX_SQL_CHARS} characters"
            )));
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub problem_id: i64,
    pub author_id: i64,
    pub title: String,
    /// Milliseconds.
    pub time_limit: i32,
    /// Megabytes.
    pub memory_limit: i32,
    pub deleted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewProblem {
    pub author_id: i64,
    pub title: String,
    pub time_limit: i32,
    pub memory_limit: i32,
}

impl NewProblem {
    pub fn validate(&self) -> Result<(), Error> {
        if !(100..=60000).contains(&self.time_limit) {
            return Err(Error::invalid_parameter(
                "time limit must be between 100 and 60000 ms",
            ));
        }

        if !(200..=4096).contains(&self.memory_limit) {
            return Err(Error::invalid_parameter(
                "memory limit must be between 200 and 4096 MB",
            ));
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_id: i64,
    pub author_id: i64,
    pub task_name: String,
    pub is_time_limited: bool,
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub deleted: bool,
}

impl Task {
    /// Whether submissions are accepted at `now`. Tasks without a time limit
    /// are always open.
    pub fn is_in_submit_time(&self, now: DateTime<Utc>) -> bool {
        if !self.is_time_limited {
            return true;
        }

        match (self.begin_time, self.end_time) {
            (Some(begin), Some(end)) => begin <= now && now <= end,
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub author_id: i64,
    pub task_name: String,
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}
