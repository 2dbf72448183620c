use chrono::Utc;
use futures_util::future::BoxFuture;
use sqlx::Acquire;

use crate::{
    db::Database,
    error::Error,
    models::{NewSubmission, Problem, Task},
    utils::with_deadline,
};

/// Decides whether a submitter may hand in a submission at all. Runs before
/// anything is persisted.
pub trait SubmissionAccess: Send + Sync + 'static {
    fn check<'a>(&'a self, submission: &'a NewSubmission) -> BoxFuture<'a, Result<(), Error>>;
}

/// Access rules backed by the task tables of the document store.
#[derive(Clone)]
pub struct TaskAccess {
    db: Database,
}

impl TaskAccess {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn check_inner(&self, submission: &NewSubmission) -> Result<(), Error> {
        let mut conn = self.db.pool().acquire().await?;

        let Some(task) = Task::find(conn.acquire().await?, submission.task_id).await? else {
            return Err(Error::not_found(format!("task {}", submission.task_id)));
        };

        if !Task::is_enrolled(conn.acquire().await?, task.task_id, submission.submitter_id).await?
        {
            return Err(Error::access_denied(format!(
                "user {} cannot access task {}",
                submission.submitter_id, task.task_id
            )));
        }

        if !Task::has_problem(conn.acquire().await?, task.task_id, submission.problem_id).await? {
            return Err(Error::invalid_parameter(format!(
                "problem {} is not part of task {}",
                submission.problem_id, task.task_id
            )));
        }

        if Problem::find(conn.acquire().await?, submission.problem_id)
            .await?
            .is_none()
        {
            return Err(Error::not_found(format!("problem {}", submission.problem_id)));
        }

        if !task.is_in_submit_time(Utc::now()) {
            return Err(Error::access_denied(format!(
                "task {} is not open for submissions",
                task.task_id
            )));
        }

        Ok(())
    }
}

impl SubmissionAccess for TaskAccess {
    fn check<'a>(&'a self, submission: &'a NewSubmission) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(with_deadline(
            self.db.timeout(),
            "check_access",
            submission.task_id.to_string(),
            self.check_inner(submission),
        ))
    }
}
