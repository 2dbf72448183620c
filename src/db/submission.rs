use chrono::Utc;
use sqlx::SqliteConnection;

use crate::{
    error::Error,
    models::{JudgeStatus, NewSubmission, Submission},
};

impl Submission {
    /// Persists `submission` under `submission_id` with status `Pending`.
    pub async fn insert(
        db: &mut SqliteConnection,
        submission_id: i64,
        submission: &NewSubmission,
    ) -> Result<Self, Error> {
        Ok(sqlx::query_as(
            "
            INSERT INTO submissions
                (submission_id, submitter_id, submit_time, task_id, problem_id, db_name, submitted_sql, judge_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            ",
        )
        .bind(submission_id)
        .bind(submission.submitter_id)
        .bind(Utc::now())
        .bind(submission.task_id)
        .bind(submission.problem_id)
        .bind(&submission.db_name)
        .bind(&submission.submitted_sql)
        .bind(JudgeStatus::Pending)
        .fetch_one(db)
        .await?)
    }

    pub async fn find(
        db: &mut SqliteConnection,
        submission_id: i64,
    ) -> Result<Option<Self>, Error> {
        Ok(
            sqlx::query_as("SELECT * FROM submissions WHERE submission_id = $1")
                .bind(submission_id)
                .fetch_optional(db)
                .await?,
        )
    }

    /// Moves a submission from `from` to `to`. Returns false when the
    /// submission was not in `from`, leaving it untouched.
    pub async fn update_status(
        db: &mut SqliteConnection,
        submission_id: i64,
        from: JudgeStatus,
        to: JudgeStatus,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "UPDATE submissions SET judge_status = $3 WHERE submission_id = $1 AND judge_status = $2",
        )
        .bind(submission_id)
        .bind(from)
        .bind(to)
        .execute(db)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}
