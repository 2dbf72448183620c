use sqlx::SqliteConnection;

use crate::{
    error::Error,
    id::IdGenerator,
    models::{NewTask, Task},
};

impl Task {
    pub async fn insert(
        db: &mut SqliteConnection,
        ids: &IdGenerator,
        task: &NewTask,
    ) -> Result<i64, Error> {
        if let Some((begin, end)) = task.window {
            if begin >= end {
                return Err(Error::invalid_parameter(
                    "task must begin before it ends",
                ));
            }
        }

        let task_id = ids.next_id();

        sqlx::query(
            "
            INSERT INTO tasks (task_id, author_id, task_name, is_time_limited, begin_time, end_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(task_id)
        .bind(task.author_id)
        .bind(&task.task_name)
        .bind(task.window.is_some())
        .bind(task.window.map(|(begin, _)| begin))
        .bind(task.window.map(|(_, end)| end))
        .execute(db)
        .await?;

        Ok(task_id)
    }

    /// Looks up a live task.
    pub async fn find(db: &mut SqliteConnection, task_id: i64) -> Result<Option<Self>, Error> {
        Ok(
            sqlx::query_as("SELECT * FROM tasks WHERE task_id = $1 AND deleted = FALSE")
                .bind(task_id)
                .fetch_optional(db)
                .await?,
        )
    }

    pub async fn delete(db: &mut SqliteConnection, task_id: i64) -> Result<(), Error> {
        let res = sqlx::query("UPDATE tasks SET deleted = TRUE WHERE task_id = $1")
            .bind(task_id)
            .execute(db)
            .await?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("task {task_id}")));
        }

        Ok(())
    }

    pub async fn add_problem(
        db: &mut SqliteConnection,
        task_id: i64,
        problem_id: i64,
        score: f64,
    ) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO task_problems (task_id, problem_id, score)
            VALUES ($1, $2, $3)
            ON CONFLICT (task_id, problem_id) DO UPDATE SET score = excluded.score
            ",
        )
        .bind(task_id)
        .bind(problem_id)
        .bind(score)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn has_problem(
        db: &mut SqliteConnection,
        task_id: i64,
        problem_id: i64,
    ) -> Result<bool, Error> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM task_problems WHERE task_id = $1 AND problem_id = $2)",
        )
        .bind(task_id)
        .bind(problem_id)
        .fetch_one(db)
        .await?)
    }

    /// Grants `student_id` access to the task, as assigning it to one of the
    /// student's classes would.
    pub async fn enroll(
        db: &mut SqliteConnection,
        task_id: i64,
        student_id: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO task_students (task_id, student_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(task_id)
        .bind(student_id)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn is_enrolled(
        db: &mut SqliteConnection,
        task_id: i64,
        student_id: i64,
    ) -> Result<bool, Error> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM task_students WHERE task_id = $1 AND student_id = $2)",
        )
        .bind(task_id)
        .bind(student_id)
        .fetch_one(db)
        .await?)
    }
}
