use sqlx::SqliteConnection;

use crate::{
    error::Error,
    id::IdGenerator,
    models::{NewProblem, Problem},
};

impl Problem {
    pub async fn insert(
        db: &mut SqliteConnection,
        ids: &IdGenerator,
        problem: &NewProblem,
    ) -> Result<i64, Error> {
        problem.validate()?;

        let problem_id = ids.next_id();

        sqlx::query(
            "
            INSERT INTO problems (problem_id, author_id, title, time_limit, memory_limit)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(problem_id)
        .bind(problem.author_id)
        .bind(&problem.title)
        .bind(problem.time_limit)
        .bind(problem.memory_limit)
        .execute(db)
        .await?;

        Ok(problem_id)
    }

    /// Looks up a live problem.
    pub async fn find(db: &mut SqliteConnection, problem_id: i64) -> Result<Option<Self>, Error> {
        Ok(
            sqlx::query_as("SELECT * FROM problems WHERE problem_id = $1 AND deleted = FALSE")
                .bind(problem_id)
                .fetch_optional(db)
                .await?,
        )
    }

    pub async fn delete(db: &mut SqliteConnection, problem_id: i64) -> Result<(), Error> {
        let res = sqlx::query("UPDATE problems SET deleted = TRUE WHERE problem_id = $1")
            .bind(problem_id)
            .execute(db)
            .await?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("problem {problem_id}")));
        }

        Ok(())
    }
}
