use sqlx::SqliteConnection;

use crate::{
    error::Error,
    id::IdGenerator,
    models::{Answer, NewAnswer},
};

impl Answer {
    /// Stores a new answer. It starts out not ready; the answer generation
    /// pipeline marks it ready once the expected output is known.
    pub async fn insert(
        db: &mut SqliteConnection,
        ids: &IdGenerator,
        answer: &NewAnswer,
    ) -> Result<i64, Error> {
        answer.validate()?;

        if Self::find_for(&mut *db, answer.problem_id, &answer.db_name)
            .await?
            .is_some()
        {
            return Err(Error::invalid_parameter(format!(
                "problem {} already has a {} answer",
                answer.problem_id, answer.db_name
            )));
        }

        let answer_id = ids.next_id();

        sqlx::query(
            "
            INSERT INTO answers (answer_id, problem_id, db_name, prepare_sql, answer_sql, judge_sql)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(answer_id)
        .bind(answer.problem_id)
        .bind(&answer.db_name)
        .bind(&answer.prepare_sql)
        .bind(&answer.answer_sql)
        .bind(&answer.judge_sql)
        .execute(db)
        .await?;

        Ok(answer_id)
    }

    /// Replaces the SQL of an answer. The cached output no longer matches, so
    /// the answer drops back to not ready.
    pub async fn update(
        db: &mut SqliteConnection,
        answer_id: i64,
        answer: &NewAnswer,
    ) -> Result<(), Error> {
        answer.validate()?;

        let res = sqlx::query(
            "
            UPDATE answers
            SET prepare_sql = $2, answer_sql = $3, judge_sql = $4,
                answer_output = '', is_ready = FALSE
            WHERE answer_id = $1 AND deleted = FALSE
            ",
        )
        .bind(answer_id)
        .bind(&answer.prepare_sql)
        .bind(&answer.answer_sql)
        .bind(&answer.judge_sql)
        .execute(db)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("answer {answer_id}")));
        }

        Ok(())
    }

    /// Records the generated output and opens the answer for judging.
    pub async fn mark_ready(
        db: &mut SqliteConnection,
        answer_id: i64,
        answer_output: &str,
    ) -> Result<(), Error> {
        let res = sqlx::query(
            "
            UPDATE answers SET answer_output = $2, is_ready = TRUE
            WHERE answer_id = $1 AND deleted = FALSE
            ",
        )
        .bind(answer_id)
        .bind(answer_output)
        .execute(db)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("answer {answer_id}")));
        }

        Ok(())
    }

    pub async fn delete(db: &mut SqliteConnection, answer_id: i64) -> Result<(), Error> {
        let res = sqlx::query(
            "UPDATE answers SET deleted = TRUE WHERE answer_id = $1 AND deleted = FALSE",
        )
        .bind(answer_id)
        .execute(db)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("answer {answer_id}")));
        }

        Ok(())
    }

    /// The live answer of `problem_id` for `db_name`, ready or not.
    pub async fn find_for(
        db: &mut SqliteConnection,
        problem_id: i64,
        db_name: &str,
    ) -> Result<Option<Self>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT * FROM answers
            WHERE problem_id = $1 AND db_name = $2 AND deleted = FALSE
            ",
        )
        .bind(problem_id)
        .bind(db_name)
        .fetch_optional(db)
        .await?)
    }
}
