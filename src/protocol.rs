//! JSON messages exchanged with grading workers.
//!
//! A [`JudgeRequest`] is published on the `submission` queue; workers answer
//! with a [`JudgeResponse`] on `judge_result`.

use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    models::{Answer, JudgeStatus, Problem, Submission},
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JudgeSubmission {
    #[serde(rename = "submissionID")]
    pub submission_id: i64,
    #[serde(rename = "submittedSQL")]
    pub submitted_sql: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JudgeProblem {
    /// Milliseconds.
    pub time_limit: i32,
    /// Megabytes.
    pub memory_limit: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JudgeAnswer {
    #[serde(rename = "dbName")]
    pub db_name: String,
    #[serde(rename = "prepareSQL")]
    pub prepare_sql: String,
    #[serde(rename = "answerSQL")]
    pub answer_sql: String,
    #[serde(rename = "judgeSQL")]
    pub judge_sql: String,
    #[serde(rename = "answerOutput")]
    pub answer_output: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JudgeRequest {
    pub submission: JudgeSubmission,
    pub problem: JudgeProblem,
    pub answer: JudgeAnswer,
}

impl JudgeRequest {
    pub fn new(submission: &Submission, problem: &Problem, answer: &Answer) -> Self {
        Self {
            submission: JudgeSubmission {
                submission_id: submission.submission_id,
                submitted_sql: submission.submitted_sql.clone(),
            },
            problem: JudgeProblem {
                time_limit: problem.time_limit,
                memory_limit: problem.memory_limit,
            },
            answer: JudgeAnswer {
                db_name: answer.db_name.clone(),
                prepare_sql: answer.prepare_sql.clone(),
                answer_sql: answer.answer_sql.clone(),
                judge_sql: answer.judge_sql.clone(),
                answer_output: answer.answer_output.clone(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub judge_status: JudgeStatus,
    /// Milliseconds.
    pub time_cost: i32,
    pub judger_output: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JudgeResponse {
    #[serde(rename = "submissionID")]
    pub submission_id: i64,
    pub result: JudgeResult,
}

impl JudgeResponse {
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }
}
