//! Submission dispatch.
//!
//! [`Dispatcher::dispatch`] persists a submission together with an outbox row
//! and returns its identifier straight away. Handing the submission to the
//! grading workers happens later, when a [`DispatchPool`] worker claims the
//! outbox row and calls [`Dispatcher::process_next`].

use std::{sync::Arc, time::Duration};

use sqlx::Acquire;
use tokio::sync::Notify;

use crate::{
    db::{outbox::OutboxEntry, Database},
    error::Error,
    id::IdGenerator,
    models::{Answer, JudgeStatus, NewSubmission, Problem, Submission},
    protocol::JudgeRequest,
    queue::{MessageId, QueueService, SUBMISSION},
    utils::with_deadline,
};

pub mod access;
pub mod pool;

pub use access::{SubmissionAccess, TaskAccess};
pub use pool::DispatchPool;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// What happened to one claimed outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Appended to the `submission` queue and moved to `Queued`.
    Queued {
        submission_id: i64,
        message_id: MessageId,
    },
    /// The answer is missing or not ready. The submission stays `Pending`
    /// until [`Dispatcher::redispatch_stalled`] is called for its answer.
    Stalled { submission_id: i64, reason: String },
    /// A transient failure; the row will be claimed again after a backoff.
    Retrying { submission_id: i64, attempts: u32 },
    /// Gave up on the row until [`Dispatcher::redispatch_failed`] is called.
    Failed { submission_id: i64, reason: String },
    /// The submission had already left `Pending`; the row was dropped.
    Skipped { submission_id: i64 },
}

enum Settle<'a> {
    Complete,
    Stall(&'a str),
    Release(&'a str, Duration),
    Fail(&'a str),
}

enum HandOff {
    Queued(MessageId),
    NotReady(String),
    AlreadyHandedOff,
}

#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    queues: QueueService,
    ids: Arc<IdGenerator>,
    access: Arc<dyn SubmissionAccess>,
    notify: Arc<Notify>,
    lease: Duration,
    max_attempts: u32,
    retry_backoff: Duration,
}

#[bon::bon]
impl Dispatcher {
    #[builder]
    pub fn new(
        db: Database,
        queues: QueueService,
        ids: Arc<IdGenerator>,
        access: Arc<dyn SubmissionAccess>,
        #[builder(default = Duration::from_secs(30))] lease: Duration,
        #[builder(default = 5)] max_attempts: u32,
        #[builder(default = Duration::from_millis(500))] retry_backoff: Duration,
    ) -> Self {
        Self {
            db,
            queues,
            ids,
            access,
            notify: Arc::new(Notify::new()),
            lease,
            max_attempts: max_attempts.max(1),
            retry_backoff,
        }
    }
}

impl Dispatcher {
    /// Signalled whenever new outbox work may be available.
    pub fn notify(&self) -> &Arc<Notify> {
        &self.notify
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Accepts a submission for judging and returns its identifier.
    ///
    /// Success means the submission is stored as `Pending`, not that it has
    /// been queued or graded.
    pub async fn dispatch(&self, submission: NewSubmission) -> Result<i64, Error> {
        submission.validate()?;

        self.access.check(&submission).await.map_err(|e| {
            tracing::info!(
                submitter_id = submission.submitter_id,
                task_id = submission.task_id,
                problem_id = submission.problem_id,
                "submission rejected: {e}"
            );
            e
        })?;

        let submission_id = self.ids.next_id();

        with_deadline(
            self.db.timeout(),
            "insert_submission",
            submission_id.to_string(),
            async {
                let mut tx = self.db.pool().begin().await?;

                Submission::insert(tx.acquire().await?, submission_id, &submission).await?;
                OutboxEntry::insert(tx.acquire().await?, submission_id).await?;

                tx.commit().await?;

                Ok(())
            },
        )
        .await
        .map_err(|e| {
            tracing::error!(submission_id, "failed to persist submission: {e}");
            e
        })?;

        tracing::info!(
            submission_id,
            submitter_id = submission.submitter_id,
            problem_id = submission.problem_id,
            db_name = %submission.db_name,
            "accepted submission"
        );

        self.notify.notify_one();

        Ok(submission_id)
    }

    /// Claims one outbox row for `worker` and tries to hand its submission
    /// off. Returns `None` when there is nothing to claim.
    pub async fn process_next(&self, worker: &str) -> Result<Option<Outcome>, Error> {
        let claimed = with_deadline(self.db.timeout(), "claim_outbox", worker, async {
            let mut conn = self.db.pool().acquire().await?;
            let entry = OutboxEntry::claim(conn.acquire().await?, worker, self.lease).await?;
            Ok(entry)
        })
        .await?;

        let Some(entry) = claimed else {
            return Ok(None);
        };

        let submission_id = entry.submission_id;

        let outcome = match self.hand_off(submission_id, worker).await {
            Ok(HandOff::Queued(message_id)) => {
                tracing::info!(submission_id, %message_id, "submission queued for judging");
                Outcome::Queued {
                    submission_id,
                    message_id,
                }
            }
            Ok(HandOff::AlreadyHandedOff) => {
                tracing::debug!(submission_id, "submission already left pending");
                self.settle(submission_id, worker, Settle::Complete).await?;
                Outcome::Skipped { submission_id }
            }
            Ok(HandOff::NotReady(reason)) => {
                tracing::info!(submission_id, reason = %reason, "submission not dispatchable yet");
                self.settle(submission_id, worker, Settle::Stall(&reason))
                    .await?;
                Outcome::Stalled {
                    submission_id,
                    reason,
                }
            }
            Err(e) => {
                let attempts = u32::try_from(entry.attempts)
                    .unwrap_or(u32::MAX)
                    .saturating_add(1);
                let reason = e.to_string();

                // A missing queue is a deployment fault that provisioning
                // repairs, so it gets the same budget as backend failures.
                let retryable = e.is_transient() || matches!(e, Error::QueueNotFound { .. });

                if retryable && attempts < self.max_attempts {
                    let backoff = backoff(self.retry_backoff, attempts);
                    tracing::warn!(
                        submission_id,
                        attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "dispatch failed, will retry: {e}"
                    );
                    self.settle(submission_id, worker, Settle::Release(&reason, backoff))
                        .await?;
                    Outcome::Retrying {
                        submission_id,
                        attempts,
                    }
                } else {
                    tracing::error!(submission_id, attempts, "dispatch failed, giving up: {e}");
                    self.settle(submission_id, worker, Settle::Fail(&reason))
                        .await?;
                    Outcome::Failed {
                        submission_id,
                        reason,
                    }
                }
            }
        };

        Ok(Some(outcome))
    }

    /// Moves submissions that stalled on the `(problem_id, db_name)` answer
    /// back into the outbox. Call once that answer has become ready.
    pub async fn redispatch_stalled(&self, problem_id: i64, db_name: &str) -> Result<u64, Error> {
        let moved = with_deadline(
            self.db.timeout(),
            "redispatch_stalled",
            problem_id.to_string(),
            async {
                let mut conn = self.db.pool().acquire().await?;
                let moved =
                    OutboxEntry::requeue_stalled(conn.acquire().await?, problem_id, db_name)
                        .await?;
                Ok(moved)
            },
        )
        .await?;

        if moved > 0 {
            tracing::info!(problem_id, db_name, moved, "re-dispatching stalled submissions");
            self.notify.notify_waiters();
        }

        Ok(moved)
    }

    /// Gives every failed row a fresh attempt budget. Call once whatever
    /// made them fail has been repaired.
    pub async fn redispatch_failed(&self) -> Result<u64, Error> {
        let moved = with_deadline(self.db.timeout(), "redispatch_failed", "outbox", async {
            let mut conn = self.db.pool().acquire().await?;
            let moved = OutboxEntry::requeue_failed(conn.acquire().await?).await?;
            Ok(moved)
        })
        .await?;

        if moved > 0 {
            tracing::info!(moved, "re-dispatching failed submissions");
            self.notify.notify_waiters();
        }

        Ok(moved)
    }

    async fn hand_off(&self, submission_id: i64, worker: &str) -> Result<HandOff, Error> {
        let loaded = with_deadline(
            self.db.timeout(),
            "load_submission",
            submission_id.to_string(),
            async {
                let mut conn = self.db.pool().acquire().await?;

                let Some(submission) =
                    Submission::find(conn.acquire().await?, submission_id).await?
                else {
                    return Err(Error::not_found(format!("submission {submission_id}")));
                };

                if submission.judge_status != JudgeStatus::Pending {
                    return Ok(None);
                }

                let problem = Problem::find(conn.acquire().await?, submission.problem_id).await?;
                let answer = Answer::find_for(
                    conn.acquire().await?,
                    submission.problem_id,
                    &submission.db_name,
                )
                .await?;

                Ok(Some((submission, problem, answer)))
            },
        )
        .await?;

        let Some((submission, problem, answer)) = loaded else {
            return Ok(HandOff::AlreadyHandedOff);
        };

        let Some(problem) = problem else {
            return Ok(HandOff::NotReady(format!(
                "problem {} not found",
                submission.problem_id
            )));
        };

        let answer = match answer {
            Some(answer) if answer.is_ready => answer,
            Some(_) => {
                return Ok(HandOff::NotReady(format!(
                    "{} answer of problem {} is not ready",
                    submission.db_name, submission.problem_id
                )))
            }
            None => {
                return Ok(HandOff::NotReady(format!(
                    "problem {} has no {} answer",
                    submission.problem_id, submission.db_name
                )))
            }
        };

        let payload = JudgeRequest::new(&submission, &problem, &answer).to_json()?;

        let message_id = self.queues.enqueue(SUBMISSION, &payload).await?;

        // Once the payload is in the queue, a failure below makes the row
        // retry and the submission may be delivered twice.
        with_deadline(
            self.db.timeout(),
            "mark_queued",
            submission_id.to_string(),
            async {
                let mut tx = self.db.pool().begin().await?;

                let moved = Submission::update_status(
                    tx.acquire().await?,
                    submission_id,
                    JudgeStatus::Pending,
                    JudgeStatus::Queued,
                )
                .await?;
                if !moved {
                    tracing::warn!(submission_id, "submission left pending while being queued");
                }

                if !OutboxEntry::complete(tx.acquire().await?, submission_id, worker).await? {
                    tracing::warn!(submission_id, worker, "outbox lease expired during dispatch");
                }

                tx.commit().await?;

                Ok(())
            },
        )
        .await?;

        Ok(HandOff::Queued(message_id))
    }

    async fn settle(
        &self,
        submission_id: i64,
        worker: &str,
        action: Settle<'_>,
    ) -> Result<(), Error> {
        with_deadline(
            self.db.timeout(),
            "settle_outbox",
            submission_id.to_string(),
            async {
                let mut conn = self.db.pool().acquire().await?;
                let conn = conn.acquire().await?;

                let held = match action {
                    Settle::Complete => OutboxEntry::complete(conn, submission_id, worker).await?,
                    Settle::Stall(reason) => {
                        OutboxEntry::stall(conn, submission_id, worker, reason).await?
                    }
                    Settle::Release(reason, backoff) => {
                        OutboxEntry::release_with_error(
                            conn,
                            submission_id,
                            worker,
                            reason,
                            backoff,
                        )
                        .await?
                    }
                    Settle::Fail(reason) => {
                        OutboxEntry::fail(conn, submission_id, worker, reason).await?
                    }
                };

                if !held {
                    tracing::warn!(submission_id, worker, "outbox lease expired before settling");
                }

                Ok(())
            },
        )
        .await
    }
}

/// Doubles `base` for every attempt after the first, up to a minute.
fn backoff(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)))
        .min(MAX_BACKOFF)
}
