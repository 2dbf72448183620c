use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde_json::json;
use sqloj::{
    config::Config,
    db::outbox::{OutboxEntry, OutboxState},
    dispatch::{DispatchPool, Dispatcher, Outcome, TaskAccess},
    error::Error,
    models::{
        Answer, JudgeStatus, NewAnswer, NewProblem, NewSubmission, NewTask, Problem, Submission,
        Task,
    },
    protocol::JudgeRequest,
    queue::{
        reclaim::Reclaimer, service::consumer_args, Delivery, DequeueArgs, MessageId, PendingEntry,
        QueueService, QueueStore, SUBMISSION, WELL_KNOWN,
    },
    service::Service,
};
use futures_util::future::BoxFuture;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct TmpService {
    svc: Service,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

async fn setup() -> TmpService {
    let path = tempfile::tempdir().unwrap();

    let config = Config {
        dispatch_poll_ms: Some(20),
        ..Config::new(
            path.path().join("sqloj.db").to_string_lossy().to_string(),
            path.path().join("queue.db").to_string_lossy().to_string(),
            1,
        )
    };

    TmpService {
        svc: Service::connect_with(config).await.unwrap(),
        tmpdir: path,
    }
}

const STUDENT: i64 = 1001;
const AUTHOR: i64 = 1;

/// A task holding one problem with a mysql answer, with [`STUDENT`] enrolled.
struct Fixture {
    task_id: i64,
    problem_id: i64,
    answer_id: i64,
}

async fn fixture(service: &Service, window: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Fixture {
    let mut conn = service.db().pool().acquire().await.unwrap();

    let problem_id = Problem::insert(
        &mut conn,
        service.ids(),
        &NewProblem {
            author_id: AUTHOR,
            title: "Select all students".to_owned(),
            time_limit: 1000,
            memory_limit: 256,
        },
    )
    .await
    .unwrap();

    let answer_id = Answer::insert(
        &mut conn,
        service.ids(),
        &NewAnswer {
            problem_id,
            db_name: "mysql".to_owned(),
            prepare_sql: "CREATE TABLE student (name TEXT);".to_owned(),
            answer_sql: "SELECT name FROM student;".to_owned(),
            judge_sql: String::new(),
        },
    )
    .await
    .unwrap();

    let task_id = Task::insert(
        &mut conn,
        service.ids(),
        &NewTask {
            author_id: AUTHOR,
            task_name: "week 1".to_owned(),
            window,
        },
    )
    .await
    .unwrap();

    Task::add_problem(&mut conn, task_id, problem_id, 10.0)
        .await
        .unwrap();
    Task::enroll(&mut conn, task_id, STUDENT).await.unwrap();

    Fixture {
        task_id,
        problem_id,
        answer_id,
    }
}

fn submission(fx: &Fixture, db_name: &str) -> NewSubmission {
    NewSubmission {
        submitter_id: STUDENT,
        task_id: fx.task_id,
        problem_id: fx.problem_id,
        db_name: db_name.to_owned(),
        submitted_sql: "SELECT name FROM student;".to_owned(),
    }
}

async fn mark_ready(service: &Service, answer_id: i64) {
    let mut conn = service.db().pool().acquire().await.unwrap();
    Answer::mark_ready(&mut conn, answer_id, "name\n").await.unwrap();
}

async fn status_of(service: &Service, submission_id: i64) -> JudgeStatus {
    let mut conn = service.db().pool().acquire().await.unwrap();
    Submission::find(&mut conn, submission_id)
        .await
        .unwrap()
        .unwrap()
        .judge_status
}

async fn outbox_entry(service: &Service, submission_id: i64) -> Option<OutboxEntry> {
    let mut conn = service.db().pool().acquire().await.unwrap();
    OutboxEntry::find(&mut conn, submission_id).await.unwrap()
}

/// Wraps the real store and breaks `append`.
struct FaultyStore {
    inner: Arc<dyn QueueStore>,
    fault: Fault,
}

enum Fault {
    /// Every append times out.
    Timeout,
    /// The first append panics, later ones go through.
    PanicOnce(AtomicBool),
}

impl FaultyStore {
    fn new(service: &Service, fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            inner: service.queues().store().clone(),
            fault,
        })
    }
}

impl QueueStore for FaultyStore {
    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, Error>> {
        self.inner.exists(name)
    }

    fn create<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        self.inner.create(name)
    }

    fn append<'a>(
        &'a self,
        name: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<MessageId, Error>> {
        match &self.fault {
            Fault::Timeout => Box::pin(async move {
                Err(Error::Timeout {
                    operation: "append",
                    resource: name.to_owned(),
                    millis: 0,
                })
            }),
            Fault::PanicOnce(fired) => {
                if !fired.swap(true, Ordering::SeqCst) {
                    panic!("append failed hard");
                }
                self.inner.append(name, payload)
            }
        }
    }

    fn read<'a>(
        &'a self,
        name: &'a str,
        consumer: &'a str,
    ) -> BoxFuture<'a, Result<Option<Delivery>, Error>> {
        self.inner.read(name, consumer)
    }

    fn acknowledge<'a>(
        &'a self,
        name: &'a str,
        id: MessageId,
    ) -> BoxFuture<'a, Result<(), Error>> {
        self.inner.acknowledge(name, id)
    }

    fn pending<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<PendingEntry>, Error>> {
        self.inner.pending(name)
    }

    fn release_stale<'a>(
        &'a self,
        name: &'a str,
        min_idle: Duration,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        self.inner.release_stale(name, min_idle)
    }

    fn trim<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<u64, Error>> {
        self.inner.trim(name)
    }
}

/// A dispatcher over `queues` that retries without backing off.
fn dispatcher_with(
    service: &Service,
    queues: QueueService,
    lease: Duration,
    max_attempts: u32,
) -> Dispatcher {
    Dispatcher::builder()
        .db(service.db().clone())
        .queues(queues)
        .ids(service.ids().clone())
        .access(Arc::new(TaskAccess::new(service.db().clone())))
        .lease(lease)
        .max_attempts(max_attempts)
        .retry_backoff(Duration::ZERO)
        .build()
}

#[tokio::test]
async fn test_create_queue_once() {
    let service = setup().await;
    let queues = service.queues();

    assert!(!queues.queue_exists(SUBMISSION).await.unwrap());

    queues.create_queue(SUBMISSION).await.unwrap();
    queues.enqueue(SUBMISSION, "first").await.unwrap();

    assert!(matches!(
        queues.create_queue(SUBMISSION).await,
        Err(Error::QueueAlreadyExists { .. })
    ));

    let msg = queues
        .dequeue(SUBMISSION, &consumer_args("w1"))
        .await
        .unwrap();
    assert_eq!(msg.data(), "first");
}

#[tokio::test]
async fn test_empty_queue_name() {
    let service = setup().await;

    assert!(matches!(
        service.queues().queue_exists("  ").await,
        Err(Error::EmptyName)
    ));
    assert!(matches!(
        service.queues().create_queue("").await,
        Err(Error::EmptyName)
    ));
}

#[tokio::test]
async fn test_enqueue_dequeue_ack() {
    let service = setup().await;
    let queues = service.queues();

    queues.create_queue(SUBMISSION).await.unwrap();
    let id = queues.enqueue(SUBMISSION, "{\"x\":1}").await.unwrap();

    let msg = queues
        .dequeue(SUBMISSION, &consumer_args("w1"))
        .await
        .unwrap();
    assert_eq!(msg.id(), id);
    assert_eq!(msg.data(), "{\"x\":1}");
    assert_eq!(msg.delivery_count(), 1);

    assert_eq!(queues.pending(SUBMISSION).await.unwrap().len(), 1);

    msg.ack().await.unwrap();

    assert!(queues.pending(SUBMISSION).await.unwrap().is_empty());
    assert!(matches!(msg.ack().await, Err(Error::NotPending { .. })));

    let err = queues
        .dequeue(SUBMISSION, &consumer_args("w2"))
        .await
        .unwrap_err();
    assert!(err.is_empty_queue());
}

#[tokio::test]
async fn test_append_order_is_delivery_order() {
    let service = setup().await;
    let queues = service.queues();

    queues.create_queue(SUBMISSION).await.unwrap();
    for n in 0..5 {
        queues.enqueue(SUBMISSION, &n.to_string()).await.unwrap();
    }

    for n in 0..5 {
        let consumer = format!("w{}", n % 2);
        let msg = queues
            .dequeue(SUBMISSION, &consumer_args(consumer))
            .await
            .unwrap();
        assert_eq!(msg.data(), n.to_string());
        msg.ack().await.unwrap();
    }
}

#[tokio::test]
async fn test_dequeue_requires_consumer_name() {
    let service = setup().await;
    let queues = service.queues();

    queues.create_queue(SUBMISSION).await.unwrap();
    queues.enqueue(SUBMISSION, "payload").await.unwrap();

    assert!(matches!(
        queues.dequeue(SUBMISSION, &DequeueArgs::new()).await,
        Err(Error::ConsumerNameNotProvided)
    ));

    let mut args = DequeueArgs::new();
    args.insert("consumerName".to_owned(), json!(7));
    assert!(matches!(
        queues.dequeue(SUBMISSION, &args).await,
        Err(Error::ConsumerNameNotString)
    ));

    // Neither failed call consumed the entry.
    assert!(queues.pending(SUBMISSION).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_enqueue_to_missing_queue() {
    let service = setup().await;

    assert!(matches!(
        service.queues().enqueue("nowhere", "payload").await,
        Err(Error::QueueNotFound { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_readers_get_one_delivery() {
    let service = setup().await;
    let queues = service.queues().clone();

    queues.create_queue(SUBMISSION).await.unwrap();
    queues.enqueue(SUBMISSION, "only").await.unwrap();

    let mut readers = tokio::task::JoinSet::new();
    for n in 0..8 {
        let queues = queues.clone();
        readers.spawn(async move {
            queues
                .dequeue(SUBMISSION, &consumer_args(format!("w{n}")))
                .await
        });
    }

    let mut delivered = 0;
    let mut empty = 0;
    while let Some(res) = readers.join_next().await {
        match res.unwrap() {
            Ok(msg) => {
                assert_eq!(msg.data(), "only");
                delivered += 1;
            }
            Err(e) if e.is_empty_queue() => empty += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(delivered, 1);
    assert_eq!(empty, 7);
}

#[tokio::test]
async fn test_released_entries_are_redelivered_first() {
    let service = setup().await;
    let queues = service.queues();

    queues.create_queue(SUBMISSION).await.unwrap();
    let first = queues.enqueue(SUBMISSION, "first").await.unwrap();
    queues.enqueue(SUBMISSION, "second").await.unwrap();

    let lost = queues
        .dequeue(SUBMISSION, &consumer_args("crashed"))
        .await
        .unwrap();
    assert_eq!(lost.id(), first);

    // Nothing is old enough yet.
    assert_eq!(
        queues
            .store()
            .release_stale(SUBMISSION, Duration::from_secs(3600))
            .await
            .unwrap(),
        0
    );

    let released = queues
        .store()
        .release_stale(SUBMISSION, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(released, 1);

    let pending = queues.pending(SUBMISSION).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consumer, None);

    let again = queues
        .dequeue(SUBMISSION, &consumer_args("live"))
        .await
        .unwrap();
    assert_eq!(again.id(), first);
    assert_eq!(again.data(), "first");
    assert_eq!(again.delivery_count(), 2);
    again.ack().await.unwrap();

    let next = queues
        .dequeue(SUBMISSION, &consumer_args("live"))
        .await
        .unwrap();
    assert_eq!(next.data(), "second");
    assert_eq!(next.delivery_count(), 1);
}

#[tokio::test]
async fn test_reclaimer_pass_skips_missing_queues() {
    let service = setup().await;
    let queues = service.queues();

    queues.create_queue(SUBMISSION).await.unwrap();
    queues.enqueue(SUBMISSION, "payload").await.unwrap();
    queues
        .dequeue(SUBMISSION, &consumer_args("crashed"))
        .await
        .unwrap();

    let reclaimer = Reclaimer::new(
        queues.store().clone(),
        [SUBMISSION, "nowhere"],
        Duration::from_secs(1),
        Duration::ZERO,
    );

    assert_eq!(reclaimer.pass().await, 1);
    assert_eq!(reclaimer.pass().await, 0);
}

#[tokio::test]
async fn test_provision() {
    let service = setup().await;

    service.provision().await.unwrap();
    // Existing queues are left alone.
    service.provision().await.unwrap();

    for name in WELL_KNOWN {
        assert!(service.queues().queue_exists(name).await.unwrap());
    }
}

#[tokio::test]
async fn test_dispatch_waits_for_ready_answer() {
    let service = setup().await;
    service.provision().await.unwrap();
    let fx = fixture(&service, None).await;

    let submission_id = service
        .dispatcher()
        .dispatch(submission(&fx, "mysql"))
        .await
        .unwrap();
    assert_eq!(status_of(&service, submission_id).await, JudgeStatus::Pending);

    let outcome = service.dispatcher().process_next("w1").await.unwrap();
    assert!(matches!(
        outcome,
        Some(Outcome::Stalled { submission_id: id, .. }) if id == submission_id
    ));

    assert_eq!(status_of(&service, submission_id).await, JudgeStatus::Pending);
    assert_eq!(
        outbox_entry(&service, submission_id).await.unwrap().state,
        OutboxState::Stalled
    );

    let err = service
        .queues()
        .dequeue(SUBMISSION, &consumer_args("judge"))
        .await
        .unwrap_err();
    assert!(err.is_empty_queue());

    // Stalled rows are not picked up again on their own.
    assert_eq!(service.dispatcher().process_next("w1").await.unwrap(), None);
}

#[tokio::test]
async fn test_dispatch_happy_path() {
    let service = setup().await;
    service.provision().await.unwrap();
    let fx = fixture(&service, None).await;
    mark_ready(&service, fx.answer_id).await;

    let submission_id = service
        .dispatcher()
        .dispatch(submission(&fx, "mysql"))
        .await
        .unwrap();

    let outcome = service.dispatcher().process_next("w1").await.unwrap();
    assert!(matches!(
        outcome,
        Some(Outcome::Queued { submission_id: id, .. }) if id == submission_id
    ));

    assert_eq!(status_of(&service, submission_id).await, JudgeStatus::Queued);
    assert!(outbox_entry(&service, submission_id).await.is_none());

    let msg = service
        .queues()
        .dequeue(SUBMISSION, &consumer_args("judge"))
        .await
        .unwrap();
    let request = JudgeRequest::from_json(msg.data()).unwrap();
    assert_eq!(request.submission.submission_id, submission_id);
    assert_eq!(request.answer.db_name, "mysql");
    assert_eq!(request.answer.answer_output, "name\n");
    assert_eq!(request.problem.time_limit, 1000);
    assert_eq!(request.problem.memory_limit, 256);
    msg.ack().await.unwrap();

    // Exactly one message was appended.
    let err = service
        .queues()
        .dequeue(SUBMISSION, &consumer_args("judge"))
        .await
        .unwrap_err();
    assert!(err.is_empty_queue());
    assert_eq!(service.dispatcher().process_next("w1").await.unwrap(), None);
}

#[tokio::test]
async fn test_dispatch_without_answer_for_database() {
    let service = setup().await;
    service.provision().await.unwrap();
    let fx = fixture(&service, None).await;
    mark_ready(&service, fx.answer_id).await;

    let submission_id = service
        .dispatcher()
        .dispatch(submission(&fx, "opengauss"))
        .await
        .unwrap();

    assert!(matches!(
        service.dispatcher().process_next("w1").await.unwrap(),
        Some(Outcome::Stalled { .. })
    ));
    assert_eq!(status_of(&service, submission_id).await, JudgeStatus::Pending);
}

#[tokio::test]
async fn test_redispatch_after_answer_becomes_ready() {
    let service = setup().await;
    service.provision().await.unwrap();
    let fx = fixture(&service, None).await;

    let submission_id = service
        .dispatcher()
        .dispatch(submission(&fx, "mysql"))
        .await
        .unwrap();
    service.dispatcher().process_next("w1").await.unwrap();

    // Nothing to move for a different database.
    assert_eq!(
        service
            .dispatcher()
            .redispatch_stalled(fx.problem_id, "opengauss")
            .await
            .unwrap(),
        0
    );

    mark_ready(&service, fx.answer_id).await;
    assert_eq!(
        service
            .dispatcher()
            .redispatch_stalled(fx.problem_id, "mysql")
            .await
            .unwrap(),
        1
    );

    assert!(matches!(
        service.dispatcher().process_next("w1").await.unwrap(),
        Some(Outcome::Queued { .. })
    ));
    assert_eq!(status_of(&service, submission_id).await, JudgeStatus::Queued);
}

#[tokio::test]
async fn test_editing_answer_clears_readiness() {
    let service = setup().await;
    let fx = fixture(&service, None).await;
    mark_ready(&service, fx.answer_id).await;

    let mut conn = service.db().pool().acquire().await.unwrap();

    Answer::update(
        &mut conn,
        fx.answer_id,
        &NewAnswer {
            problem_id: fx.problem_id,
            db_name: "mysql".to_owned(),
            prepare_sql: "CREATE TABLE student (name TEXT, age INT);".to_owned(),
            answer_sql: "SELECT name FROM student;".to_owned(),
            judge_sql: String::new(),
        },
    )
    .await
    .unwrap();

    let answer = Answer::find_for(&mut conn, fx.problem_id, "mysql")
        .await
        .unwrap()
        .unwrap();
    assert!(!answer.is_ready);
    assert_eq!(answer.answer_output, "");

    Answer::delete(&mut conn, fx.answer_id).await.unwrap();
    assert!(Answer::find_for(&mut conn, fx.problem_id, "mysql")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_dispatch_rejections() {
    let service = setup().await;
    service.provision().await.unwrap();
    let fx = fixture(&service, None).await;
    let dispatcher = service.dispatcher();

    let err = dispatcher
        .dispatch(NewSubmission {
            submitter_id: 4242,
            ..submission(&fx, "mysql")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }));

    let err = dispatcher
        .dispatch(NewSubmission {
            problem_id: 9999,
            ..submission(&fx, "mysql")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }));

    let err = dispatcher
        .dispatch(NewSubmission {
            task_id: 9999,
            ..submission(&fx, "mysql")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let err = dispatcher
        .dispatch(submission(&fx, "sqlite"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }));
    assert!(err.is_precondition());

    {
        let mut conn = service.db().pool().acquire().await.unwrap();
        Problem::delete(&mut conn, fx.problem_id).await.unwrap();
    }
    let err = dispatcher
        .dispatch(submission(&fx, "mysql"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    // Nothing was persisted for any of them.
    let mut conn = service.db().pool().acquire().await.unwrap();
    assert!(OutboxEntry::list(&mut conn, OutboxState::Ready)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_dispatch_respects_submit_window() {
    let service = setup().await;
    service.provision().await.unwrap();
    let now = Utc::now();

    let closed = fixture(
        &service,
        Some((now - TimeDelta::hours(2), now - TimeDelta::hours(1))),
    )
    .await;
    let err = service
        .dispatcher()
        .dispatch(submission(&closed, "mysql"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }));

    let open = fixture(
        &service,
        Some((now - TimeDelta::hours(1), now + TimeDelta::hours(1))),
    )
    .await;
    service
        .dispatcher()
        .dispatch(submission(&open, "mysql"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dispatch_pool_drains_outbox() {
    let service = setup().await;
    service.provision().await.unwrap();
    let fx = fixture(&service, None).await;
    mark_ready(&service, fx.answer_id).await;

    let cancel = CancellationToken::new();
    let pool = tokio::spawn(service.dispatch_pool().run(cancel.clone()));

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            service
                .dispatcher()
                .dispatch(submission(&fx, "mysql"))
                .await
                .unwrap(),
        );
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    for id in &ids {
        while status_of(&service, *id).await != JudgeStatus::Queued {
            assert!(tokio::time::Instant::now() < deadline, "submission {id} never queued");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    cancel.cancel();
    pool.await.unwrap();

    let mut seen = Vec::new();
    while let Ok(msg) = service
        .queues()
        .dequeue(SUBMISSION, &consumer_args("judge"))
        .await
    {
        seen.push(JudgeRequest::from_json(msg.data()).unwrap().submission.submission_id);
        msg.ack().await.unwrap();
    }
    seen.sort();
    ids.sort();
    assert_eq!(seen, ids);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let service = setup().await;
    service.provision().await.unwrap();
    let fx = fixture(&service, None).await;
    mark_ready(&service, fx.answer_id).await;

    let submission_id = service
        .dispatcher()
        .dispatch(submission(&fx, "mysql"))
        .await
        .unwrap();

    // A worker claims the row and dies before settling it.
    {
        let mut conn = service.db().pool().acquire().await.unwrap();
        let claimed = OutboxEntry::claim(&mut conn, "crashed", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.submission_id, submission_id);
    }

    assert_eq!(service.dispatcher().process_next("w1").await.unwrap(), None);
    assert_eq!(status_of(&service, submission_id).await, JudgeStatus::Pending);

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(matches!(
        service.dispatcher().process_next("w1").await.unwrap(),
        Some(Outcome::Queued { submission_id: id, .. }) if id == submission_id
    ));
    assert_eq!(status_of(&service, submission_id).await, JudgeStatus::Queued);
    assert!(outbox_entry(&service, submission_id).await.is_none());
}

#[tokio::test]
async fn test_transient_failures_retry_until_budget_runs_out() {
    let service = setup().await;
    service.provision().await.unwrap();
    let fx = fixture(&service, None).await;
    mark_ready(&service, fx.answer_id).await;

    let store = FaultyStore::new(&service, Fault::Timeout);
    let dispatcher = dispatcher_with(
        &service,
        QueueService::with_store(store),
        Duration::from_secs(30),
        3,
    );

    let submission_id = dispatcher.dispatch(submission(&fx, "mysql")).await.unwrap();

    for attempts in 1..=2 {
        assert_eq!(
            dispatcher.process_next("w1").await.unwrap(),
            Some(Outcome::Retrying {
                submission_id,
                attempts
            })
        );
        let entry = outbox_entry(&service, submission_id).await.unwrap();
        assert_eq!(entry.state, OutboxState::Ready);
        assert_eq!(entry.attempts, i64::from(attempts));
        assert!(entry.claimed_by.is_none());
    }

    assert!(matches!(
        dispatcher.process_next("w1").await.unwrap(),
        Some(Outcome::Failed { submission_id: id, .. }) if id == submission_id
    ));

    let entry = outbox_entry(&service, submission_id).await.unwrap();
    assert_eq!(entry.state, OutboxState::Failed);
    assert_eq!(entry.attempts, 3);
    assert!(entry.last_error.is_some());
    assert_eq!(status_of(&service, submission_id).await, JudgeStatus::Pending);

    assert_eq!(dispatcher.process_next("w1").await.unwrap(), None);
    let err = service
        .queues()
        .dequeue(SUBMISSION, &consumer_args("judge"))
        .await
        .unwrap_err();
    assert!(err.is_empty_queue());
}

#[tokio::test]
async fn test_failed_dispatch_recovers_after_provisioning() {
    let service = setup().await;
    let fx = fixture(&service, None).await;
    mark_ready(&service, fx.answer_id).await;

    let dispatcher = dispatcher_with(
        &service,
        service.queues().clone(),
        Duration::from_secs(30),
        2,
    );

    // The submission queue has not been provisioned yet.
    let submission_id = dispatcher.dispatch(submission(&fx, "mysql")).await.unwrap();

    assert_eq!(
        dispatcher.process_next("w1").await.unwrap(),
        Some(Outcome::Retrying {
            submission_id,
            attempts: 1
        })
    );
    assert!(matches!(
        dispatcher.process_next("w1").await.unwrap(),
        Some(Outcome::Failed { .. })
    ));
    assert_eq!(
        outbox_entry(&service, submission_id).await.unwrap().state,
        OutboxState::Failed
    );
    assert_eq!(dispatcher.process_next("w1").await.unwrap(), None);

    service.provision().await.unwrap();
    assert_eq!(dispatcher.redispatch_failed().await.unwrap(), 1);

    let entry = outbox_entry(&service, submission_id).await.unwrap();
    assert_eq!(entry.state, OutboxState::Ready);
    assert_eq!(entry.attempts, 0);

    assert!(matches!(
        dispatcher.process_next("w1").await.unwrap(),
        Some(Outcome::Queued { submission_id: id, .. }) if id == submission_id
    ));
    assert_eq!(status_of(&service, submission_id).await, JudgeStatus::Queued);
    assert_eq!(dispatcher.redispatch_failed().await.unwrap(), 0);
}

#[tokio::test]
async fn test_dispatch_pool_replaces_panicked_worker() {
    let service = setup().await;
    service.provision().await.unwrap();
    let fx = fixture(&service, None).await;
    mark_ready(&service, fx.answer_id).await;

    let store = FaultyStore::new(&service, Fault::PanicOnce(AtomicBool::new(false)));
    let dispatcher = dispatcher_with(
        &service,
        QueueService::with_store(store.clone()),
        Duration::from_millis(100),
        5,
    );

    let cancel = CancellationToken::new();
    let pool = tokio::spawn(
        DispatchPool::new(dispatcher.clone(), 1, Duration::from_millis(20)).run(cancel.clone()),
    );

    let submission_id = dispatcher.dispatch(submission(&fx, "mysql")).await.unwrap();

    // The only worker dies on the first append; the row can only be queued
    // by its replacement once the lease runs out.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while status_of(&service, submission_id).await != JudgeStatus::Queued {
        assert!(
            tokio::time::Instant::now() < deadline,
            "submission {submission_id} never queued"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let Fault::PanicOnce(fired) = &store.fault else {
        unreachable!()
    };
    assert!(fired.load(Ordering::SeqCst));

    cancel.cancel();
    pool.await.unwrap();
}
