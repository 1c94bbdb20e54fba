mod common;

use common::setup_db;

use chrono::Utc;
use hookflow::jobs::{
    ErrorCode, JobError, JobQueue, JobStatus, JobStore, JobsRepo, NewJob, StoreError,
};
use serde_json::json;
use serial_test::serial;
use std::time::Duration;

async fn enqueue(repo: &JobsRepo, name: &str, priority: i32, max_attempts: i32) -> uuid::Uuid {
    repo.enqueue(NewJob::now(name, json!({"name": name}), priority, max_attempts))
        .await
        .unwrap()
}

#[tokio::test]
#[serial]
async fn claims_follow_priority_then_arrival() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let a = enqueue(&repo, "a", 1, 3).await;
    let b = enqueue(&repo, "b", 100, 3).await;
    let c = enqueue(&repo, "c", 100, 3).await;

    let mut order = Vec::new();
    while let Some(job) = repo.claim_next("slot-0").await.unwrap() {
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.attempts, 1);
        order.push(job.id);
    }
    assert_eq!(order, vec![b, c, a]);
}

#[tokio::test]
#[serial]
async fn delayed_jobs_are_not_claimable_yet() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let mut later = NewJob::now("later", json!({}), 100, 3);
    later.run_at = Utc::now() + chrono::Duration::seconds(60);
    repo.enqueue(later).await.unwrap();
    let now = enqueue(&repo, "now", 0, 3).await;

    assert_eq!(repo.claim_next("slot-0").await.unwrap().unwrap().id, now);
    assert!(repo.claim_next("slot-0").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn concurrent_claims_get_distinct_jobs() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let only = enqueue(&repo, "only", 0, 3).await;

    let (x, y) = tokio::join!(repo.claim_next("slot-x"), repo.claim_next("slot-y"));
    let claimed: Vec<_> = [x.unwrap(), y.unwrap()].into_iter().flatten().collect();

    assert_eq!(claimed.len(), 1, "exactly one slot gets the job");
    assert_eq!(claimed[0].id, only);
}

#[tokio::test]
#[serial]
async fn log_progress_and_completion_round_trip() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let id = enqueue(&repo, "job", 0, 3).await;
    repo.claim_next("slot-0").await.unwrap();

    repo.append_log(id, "slot-0", "first").await.unwrap();
    repo.append_log(id, "slot-0", "second").await.unwrap();
    repo.set_progress(id, "slot-0", 70).await.unwrap();

    let job = repo.complete(id, "slot-0", json!({"ok": true})).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.locked_by.is_none());
    assert!(job.finished_at.is_some());

    let job = repo.get(id).await.unwrap().unwrap();
    let lines: Vec<_> = job.log.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(lines, vec!["first", "second"]);
    assert_eq!(job.progress, 70);
    assert_eq!(job.result, Some(json!({"ok": true})));
}

#[tokio::test]
#[serial]
async fn terminal_writes_are_fenced_and_write_once() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let id = enqueue(&repo, "job", 0, 3).await;
    repo.claim_next("slot-0").await.unwrap();

    // Wrong claimant
    let err = repo.complete(id, "slot-9", json!(1)).await.unwrap_err();
    assert!(matches!(err, StoreError::ClaimLost { .. }));

    repo.fail(id, "slot-0", JobError::downstream(502, "Bad Gateway"))
        .await
        .unwrap();

    // Already terminal
    let err = repo.complete(id, "slot-0", json!(1)).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidState {
            actual: Some(JobStatus::Failed),
            ..
        }
    ));

    let job = repo.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.result.is_none());
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::DownstreamError);
    assert_eq!(error.status_code, Some(502));
}

#[tokio::test]
#[serial]
async fn retry_requeues_with_last_error_and_delay() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let id = enqueue(&repo, "job", 0, 3).await;
    repo.claim_next("slot-0").await.unwrap();

    let run_at = Utc::now() + chrono::Duration::milliseconds(300);
    repo.retry(id, "slot-0", JobError::new(ErrorCode::Timeout, "slow"), run_at)
        .await
        .unwrap();

    let job = repo.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.last_error.map(|e| e.code), Some(ErrorCode::Timeout));
    assert!(repo.claim_next("slot-0").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let job = repo.claim_next("slot-1").await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
#[serial]
async fn stalled_claims_are_requeued_then_exhausted() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);
    let visibility = Duration::from_millis(100);

    let id = enqueue(&repo, "job", 0, 2).await;

    repo.claim_next("slot-a").await.unwrap();
    tokio::time::sleep(visibility * 3).await;
    let reclaimed = repo.reclaim_stalled(visibility).await.unwrap();
    assert_eq!(reclaimed.requeued, vec![id]);

    let job = repo.claim_next("slot-b").await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);

    // Old claimant is fenced out
    let err = repo.complete(id, "slot-a", json!(1)).await.unwrap_err();
    assert!(err.is_invalid_state());

    tokio::time::sleep(visibility * 3).await;
    let reclaimed = repo.reclaim_stalled(visibility).await.unwrap();
    assert!(reclaimed.requeued.is_empty());
    assert_eq!(reclaimed.exhausted.len(), 1);

    let job = repo.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error.map(|e| e.code),
        Some(ErrorCode::MaxAttemptsExceeded)
    );
    assert!(repo.claim_next("slot-c").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn counts_and_list_reflect_status() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let done = enqueue(&repo, "done", 10, 3).await;
    enqueue(&repo, "waiting", 0, 3).await;
    repo.claim_next("slot-0").await.unwrap();
    repo.complete(done, "slot-0", json!(null)).await.unwrap();

    let counts = repo.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.active, 0);

    let completed = repo.list(Some(JobStatus::Completed), 10).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, done);
    assert_eq!(repo.list(None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
#[serial]
async fn completion_in_another_process_reaches_local_waiter() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    // Two queues over one database stand in for two processes
    let api_side = JobQueue::new(repo.clone());
    let worker_side = JobQueue::new(repo.clone());
    let listener = repo.spawn_listener(api_side.clone()).await.unwrap();

    let id = api_side
        .enqueue_now("webhook-high", json!({"x": 1}), 100, 3)
        .await
        .unwrap();

    let waiter = {
        let queue = api_side.clone();
        tokio::spawn(async move { queue.await_completion(id, Duration::from_secs(10)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    worker_side.claim_next("remote-slot").await.unwrap();
    worker_side
        .complete(id, "remote-slot", json!({"ok": true}))
        .await
        .unwrap();

    let job = waiter.await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"ok": true})));

    listener.abort();
}

#[tokio::test]
#[serial]
async fn enqueue_in_another_process_wakes_local_dispatcher() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let worker_side = JobQueue::new(repo.clone());
    let api_side = JobQueue::new(repo.clone());
    let listener = repo.spawn_listener(worker_side.clone()).await.unwrap();

    let dispatcher = hookflow::jobs::Dispatcher::new(
        worker_side.clone(),
        hookflow::jobs::DispatcherConfig::new(Duration::from_secs(60)),
    );
    let idle = tokio::spawn(async move { dispatcher.next_job("slot-0").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!idle.is_finished());

    let id = api_side
        .enqueue_now("webhook-low", json!({}), 1, 3)
        .await
        .unwrap();

    let job = tokio::time::timeout(Duration::from_secs(5), idle)
        .await
        .expect("dispatcher woke on remote enqueue")
        .unwrap()
        .unwrap();
    assert_eq!(job.id, id);

    listener.abort();
}

#[tokio::test]
#[serial]
async fn sweep_wakes_dispatcher_for_backoff_left_by_exited_process() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    // The exited process requeued with a backoff and never woke anyone
    let id = enqueue(&repo, "webhook-high", 100, 3).await;
    repo.claim_next("gone-slot").await.unwrap();
    let run_at = Utc::now() + chrono::Duration::milliseconds(100);
    repo.retry(id, "gone-slot", JobError::new(ErrorCode::Timeout, "slow"), run_at)
        .await
        .unwrap();
    assert!(!repo.has_due().await.unwrap());

    let survivor = JobQueue::new(repo.clone());
    let dispatcher = hookflow::jobs::Dispatcher::new(
        survivor.clone(),
        hookflow::jobs::DispatcherConfig::new(Duration::from_secs(60)),
    );
    let idle = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.next_job("slot-0").await })
    };

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!idle.is_finished());
    assert!(repo.has_due().await.unwrap());

    dispatcher.sweep().await.unwrap();
    let job = tokio::time::timeout(Duration::from_secs(5), idle)
        .await
        .expect("sweep woke the dispatcher")
        .unwrap()
        .unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 2);
}
