use hookflow::jobs::{JobQueue, JobStatus, MemoryStore, StoreError};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Drain order is priority descending, then enqueue order.
    #[test]
    fn drain_order_is_priority_then_fifo(priorities in prop::collection::vec(0i32..4, 0..40)) {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let queue = JobQueue::new(MemoryStore::new());

            let mut enqueued: Vec<(i32, usize, Uuid)> = Vec::new();
            for (i, p) in priorities.iter().enumerate() {
                let id = queue.enqueue_now("job", json!({"i": i}), *p, 3).await.unwrap();
                enqueued.push((*p, i, id));
            }

            let mut expected = enqueued.clone();
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            let expected: Vec<Uuid> = expected.into_iter().map(|(_, _, id)| id).collect();

            let mut drained = Vec::new();
            while let Some(job) = queue.claim_next("slot-0").await.unwrap() {
                drained.push(job.id);
            }

            prop_assert_eq!(drained, expected);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn equal_priority_is_fifo_and_higher_priority_jumps_ahead() {
    let queue = JobQueue::new(MemoryStore::new());
    let a = queue.enqueue_now("a", json!({}), 1, 3).await.unwrap();
    let b = queue.enqueue_now("b", json!({}), 100, 3).await.unwrap();
    let c = queue.enqueue_now("c", json!({}), 100, 3).await.unwrap();

    let first = queue.claim_next("slot-0").await.unwrap().unwrap();
    let second = queue.claim_next("slot-0").await.unwrap().unwrap();
    let third = queue.claim_next("slot-0").await.unwrap().unwrap();
    assert_eq!([first.id, second.id, third.id], [b, c, a]);
    assert!(queue.claim_next("slot-0").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_job() {
    let queue = JobQueue::new(MemoryStore::new());
    for i in 0..200 {
        queue.enqueue_now("job", json!({"i": i}), i % 5, 3).await.unwrap();
    }

    let mut tasks = Vec::new();
    for slot in 0..8 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let slot_id = format!("slot-{slot}");
            let mut mine = Vec::new();
            while let Some(job) = queue.claim_next(&slot_id).await.unwrap() {
                assert_eq!(job.locked_by.as_deref(), Some(slot_id.as_str()));
                mine.push(job.id);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 200);

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.active, 200);
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn terminal_state_is_written_once() {
    let queue = JobQueue::new(MemoryStore::new());
    let id = queue.enqueue_now("job", json!({}), 0, 3).await.unwrap();
    queue.claim_next("slot-0").await.unwrap();

    queue.complete(id, "slot-0", json!({"first": true})).await.unwrap();

    // Second completion and a late failure are both rejected
    let err = queue
        .complete(id, "slot-0", json!({"second": true}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidState {
            actual: Some(JobStatus::Completed),
            ..
        }
    ));
    let err = queue
        .fail(
            id,
            "slot-0",
            hookflow::jobs::JobError::new(hookflow::jobs::ErrorCode::Unknown, "late"),
        )
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"first": true})));
    assert!(job.error.is_none());
}

#[tokio::test]
async fn list_filters_by_status_newest_first() {
    let queue = JobQueue::new(MemoryStore::new());
    let older = queue.enqueue_now("job", json!({}), 0, 3).await.unwrap();
    let newer = queue.enqueue_now("job", json!({}), 0, 3).await.unwrap();
    let claimed = queue.enqueue_now("job", json!({}), 9, 3).await.unwrap();
    assert_eq!(queue.claim_next("slot-0").await.unwrap().unwrap().id, claimed);

    let waiting: Vec<Uuid> = queue
        .list(Some(JobStatus::Waiting), 10)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(waiting, vec![newer, older]);

    let all = queue.list(None, 2).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, claimed);
}
