//! Claim/commit engine properties against the in-process store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use logaudit::error::Error;
use logaudit::model::task::{Completion, Failure, NewTask, Status};
use logaudit::model::transition::RETRY_EXHAUSTED_PREFIX;
use logaudit::store::TaskStore;
use logaudit::store::memory::MemoryStore;

fn task(id: &str) -> NewTask {
    NewTask::from_content(id, "org-a", &format!("log line for {id}"), Utc::now())
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Insert `id` and drive it through `cycles` claim/retry rounds.
async fn with_retries(store: &MemoryStore, id: &str, cycles: u32) {
    store.insert(vec![task(id)]).await.unwrap();
    for _ in 0..cycles {
        let claimed = store.claim(&ids(&[id]), u32::MAX).await.unwrap();
        assert!(claimed.contains_key(id));
        store.retry(&ids(&[id]), "ledger timeout").await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------------

#[tokio::test]
async fn insert_creates_received_tasks() {
    let store = MemoryStore::new();
    let report = store.insert(vec![task("a"), task("b")]).await.unwrap();
    assert_eq!(report.affected, 2);

    let a = store.get_by_id("a").await.unwrap();
    assert_eq!(a.status, Status::Received);
    assert_eq!(a.retry_count, 0);
    assert_eq!(a.source_org_id, "org-a");
    assert!(a.processing_started_at.is_none());
}

#[tokio::test]
async fn reinsert_keeps_first_write() {
    let store = MemoryStore::new();
    store.insert(vec![task("a"), task("b")]).await.unwrap();

    let mut changed = task("a");
    changed.source_org_id = "org-b".to_string();
    let report = store.insert(vec![changed, task("c")]).await.unwrap();
    assert_eq!(report.requested, 2);
    assert_eq!(report.affected, 1);

    assert_eq!(store.len().unwrap(), 3);
    assert_eq!(store.get_by_id("a").await.unwrap().source_org_id, "org-a");
}

#[tokio::test]
async fn insert_rejects_blank_id() {
    let store = MemoryStore::new();
    let err = store.insert(vec![task("a"), task("")]).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(store.is_empty().unwrap());
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_then_reclaim_returns_nothing() {
    let store = MemoryStore::new();
    store.insert(vec![task("t1")]).await.unwrap();

    let claimed = store.claim(&ids(&["t1"]), 3).await.unwrap();
    let t1 = &claimed["t1"];
    assert_eq!(t1.status, Status::Processing);
    assert!(t1.processing_started_at.is_some());

    assert!(store.claim(&ids(&["t1"]), 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_ignores_unknown_and_empty_input() {
    let store = MemoryStore::new();
    assert!(store.claim(&[], 3).await.unwrap().is_empty());
    assert!(store.claim(&ids(&["ghost"]), 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_rejects_blank_id() {
    let store = MemoryStore::new();
    let err = store.claim(&ids(&["a", ""]), 3).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn concurrent_claims_are_disjoint() {
    let store = Arc::new(MemoryStore::new());
    let all: Vec<String> = (0..200).map(|i| format!("task-{i}")).collect();
    store
        .insert(all.iter().map(|id| task(id)).collect())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let candidates = all.clone();
        handles.push(tokio::spawn(async move {
            store.claim(&candidates, 3).await.unwrap()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap().into_keys() {
            assert!(seen.insert(id.clone()), "{id} claimed twice");
        }
    }
    assert_eq!(seen.len(), all.len());
}

#[tokio::test]
async fn retry_ceiling_fails_at_claim_time() {
    let store = MemoryStore::new();
    with_retries(&store, "t1", 3).await;
    assert_eq!(store.get_by_id("t1").await.unwrap().retry_count, 3);

    let claimed = store.claim(&ids(&["t1"]), 3).await.unwrap();
    assert!(claimed.is_empty());

    let t1 = store.get_by_id("t1").await.unwrap();
    assert_eq!(t1.status, Status::Failed);
    assert!(
        t1.error_message
            .as_deref()
            .unwrap()
            .starts_with(RETRY_EXHAUSTED_PREFIX)
    );
    assert!(t1.processing_finished_at.is_some());

    // FAILED is never reclaimed, even under a higher ceiling.
    assert!(store.claim(&ids(&["t1"]), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_partitions_mixed_batch() {
    let store = MemoryStore::new();
    with_retries(&store, "old", 2).await;
    store.insert(vec![task("new")]).await.unwrap();

    let claimed = store.claim(&ids(&["old", "new"]), 2).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(claimed.contains_key("new"));
    assert_eq!(store.get_by_id("old").await.unwrap().status, Status::Failed);
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_requeues_and_counts() {
    let store = MemoryStore::new();
    store.insert(vec![task("t1")]).await.unwrap();
    store.claim(&ids(&["t1"]), 3).await.unwrap();

    let report = store.retry(&ids(&["t1"]), "ledger timeout").await.unwrap();
    assert_eq!(report.affected, 1);

    let t1 = store.get_by_id("t1").await.unwrap();
    assert_eq!(t1.status, Status::Received);
    assert_eq!(t1.retry_count, 1);
    assert_eq!(t1.error_message.as_deref(), Some("ledger timeout"));
    assert!(t1.processing_started_at.is_none());

    let claimed = store.claim(&ids(&["t1"]), 3).await.unwrap();
    assert_eq!(claimed["t1"].status, Status::Processing);
    assert_eq!(claimed["t1"].retry_count, 1);
    assert_eq!(claimed["t1"].error_message.as_deref(), Some("ledger timeout"));
}

#[tokio::test]
async fn retry_skips_rows_not_processing() {
    let store = MemoryStore::new();
    store.insert(vec![task("t1")]).await.unwrap();

    let report = store.retry(&ids(&["t1"]), "boom").await.unwrap();
    assert_eq!(report.affected, 0);
    assert!(report.is_partial());
    assert_eq!(store.get_by_id("t1").await.unwrap().retry_count, 0);
}

// ---------------------------------------------------------------------------
// Complete / Fail
// ---------------------------------------------------------------------------

fn completion(id: &str) -> Completion {
    Completion {
        request_id: id.to_string(),
        tx_hash: "0xabc".to_string(),
        log_hash_on_chain: "h1".to_string(),
        block_height: 42,
    }
}

#[tokio::test]
async fn complete_populates_anchoring_fields() {
    let store = MemoryStore::new();
    store.insert(vec![task("t1")]).await.unwrap();
    store.claim(&ids(&["t1"]), 3).await.unwrap();
    store.retry(&ids(&["t1"]), "ledger timeout").await.unwrap();
    store.claim(&ids(&["t1"]), 3).await.unwrap();

    let report = store.complete(vec![completion("t1")]).await.unwrap();
    assert_eq!(report.affected, 1);

    let t1 = store.get_by_id("t1").await.unwrap();
    assert_eq!(t1.status, Status::Completed);
    assert_eq!(t1.tx_hash.as_deref(), Some("0xabc"));
    assert_eq!(t1.block_height, Some(42));
    assert_eq!(t1.log_hash_on_chain.as_deref(), Some("h1"));
    assert!(t1.error_message.is_none());
    assert!(t1.processing_finished_at.is_some());
}

#[tokio::test]
async fn complete_on_non_processing_is_noop() {
    let store = MemoryStore::new();
    store.insert(vec![task("received"), task("done")]).await.unwrap();
    store.claim(&ids(&["done"]), 3).await.unwrap();
    store.complete(vec![completion("done")]).await.unwrap();
    let before = store.get_by_id("done").await.unwrap();

    let report = store
        .complete(vec![completion("received"), completion("done")])
        .await
        .unwrap();
    assert_eq!(report.affected, 0);
    assert_eq!(report.requested, 2);
    assert_eq!(
        store.get_by_id("received").await.unwrap().status,
        Status::Received
    );
    assert_eq!(store.get_by_id("done").await.unwrap(), before);
}

#[tokio::test]
async fn complete_correlates_each_outcome_with_its_task() {
    let store = MemoryStore::new();
    store.insert(vec![task("a"), task("b")]).await.unwrap();
    store.claim(&ids(&["a", "b"]), 3).await.unwrap();

    store
        .complete(vec![
            Completion {
                block_height: 7,
                tx_hash: "0xb".into(),
                ..completion("b")
            },
            Completion {
                block_height: 9,
                tx_hash: "0xa".into(),
                ..completion("a")
            },
        ])
        .await
        .unwrap();

    assert_eq!(store.get_by_id("a").await.unwrap().block_height, Some(9));
    assert_eq!(
        store.get_by_id("b").await.unwrap().tx_hash.as_deref(),
        Some("0xb")
    );
}

#[tokio::test]
async fn fail_marks_processing_tasks_only() {
    let store = MemoryStore::new();
    store.insert(vec![task("a"), task("b")]).await.unwrap();
    store.claim(&ids(&["a"]), 3).await.unwrap();

    let report = store
        .fail(vec![
            Failure::new("a", "malformed payload"),
            Failure::new("b", "malformed payload"),
        ])
        .await
        .unwrap();
    assert_eq!(report.affected, 1);

    let a = store.get_by_id("a").await.unwrap();
    assert_eq!(a.status, Status::Failed);
    assert_eq!(a.error_message.as_deref(), Some("malformed payload"));
    assert_eq!(store.get_by_id("b").await.unwrap().status, Status::Received);

    // Failing again is a no-op.
    let again = store
        .fail(vec![Failure::new("a", "second reason")])
        .await
        .unwrap();
    assert_eq!(again.affected, 0);
    assert_eq!(
        store.get_by_id("a").await.unwrap().error_message.as_deref(),
        Some("malformed payload")
    );
}

#[tokio::test]
async fn empty_batches_are_noops() {
    let store = MemoryStore::new();
    assert_eq!(store.insert(vec![]).await.unwrap().requested, 0);
    assert_eq!(store.complete(vec![]).await.unwrap().requested, 0);
    assert_eq!(store.fail(vec![]).await.unwrap().requested, 0);
    assert_eq!(store.retry(&[], "x").await.unwrap().requested, 0);
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lookups_by_id_and_hash() {
    let store = MemoryStore::new();
    let t = task("t1");
    let hash = t.log_hash.clone();
    store.insert(vec![t]).await.unwrap();

    assert_eq!(store.get_by_hash(&hash).await.unwrap().request_id, "t1");
    assert!(matches!(
        store.get_by_id("missing").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        store.get_by_hash("deadbeef").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn shared_hash_resolves_to_lowest_id_within_a_batch() {
    // One batch shares one arrival time, so the id breaks the tie.
    for _ in 0..20 {
        let store = MemoryStore::new();
        let batch: Vec<NewTask> = ["z-later", "a-first", "m-mid"]
            .into_iter()
            .map(|id| NewTask::from_content(id, "org-a", "same payload", Utc::now()))
            .collect();
        let hash = batch[0].log_hash.clone();
        store.insert(batch).await.unwrap();

        assert_eq!(store.get_by_hash(&hash).await.unwrap().request_id, "a-first");
    }
}
