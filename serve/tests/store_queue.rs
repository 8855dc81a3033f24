//! Queue discipline against a real SQLite file: lease order, terminal
//! states, stale-lease recovery, and the single-drainer worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use serve::queue::{QueueRunSummary, QueueRunner, QueueWorker, STALE_LEASE_MS};
use serve::store::{QueueItemInsert, Store};

fn items(experiment_id: &str, n: i64) -> Vec<QueueItemInsert> {
    (0..n)
        .map(|i| QueueItemInsert {
            experiment_id: experiment_id.to_string(),
            item_index: i,
            iteration: 1,
            payload: json!({"user_message": format!("item {i}")}),
        })
        .collect()
}

#[tokio::test]
async fn lease_follows_enqueue_order_and_completion_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("queue.db")).unwrap();

    store.enqueue_items(items("exp-1", 3)).await.unwrap();

    let first = store.lease_next().await.unwrap().unwrap();
    assert_eq!(first.item_index, 0);
    assert_eq!(first.status, "in_progress");
    assert!(first.started_at_ms.is_some());

    store
        .mark_completed(first.id, true, None, Some(&json!({"status": "ok"})))
        .await
        .unwrap();

    // Completed rows are skipped; the next lease is the next pending row.
    let second = store.lease_next().await.unwrap().unwrap();
    assert_eq!(second.item_index, 1);
    store
        .mark_completed(second.id, false, Some("boom"), None)
        .await
        .unwrap();

    let third = store.lease_next().await.unwrap().unwrap();
    assert_eq!(third.item_index, 2);
    store.mark_completed(third.id, true, None, None).await.unwrap();

    assert!(store.lease_next().await.unwrap().is_none());

    let rows = store.queue_rows_for_experiment("exp-1").await.unwrap();
    let statuses: Vec<&str> = rows.iter().map(|r| r.status.as_str()).collect();
    assert_eq!(statuses, vec!["completed", "failed", "completed"]);
    assert_eq!(rows[1].error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn stale_leases_are_recovered_fresh_ones_are_not() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("stale.db");
    let store = Store::new(&db_path).unwrap();

    store.enqueue_items(items("exp-stale", 2)).await.unwrap();
    let leased = store.lease_next().await.unwrap().unwrap();

    // A fresh lease survives recovery.
    assert_eq!(store.recover_stale(STALE_LEASE_MS).await.unwrap(), 0);

    // Age the lease past the stale timeout behind the store's back.
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE experiment_queue SET started_at = started_at - ?1 WHERE id = ?2",
        rusqlite::params![STALE_LEASE_MS + 1000, leased.id],
    )
    .unwrap();

    assert_eq!(store.recover_stale(STALE_LEASE_MS).await.unwrap(), 1);
    let rows = store.queue_rows_for_experiment("exp-stale").await.unwrap();
    let recovered = rows.iter().find(|r| r.id == leased.id).unwrap();
    assert_eq!(recovered.status, "pending");
    assert!(recovered.started_at_ms.is_none());
    assert!(recovered.error.is_none());

    // The recovered row is leaseable again.
    let re_leased = store.lease_next().await.unwrap().unwrap();
    assert_eq!(re_leased.id, leased.id);
}

struct CountingRunner {
    calls: AtomicUsize,
}

#[async_trait]
impl QueueRunner for CountingRunner {
    async fn run(&self, payload: Value) -> QueueRunSummary {
        self.calls.fetch_add(1, Ordering::SeqCst);
        QueueRunSummary {
            succeeded: payload["user_message"] != "item 1",
            status: "ok".to_string(),
            trace_id: Some("trace".to_string()),
            error: None,
        }
    }
}

#[tokio::test]
async fn worker_drains_every_item_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(dir.path().join("worker.db")).unwrap());
    let runner = Arc::new(CountingRunner {
        calls: AtomicUsize::new(0),
    });
    let worker = QueueWorker::new(Arc::clone(&store), Arc::clone(&runner) as Arc<dyn QueueRunner>);

    store.enqueue_items(items("exp-worker", 3)).await.unwrap();
    worker.ensure_running().await;

    // Wait for the drain to finish.
    for _ in 0..100 {
        let counts = store.queue_counts_for_experiment("exp-worker").await.unwrap();
        let open: i64 = counts
            .iter()
            .filter(|(status, _)| status == "pending" || status == "in_progress")
            .map(|(_, n)| n)
            .sum();
        if open == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    let rows = store.queue_rows_for_experiment("exp-worker").await.unwrap();
    assert!(rows.iter().all(|r| r.status == "completed" || r.status == "failed"));
    let failed: Vec<_> = rows.iter().filter(|r| r.status == "failed").collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].item_index, 1);
    assert_eq!(failed[0].result.as_ref().unwrap()["trace_id"], "trace");

    // Re-arming an already-drained worker is a no-op.
    worker.ensure_running().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
}
