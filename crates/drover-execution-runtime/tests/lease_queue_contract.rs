use chrono::{Duration, Utc};
use serde_json::json;

use drover_execution_runtime::{ElementOutcome, InMemoryLeaseQueue, LeaseQueue, QueueElement};

fn assert_lease_queue_contract<Q: LeaseQueue>(queue: &Q, name: &str) {
    let tenant = format!("tenant-{}", name);
    let other = format!("other-{}", name);
    let now = Utc::now();

    assert!(queue.add(&tenant, QueueElement::new("a", json!({"n": 1})), now).unwrap());
    assert!(queue.add(&tenant, QueueElement::new("b", json!({"n": 2})), now).unwrap());
    assert!(queue.add(&tenant, QueueElement::new("c", json!({"n": 3})), now).unwrap());
    assert!(!queue.add(&tenant, QueueElement::new("a", json!({"n": 9})), now).unwrap());
    assert!(queue.add(&other, QueueElement::new("a", json!({})), now).unwrap());
    assert_eq!(queue.size(&tenant).unwrap(), 3);

    // FIFO, exclusive leases
    let first = queue.take(&tenant, "w1", now).unwrap().expect("first element");
    assert_eq!(first.element.id, "a");
    assert_eq!(first.element.payload, json!({"n": 1}));
    assert_eq!(first.lease.consumer_id, "w1");
    let second = queue.take(&tenant, "w2", now + Duration::seconds(1)).unwrap().expect("second element");
    assert_eq!(second.element.id, "b");

    // leased ids stay unique
    assert!(!queue.add(&tenant, QueueElement::new("a", json!({})), now).unwrap());

    let leased = queue.get_being_consumed(&tenant).unwrap();
    let leased_ids: Vec<&str> = leased.iter().map(|l| l.element.id.as_str()).collect();
    assert_eq!(leased_ids, vec!["a", "b"]);
    let queued: Vec<String> = queue.get_queued(&tenant).unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(queued, vec!["c".to_string()]);

    // stale holder is ignored
    assert!(!queue
        .record_progress("w2", &tenant, "a", ElementOutcome::Acked, "stale")
        .unwrap());
    assert_eq!(queue.size(&tenant).unwrap(), 3);

    assert!(queue
        .record_progress("w1", &tenant, "a", ElementOutcome::Acked, "done")
        .unwrap());
    assert!(!queue
        .record_progress("w1", &tenant, "a", ElementOutcome::Acked, "again")
        .unwrap());

    // requeue keeps position ahead of later elements
    assert!(queue
        .record_progress("w2", &tenant, "b", ElementOutcome::Requeued, "retry")
        .unwrap());
    let again = queue.take(&tenant, "w3", now).unwrap().expect("requeued element");
    assert_eq!(again.element.id, "b");
    assert!(queue
        .record_progress("w3", &tenant, "b", ElementOutcome::Dropped, "give up")
        .unwrap());

    assert!(queue.remove(&tenant, "c").unwrap());
    assert!(!queue.remove(&tenant, "c").unwrap());
    assert!(queue.take(&tenant, "w1", now).unwrap().is_none());
    assert_eq!(queue.size(&tenant).unwrap(), 0);

    assert!(queue.tenants().unwrap().contains(&other));
    assert_eq!(queue.remove_all(&other).unwrap(), 1);
    let metrics = queue.metrics(&other).unwrap();
    assert_eq!(metrics.total(), 0);
}

#[test]
fn lease_queue_contract_memory() {
    let queue = InMemoryLeaseQueue::new();
    assert_lease_queue_contract(&queue, "memory");
}

#[cfg(feature = "sqlite-persistence")]
#[test]
fn lease_queue_contract_sqlite() {
    let queue = drover_execution_runtime::SqliteLeaseQueue::new(":memory:").expect("sqlite queue");
    assert_lease_queue_contract(&queue, "sqlite");
}

#[cfg(feature = "kernel-postgres")]
#[test]
fn lease_queue_contract_postgres_when_env_is_set() {
    use std::time::{SystemTime, UNIX_EPOCH};

    let Ok(db_url) = std::env::var("DROVER_TEST_POSTGRES_URL") else {
        return;
    };
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let queue = drover_execution_runtime::PostgresLeaseQueue::new(db_url)
        .with_schema(format!("drover_queue_test_{}", ts));
    assert_lease_queue_contract(&queue, "postgres");
}
