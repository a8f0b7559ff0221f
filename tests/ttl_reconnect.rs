use std::sync::Arc;
use std::time::Duration;

use driftq::{Clock, Item, ManualClock, MemoryStorage, QueueManager, Storage, StorageConfig};
use tempfile::tempdir;

fn manager_with_clock(storage: Box<dyn Storage>) -> (QueueManager, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000_000_000_000));
    let manager = QueueManager::with_clock(storage, clock.clone()).expect("manager");
    (manager, clock)
}

#[test]
fn jobs_scenario() {
    let dir = tempdir().expect("tempdir");
    let config = StorageConfig::new(dir.path().join("store.log"));
    let storage = driftq::open_storage(&config).expect("storage");
    let (mut manager, clock) = manager_with_clock(storage);

    let mut jobs = manager.get_queue("jobs").expect("jobs");
    jobs.connect().expect("connect");
    jobs.push(Item::persistent("a1", "payload", 5.0)).expect("push");
    let front = jobs.peek().expect("front");
    assert_eq!(front.uuid, "a1");
    assert_eq!(front.data, b"payload");
    assert_eq!(front.ttl, 5.0);
    jobs.disconnect();
    clock.advance(Duration::from_secs(3));

    let report = jobs.connect().expect("reconnect");
    assert_eq!(report.elapsed_secs, 3.0);
    assert_eq!(report.kept, 1);
    assert_eq!(jobs.peek().expect("front").ttl, 2.0);
    drop(jobs);
    assert_eq!(manager.storage().get_items("jobs").expect("items")[0].ttl, 2.0);

    let mut jobs = manager.get_queue("jobs").expect("jobs");
    let popped = jobs.pop().expect("pop");
    assert_eq!(popped.expect("item").uuid, "a1");
    assert_eq!(jobs.len(), 0);
    drop(jobs);
    assert!(manager.storage().get_items("jobs").expect("items").is_empty());
}

#[test]
fn connected_time_is_free() {
    let (mut manager, clock) = manager_with_clock(Box::new(MemoryStorage::new()));
    let mut jobs = manager.get_queue("jobs").expect("jobs");
    jobs.connect().expect("connect");
    jobs.push(Item::persistent("a", "x", 1.0)).expect("push");

    clock.advance(Duration::from_secs(3600));
    assert_eq!(jobs.peek().expect("front").ttl, 1.0);

    jobs.disconnect();
    jobs.connect().expect("reconnect");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs.peek().expect("front").ttl, 1.0);
}

#[test]
fn zero_is_kept_and_below_zero_is_evicted() {
    let (mut manager, clock) = manager_with_clock(Box::new(MemoryStorage::new()));
    let mut jobs = manager.get_queue("jobs").expect("jobs");
    jobs.push(Item::persistent("zero", "x", 2.0)).expect("push");
    jobs.push(Item::persistent("short", "x", 1.999)).expect("push");
    jobs.push(Item::persistent("long", "x", 10.0)).expect("push");
    clock.advance(Duration::from_secs(2));

    let report = jobs.connect().expect("connect");
    assert_eq!(report.kept, 2);
    assert_eq!(report.expired, 1);
    let remaining: Vec<_> = jobs
        .queue()
        .iter()
        .map(|item| (item.uuid.clone(), item.ttl))
        .collect();
    assert_eq!(remaining, [("zero".to_string(), 0.0), ("long".to_string(), 8.0)]);
    drop(jobs);

    let stored: Vec<_> = manager
        .storage()
        .get_items("jobs")
        .expect("items")
        .into_iter()
        .map(|item| item.uuid)
        .collect();
    assert_eq!(stored, ["zero", "long"]);
}

#[test]
fn repeated_disconnects_accumulate_only_disconnected_spans() {
    let (mut manager, clock) = manager_with_clock(Box::new(MemoryStorage::new()));
    let mut jobs = manager.get_queue("jobs").expect("jobs");
    jobs.connect().expect("connect");
    jobs.push(Item::new("a", "x", 10.0)).expect("push");

    for _ in 0..3 {
        jobs.disconnect();
        clock.advance(Duration::from_secs(2));
        jobs.connect().expect("reconnect");
        clock.advance(Duration::from_secs(100));
    }
    assert_eq!(jobs.peek().expect("front").ttl, 4.0);
    assert!(jobs.is_connected());
    assert!(clock.now() > 0);
}
