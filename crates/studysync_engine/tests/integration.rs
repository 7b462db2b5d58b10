//! Integration tests for the sync engine against an in-memory remote.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use studysync_engine::{
    AutoSync, ConnectivityProbe, HttpTransport, InMemoryRemote, LoopbackClient, ManualClock,
    NetworkConfig, NetworkEvent, NetworkStatusService, RetryConfig, StaticProbe, SyncConfig,
    SyncEngine, SyncError, SyncEventKind, SyncHealth, SyncTransport,
};
use studysync_protocol::{ConflictKind, Resolution, ResolutionStrategy};
use studysync_store::{FileStore, InMemoryStore, LocalStore, Payload, Record};

fn payload(title: &str) -> Payload {
    let mut p = Payload::new();
    p.insert("title".into(), json!(title));
    p
}

fn task(id: &str, updated_at: i64, title: &str) -> Record {
    Record::new("tasks", id, updated_at).with_payload(payload(title))
}

fn config() -> SyncConfig {
    SyncConfig::new()
        .with_timeout(Duration::from_secs(2))
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_secs(10))
                .with_jitter(false),
        )
}

struct Harness {
    store: Arc<InMemoryStore>,
    remote: Arc<InMemoryRemote>,
    clock: Arc<ManualClock>,
    engine: Arc<SyncEngine>,
}

fn harness_with(store: Arc<InMemoryStore>, config: SyncConfig) -> Harness {
    let remote = Arc::new(InMemoryRemote::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = SyncEngine::open_with_clock(
        config,
        store.clone(),
        remote.clone(),
        clock.clone(),
    )
    .unwrap();
    Harness {
        store,
        remote,
        clock,
        engine: Arc::new(engine),
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(InMemoryStore::new()), config())
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn offline_edit_is_pushed_on_reconnect() {
    let h = harness();
    h.store.put(task("t1", 10, "draft")).unwrap();
    h.remote.seed("tasks", "t1", payload("draft"), 10);

    h.engine.set_online(false);
    h.engine.record_put(task("t1", 11, "final")).unwrap();
    assert_eq!(h.engine.pending_changes_count(), 1);
    assert!(!h.engine.manual_sync().success);

    h.engine.set_online(true);
    let report = h.engine.manual_sync();

    assert!(report.success, "{report:?}");
    assert_eq!(report.pushed, 1);
    assert_eq!(h.engine.pending_changes_count(), 0);
    let remote = h.remote.get("tasks", "t1").unwrap();
    assert!(remote.updated_at >= 11);
    assert_eq!(remote.payload.unwrap()["title"], "final");
    assert_eq!(h.engine.sync_status().health, SyncHealth::UpToDate);
}

#[test]
fn concurrent_remote_edit_becomes_conflict_and_remote_wins() {
    let h = harness();
    h.store.put(task("t1", 10, "original")).unwrap();
    h.remote.seed("tasks", "t1", payload("original"), 10);

    h.engine.record_put(task("t1", 12, "mine")).unwrap();
    h.remote.seed("tasks", "t1", payload("theirs"), 13);

    let report = h.engine.manual_sync();
    assert!(report.success);
    assert_eq!(report.pushed, 0);

    let conflicts = h.engine.conflicts();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::DataConflict);
    assert_eq!(conflict.resolution_strategy, ResolutionStrategy::Manual);
    assert_eq!(conflict.local_data.as_ref().unwrap()["title"], "mine");
    let remote_data = conflict.remote_data.as_ref().unwrap();
    assert_eq!(remote_data.updated_at, 13);
    assert_eq!(remote_data.payload.as_ref().unwrap()["title"], "theirs");

    // Pull does not overwrite the pending local edit.
    let local = h.store.get("tasks", "t1").unwrap().unwrap();
    assert_eq!(local.payload["title"], "mine");

    h.engine
        .resolve_conflict(&conflict.id, Resolution::Remote)
        .unwrap();

    let local = h.store.get("tasks", "t1").unwrap().unwrap();
    assert_eq!(local.updated_at, 13);
    assert_eq!(local.payload["title"], "theirs");
    assert_eq!(h.engine.conflict_count(), 0);
    assert_eq!(h.engine.pending_changes_count(), 0);
}

#[test]
fn local_resolution_force_pushes_and_is_stable() {
    let h = harness();
    h.store.put(task("t1", 10, "original")).unwrap();
    h.remote.seed("tasks", "t1", payload("original"), 10);
    h.engine.record_put(task("t1", 12, "mine")).unwrap();
    h.remote.seed("tasks", "t1", payload("theirs"), 13);
    h.engine.manual_sync();

    let conflict_id = h.engine.conflicts()[0].id.clone();
    h.engine
        .resolve_conflict(&conflict_id, Resolution::Local)
        .unwrap();

    let remote = h.remote.get("tasks", "t1").unwrap();
    assert_eq!(remote.updated_at, 14);
    assert_eq!(remote.payload.unwrap()["title"], "mine");

    let local = h.store.get("tasks", "t1").unwrap().unwrap();
    assert_eq!(local.updated_at, 14);
    assert_eq!(local.payload["title"], "mine");
    assert_eq!(h.engine.conflict_count(), 0);
    assert_eq!(h.engine.pending_changes_count(), 0);

    // Another cycle only sees echoes.
    assert!(h.engine.manual_sync().success);
    assert_eq!(h.store.get("tasks", "t1").unwrap().unwrap(), local);
    assert_eq!(h.engine.conflict_count(), 0);
}

#[test]
fn local_resolution_keeps_conflict_when_remote_unreachable() {
    let h = harness();
    h.remote.seed("tasks", "t1", payload("theirs"), 5);
    h.engine.record_put(task("t1", 3, "mine")).unwrap();
    h.engine.manual_sync();
    let conflict_id = h.engine.conflicts()[0].id.clone();

    h.remote.set_online(false);
    let err = h
        .engine
        .resolve_conflict(&conflict_id, Resolution::Local)
        .unwrap_err();
    assert!(err.is_network());
    assert_eq!(h.engine.conflict_count(), 1);
}

#[test]
fn failed_push_backs_off_then_escalates() {
    let h = harness();
    h.remote.fail_next_pushes(100);
    h.engine.record_put(task("t1", 1, "x")).unwrap();

    let first = h.engine.manual_sync();
    assert!(!first.success);
    let entry = &h.engine.pending_changes()[0];
    assert_eq!(entry.attempts, 1);

    // Still backing off: nothing is pushed, the cycle itself succeeds.
    h.clock.advance(Duration::from_secs(9));
    let waiting = h.engine.manual_sync();
    assert!(waiting.success);
    assert_eq!(h.engine.pending_changes()[0].attempts, 1);

    h.clock.advance(Duration::from_secs(1));
    assert!(!h.engine.manual_sync().success);
    assert_eq!(h.engine.pending_changes()[0].attempts, 2);

    // Second delay doubles.
    h.clock.advance(Duration::from_secs(19));
    h.engine.manual_sync();
    assert_eq!(h.engine.pending_changes()[0].attempts, 2);

    h.clock.advance(Duration::from_secs(1));
    h.engine.manual_sync();

    let conflicts = h.engine.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::PushFailed);
    assert_eq!(conflicts[0].resolution_strategy, ResolutionStrategy::Auto);
    assert_eq!(h.engine.sync_status().health, SyncHealth::Conflicted);

    // Once the remote recovers, keeping the local version delivers it.
    h.remote.fail_next_pushes(0);
    h.engine
        .resolve_conflict(&conflicts[0].id, Resolution::Local)
        .unwrap();
    assert_eq!(h.engine.pending_changes_count(), 0);
    assert!(h.remote.get("tasks", "t1").is_some());
}

#[test]
fn remote_change_never_overwrites_pending_edit() {
    let h = harness();
    h.remote.fail_next_pushes(1);
    h.engine.record_put(task("t1", 5, "mine")).unwrap();
    assert!(!h.engine.manual_sync().success);

    h.remote.seed("tasks", "t1", payload("theirs"), 7);
    let report = h.engine.manual_sync();

    assert!(report.success);
    assert_eq!(report.conflicts, 1);
    assert_eq!(
        h.store.get("tasks", "t1").unwrap().unwrap().payload["title"],
        "mine"
    );
    assert_eq!(h.engine.conflict_count(), 1);
}

#[test]
fn pull_applies_remote_changes_and_deletes() {
    let h = harness_with(
        Arc::new(InMemoryStore::new()),
        config().with_pull_batch_size(2),
    );
    for i in 0..5 {
        h.remote.seed("tasks", &format!("t{i}"), payload("remote"), 100 + i);
    }
    h.remote.seed_delete("tasks", "t0", 200);

    let report = h.engine.manual_sync();
    assert!(report.success);
    assert_eq!(report.pulled, 6);
    assert_eq!(h.store.count("tasks").unwrap(), 5);
    assert!(h.store.get("tasks", "t0").unwrap().unwrap().deleted);

    // Cursor persisted: nothing new the second time.
    assert_eq!(h.engine.manual_sync().pulled, 0);
}

#[test]
fn concurrent_manual_sync_shares_one_cycle() {
    let h = harness();
    h.remote.set_latency(Duration::from_millis(200));
    h.engine.record_put(task("t1", 1, "x")).unwrap();

    let first = {
        let engine = Arc::clone(&h.engine);
        thread::spawn(move || engine.manual_sync())
    };
    assert!(wait_until(Duration::from_secs(2), || h.engine.sync_status().is_syncing));
    assert!(h.engine.try_sync().is_none());

    let second = h.engine.manual_sync();
    let first = first.join().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.pushed, 1);
    assert_eq!(h.remote.log_len(), 1);
}

#[test]
fn storage_quota_aborts_cycle() {
    let h = harness_with(Arc::new(InMemoryStore::with_quota(0)), config());
    h.remote.seed("tasks", "t1", payload("remote"), 1);

    let report = h.engine.manual_sync();
    assert!(!report.success);
    assert!(report.error.unwrap().contains("quota"));
    assert!(h.engine.sync_status().last_error.is_some());

    let err = h.engine.record_put(task("t2", 1, "x")).unwrap_err();
    assert!(matches!(err, SyncError::StorageQuota { .. }));
    assert_eq!(h.engine.pending_changes_count(), 0);
}

#[test]
fn timeout_is_a_retryable_failure() {
    let h = harness_with(
        Arc::new(InMemoryStore::new()),
        config().with_timeout(Duration::from_millis(20)),
    );
    h.remote.set_latency(Duration::from_millis(100));
    h.engine.record_put(task("t1", 1, "x")).unwrap();

    let report = h.engine.manual_sync();
    assert!(!report.success);
    assert_eq!(report.error.as_deref(), Some("operation timed out"));
    assert_eq!(h.engine.pending_changes()[0].attempts, 1);
}

#[test]
fn listeners_see_transitions_in_order() {
    let h = harness();
    h.remote.seed("tasks", "t1", payload("theirs"), 5);

    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    let id = h.engine.add_sync_listener(move |event| sink.lock().push(event.kind));

    h.engine.record_put(task("t1", 1, "mine")).unwrap();
    h.engine.manual_sync();

    assert_eq!(
        *kinds.lock(),
        vec![
            SyncEventKind::ChangeQueued,
            SyncEventKind::SyncStarted,
            SyncEventKind::ConflictAdded,
            SyncEventKind::SyncFinished,
        ]
    );

    assert!(h.engine.remove_sync_listener(id));
    h.engine.set_online(false);
    assert_eq!(kinds.lock().len(), 4);
}

#[test]
fn outbox_and_conflicts_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed("tasks", "t2", payload("theirs"), 9);

    {
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let engine = SyncEngine::open(config(), store, remote.clone()).unwrap();
        engine.record_put(task("t2", 1, "mine")).unwrap();
        engine.manual_sync();
        engine.set_online(false);
        engine.record_put(task("t1", 1, "queued")).unwrap();
        assert_eq!(engine.conflict_count(), 1);
    }

    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let engine = SyncEngine::open(config(), store, remote.clone()).unwrap();
    assert_eq!(engine.pending_changes_count(), 2);
    assert_eq!(engine.conflict_count(), 1);
    assert!(engine.sync_status().last_sync_time.is_some());

    let report = engine.manual_sync();
    assert_eq!(report.pushed, 1);
    assert!(remote.get("tasks", "t1").is_some());
}

#[test]
fn http_transport_over_loopback() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed("tasks", "r1", payload("remote"), 3);
    let transport = HttpTransport::new(
        "memory://studysync",
        LoopbackClient::new(Arc::clone(&remote)),
    );
    let store = Arc::new(InMemoryStore::new());
    let engine = SyncEngine::open(config(), store.clone(), Arc::new(transport)).unwrap();

    engine.record_put(task("l1", 1, "local")).unwrap();
    let report = engine.manual_sync();

    assert!(report.success, "{report:?}");
    assert_eq!(report.pushed, 1);
    assert!(remote.get("tasks", "l1").is_some());
    assert_eq!(store.get("tasks", "r1").unwrap().unwrap().payload["title"], "remote");
}

#[test]
fn auto_sync_runs_after_reconnect() {
    let h = harness_with(
        Arc::new(InMemoryStore::new()),
        config().with_reconnect_debounce(Duration::from_millis(50)),
    );
    let probe = Arc::new(StaticProbe::new(true));
    let network = Arc::new(NetworkStatusService::new(probe));
    let mut auto = AutoSync::start(Arc::clone(&h.engine), Arc::clone(&network)).unwrap();

    network.handle_event(NetworkEvent::Offline);
    assert!(!h.engine.is_online());
    h.engine.record_put(task("t1", 1, "x")).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(h.engine.pending_changes_count(), 1);

    network.handle_event(NetworkEvent::Online);
    assert!(wait_until(Duration::from_secs(5), || {
        h.engine.pending_changes_count() == 0
    }));
    assert!(h.remote.get("tasks", "t1").is_some());

    auto.stop();
}

#[test]
fn auto_sync_polls_on_interval() {
    let h = harness_with(
        Arc::new(InMemoryStore::new()),
        config().with_sync_interval(Duration::from_millis(30)),
    );
    let probe: Arc<dyn ConnectivityProbe> = Arc::new(StaticProbe::new(true));
    let network = Arc::new(NetworkStatusService::new(probe));
    network.start(&NetworkConfig::new(Duration::from_millis(20)));
    let _auto = AutoSync::start(Arc::clone(&h.engine), Arc::clone(&network)).unwrap();

    h.remote.seed("tasks", "r1", payload("remote"), 1);
    assert!(wait_until(Duration::from_secs(5), || {
        h.store.get("tasks", "r1").unwrap().is_some()
    }));
    network.stop_probing();
}

#[test]
fn transport_ping_reflects_remote_reachability() {
    let remote = InMemoryRemote::new();
    assert!(remote.ping(Duration::from_secs(1)).is_ok());
    remote.set_online(false);
    assert!(remote.ping(Duration::from_secs(1)).is_err());
}
