//! The sync engine: outbox drain, pull, conflict detection and resolution.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflict_store::ConflictStore;
use crate::error::{SyncError, SyncResult};
use crate::listeners::{ListenerId, Listeners};
use crate::outbox::Outbox;
use crate::system::SyncMeta;
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use studysync_protocol::{
    ChangeOp, FailOutcome, PendingChange, PullRequest, PushRequest, PushResponse, RemoteChange,
    RemoteVersion, Resolution, SyncConflict,
};
use studysync_store::{is_system_table, LocalStore, Record};
use tracing::{debug, info, warn};

/// Overall sync health, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncHealth {
    /// Nothing left to push and no conflicts.
    UpToDate,
    /// Local changes are waiting to be pushed.
    Pending,
    /// At least one conflict needs resolution.
    Conflicted,
}

/// Snapshot of the engine's observable state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    /// Whether the engine believes the remote is reachable.
    pub is_online: bool,
    /// Whether a sync cycle is in flight.
    pub is_syncing: bool,
    /// End of the last successful cycle.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Outbox entries not yet acknowledged.
    pub pending_count: usize,
    /// Unresolved conflicts.
    pub conflict_count: usize,
    /// Worst unresolved condition.
    pub health: SyncHealth,
    /// Error of the last failed cycle, cleared by a successful one.
    pub last_error: Option<String>,
}

/// What triggered a listener notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEventKind {
    /// A local change was queued.
    ChangeQueued,
    /// A sync cycle started.
    SyncStarted,
    /// A sync cycle finished, successfully or not.
    SyncFinished,
    /// A conflict was recorded.
    ConflictAdded,
    /// A conflict was resolved.
    ConflictResolved,
    /// Connectivity changed.
    ConnectivityChanged,
}

/// Notification delivered to sync listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    /// What happened.
    pub kind: SyncEventKind,
    /// Engine state after the transition.
    pub status: SyncStatus,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Whether both phases completed and no change was left waiting for a retry.
    pub success: bool,
    /// Changes acknowledged by the remote.
    pub pushed: usize,
    /// Changes whose push failed and will be retried after backoff.
    pub failed: usize,
    /// Remote changes written locally.
    pub pulled: usize,
    /// Conflicts recorded or refreshed during the cycle.
    pub conflicts: usize,
    /// Why the cycle failed.
    pub error: Option<String>,
}

impl SyncReport {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct Flight {
    running: bool,
    generation: u64,
    last: Option<SyncReport>,
}

#[derive(Debug, Default)]
struct Connectivity {
    online: bool,
    syncing: bool,
    last_sync_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

enum PullOutcome {
    Applied,
    Ignored,
    Conflict,
}

/// The sync engine keeps the local store consistent with the remote.
///
/// Local writes go through [`SyncEngine::record_put`] and
/// [`SyncEngine::record_delete`], which update the store and queue a
/// [`PendingChange`]. A cycle drains the outbox with conditional pushes,
/// then pulls remote changes since the stored cursor.
///
/// # Concurrency
///
/// - Only one cycle runs at a time; concurrent [`SyncEngine::manual_sync`]
///   callers wait for and share the in-flight report
/// - Local writes and the apply step of each synced item serialize on one
///   write lock, so every item is applied atomically
/// - Listeners are notified after the transition, outside every lock
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn SyncTransport>,
    clock: Arc<dyn Clock>,
    outbox: Outbox,
    conflicts: ConflictStore,
    meta: SyncMeta,
    connectivity: RwLock<Connectivity>,
    flight: Mutex<Flight>,
    flight_done: Condvar,
    write_lock: Mutex<()>,
    cancelled: AtomicBool,
    listeners: Listeners<SyncEvent>,
}

impl SyncEngine {
    /// Opens the engine over a store and a transport.
    ///
    /// Outbox entries, conflicts and the pull cursor are loaded from the
    /// store's system tables. The engine starts online.
    pub fn open(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn SyncTransport>,
    ) -> SyncResult<Self> {
        Self::open_with_clock(config, store, transport, Arc::new(SystemClock))
    }

    /// Opens the engine with an explicit clock.
    pub fn open_with_clock(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn SyncTransport>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let outbox = Outbox::open(Arc::clone(&store))?;
        let conflicts = ConflictStore::open(Arc::clone(&store))?;
        let meta = SyncMeta::new(Arc::clone(&store));
        let last_sync_time = meta.last_sync()?;

        info!(
            pending = outbox.len(),
            conflicts = conflicts.len(),
            "sync engine opened"
        );

        Ok(Self {
            config,
            store,
            transport,
            clock,
            outbox,
            conflicts,
            meta,
            connectivity: RwLock::new(Connectivity {
                online: true,
                last_sync_time,
                ..Connectivity::default()
            }),
            flight: Mutex::new(Flight::default()),
            flight_done: Condvar::new(),
            write_lock: Mutex::new(()),
            cancelled: AtomicBool::new(false),
            listeners: Listeners::new(),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Status and listeners
    // ------------------------------------------------------------------

    /// Returns the current status.
    pub fn sync_status(&self) -> SyncStatus {
        let pending_count = self.outbox.len();
        let conflict_count = self.conflicts.len();
        let health = if conflict_count > 0 {
            SyncHealth::Conflicted
        } else if pending_count > 0 {
            SyncHealth::Pending
        } else {
            SyncHealth::UpToDate
        };
        let connectivity = self.connectivity.read();
        SyncStatus {
            is_online: connectivity.online,
            is_syncing: connectivity.syncing,
            last_sync_time: connectivity.last_sync_time,
            pending_count,
            conflict_count,
            health,
            last_error: connectivity.last_error.clone(),
        }
    }

    /// Registers a listener fired after every state transition.
    pub fn add_sync_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Unregisters a listener. Returns true if it was registered.
    pub fn remove_sync_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Outbox entries not yet acknowledged.
    pub fn pending_changes_count(&self) -> usize {
        self.outbox.len()
    }

    /// Outbox entries, oldest first.
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.outbox.entries()
    }

    /// Unresolved conflicts.
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// Unresolved conflicts, oldest first.
    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.conflicts.list()
    }

    /// Marks the remote reachable or unreachable.
    ///
    /// Returns true if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = {
            let mut connectivity = self.connectivity.write();
            let changed = connectivity.online != online;
            connectivity.online = online;
            changed
        };
        if changed {
            info!(online, "connectivity changed");
            self.emit(SyncEventKind::ConnectivityChanged);
        }
        changed
    }

    /// Returns true if the engine believes the remote is reachable.
    pub fn is_online(&self) -> bool {
        self.connectivity.read().online
    }

    /// Requests cancellation of the in-flight cycle.
    ///
    /// Checked between items; the item being applied completes first.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn emit(&self, kind: SyncEventKind) {
        let event = SyncEvent {
            kind,
            status: self.sync_status(),
        };
        self.listeners.notify(&event);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------

    /// Writes a record locally and queues it for push.
    ///
    /// # Errors
    ///
    /// - [`SyncError::StaleWrite`] if the stored revision is newer
    /// - [`SyncError::StorageQuota`] if the store refuses the write
    pub fn record_put(&self, record: Record) -> SyncResult<()> {
        let op = {
            let _guard = self.write_lock.lock();
            let existing = self.check_local_write(&record.table, &record.id, record.updated_at)?;
            let op = match &existing {
                Some(e) if !e.deleted => ChangeOp::Update,
                _ => ChangeOp::Create,
            };
            let payload = Some(record.payload.clone());
            self.write_and_queue(record, existing, op, payload)?;
            op
        };
        debug!(op = op.as_str(), "local write queued");
        self.emit(SyncEventKind::ChangeQueued);
        Ok(())
    }

    /// Tombstones a record locally and queues the delete.
    ///
    /// Returns false if there was no live record to delete.
    pub fn record_delete(&self, table: &str, id: &str, updated_at: i64) -> SyncResult<bool> {
        {
            let _guard = self.write_lock.lock();
            let existing = self.check_local_write(table, id, updated_at)?;
            if !existing.as_ref().is_some_and(|e| !e.deleted) {
                return Ok(false);
            }
            let tombstone = Record::tombstone(table, id, updated_at);
            self.write_and_queue(tombstone, existing, ChangeOp::Delete, None)?;
        }
        self.emit(SyncEventKind::ChangeQueued);
        Ok(true)
    }

    fn check_local_write(&self, table: &str, id: &str, updated_at: i64) -> SyncResult<Option<Record>> {
        if is_system_table(table) {
            return Err(SyncError::ReservedTable(table.to_string()));
        }
        let existing = self.store.get(table, id)?;
        if let Some(stored) = &existing {
            if updated_at < stored.updated_at {
                return Err(SyncError::StaleWrite {
                    table: table.to_string(),
                    record_id: id.to_string(),
                    stored: stored.updated_at,
                    attempted: updated_at,
                });
            }
        }
        Ok(existing)
    }

    // Caller holds the write lock.
    fn write_and_queue(
        &self,
        record: Record,
        existing: Option<Record>,
        op: ChangeOp,
        payload: Option<studysync_store::Payload>,
    ) -> SyncResult<()> {
        // A queued change for the record has not reached the remote yet, so
        // the base is whatever that change was based on.
        let base = match self.outbox.for_record(&record.table, &record.id).last() {
            Some(last) => last.base_updated_at,
            None => existing.as_ref().map(|e| e.updated_at),
        };
        let change = PendingChange::new(
            record.table.clone(),
            record.id.clone(),
            op,
            payload,
            base,
            record.updated_at,
            self.clock.now(),
        );

        let table = record.table.clone();
        let id = record.id.clone();
        self.store.put(record)?;

        if let Err(err) = self.outbox.append(change) {
            let restored = match existing {
                Some(previous) => self.store.put(previous),
                None => self.store.delete(&table, &id).map(|_| ()),
            };
            if let Err(rollback) = restored {
                warn!(table = %table, id = %id, error = %rollback, "failed to roll back local write");
            }
            return Err(err);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync cycle
    // ------------------------------------------------------------------

    /// Runs a push-then-pull cycle.
    ///
    /// Fails soft: errors are reported in the returned [`SyncReport`]. A
    /// caller arriving while a cycle is in flight waits for it and receives
    /// its report.
    pub fn manual_sync(&self) -> SyncReport {
        let mut flight = self.flight.lock();
        if flight.running {
            let generation = flight.generation;
            while flight.running && flight.generation == generation {
                self.flight_done.wait(&mut flight);
            }
            return flight
                .last
                .clone()
                .unwrap_or_else(|| SyncReport::failed("sync aborted"));
        }
        flight.running = true;
        drop(flight);
        self.run_in_flight()
    }

    /// Runs a cycle unless one is already in flight.
    ///
    /// Used by timers; returns `None` instead of waiting.
    pub fn try_sync(&self) -> Option<SyncReport> {
        {
            let mut flight = self.flight.lock();
            if flight.running {
                return None;
            }
            flight.running = true;
        }
        Some(self.run_in_flight())
    }

    fn run_in_flight(&self) -> SyncReport {
        let guard = FlightGuard { engine: self };
        let report = self.run_cycle();
        guard.finish(report.clone());
        report
    }

    fn run_cycle(&self) -> SyncReport {
        if !self.is_online() {
            debug!("sync skipped: offline");
            self.connectivity.write().last_error = Some(SyncError::Offline.to_string());
            return SyncReport::failed(SyncError::Offline.to_string());
        }

        self.cancelled.store(false, Ordering::SeqCst);
        self.connectivity.write().syncing = true;
        self.emit(SyncEventKind::SyncStarted);

        let mut report = SyncReport::default();
        let outcome = self
            .push_phase(&mut report)
            .and_then(|()| self.pull_phase(&mut report));

        let now = self.clock.now();
        match outcome {
            Ok(()) => {
                report.success = report.failed == 0;
                if report.success {
                    report.error = None;
                }
                if let Err(e) = self.meta.set_last_sync(now) {
                    warn!(error = %e, "failed to persist last sync time");
                }
                let mut connectivity = self.connectivity.write();
                connectivity.last_sync_time = Some(now);
                connectivity.last_error = report.error.clone();
            }
            Err(e) => {
                warn!(error = %e, "sync cycle failed");
                report.error = Some(e.to_string());
                self.connectivity.write().last_error = Some(e.to_string());
            }
        }
        self.connectivity.write().syncing = false;

        info!(
            success = report.success,
            pushed = report.pushed,
            pulled = report.pulled,
            conflicts = report.conflicts,
            failed = report.failed,
            "sync cycle finished"
        );
        self.emit(SyncEventKind::SyncFinished);
        report
    }

    fn push_phase(&self, report: &mut SyncReport) -> SyncResult<()> {
        let started = self.clock.now();
        let plan = self.outbox.drain_plan(started);
        let mut held: HashSet<(String, String)> = HashSet::new();
        let mut consecutive_failures = 0u32;

        for id in plan {
            self.check_cancelled()?;

            let Some(mut change) = self.outbox.get(id) else {
                continue;
            };
            let key = (change.table.clone(), change.record_id.clone());
            if held.contains(&key) || !change.is_ready(started) {
                continue;
            }

            change.begin_push();
            self.outbox.update(&change)?;
            debug!(id, table = %change.table, record_id = %change.record_id, "pushing change");

            let request = PushRequest::from_change(&change);
            match self.transport.push(&request, self.config.timeout) {
                Ok(PushResponse::Accepted { new_updated_at }) => {
                    consecutive_failures = 0;
                    self.apply_ack(change, new_updated_at)?;
                    report.pushed += 1;
                }
                Ok(PushResponse::Conflict { current }) => {
                    consecutive_failures = 0;
                    self.hold_for_conflict(change, current)?;
                    held.insert(key);
                    report.conflicts += 1;
                    self.emit(SyncEventKind::ConflictAdded);
                }
                Err(err) => {
                    held.insert(key);
                    match self.record_push_failure(change, &err)? {
                        FailOutcome::Retry { .. } => report.failed += 1,
                        FailOutcome::Exhausted => report.conflicts += 1,
                    }
                    report.error = Some(err.to_string());

                    if matches!(err, SyncError::Offline) {
                        return Err(err);
                    }
                    if err.is_retryable() {
                        consecutive_failures += 1;
                        if consecutive_failures >= self.config.max_consecutive_failures {
                            warn!(consecutive_failures, "remote unreachable, stopping push phase");
                            return Err(err);
                        }
                    } else {
                        consecutive_failures = 0;
                    }
                }
            }
        }
        Ok(())
    }

    /// Records a failed push: backoff, or a `PushFailed` conflict once the
    /// attempt budget is spent. Non-retryable errors escalate immediately.
    fn record_push_failure(
        &self,
        mut change: PendingChange,
        err: &SyncError,
    ) -> SyncResult<FailOutcome> {
        let now = self.clock.now();
        let retry = &self.config.retry;
        let max_attempts = if err.is_retryable() {
            retry.max_attempts
        } else {
            0
        };
        let delay = retry.delay_for_attempt(change.attempts.saturating_add(1));

        let outcome = change.fail(now, delay, max_attempts, err.to_string());
        match &outcome {
            FailOutcome::Retry { retry_at } => {
                warn!(
                    id = change.id,
                    attempts = change.attempts,
                    retry_at = %retry_at,
                    error = %err,
                    "push failed, will retry"
                );
                self.outbox.update(&change)?;
            }
            FailOutcome::Exhausted => {
                warn!(id = change.id, attempts = change.attempts, error = %err, "push failed permanently");
                let conflict = SyncConflict::push_failed(&change, &err.to_string(), now);
                self.conflicts.put(&conflict)?;
                change.hold_for_conflict(conflict.id);
                self.outbox.update(&change)?;
                self.emit(SyncEventKind::ConflictAdded);
            }
        }
        Ok(outcome)
    }

    /// Push acknowledged: local revision update, then outbox removal.
    fn apply_ack(&self, mut change: PendingChange, new_updated_at: i64) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        change.acknowledge(new_updated_at);

        let later: Vec<PendingChange> = self
            .outbox
            .for_record(&change.table, &change.record_id)
            .into_iter()
            .filter(|c| c.id > change.id)
            .collect();

        if let Some(mut local) = self.store.get(&change.table, &change.record_id)? {
            let updated_at = if later.is_empty() {
                new_updated_at
            } else {
                local.updated_at.max(new_updated_at)
            };
            if local.updated_at != updated_at {
                local.updated_at = updated_at;
                self.store.put(local)?;
            }
        }

        for mut next in later {
            next.rebase(new_updated_at);
            self.outbox.update(&next)?;
        }

        self.outbox.remove(change.id)?;
        debug!(id = change.id, state = ?change.state, "change acknowledged");
        Ok(())
    }

    fn hold_for_conflict(&self, mut change: PendingChange, remote: RemoteVersion) -> SyncResult<()> {
        let now = self.clock.now();
        let conflict = match self.conflicts.find_for_record(&change.table, &change.record_id) {
            Some(mut existing) => {
                existing.refresh_remote(remote);
                existing
            }
            None => SyncConflict::data_conflict(&change, remote, now),
        };
        warn!(
            table = %change.table,
            record_id = %change.record_id,
            conflict_id = %conflict.id,
            "data conflict"
        );
        self.conflicts.put(&conflict)?;
        change.hold_for_conflict(conflict.id);
        self.outbox.update(&change)
    }

    fn pull_phase(&self, report: &mut SyncReport) -> SyncResult<()> {
        loop {
            self.check_cancelled()?;

            let request = PullRequest::new(self.meta.cursor()?, self.config.pull_batch_size);
            let response = self.transport.pull(&request, self.config.timeout)?;
            response.validate(&request)?;

            for change in &response.changes {
                self.check_cancelled()?;
                match self.apply_remote(change)? {
                    PullOutcome::Applied => report.pulled += 1,
                    PullOutcome::Conflict => {
                        report.conflicts += 1;
                        self.emit(SyncEventKind::ConflictAdded);
                    }
                    PullOutcome::Ignored => {}
                }
            }

            self.meta.set_cursor(response.cursor)?;
            debug!(cursor = response.cursor, changes = response.changes.len(), "pulled page");

            if !response.has_more || response.changes.is_empty() {
                return Ok(());
            }
        }
    }

    fn apply_remote(&self, change: &RemoteChange) -> SyncResult<PullOutcome> {
        if is_system_table(&change.table) {
            warn!(table = %change.table, "ignoring remote change to reserved table");
            return Ok(PullOutcome::Ignored);
        }

        let _guard = self.write_lock.lock();
        let pending = self.outbox.for_record(&change.table, &change.record_id);

        let Some(oldest) = pending.first() else {
            let local = self.store.get(&change.table, &change.record_id)?;
            if local.is_some_and(|l| l.updated_at > change.updated_at) {
                return Ok(PullOutcome::Ignored);
            }
            self.store.put(change.to_record())?;
            return Ok(PullOutcome::Applied);
        };

        // Echo of a push this replica already saw acknowledged.
        if oldest
            .base_updated_at
            .is_some_and(|base| change.updated_at <= base)
        {
            return Ok(PullOutcome::Ignored);
        }

        if let Some(mut existing) = self.conflicts.find_for_record(&change.table, &change.record_id) {
            if existing.refresh_remote(change.version()) {
                self.conflicts.put(&existing)?;
                return Ok(PullOutcome::Conflict);
            }
            return Ok(PullOutcome::Ignored);
        }

        let conflict = SyncConflict::data_conflict(oldest, change.version(), self.clock.now());
        warn!(
            table = %change.table,
            record_id = %change.record_id,
            conflict_id = %conflict.id,
            "remote change conflicts with pending local change"
        );
        self.conflicts.put(&conflict)?;
        let mut held = oldest.clone();
        held.hold_for_conflict(conflict.id);
        self.outbox.update(&held)?;
        Ok(PullOutcome::Conflict)
    }

    // ------------------------------------------------------------------
    // Conflict resolution
    // ------------------------------------------------------------------

    /// Resolves a conflict.
    ///
    /// - `Local` force-pushes the held change, clears the conflict and then
    ///   re-drives the outbox. On transport failure the conflict stays and
    ///   the error is returned.
    /// - `Remote` overwrites the local record with the remote version,
    ///   discards every pending change for it and clears the conflict.
    pub fn resolve_conflict(&self, conflict_id: &str, resolution: Resolution) -> SyncResult<()> {
        let conflict = self
            .conflicts
            .get(conflict_id)
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;

        match resolution {
            Resolution::Local => self.resolve_local(&conflict)?,
            Resolution::Remote => self.resolve_remote(&conflict)?,
        }

        info!(conflict_id, ?resolution, "conflict resolved");
        self.emit(SyncEventKind::ConflictResolved);

        if resolution == Resolution::Local && self.is_online() && !self.outbox.is_empty() {
            let report = self.manual_sync();
            debug!(success = report.success, pushed = report.pushed, "outbox re-driven");
        }
        Ok(())
    }

    fn resolve_local(&self, conflict: &SyncConflict) -> SyncResult<()> {
        let Some(mut change) = self.outbox.get(conflict.change_id) else {
            self.conflicts.remove(&conflict.id)?;
            return Ok(());
        };

        let request = PushRequest::from_change(&change).forced();
        match self.transport.push(&request, self.config.timeout)? {
            PushResponse::Accepted { new_updated_at } => {
                change.begin_push();
                self.apply_ack(change, new_updated_at)?;
            }
            PushResponse::Conflict { .. } => {
                return Err(SyncError::DataConflict {
                    table: conflict.table_name.clone(),
                    record_id: conflict.record_id.clone(),
                });
            }
        }

        let _guard = self.write_lock.lock();
        for mut next in self
            .outbox
            .for_record(&conflict.table_name, &conflict.record_id)
        {
            if next.is_conflicted() {
                next.release();
                self.outbox.update(&next)?;
            }
        }
        self.conflicts.remove(&conflict.id)?;
        Ok(())
    }

    fn resolve_remote(&self, conflict: &SyncConflict) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        if let Some(remote) = &conflict.remote_data {
            self.store
                .put(remote.to_record(&conflict.table_name, &conflict.record_id))?;
        }
        let discarded = self
            .outbox
            .remove_for_record(&conflict.table_name, &conflict.record_id)?;
        self.conflicts.remove(&conflict.id)?;
        debug!(discarded, "pending changes discarded");
        Ok(())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("outbox", &self.outbox)
            .field("conflicts", &self.conflicts)
            .finish()
    }
}

/// Clears the single-flight flag even if the cycle panics.
struct FlightGuard<'a> {
    engine: &'a SyncEngine,
}

impl FlightGuard<'_> {
    fn finish(self, report: SyncReport) {
        self.engine.flight.lock().last = Some(report);
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut flight = self.engine.flight.lock();
            flight.running = false;
            flight.generation = flight.generation.wrapping_add(1);
        }
        self.engine.flight_done.notify_all();
    }
}
