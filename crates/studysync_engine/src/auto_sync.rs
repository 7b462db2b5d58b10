//! Automatic sync on reconnect and on an interval.

use crate::listeners::ListenerId;
use crate::network::{NetworkStatus, NetworkStatusService};
use crate::state::SyncEngine;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug)]
struct Schedule {
    was_online: bool,
    reconnect_at: Option<Instant>,
    next_periodic: Option<Instant>,
    stopped: bool,
}

#[derive(Debug)]
struct Shared {
    schedule: Mutex<Schedule>,
    wake: Condvar,
}

/// Drives a [`SyncEngine`] from connectivity changes and a timer.
///
/// - An offline to online transition schedules a sync after
///   `reconnect_debounce`; a newer transition restarts the window
/// - With `sync_interval` set, a sync is attempted on every tick
/// - Both use [`SyncEngine::try_sync`] and skip when a cycle is in flight
///
/// The worker stops when [`AutoSync::stop`] is called or the handle is dropped.
pub struct AutoSync {
    shared: Arc<Shared>,
    network: Arc<NetworkStatusService>,
    listener: ListenerId,
    worker: Option<JoinHandle<()>>,
}

impl AutoSync {
    /// Subscribes `engine` to `network` and starts the worker thread.
    pub fn start(
        engine: Arc<SyncEngine>,
        network: Arc<NetworkStatusService>,
    ) -> std::io::Result<Self> {
        let debounce = engine.config().reconnect_debounce;
        let interval = engine.config().sync_interval;
        let online = network.status().is_online;
        engine.set_online(online);

        let shared = Arc::new(Shared {
            schedule: Mutex::new(Schedule {
                was_online: online,
                reconnect_at: None,
                next_periodic: interval.map(|i| Instant::now() + i),
                stopped: false,
            }),
            wake: Condvar::new(),
        });

        let listener = {
            let shared = Arc::clone(&shared);
            let engine = Arc::clone(&engine);
            network.add_listener(move |status: &NetworkStatus| {
                engine.set_online(status.is_online);
                let mut schedule = shared.schedule.lock();
                match (schedule.was_online, status.is_online) {
                    (false, true) => {
                        debug!(?debounce, "reconnected, sync scheduled");
                        schedule.reconnect_at = Some(Instant::now() + debounce);
                    }
                    (true, false) => {
                        schedule.reconnect_at = None;
                    }
                    _ => {}
                }
                schedule.was_online = status.is_online;
                drop(schedule);
                shared.wake.notify_all();
            })
        };

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("studysync-auto-sync".into())
                .spawn(move || run_worker(&shared, &engine, interval))
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                network.remove_listener(listener);
                return Err(e);
            }
        };

        Ok(Self {
            shared,
            network,
            listener,
            worker: Some(worker),
        })
    }

    /// Stops the worker and unsubscribes from the network service.
    pub fn stop(&mut self) {
        self.network.remove_listener(self.listener);
        self.shared.schedule.lock().stopped = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("auto-sync worker panicked");
            }
        }
    }
}

impl Drop for AutoSync {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: &Shared, engine: &SyncEngine, interval: Option<Duration>) {
    let mut schedule = shared.schedule.lock();
    loop {
        if schedule.stopped {
            return;
        }

        let now = Instant::now();
        let reconnect_due = schedule.reconnect_at.is_some_and(|at| at <= now);
        let periodic_due = schedule.next_periodic.is_some_and(|at| at <= now);

        if reconnect_due || periodic_due {
            if reconnect_due {
                schedule.reconnect_at = None;
            }
            if periodic_due {
                schedule.next_periodic = interval.map(|i| now + i);
            }
            drop(schedule);

            match engine.try_sync() {
                Some(report) => debug!(
                    reconnect = reconnect_due,
                    success = report.success,
                    "automatic sync finished"
                ),
                None => debug!("automatic sync skipped: cycle in flight"),
            }

            schedule = shared.schedule.lock();
            continue;
        }

        let deadline = match (schedule.reconnect_at, schedule.next_periodic) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match deadline {
            Some(deadline) => {
                shared.wake.wait_until(&mut schedule, deadline);
            }
            None => shared.wake.wait(&mut schedule),
        }
    }
}

impl std::fmt::Debug for AutoSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSync")
            .field("running", &self.worker.is_some())
            .finish()
    }
}
