//! Connectivity monitoring.

use crate::clock::{Clock, SystemClock};
use crate::config::NetworkConfig;
use crate::listeners::{ListenerId, Listeners};
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Physical link type, as far as the platform reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Wi-Fi.
    Wifi,
    /// Mobile data.
    Cellular,
    /// Wired.
    Ethernet,
    /// No link.
    None,
    /// The platform does not say.
    Unknown,
}

/// Platform connectivity events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// The platform reports the device online.
    Online,
    /// The platform reports the device offline.
    Offline,
}

/// Current connectivity as last observed.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStatus {
    /// Whether the remote is believed reachable.
    pub is_online: bool,
    /// Link type.
    pub connection_type: ConnectionType,
    /// Effective quality class (`"4g"`, `"3g"`, `"2g"`, `"slow-2g"`).
    pub effective_type: Option<String>,
    /// Last measured round trip.
    pub rtt: Option<Duration>,
    /// When this status was observed.
    pub last_checked: DateTime<Utc>,
}

impl NetworkStatus {
    fn same_state(&self, other: &NetworkStatus) -> bool {
        self.is_online == other.is_online
            && self.connection_type == other.connection_type
            && self.effective_type == other.effective_type
    }
}

/// Result of one connectivity probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    /// Whether the probe reached the remote.
    pub online: bool,
    /// Link type.
    pub connection_type: ConnectionType,
    /// Measured round trip.
    pub rtt: Option<Duration>,
}

impl ProbeResult {
    /// A successful probe.
    pub fn online(connection_type: ConnectionType, rtt: Option<Duration>) -> Self {
        Self {
            online: true,
            connection_type,
            rtt,
        }
    }

    /// A failed probe.
    pub fn offline() -> Self {
        Self {
            online: false,
            connection_type: ConnectionType::None,
            rtt: None,
        }
    }
}

/// Checks whether the remote is reachable.
pub trait ConnectivityProbe: Send + Sync {
    /// Runs one probe.
    fn probe(&self) -> ProbeResult;
}

/// A probe that returns whatever it was told.
#[derive(Debug)]
pub struct StaticProbe {
    result: Mutex<ProbeResult>,
}

impl StaticProbe {
    /// Creates a probe reporting online or offline.
    pub fn new(online: bool) -> Self {
        let result = if online {
            ProbeResult::online(ConnectionType::Unknown, None)
        } else {
            ProbeResult::offline()
        };
        Self {
            result: Mutex::new(result),
        }
    }

    /// Changes the reported result.
    pub fn set(&self, result: ProbeResult) {
        *self.result.lock() = result;
    }

    /// Shorthand for reporting online or offline.
    pub fn set_online(&self, online: bool) {
        self.set(Self::new(online).result.into_inner());
    }
}

impl ConnectivityProbe for StaticProbe {
    fn probe(&self) -> ProbeResult {
        self.result.lock().clone()
    }
}

/// A probe that pings the sync transport and times the round trip.
pub struct TransportProbe {
    transport: Arc<dyn SyncTransport>,
    timeout: Duration,
}

impl TransportProbe {
    /// Creates a probe over a transport.
    pub fn new(transport: Arc<dyn SyncTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }
}

impl ConnectivityProbe for TransportProbe {
    fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        match self.transport.ping(self.timeout) {
            Ok(()) => ProbeResult::online(ConnectionType::Unknown, Some(started.elapsed())),
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                ProbeResult::offline()
            }
        }
    }
}

/// Effective connection class for a round trip, as browsers report it.
pub fn effective_type_for(rtt: Duration) -> &'static str {
    match rtt.as_millis() {
        0..=99 => "4g",
        100..=399 => "3g",
        400..=1399 => "2g",
        _ => "slow-2g",
    }
}

struct Prober {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Observes connectivity and notifies listeners of changes.
///
/// Status changes come from platform events ([`handle_event`]), background
/// probes ([`start_probing`]) and explicit checks ([`check_connectivity`]).
/// Listeners fire only when online state, link type or quality class change.
///
/// [`handle_event`]: NetworkStatusService::handle_event
/// [`start_probing`]: NetworkStatusService::start_probing
/// [`check_connectivity`]: NetworkStatusService::check_connectivity
pub struct NetworkStatusService {
    probe: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    status: RwLock<NetworkStatus>,
    listeners: Listeners<NetworkStatus>,
    prober: Mutex<Option<Prober>>,
}

impl NetworkStatusService {
    /// Creates a service that assumes online until told otherwise.
    pub fn new(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self::with_clock(probe, Arc::new(SystemClock))
    }

    /// Creates a service with an explicit clock.
    pub fn with_clock(probe: Arc<dyn ConnectivityProbe>, clock: Arc<dyn Clock>) -> Self {
        let status = NetworkStatus {
            is_online: true,
            connection_type: ConnectionType::Unknown,
            effective_type: None,
            rtt: None,
            last_checked: clock.now(),
        };
        Self {
            probe,
            clock,
            status: RwLock::new(status),
            listeners: Listeners::new(),
            prober: Mutex::new(None),
        }
    }

    /// Returns the last observed status.
    pub fn status(&self) -> NetworkStatus {
        self.status.read().clone()
    }

    /// Registers a listener for status changes.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&NetworkStatus) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Unregisters a listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Applies a platform online/offline event.
    pub fn handle_event(&self, event: NetworkEvent) -> NetworkStatus {
        let mut next = self.status();
        next.last_checked = self.clock.now();
        match event {
            NetworkEvent::Online => {
                next.is_online = true;
                if next.connection_type == ConnectionType::None {
                    next.connection_type = ConnectionType::Unknown;
                }
            }
            NetworkEvent::Offline => {
                next.is_online = false;
                next.connection_type = ConnectionType::None;
                next.effective_type = None;
                next.rtt = None;
            }
        }
        self.update(next)
    }

    /// Probes now and returns the resulting status.
    pub fn check_connectivity(&self) -> NetworkStatus {
        let result = self.probe.probe();
        let next = NetworkStatus {
            is_online: result.online,
            connection_type: result.connection_type,
            effective_type: result.rtt.map(|rtt| effective_type_for(rtt).to_string()),
            rtt: result.rtt,
            last_checked: self.clock.now(),
        };
        self.update(next)
    }

    /// Starts probing every `interval` on a background thread.
    ///
    /// Replaces any prober already running. The thread holds only a weak
    /// reference and exits when the service is dropped.
    pub fn start_probing(self: &Arc<Self>, interval: Duration) {
        self.stop_probing();

        let (stop, stopped) = mpsc::channel::<()>();
        let service: Weak<Self> = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("studysync-network-probe".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.check_connectivity();
            });

        match handle {
            Ok(handle) => {
                debug!(?interval, "network probing started");
                *self.prober.lock() = Some(Prober { stop, handle });
            }
            Err(e) => warn!(error = %e, "failed to start network prober"),
        }
    }

    /// Starts probing at the configured interval.
    pub fn start(self: &Arc<Self>, config: &NetworkConfig) {
        self.start_probing(config.probe_interval);
    }

    /// Stops background probing, if running.
    pub fn stop_probing(&self) {
        let prober = self.prober.lock().take();
        if let Some(prober) = prober {
            let _ = prober.stop.send(());
            // The prober thread may be the one dropping the service.
            if prober.handle.thread().id() != std::thread::current().id() {
                let _ = prober.handle.join();
            }
        }
    }

    fn update(&self, next: NetworkStatus) -> NetworkStatus {
        let changed = {
            let mut status = self.status.write();
            let changed = !status.same_state(&next);
            *status = next.clone();
            changed
        };
        if changed {
            info!(
                online = next.is_online,
                connection = ?next.connection_type,
                effective = next.effective_type.as_deref().unwrap_or("-"),
                "network status changed"
            );
            self.listeners.notify(&next);
        }
        next
    }
}

impl Drop for NetworkStatusService {
    fn drop(&mut self) {
        self.stop_probing();
    }
}

impl std::fmt::Debug for NetworkStatusService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkStatusService")
            .field("status", &*self.status.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service(probe: Arc<StaticProbe>) -> Arc<NetworkStatusService> {
        Arc::new(NetworkStatusService::new(probe))
    }

    #[test]
    fn events_toggle_online_state() {
        let service = service(Arc::new(StaticProbe::new(true)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service.add_listener(move |s: &NetworkStatus| sink.lock().push(s.is_online));

        service.handle_event(NetworkEvent::Offline);
        service.handle_event(NetworkEvent::Offline);
        service.handle_event(NetworkEvent::Online);

        assert_eq!(*seen.lock(), vec![false, true]);
        assert_eq!(service.status().connection_type, ConnectionType::Unknown);
    }

    #[test]
    fn check_connectivity_uses_probe() {
        let probe = Arc::new(StaticProbe::new(false));
        let service = service(Arc::clone(&probe));
        assert!(!service.check_connectivity().is_online);

        probe.set(ProbeResult::online(
            ConnectionType::Wifi,
            Some(Duration::from_millis(250)),
        ));
        let status = service.check_connectivity();
        assert!(status.is_online);
        assert_eq!(status.connection_type, ConnectionType::Wifi);
        assert_eq!(status.effective_type.as_deref(), Some("3g"));
    }

    #[test]
    fn effective_type_thresholds() {
        assert_eq!(effective_type_for(Duration::from_millis(20)), "4g");
        assert_eq!(effective_type_for(Duration::from_millis(100)), "3g");
        assert_eq!(effective_type_for(Duration::from_millis(900)), "2g");
        assert_eq!(effective_type_for(Duration::from_secs(3)), "slow-2g");
    }

    #[test]
    fn background_probing_reports_changes() {
        let probe = Arc::new(StaticProbe::new(true));
        let service = service(Arc::clone(&probe));
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        service.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        service.start_probing(Duration::from_millis(10));
        probe.set_online(false);

        let deadline = Instant::now() + Duration::from_secs(5);
        while service.status().is_online && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        service.stop_probing();

        assert!(!service.status().is_online);
        assert!(changes.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn transport_probe_measures_round_trip() {
        let transport = Arc::new(crate::transport::MockTransport::new());
        let probe = TransportProbe::new(transport.clone(), Duration::from_secs(1));
        let result = probe.probe();
        assert!(result.online);
        assert!(result.rtt.is_some());

        transport.set_connected(false);
        assert!(!probe.probe().online);
    }
}
