//! # Network Monitor
//!
//! Decides whether the host is online and tells the connection manager.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Network Monitor                                │
//! │                                                                         │
//! │   NetworkApi (OS signal) ──► online? ─┐                                │
//! │                                       ├──► effective availability      │
//! │   LatencyProbe (every N s) ──► failures < threshold? ─┘                │
//! │                     │                                                   │
//! │                     └──► quality: excellent │ good │ fair │ poor │      │
//! │                                   unreachable                           │
//! │                                                                         │
//! │   offline ─► ConnectionHandle::set_network(false)  (timers suspended)  │
//! │   online  ─► ConnectionHandle::set_network(true)                       │
//! │              ReconcilerHandle::trigger()                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use shopfloor_core::{NetworkAvailability, NetworkQuality, NetworkStatus};

use crate::config::NetworkSettings;
use crate::connection::ConnectionHandle;
use crate::error::{SyncError, SyncResult};
use crate::reconciler::ReconcilerHandle;

// =============================================================================
// Connectivity Signal
// =============================================================================

/// The host's own idea of connectivity.
pub trait NetworkApi: Send + Sync {
    fn is_online(&self) -> bool;

    /// Change stream of the online flag.
    fn watch(&self) -> watch::Receiver<bool>;
}

/// Connectivity flag driven by the host application.
#[derive(Clone)]
pub struct NetworkSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkSignal {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        NetworkSignal { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }
}

impl Default for NetworkSignal {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkApi for NetworkSignal {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

// =============================================================================
// Latency Probe
// =============================================================================

#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Round trip to the health endpoint.
    async fn probe(&self) -> SyncResult<Duration>;
}

/// Times a TCP connect to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpLatencyProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpLatencyProbe {
    /// Accepts `ws`, `wss`, `http` and `https` URLs.
    pub fn from_url(url: &str, timeout: Duration) -> SyncResult<Self> {
        let parsed = Url::parse(url)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| SyncError::InvalidUrl(format!("{} has no host", url)))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .or(match parsed.scheme() {
                "ws" => Some(80),
                "wss" => Some(443),
                _ => None,
            })
            .ok_or_else(|| SyncError::InvalidUrl(format!("{} has no port", url)))?;
        Ok(TcpLatencyProbe {
            host,
            port,
            timeout,
        })
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl LatencyProbe for TcpLatencyProbe {
    async fn probe(&self) -> SyncResult<Duration> {
        let started = Instant::now();
        match timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(SyncError::ConnectionFailed(e.to_string())),
            Err(_) => Err(SyncError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

// =============================================================================
// Monitor
// =============================================================================

enum MonitorCommand {
    ProbeNow,
    Shutdown,
}

/// Handle to a running monitor.
#[derive(Clone)]
pub struct NetworkHandle {
    tx: mpsc::UnboundedSender<MonitorCommand>,
    status: watch::Receiver<NetworkStatus>,
}

impl NetworkHandle {
    pub fn status(&self) -> NetworkStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<NetworkStatus> {
        self.status.clone()
    }

    pub fn is_online(&self) -> bool {
        self.status.borrow().availability.is_online()
    }

    /// Probes right away instead of waiting for the next tick.
    pub fn probe_now(&self) {
        let _ = self.tx.send(MonitorCommand::ProbeNow);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(MonitorCommand::Shutdown);
    }
}

pub struct NetworkMonitor {
    settings: NetworkSettings,
    signal: watch::Receiver<bool>,
    probe: Option<Arc<dyn LatencyProbe>>,
    connection: ConnectionHandle,
    reconciler: Option<ReconcilerHandle>,
    status: NetworkStatus,
    status_tx: watch::Sender<NetworkStatus>,
    signal_online: bool,
}

impl NetworkMonitor {
    pub fn spawn(
        settings: NetworkSettings,
        api: &dyn NetworkApi,
        probe: Option<Arc<dyn LatencyProbe>>,
        connection: ConnectionHandle,
        reconciler: Option<ReconcilerHandle>,
    ) -> (NetworkHandle, JoinHandle<()>) {
        let status = NetworkStatus {
            availability: NetworkAvailability::from_online(api.is_online()),
            ..NetworkStatus::default()
        };
        let (status_tx, status_rx) = watch::channel(status.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        let monitor = NetworkMonitor {
            signal_online: api.is_online(),
            settings,
            signal: api.watch(),
            probe,
            connection,
            reconciler,
            status,
            status_tx,
        };
        let task = tokio::spawn(monitor.run(rx));
        (
            NetworkHandle {
                tx,
                status: status_rx,
            },
            task,
        )
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<MonitorCommand>) {
        let period = self.settings.probe_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let probing = self.probe.is_some();
        let mut signal_open = true;

        info!(
            online = self.status.availability.is_online(),
            probing,
            "Network monitor started"
        );
        let _ = self.connection.set_network(self.status.availability.is_online());

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(MonitorCommand::ProbeNow) => self.probe_once().await,
                    Some(MonitorCommand::Shutdown) | None => break,
                },
                changed = self.signal.changed(), if signal_open => {
                    if changed.is_err() {
                        signal_open = false;
                        continue;
                    }
                    let online = *self.signal.borrow_and_update();
                    debug!(online, "Connectivity signal changed");
                    if online && !self.signal_online {
                        self.status.consecutive_probe_failures = 0;
                    }
                    self.signal_online = online;
                    self.reevaluate();
                }
                _ = ticker.tick(), if probing => self.probe_once().await,
            }
        }

        info!("Network monitor stopped");
    }

    async fn probe_once(&mut self) {
        let Some(probe) = self.probe.clone() else {
            return;
        };
        if !*self.signal.borrow() {
            // nothing to learn while the host says offline
            return;
        }

        match probe.probe().await {
            Ok(rtt) => {
                let ms = rtt.as_millis() as u64;
                if self.status.consecutive_probe_failures > 0 {
                    info!(latency_ms = ms, "Health endpoint reachable again");
                }
                self.status.consecutive_probe_failures = 0;
                self.status.latency_ms = Some(ms);
                self.status.quality = NetworkQuality::from_latency_ms(ms);
                debug!(latency_ms = ms, quality = %self.status.quality, "Probe ok");
            }
            Err(e) => {
                self.status.consecutive_probe_failures += 1;
                self.status.latency_ms = None;
                self.status.quality = NetworkQuality::Unreachable;
                warn!(
                    error = %e,
                    failures = self.status.consecutive_probe_failures,
                    threshold = self.settings.probe_failure_threshold,
                    "Probe failed"
                );
            }
        }
        self.reevaluate();
    }

    fn reevaluate(&mut self) {
        let signal_online = *self.signal.borrow();
        let probe_ok = self.status.consecutive_probe_failures < self.settings.probe_failure_threshold;
        let availability = NetworkAvailability::from_online(signal_online && probe_ok);

        if availability != self.status.availability {
            self.status.availability = availability;
            if availability.is_online() {
                info!("Network online");
                let _ = self.connection.set_network(true);
                if let Some(reconciler) = &self.reconciler {
                    reconciler.trigger();
                }
            } else {
                warn!(signal_online, probe_ok, "Network offline");
                let _ = self.connection.set_network(false);
            }
        }

        if !signal_online {
            self.status.quality = NetworkQuality::Unknown;
            self.status.latency_ms = None;
        }
        self.status_tx.send_replace(self.status.clone());
    }
}
