//! Registry of live sessions.
//!
//! The [`SessionManager`] is the only place sessions are created and destroyed. One
//! coarse lock guards the registry: live sessions, identifiers and endpoints with a
//! connect in progress, and the observers that follow every device. The lock is never
//! held across I/O.
//!
//! Whoever removes a session from the registry (an explicit disconnect, a fatal
//! transport error, or [`SessionManager::teardown`]) is the one that shuts it down and
//! announces `device_disconnected`, so the event is sent exactly once per session.

use crate::config::{ManagerConfig, SUPPORTED_BAUD_RATES};
use crate::dispatcher::CommandDispatcher;
use crate::poller::{self, FatalReport};
use crate::ports::PortOpener;
use crate::session::{DeviceSession, SessionSummary};
use crate::subscribers::{Observer, ObserverId};
use crate::transport::SerialTransport;
use nim_core::{Command, DeviceEvent, DeviceId, Family, NimError, NimResult, Outcome};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Parameters of a connect request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectRequest {
    /// Serial endpoint, e.g. `COM3` or `/dev/ttyUSB0`.
    pub port: String,
    /// Instrument family (`mscf16`, `MHV-4`, ...). Defaults to the configured family.
    #[serde(default)]
    pub family: Option<String>,
    /// Identifier to register the device under. Defaults to the endpoint.
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    /// Line speed override.
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Exchange deadline override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ConnectRequest {
    /// Request for `port` with every option defaulted.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Builder-style family selection.
    pub fn family(mut self, family: Family) -> Self {
        self.family = Some(family.to_string());
        self
    }

    /// Builder-style identifier.
    pub fn device_id(mut self, id: impl Into<DeviceId>) -> Self {
        self.device_id = Some(id.into());
        self
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<DeviceId, Arc<DeviceSession>>,
    pending_ids: HashSet<DeviceId>,
    pending_endpoints: HashSet<String>,
    observers: Vec<Observer>,
}

impl Registry {
    fn claims(&self, device_id: &str, endpoint: &str) -> bool {
        self.sessions.contains_key(device_id)
            || self.pending_ids.contains(device_id)
            || self.pending_endpoints.contains(endpoint)
            || self.sessions.values().any(|s| s.endpoint() == endpoint)
    }
}

/// Connect in progress. Dropping it, on failure or when the connecting caller goes
/// away, frees the identifier and endpoint again.
struct Reservation<'a> {
    registry: &'a Mutex<Registry>,
    device_id: DeviceId,
    endpoint: String,
    armed: bool,
}

impl Reservation<'_> {
    fn release(registry: &mut Registry, device_id: &str, endpoint: &str) {
        registry.pending_ids.remove(device_id);
        registry.pending_endpoints.remove(endpoint);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            Self::release(&mut self.registry.lock(), &self.device_id, &self.endpoint);
        }
    }
}

/// Owner of every live [`DeviceSession`].
pub struct SessionManager {
    config: ManagerConfig,
    opener: Arc<dyn PortOpener>,
    registry: Mutex<Registry>,
    fatal_tx: mpsc::UnboundedSender<FatalReport>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("sessions", &self.registry.lock().sessions.len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Empty registry opening endpoints through `opener`.
    ///
    /// Must be called inside a Tokio runtime: it spawns the task that tears down
    /// sessions whose telemetry lost the device.
    pub fn new(config: ManagerConfig, opener: Arc<dyn PortOpener>) -> Arc<Self> {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config,
            opener,
            registry: Mutex::new(Registry::default()),
            fatal_tx,
        });
        tokio::spawn(reap(Arc::downgrade(&manager), fatal_rx));
        manager
    }

    /// Active configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Open `request.port`, read the device's settings and register the session.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty port, unknown family or unsupported baud rate
    /// - `AlreadyConnected` if the identifier or endpoint is live or connecting
    /// - `Transport` if the endpoint cannot be opened or dies during the initial reads
    #[instrument(skip(self, request), fields(port = %request.port), err)]
    pub async fn connect(&self, request: ConnectRequest) -> NimResult<Arc<DeviceSession>> {
        let endpoint = request.port.trim().to_string();
        if endpoint.is_empty() {
            return Err(NimError::Validation("port is required".into()));
        }
        let family = match &request.family {
            Some(name) => name.parse::<Family>()?,
            None => self.config.session.default_family,
        };
        let baud_rate = request
            .baud_rate
            .unwrap_or(self.config.family(family).baud_rate);
        if !SUPPORTED_BAUD_RATES.contains(&baud_rate) {
            return Err(NimError::Validation(format!(
                "unsupported baud rate {baud_rate}"
            )));
        }
        let timeout = match request.timeout_ms {
            Some(0) => return Err(NimError::Validation("timeout_ms must be positive".into())),
            Some(ms) => Duration::from_millis(ms),
            None => self.config.command_timeout(family),
        };
        let device_id = request
            .device_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| endpoint.clone());

        let mut reservation = {
            let mut registry = self.registry.lock();
            if registry.claims(&device_id, &endpoint) {
                return Err(NimError::AlreadyConnected(device_id));
            }
            registry.pending_ids.insert(device_id.clone());
            registry.pending_endpoints.insert(endpoint.clone());
            Reservation {
                registry: &self.registry,
                device_id: device_id.clone(),
                endpoint: endpoint.clone(),
                armed: true,
            }
        };

        let port = self.opener.open(&endpoint, family, baud_rate).await?;
        let transport = SerialTransport::new(endpoint.clone(), port, self.config.drain_window());
        let driver = nim_driver_mesytec::driver_for(family);
        let session = Arc::new(DeviceSession::new(
            device_id.clone(),
            endpoint.clone(),
            driver.clone(),
            CommandDispatcher::new(transport),
            timeout,
        ));

        for command in driver.initial_reads() {
            match session.execute(&command).await {
                Ok(_) => {}
                Err(error) if error.is_fatal() => {
                    session.shutdown(Duration::ZERO).await;
                    return Err(error);
                }
                Err(error) => warn!(device_id = %device_id, op = %command.op, %error, "initial read failed"),
            }
        }

        let observers = {
            let mut registry = self.registry.lock();
            Reservation::release(&mut registry, &device_id, &endpoint);
            reservation.armed = false;
            registry.sessions.insert(device_id.clone(), session.clone());
            for observer in &registry.observers {
                session.subscribers().add(observer.clone());
            }
            registry.observers.clone()
        };
        for observer in &observers {
            session.replay_to(observer);
        }

        if let Some(command) = driver.telemetry_command() {
            let installed = session.set_poller(poller::spawn(
                &session,
                command,
                self.config.poll_interval(family),
                self.fatal_tx.clone(),
            ));
            if !installed {
                debug!(device_id = %device_id, "disconnected while connecting, telemetry not started");
            }
        }

        info!(device_id = %device_id, endpoint = %endpoint, family = %family, baud_rate, "device connected");
        Ok(session)
    }

    /// Shut a session down and announce `device_disconnected`.
    ///
    /// # Errors
    ///
    /// `NotFound` if no live session has this identifier.
    #[instrument(skip(self), err)]
    pub async fn disconnect(&self, device_id: &str) -> NimResult<()> {
        let (session, observers) = {
            let mut registry = self.registry.lock();
            let session = registry
                .sessions
                .remove(device_id)
                .ok_or_else(|| NimError::NotFound(device_id.to_string()))?;
            (session, registry.observers.clone())
        };
        self.retire(session, observers, self.config.shutdown_grace()).await;
        info!(device_id, "device disconnected");
        Ok(())
    }

    /// Live session by identifier.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent.
    pub fn get_session(&self, device_id: &str) -> NimResult<Arc<DeviceSession>> {
        self.registry
            .lock()
            .sessions
            .get(device_id)
            .cloned()
            .ok_or_else(|| NimError::NotFound(device_id.to_string()))
    }

    /// Run `command` on a device. A transport failure tears the session down.
    ///
    /// # Errors
    ///
    /// `NotFound`, or whatever the session pipeline reports.
    pub async fn execute(&self, device_id: &str, command: &Command) -> NimResult<Outcome> {
        let session = self.get_session(device_id)?;
        let result = session.execute(command).await;
        if let Err(error) = &result {
            if error.is_fatal() {
                self.lost(&session, error).await;
            }
        }
        result
    }

    /// Summaries of every live session, ordered by identifier.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .registry
            .lock()
            .sessions
            .values()
            .map(|s| s.summary())
            .collect();
        sessions.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        sessions
    }

    /// Follow every device, present and future, and receive the cached values of the
    /// devices already connected.
    pub fn attach(&self, observer: Observer) {
        let sessions: Vec<Arc<DeviceSession>> = {
            let mut registry = self.registry.lock();
            if !registry.observers.iter().any(|o| o.id == observer.id) {
                registry.observers.push(observer.clone());
            }
            registry.sessions.values().cloned().collect()
        };
        for session in sessions {
            if session.subscribers().add(observer.clone()) {
                session.replay_to(&observer);
            }
        }
    }

    /// Stop delivering anything to `observer`.
    pub fn detach(&self, observer: ObserverId) {
        let mut registry = self.registry.lock();
        registry.observers.retain(|o| o.id != observer);
        for session in registry.sessions.values() {
            session.subscribers().remove(observer);
        }
    }

    /// Follow one device and receive its cached values.
    ///
    /// # Errors
    ///
    /// `NotFound` if the device is not connected.
    pub fn subscribe(&self, observer: Observer, device_id: &str) -> NimResult<()> {
        let session = self.get_session(device_id)?;
        if session.subscribers().add(observer.clone()) {
            session.replay_to(&observer);
        }
        Ok(())
    }

    /// Stop following one device.
    ///
    /// # Errors
    ///
    /// `NotFound` if the device is not connected.
    pub fn unsubscribe(&self, observer: ObserverId, device_id: &str) -> NimResult<()> {
        self.get_session(device_id)?.subscribers().remove(observer);
        Ok(())
    }

    /// Disconnect every session.
    pub async fn teardown(&self) {
        let (sessions, observers) = {
            let mut registry = self.registry.lock();
            let sessions: Vec<Arc<DeviceSession>> =
                registry.sessions.drain().map(|(_, s)| s).collect();
            (sessions, registry.observers.clone())
        };
        let grace = self.config.shutdown_grace();
        futures::future::join_all(
            sessions
                .into_iter()
                .map(|session| self.retire(session, observers.clone(), grace)),
        )
        .await;
        info!("all sessions closed");
    }

    /// Tear down `session` after a transport failure, unless someone already did.
    async fn lost(&self, session: &Arc<DeviceSession>, error: &NimError) {
        let observers = {
            let mut registry = self.registry.lock();
            match registry.sessions.get(session.device_id()) {
                Some(live) if Arc::ptr_eq(live, session) => {}
                _ => return,
            }
            registry.sessions.remove(session.device_id());
            registry.observers.clone()
        };
        warn!(device_id = %session.device_id(), %error, "device lost, closing session");
        self.retire(session.clone(), observers, Duration::ZERO).await;
    }

    async fn retire(&self, session: Arc<DeviceSession>, observers: Vec<Observer>, grace: Duration) {
        session.shutdown(grace).await;

        let mut recipients = session.subscribers().drain();
        for observer in observers {
            if !recipients.iter().any(|o| o.id == observer.id) {
                recipients.push(observer);
            }
        }
        let event = DeviceEvent::DeviceDisconnected {
            device_id: session.device_id().to_string(),
        };
        for observer in &recipients {
            observer.send(event.clone());
        }
    }
}

async fn reap(manager: Weak<SessionManager>, mut reports: mpsc::UnboundedReceiver<FatalReport>) {
    while let Some(report) = reports.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if let Some(session) = report.session.upgrade() {
            manager.lost(&session, &report.error).await;
        } else {
            debug!(device_id = %report.device_id, "fatal report for a retired session");
        }
    }
}
