//! One connected device.
//!
//! A [`DeviceSession`] binds a driver to a dispatcher and keeps the last-known parameter
//! values and readings. Every command runs the same pipeline:
//!
//! 1. `validate` and `encode` (no I/O; a rejected command never reaches the wire)
//! 2. exchange all frames while holding the dispatcher slot
//! 3. `decode`, then apply updates to the cache
//! 4. publish `initial_values` / `readings_update` to subscribers, outside the slot
//!
//! A failed step leaves the cache untouched.

use crate::dispatcher::CommandDispatcher;
use crate::poller::PollerHandle;
use crate::subscribers::{Observer, SubscriberSet};
use nim_core::{
    Command, DeviceDriver, DeviceEvent, DeviceId, Family, NimResult, Outcome, ParamCache,
    ParamUpdate, Readings,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Registry view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Identifier clients address the device by.
    pub device_id: DeviceId,
    /// Serial endpoint.
    pub endpoint: String,
    /// Instrument family.
    pub family: Family,
    /// Number of cached parameters.
    pub cached_values: usize,
    /// Number of observers receiving this device's events.
    pub subscribers: usize,
    /// Whether a telemetry poller runs.
    pub telemetry: bool,
}

/// Cached state of a session, as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    /// Identifier clients address the device by.
    pub device_id: DeviceId,
    /// Instrument family.
    pub family: Family,
    /// Every cached parameter.
    pub values: Vec<ParamUpdate>,
    /// Last telemetry readings.
    pub readings: Readings,
}

/// A connected device.
pub struct DeviceSession {
    device_id: DeviceId,
    endpoint: String,
    driver: Arc<dyn DeviceDriver>,
    dispatcher: CommandDispatcher,
    command_timeout: Duration,
    cache: RwLock<ParamCache>,
    readings: RwLock<Readings>,
    subscribers: SubscriberSet,
    poller: Mutex<PollerSlot>,
}

/// Telemetry poller of a session. Once retired, no poller is accepted again.
#[derive(Default)]
struct PollerSlot {
    handle: Option<PollerHandle>,
    retired: bool,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id)
            .field("endpoint", &self.endpoint)
            .field("family", &self.driver.family())
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Bind `driver` to an open dispatcher.
    pub fn new(
        device_id: DeviceId,
        endpoint: String,
        driver: Arc<dyn DeviceDriver>,
        dispatcher: CommandDispatcher,
        command_timeout: Duration,
    ) -> Self {
        Self {
            device_id,
            endpoint,
            driver,
            dispatcher,
            command_timeout,
            cache: RwLock::new(ParamCache::new()),
            readings: RwLock::new(Readings::new()),
            subscribers: SubscriberSet::new(),
            poller: Mutex::new(PollerSlot::default()),
        }
    }

    /// Identifier clients address the device by.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Serial endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Instrument family.
    pub fn family(&self) -> Family {
        self.driver.family()
    }

    /// Driver of this session.
    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    /// Observers of this session.
    pub fn subscribers(&self) -> &SubscriberSet {
        &self.subscribers
    }

    /// Run one logical command through validate, exchange, decode and cache.
    ///
    /// # Errors
    ///
    /// Any [`nim_core::NimError`]; on error nothing is cached or published.
    #[instrument(skip(self, command), fields(device_id = %self.device_id, op = %command.op), err)]
    pub async fn execute(&self, command: &Command) -> NimResult<Outcome> {
        self.driver.validate(command)?;
        let frames = self.driver.encode(command)?;
        let replies = self.dispatcher.execute(&frames, self.command_timeout).await?;
        let outcome = self.driver.decode(command, &replies)?;

        self.cache.write().apply(&outcome.updates);
        if !outcome.readings.is_empty() {
            let mut readings = self.readings.write();
            readings.extend(outcome.readings.iter().map(|(k, v)| (k.clone(), *v)));
        }
        debug!(updates = outcome.updates.len(), readings = outcome.readings.len(), "command applied");

        self.publish(&outcome);
        Ok(outcome)
    }

    fn publish(&self, outcome: &Outcome) {
        if self.subscribers.is_empty() {
            return;
        }
        for update in &outcome.updates {
            self.subscribers.broadcast(&DeviceEvent::InitialValues {
                device_id: self.device_id.clone(),
                update: update.clone(),
            });
        }
        if !outcome.readings.is_empty() {
            self.subscribers.broadcast(&DeviceEvent::ReadingsUpdate {
                device_id: self.device_id.clone(),
                readings: outcome.readings.clone(),
            });
        }
    }

    /// `initial_values` events for every cached parameter.
    pub fn cached_events(&self) -> Vec<DeviceEvent> {
        self.cache
            .read()
            .snapshot()
            .into_iter()
            .map(|update| DeviceEvent::InitialValues {
                device_id: self.device_id.clone(),
                update,
            })
            .collect()
    }

    /// Resynchronize one observer from the cache, without touching the hardware.
    pub fn replay_to(&self, observer: &Observer) {
        for event in self.cached_events() {
            if !observer.send(event) {
                break;
            }
        }
    }

    /// Last readings.
    pub fn readings(&self) -> Readings {
        self.readings.read().clone()
    }

    /// Cached state for clients.
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            family: self.family(),
            values: self.cache.read().snapshot(),
            readings: self.readings(),
        }
    }

    /// Registry view.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            device_id: self.device_id.clone(),
            endpoint: self.endpoint.clone(),
            family: self.family(),
            cached_values: self.cache.read().len(),
            subscribers: self.subscribers.len(),
            telemetry: self.poller.lock().handle.is_some(),
        }
    }

    /// Install the telemetry poller. Returns `false`, and stops `handle`, if the session
    /// is already shutting down.
    pub(crate) fn set_poller(&self, handle: PollerHandle) -> bool {
        let mut slot = self.poller.lock();
        if slot.retired {
            handle.stop();
            return false;
        }
        if let Some(previous) = slot.handle.replace(handle) {
            previous.stop();
        }
        true
    }

    /// Stop telemetry and close the transport, waiting up to `grace` for an in-flight
    /// command.
    pub async fn shutdown(&self, grace: Duration) {
        let poller = {
            let mut slot = self.poller.lock();
            slot.retired = true;
            slot.handle.take()
        };
        if let Some(poller) = &poller {
            poller.stop();
        }
        self.dispatcher.shutdown(grace).await;
        if let Some(poller) = poller {
            poller.join(grace).await;
        }
    }
}
