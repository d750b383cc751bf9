//! Periodic telemetry for families with live readings.
//!
//! The poller issues the driver's telemetry command through the normal session
//! pipeline, so a tick queues behind client commands on the dispatcher slot like any
//! other caller and its readings reach subscribers as `readings_update`.
//!
//! A failed tick is logged and polling continues. A transport failure is reported to
//! the session manager, which tears the session down; the poller stops itself.

use crate::session::DeviceSession;
use nim_core::{Command, DeviceId, NimError};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// A fatal error observed outside of a client request.
#[derive(Debug, Clone)]
pub struct FatalReport {
    /// Device the error belongs to.
    pub device_id: DeviceId,
    /// The session that failed; stale if the device already reconnected.
    pub session: Weak<DeviceSession>,
    /// What went wrong.
    pub error: NimError,
}

/// Running poller.
#[derive(Debug)]
pub struct PollerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Cancel the next scheduled wake. An in-flight tick finishes or is cancelled by
    /// the dispatcher.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait up to `grace` for the task to end, then abort it.
    pub async fn join(self, grace: Duration) {
        let abort = self.task.abort_handle();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            warn!(?grace, "telemetry poller did not stop in time, aborting");
            abort.abort();
        }
    }
}

/// Start polling `session` every `interval` with `command`.
pub fn spawn(
    session: &Arc<DeviceSession>,
    command: Command,
    interval: Duration,
    fatal: mpsc::UnboundedSender<FatalReport>,
) -> PollerHandle {
    let (stop, stop_rx) = watch::channel(false);
    let weak = Arc::downgrade(session);
    let device_id = session.device_id().to_string();
    let task = tokio::spawn(run(weak, device_id, command, interval, fatal, stop_rx));
    PollerHandle { stop, task }
}

async fn run(
    session: Weak<DeviceSession>,
    device_id: DeviceId,
    command: Command,
    interval: Duration,
    fatal: mpsc::UnboundedSender<FatalReport>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; the connect burst already populated the cache
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let Some(live) = session.upgrade() else {
            break;
        };
        let result = live.execute(&command).await;
        drop(live);

        match result {
            Ok(_) => {}
            Err(NimError::Cancelled(_)) => break,
            Err(error) if error.is_fatal() => {
                warn!(device_id = %device_id, %error, "telemetry lost the device");
                let report = FatalReport {
                    device_id: device_id.clone(),
                    session: session.clone(),
                    error,
                };
                let _ = fatal.send(report);
                break;
            }
            Err(error) => warn!(device_id = %device_id, %error, "telemetry tick failed"),
        }
    }
    debug!(device_id = %device_id, "telemetry poller stopped");
}
