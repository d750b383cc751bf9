//! Server-to-client events.
//!
//! Events serialize as `{"event": "<name>", "data": {...}}` so one WebSocket text frame
//! carries exactly one event.

use crate::params::ParamUpdate;
use crate::DeviceId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Live values from one telemetry tick, keyed `voltage_<ch>` / `current_<ch>`.
pub type Readings = BTreeMap<String, f64>;

/// Typed event union delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// Greeting, sent once when an observer's connection is established.
    Connected {
        /// Human readable greeting.
        message: String,
    },
    /// One cached parameter value.
    InitialValues {
        /// Device the value belongs to.
        device_id: DeviceId,
        /// Parameter key and value, flattened into the payload.
        #[serde(flatten)]
        update: ParamUpdate,
    },
    /// Periodic telemetry.
    ReadingsUpdate {
        /// Device the readings belong to.
        device_id: DeviceId,
        /// Voltage (V) and current (µA) per channel.
        readings: Readings,
    },
    /// Terminal event for a session.
    DeviceDisconnected {
        /// Device that went away.
        device_id: DeviceId,
    },
}

impl DeviceEvent {
    /// Greeting sent on every new event-channel connection.
    pub fn greeting() -> Self {
        DeviceEvent::Connected {
            message: "Connected to server".to_string(),
        }
    }

    /// Device the event refers to, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DeviceEvent::Connected { .. } => None,
            DeviceEvent::InitialValues { device_id, .. }
            | DeviceEvent::ReadingsUpdate { device_id, .. }
            | DeviceEvent::DeviceDisconnected { device_id } => Some(device_id),
        }
    }

    /// Event name as sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::Connected { .. } => "connected",
            DeviceEvent::InitialValues { .. } => "initial_values",
            DeviceEvent::ReadingsUpdate { .. } => "readings_update",
            DeviceEvent::DeviceDisconnected { .. } => "device_disconnected",
        }
    }
}
