//! Device driver capability interface.
//!
//! One [`DeviceDriver`] exists per instrument family. Drivers are pure: they turn a
//! [`Command`] into wire frames and turn the module's [`Reply`]s back into parameter
//! updates and readings. All I/O, ordering and timeouts live in the session layer, so
//! a new family is added by implementing this trait alone.
//!
//! # Contract
//!
//! - `validate` must reject every command `encode` would reject, without I/O.
//! - `encode` returns the frames (without the CR terminator) that are exchanged, in
//!   order, while the session's dispatcher slot is held.
//! - `decode` receives exactly one reply per encoded frame.

use crate::command::Command;
use crate::error::{NimError, NimResult};
use crate::event::Readings;
use crate::params::ParamUpdate;
use crate::reply::Reply;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported instrument families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Mesytec MSCF-16 shaping amplifier / discriminator.
    Mscf16,
    /// Mesytec MHV-4 four-channel high-voltage supply.
    Mhv4,
}

impl Family {
    /// Every family, in display order.
    pub const ALL: [Family; 2] = [Family::Mscf16, Family::Mhv4];

    /// Power-up baud rate of the module.
    pub fn default_baud_rate(self) -> u32 {
        9600
    }

    /// Label used in logs and port descriptions.
    pub fn label(self) -> &'static str {
        match self {
            Family::Mscf16 => "MSCF-16",
            Family::Mhv4 => "MHV-4",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Mscf16 => "mscf16",
            Family::Mhv4 => "mhv4",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Family {
    type Err = NimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'].as_slice(), "").as_str() {
            "mscf16" => Ok(Family::Mscf16),
            "mhv4" => Ok(Family::Mhv4),
            other => Err(NimError::Validation(format!("unknown device family '{other}'"))),
        }
    }
}

/// What a successfully decoded command produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Outcome {
    /// Parameter values to cache and announce as `initial_values`.
    pub updates: Vec<ParamUpdate>,
    /// Live readings to cache and announce as `readings_update`.
    #[serde(skip_serializing_if = "Readings::is_empty")]
    pub readings: Readings,
    /// Body lines of the replies, for the requesting client.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response: Vec<String>,
}

impl Outcome {
    /// Outcome carrying only parameter updates.
    pub fn updates(updates: Vec<ParamUpdate>) -> Self {
        Self {
            updates,
            ..Self::default()
        }
    }

    /// Attach the reply bodies for the client.
    pub fn with_response(mut self, replies: &[Reply]) -> Self {
        self.response = replies.iter().flat_map(|r| r.body.iter().cloned()).collect();
        self
    }
}

/// Encoder/decoder/validator for one instrument family.
pub trait DeviceDriver: Send + Sync + 'static {
    /// Family this driver speaks.
    fn family(&self) -> Family;

    /// Check parameters and targets without touching the wire.
    ///
    /// # Errors
    ///
    /// `Validation` for bad parameters, `UnknownCommand` for unsupported operations.
    fn validate(&self, command: &Command) -> NimResult<()>;

    /// Frames to exchange for `command`, in order.
    fn encode(&self, command: &Command) -> NimResult<Vec<String>>;

    /// Interpret the replies to the frames produced by [`DeviceDriver::encode`].
    ///
    /// # Errors
    ///
    /// `Protocol` when a reply does not have the expected shape.
    fn decode(&self, command: &Command, replies: &[Reply]) -> NimResult<Outcome>;

    /// Read-only commands that populate the cache right after connecting.
    fn initial_reads(&self) -> Vec<Command>;

    /// Read-only command issued on every telemetry tick, for families with live readings.
    fn telemetry_command(&self) -> Option<Command> {
        None
    }

    /// Whether sessions of this family run a telemetry poller.
    fn supports_telemetry(&self) -> bool {
        self.telemetry_command().is_some()
    }
}

/// Check that `decode` received one reply per encoded frame.
pub fn expect_replies(command: &Command, replies: &[Reply], count: usize) -> NimResult<()> {
    if replies.len() != count {
        return Err(NimError::Protocol(format!(
            "{} expected {count} replies, got {}",
            command.op,
            replies.len()
        )));
    }
    Ok(())
}
