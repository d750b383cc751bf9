//! Session and per-family tuning.
//!
//! These sections are embedded in the daemon's configuration file:
//!
//! ```toml
//! [session]
//! command_timeout_ms = 1000
//! shutdown_grace_ms = 2000
//! drain_ms = 10
//! default_family = "mscf16"
//!
//! [mhv4]
//! baud_rate = 9600
//! poll_interval_ms = 1000
//! ```

use nim_core::Family;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Baud rates the modules can be switched to.
pub const SUPPORTED_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115_200];

/// Settings shared by every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Deadline for one request/response exchange.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// How long disconnect waits for an in-flight command.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    /// Quiet window used to discard stale input before each write.
    #[serde(default = "default_drain")]
    pub drain_ms: u64,
    /// Family assumed when a connect request names none.
    #[serde(default = "default_family")]
    pub default_family: Family,
}

/// Settings for one instrument family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyConfig {
    /// Line speed.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Overrides `session.command_timeout_ms` for this family.
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    /// Telemetry period, for families that poll.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_command_timeout() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_drain() -> u64 {
    10
}

fn default_family() -> Family {
    Family::Mscf16
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_poll_interval() -> u64 {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            drain_ms: default_drain(),
            default_family: default_family(),
        }
    }
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            command_timeout_ms: None,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Everything the session manager needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Shared settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// MSCF-16 settings.
    #[serde(default)]
    pub mscf16: FamilyConfig,
    /// MHV-4 settings.
    #[serde(default)]
    pub mhv4: FamilyConfig,
}

impl ManagerConfig {
    /// Settings for `family`.
    pub fn family(&self, family: Family) -> &FamilyConfig {
        match family {
            Family::Mscf16 => &self.mscf16,
            Family::Mhv4 => &self.mhv4,
        }
    }

    /// Exchange deadline for `family`.
    pub fn command_timeout(&self, family: Family) -> Duration {
        Duration::from_millis(
            self.family(family)
                .command_timeout_ms
                .unwrap_or(self.session.command_timeout_ms),
        )
    }

    /// Telemetry period for `family`.
    pub fn poll_interval(&self, family: Family) -> Duration {
        Duration::from_millis(self.family(family).poll_interval_ms)
    }

    /// Disconnect grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.session.shutdown_grace_ms)
    }

    /// Drain window before each write.
    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.session.drain_ms)
    }

    /// Check timeouts and baud rates.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        if self.session.command_timeout_ms == 0 {
            return Err("session.command_timeout_ms must be greater than 0".into());
        }
        for family in Family::ALL {
            let cfg = self.family(family);
            if !SUPPORTED_BAUD_RATES.contains(&cfg.baud_rate) {
                return Err(format!(
                    "Invalid {family}.baud_rate {}. Must be one of: {:?}",
                    cfg.baud_rate, SUPPORTED_BAUD_RATES
                ));
            }
            if cfg.command_timeout_ms == Some(0) {
                return Err(format!("{family}.command_timeout_ms must be greater than 0"));
            }
            if cfg.poll_interval_ms == 0 {
                return Err(format!("{family}.poll_interval_ms must be greater than 0"));
            }
        }
        Ok(())
    }
}
