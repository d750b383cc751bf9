//! Gateway configuration using Figment.
//!
//! Layers, later ones winning:
//! 1. built-in defaults
//! 2. the TOML file (`--config`, or `nim-gateway.toml` in the working directory if present)
//! 3. environment variables prefixed `NIM_GATEWAY_`, nested keys separated by `__`
//!    (e.g. `NIM_GATEWAY_SERVER__PORT=9000`, `NIM_GATEWAY_MHV4__POLL_INTERVAL_MS=500`)
//! 4. command-line flags

use crate::logging::{parse_log_level, LogConfig, LogFormat};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use nim_session::{FamilyConfig, ManagerConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration file picked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "nim-gateway.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "NIM_GATEWAY_";

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
    /// Serve emulated modules instead of the host's serial ports.
    #[serde(default)]
    pub simulate: bool,
    /// Shared session settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// MSCF-16 settings.
    #[serde(default)]
    pub mscf16: FamilyConfig,
    /// MHV-4 settings.
    #[serde(default)]
    pub mhv4: FamilyConfig,
}

/// Values given on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--host`
    pub host: Option<String>,
    /// `--port`
    pub port: Option<u16>,
    /// `--simulate`
    pub simulate: bool,
    /// `--log-level`
    pub log_level: Option<String>,
    /// `--log-format`
    pub log_format: Option<LogFormat>,
}

impl GatewayConfig {
    /// Load from `path` (or the default file), the environment and `overrides`.
    ///
    /// # Errors
    ///
    /// An explicitly named file that does not exist, or a value of the wrong type.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, figment::Error> {
        let file = match path {
            Some(path) if !path.exists() => {
                return Err(format!("config file {} not found", path.display()).into());
            }
            Some(path) => Toml::file(path),
            None => Toml::file(DEFAULT_CONFIG_FILE),
        };
        Self::figment(file, overrides).extract()
    }

    fn figment(file: figment::providers::Data<Toml>, overrides: &Overrides) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(host) = &overrides.host {
            figment = figment.merge(Serialized::default("server.host", host));
        }
        if let Some(port) = overrides.port {
            figment = figment.merge(Serialized::default("server.port", port));
        }
        if overrides.simulate {
            figment = figment.merge(Serialized::default("simulate", true));
        }
        if let Some(level) = &overrides.log_level {
            figment = figment.merge(Serialized::default("log.level", level));
        }
        if let Some(format) = overrides.log_format {
            figment = figment.merge(Serialized::default("log.format", format));
        }
        figment
    }

    /// Check values figment cannot check by type.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        parse_log_level(&self.log.level)?;
        if self.server.host.trim().is_empty() {
            return Err("server.host must not be empty".into());
        }
        self.manager().validate()
    }

    /// Settings for the session manager.
    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            session: self.session.clone(),
            mscf16: self.mscf16.clone(),
            mhv4: self.mhv4.clone(),
        }
    }

    /// `host:port` to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
