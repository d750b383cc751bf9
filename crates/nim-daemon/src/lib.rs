//! Daemon support for the `nim-gateway` binary: layered configuration and tracing setup.

pub mod config;
pub mod logging;

pub use config::{GatewayConfig, Overrides};
pub use logging::{LogConfig, LogFormat};
