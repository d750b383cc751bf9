//! Serial endpoint discovery and opening.
//!
//! Two backends implement [`PortScanner`] and [`PortOpener`]:
//!
//! - [`SystemPorts`]: the host's serial ports via `serialport` / `tokio-serial`
//! - [`SimulatedBench`]: emulated modules on named endpoints, for running without hardware

use async_trait::async_trait;
use nim_core::serial::DynSerial;
use nim_core::{Family, NimError, NimResult};
use nim_driver_mesytec::sim::{self, SimControl};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// One serial endpoint as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Path or name used to open the endpoint, e.g. `/dev/ttyUSB0` or `COM3`.
    pub endpoint: String,
    /// Human readable description.
    pub description: String,
}

/// Enumerates serial endpoints. Pure query, no side effects.
pub trait PortScanner: Send + Sync {
    /// Endpoints currently present.
    fn list_ports(&self) -> Vec<PortInfo>;
}

/// Opens serial endpoints for a session.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open `endpoint` for a module of `family`.
    ///
    /// # Errors
    ///
    /// `Transport` if the endpoint does not exist or cannot be opened.
    async fn open(&self, endpoint: &str, family: Family, baud_rate: u32) -> NimResult<DynSerial>;
}

/// The host's serial ports.
#[cfg(feature = "serial")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

#[cfg(feature = "serial")]
fn describe(port: &serialport::SerialPortInfo) -> String {
    use serialport::SerialPortType;

    match &port.port_type {
        SerialPortType::UsbPort(usb) => {
            let mut text = format!("USB {:04x}:{:04x}", usb.vid, usb.pid);
            if let Some(product) = &usb.product {
                text.push(' ');
                text.push_str(product);
            } else if let Some(manufacturer) = &usb.manufacturer {
                text.push(' ');
                text.push_str(manufacturer);
            }
            text
        }
        SerialPortType::PciPort => "PCI serial port".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
        SerialPortType::Unknown => "n/a".to_string(),
    }
}

#[cfg(feature = "serial")]
impl PortScanner for SystemPorts {
    fn list_ports(&self) -> Vec<PortInfo> {
        match serialport::available_ports() {
            Ok(ports) => ports
                .iter()
                .map(|p| PortInfo {
                    endpoint: p.port_name.clone(),
                    description: describe(p),
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "serial port enumeration failed");
                Vec::new()
            }
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl PortOpener for SystemPorts {
    async fn open(&self, endpoint: &str, family: Family, baud_rate: u32) -> NimResult<DynSerial> {
        let port = nim_core::serial::open_serial_async(endpoint, baud_rate, family.label())
            .await
            .map_err(|e| NimError::Transport(format!("{e:#}")))?;
        info!(endpoint, baud_rate, family = %family, "serial port opened");
        Ok(Box::new(port))
    }
}

/// Emulated modules on fixed endpoints.
///
/// Every `open` starts a fresh emulator, so a reconnect sees a power-cycled module.
#[derive(Debug)]
pub struct SimulatedBench {
    ports: Vec<(String, Family)>,
    controls: Mutex<HashMap<String, SimControl>>,
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl SimulatedBench {
    /// `mscf16` emulated MSCF-16s on `SIM-MSCF16-n` and `mhv4` MHV-4s on `SIM-MHV4-n`.
    pub fn new(mscf16: usize, mhv4: usize) -> Self {
        let ports = (1..=mscf16)
            .map(|n| (format!("SIM-MSCF16-{n}"), Family::Mscf16))
            .chain((1..=mhv4).map(|n| (format!("SIM-MHV4-{n}"), Family::Mhv4)))
            .collect();
        Self::with_ports(ports)
    }

    /// Emulators on explicitly named endpoints.
    pub fn with_ports(ports: Vec<(String, Family)>) -> Self {
        Self {
            ports,
            controls: Mutex::new(HashMap::new()),
        }
    }

    /// Control handle of the emulator last opened on `endpoint`.
    pub fn control(&self, endpoint: &str) -> Option<SimControl> {
        self.controls.lock().get(endpoint).cloned()
    }
}

impl PortScanner for SimulatedBench {
    fn list_ports(&self) -> Vec<PortInfo> {
        self.ports
            .iter()
            .map(|(endpoint, family)| PortInfo {
                endpoint: endpoint.clone(),
                description: format!("Simulated {}", family.label()),
            })
            .collect()
    }
}

#[async_trait]
impl PortOpener for SimulatedBench {
    async fn open(&self, endpoint: &str, family: Family, _baud_rate: u32) -> NimResult<DynSerial> {
        let module = self
            .ports
            .iter()
            .find(|(name, _)| name == endpoint)
            .map(|(_, f)| *f)
            .ok_or_else(|| NimError::Transport(format!("could not open port '{endpoint}'")))?;
        if module != family {
            debug!(endpoint, requested = %family, present = %module, "family mismatch on simulated port");
        }
        let (port, control) = sim::spawn(module);
        self.controls.lock().insert(endpoint.to_string(), control);
        Ok(Box::new(port))
    }
}
