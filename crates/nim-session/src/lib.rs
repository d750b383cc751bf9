//! Device sessions for the NIM gateway.
//!
//! # Architecture
//!
//! ```text
//! SessionManager ── registry lock ── DeviceSession (one per device)
//!                                      ├── DeviceDriver        (family codec)
//!                                      ├── CommandDispatcher   (FIFO slot)
//!                                      │     └── SerialTransport (drain, write, read-to-prompt)
//!                                      ├── ParamCache / Readings
//!                                      ├── SubscriberSet       (observers)
//!                                      └── telemetry poller    (MHV-4)
//! ```
//!
//! Sessions share no mutable state with each other. Within a session the dispatcher
//! guarantees one request/response cycle on the wire at a time.
//!
//! Endpoints come from a [`ports::PortOpener`]: real serial ports, or the
//! [`ports::SimulatedBench`] of emulated modules.

pub mod config;
pub mod dispatcher;
pub mod manager;
pub mod poller;
pub mod ports;
pub mod session;
pub mod subscribers;
pub mod transport;

pub use config::{FamilyConfig, ManagerConfig, SessionConfig};
pub use dispatcher::CommandDispatcher;
pub use manager::{ConnectRequest, SessionManager};
#[cfg(feature = "serial")]
pub use ports::SystemPorts;
pub use ports::{PortInfo, PortOpener, PortScanner, SimulatedBench};
pub use session::{DeviceSession, DeviceSnapshot, SessionSummary};
pub use subscribers::{Observer, ObserverId, SubscriberSet};
pub use transport::SerialTransport;
