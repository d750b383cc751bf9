//! `nim-core`
//!
//! Shared building blocks for the NIM gateway: the error taxonomy, the serial I/O
//! abstractions, the device driver capability interface, and the event types that
//! flow from device sessions out to observers.
//!
//! ## Key Types
//!
//! - [`NimError`]: validation / protocol / timeout / transport taxonomy
//! - [`DeviceDriver`]: per-family encoder, decoder and validator
//! - [`Command`] and [`Target`]: logical operations and their channel/group targets
//! - [`Reply`]: one echo/body/prompt exchange split out of raw serial text
//! - [`ParamUpdate`] and [`ParamCache`]: last-known parameter values
//! - [`DeviceEvent`]: the typed server-to-client event union

pub mod command;
pub mod driver;
pub mod error;
pub mod event;
pub mod mock_serial;
pub mod params;
pub mod reply;
pub mod serial;

pub use command::{Command, ParamReader, Target};
pub use driver::{DeviceDriver, Family, Outcome};
pub use error::{NimError, NimResult};
pub use event::{DeviceEvent, Readings};
pub use params::{Member, ParamCache, ParamKey, ParamUpdate, ParamValue};
pub use reply::Reply;

/// Identifier of a connected device (defaults to its serial endpoint path).
pub type DeviceId = String;
