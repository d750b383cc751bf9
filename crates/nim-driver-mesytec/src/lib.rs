//! Mesytec NIM module drivers for the NIM gateway.
//!
//! This crate provides:
//! - [`Mscf16Driver`]: MSCF-16 16-channel shaping amplifier with discriminators
//! - [`Mhv4Driver`]: MHV-4 four-channel high-voltage supply
//! - [`sim`]: line-level emulators of both modules for tests and the simulated bench
//!
//! Both modules speak the same framing (`MNEMONIC args\r`, echo, body, prompt), so the
//! drivers only differ in their command tables and reply parsers.
//!
//! ```rust,ignore
//! use nim_core::Family;
//! let driver = nim_driver_mesytec::driver_for(Family::Mhv4);
//! let frames = driver.encode(&Command::new("set_voltage").with("channel", 0).with("voltage", 120.0))?;
//! assert_eq!(frames, vec!["SU 0 1200"]);
//! ```

pub mod mhv4;
pub mod mscf16;
pub mod mscf16_setup;
pub mod sim;

pub use mhv4::Mhv4Driver;
pub use mscf16::Mscf16Driver;

use nim_core::{DeviceDriver, Family};
use std::sync::Arc;

/// Driver instance for `family`.
pub fn driver_for(family: Family) -> Arc<dyn DeviceDriver> {
    match family {
        Family::Mscf16 => Arc::new(Mscf16Driver),
        Family::Mhv4 => Arc::new(Mhv4Driver),
    }
}
