//! Serial port abstractions
//!
//! The gateway talks to every instrument through a type-erased async byte stream so
//! that real ports (`tokio_serial::SerialStream`), in-memory test ports
//! ([`crate::mock_serial::MockSerialPort`]) and `tokio::io::duplex` pipes are
//! interchangeable.
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a port 8N1 without blocking the runtime
//! - [`drain_serial_buffer`]: discard stale bytes before the next request
//!
//! ```rust,ignore
//! use nim_core::serial::{open_serial_async, drain_serial_buffer, DynSerial};
//!
//! let mut port: DynSerial = Box::new(open_serial_async("/dev/ttyUSB0", 9600, "MHV-4").await?);
//! let discarded = drain_serial_buffer(&mut port, Duration::from_millis(20)).await;
//! ```

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Trait alias for async serial port I/O.
///
/// Any `AsyncRead + AsyncWrite + Unpin + Send` type can stand in for a port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port, exclusively owned by one transport.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a serial port asynchronously using `spawn_blocking`.
///
/// Mesytec NIM modules use 8 data bits, no parity, one stop bit and no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or the blocking task fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| {
                format!("Failed to open {device_name_owned} serial port: {port_path_owned}")
            })
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives within `window`. A reply that shows up
/// after its command timed out is removed here instead of being mistaken for the
/// answer to the next command.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break, // surfaced by the following write/read instead
            Err(_) => break,     // quiet line
        }
    }

    if total_discarded > 0 {
        tracing::debug!(bytes = total_discarded, "discarded stale serial data");
    }
    total_discarded
}
