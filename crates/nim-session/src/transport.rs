//! Request/response exchange over one serial endpoint.
//!
//! The transport owns the port exclusively and performs exactly one exchange at a time:
//! drain stale bytes, write the frame with its CR terminator, then accumulate input until
//! the prompt arrives or the deadline expires. It has no notion of commands or families;
//! ordering between exchanges is the dispatcher's job.

use nim_core::serial::{drain_serial_buffer, DynSerial};
use nim_core::{NimError, NimResult, Reply};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{instrument, trace};

/// Exclusive owner of an open serial endpoint.
pub struct SerialTransport {
    endpoint: String,
    port: DynSerial,
    drain_window: Duration,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("endpoint", &self.endpoint)
            .field("drain_window", &self.drain_window)
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    /// Wrap an open port.
    pub fn new(endpoint: impl Into<String>, port: DynSerial, drain_window: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            port,
            drain_window,
        }
    }

    /// Endpoint path this transport is bound to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send `frame` and wait for the complete reply.
    ///
    /// # Errors
    ///
    /// - `Timeout` when no prompt arrives within `timeout`
    /// - `Transport` when the endpoint reports EOF or an I/O error
    /// - `Protocol` when the reply is malformed or reports an error
    #[instrument(skip(self), fields(endpoint = %self.endpoint), err)]
    pub async fn exchange(&mut self, frame: &str, timeout: Duration) -> NimResult<Reply> {
        let stale = drain_serial_buffer(&mut self.port, self.drain_window).await;
        if stale > 0 {
            trace!(bytes = stale, "discarded stale input");
        }

        let wire = format!("{frame}\r");
        self.port.write_all(wire.as_bytes()).await?;
        self.port.flush().await?;

        let raw = tokio::time::timeout(timeout, self.read_until_prompt())
            .await
            .map_err(|_| NimError::Timeout(timeout))??;
        trace!(reply = %raw.trim_end(), "received");

        Reply::parse(frame, &raw)
    }

    async fn read_until_prompt(&mut self) -> NimResult<String> {
        let mut raw = String::new();
        let mut buf = [0u8; 256];
        while !Reply::is_complete(&raw) {
            let n = self.port.read(&mut buf).await?;
            if n == 0 {
                return Err(NimError::Transport(format!(
                    "{} closed by the device",
                    self.endpoint
                )));
            }
            raw.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        Ok(raw)
    }

    /// Release the endpoint.
    pub async fn close(mut self) {
        if let Err(e) = self.port.shutdown().await {
            trace!(endpoint = %self.endpoint, error = %e, "shutdown on close failed");
        }
    }
}
