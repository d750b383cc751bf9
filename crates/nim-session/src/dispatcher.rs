//! Per-session command serialization.
//!
//! The dispatcher owns the session's [`SerialTransport`] behind a FIFO-fair async mutex
//! (the "slot"). A caller holds the slot for all frames of one logical command, so
//! request/response cycles of different callers never interleave on the wire, and
//! callers are served in arrival order.
//!
//! Shutdown is two-phase. [`CommandDispatcher::shutdown`] first marks the dispatcher
//! closing so queued callers fail with `Cancelled` as soon as they get the slot. It then
//! waits up to a grace period for the in-flight command; when the grace expires the
//! in-flight exchange is aborted and its caller also sees `Cancelled`.

use crate::transport::SerialTransport;
use nim_core::{NimError, NimResult, Reply};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Serializes access to one transport.
#[derive(Debug)]
pub struct CommandDispatcher {
    endpoint: String,
    slot: Mutex<Option<SerialTransport>>,
    closing: AtomicBool,
    abort: watch::Sender<bool>,
}

impl CommandDispatcher {
    /// Take ownership of an open transport.
    pub fn new(transport: SerialTransport) -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            endpoint: transport.endpoint().to_string(),
            slot: Mutex::new(Some(transport)),
            closing: AtomicBool::new(false),
            abort,
        }
    }

    /// Whether shutdown has begun.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn cancelled(&self) -> NimError {
        NimError::Cancelled(format!("{} is disconnecting", self.endpoint))
    }

    /// Exchange `frames` in order while holding the slot.
    ///
    /// Stops at the first failing frame; replies to earlier frames are discarded.
    ///
    /// # Errors
    ///
    /// `Cancelled` if the session is shutting down, otherwise whatever the transport
    /// reports for the failing frame.
    pub async fn execute(&self, frames: &[String], timeout: Duration) -> NimResult<Vec<Reply>> {
        if self.is_closing() {
            return Err(self.cancelled());
        }
        let mut aborted = self.abort.subscribe();
        let mut slot = self.slot.lock().await;
        if self.is_closing() {
            return Err(self.cancelled());
        }
        let transport = slot.as_mut().ok_or_else(|| self.cancelled())?;

        let mut replies = Vec::with_capacity(frames.len());
        for frame in frames {
            let reply = tokio::select! {
                biased;
                () = wait_aborted(&mut aborted) => return Err(self.cancelled()),
                reply = transport.exchange(frame, timeout) => reply?,
            };
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Stop accepting commands and close the transport.
    ///
    /// Waits up to `grace` for an in-flight command before aborting it. Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        self.closing.store(true, Ordering::SeqCst);

        let mut slot = match tokio::time::timeout(grace, self.slot.lock()).await {
            Ok(slot) => slot,
            Err(_) => {
                warn!(endpoint = %self.endpoint, ?grace, "in-flight command exceeded grace, aborting");
                self.abort.send_replace(true);
                self.slot.lock().await
            }
        };
        if let Some(transport) = slot.take() {
            transport.close().await;
            debug!(endpoint = %self.endpoint, "transport closed");
        }
    }
}

async fn wait_aborted(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
