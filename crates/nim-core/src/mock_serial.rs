//! In-memory serial port for tests and the simulated bench
//!
//! `MockSerialPort` implements `AsyncRead`/`AsyncWrite` and is handed to a transport in
//! place of a real port. The paired `MockDeviceHarness` plays the instrument: it sees
//! every byte the host writes and decides what the host reads back.
//!
//! The port also records a [`WireLog`] of what crossed the line from the host's point of
//! view (each write, and each read that delivered a prompt). Tests use it to prove that
//! request/response cycles never overlap.
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::new();
//! let wire = harness.wire_log();
//! // hand `port` to a SerialTransport, then:
//! harness.expect_and_respond(b"V\r", b"V\r\nsw: 5.3\r\nmscf>").await;
//! assert!(wire.is_strictly_alternating());
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// One observation on the host side of the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Bytes written by the host.
    Write(String),
    /// A read that delivered the end-of-reply prompt (`>`).
    Prompt,
}

/// Shared, append-only record of host-side line activity.
#[derive(Debug, Clone, Default)]
pub struct WireLog(Arc<Mutex<Vec<WireEvent>>>);

impl WireLog {
    fn push(&self, event: WireEvent) {
        self.0.lock().push(event);
    }

    /// Snapshot of every recorded event.
    pub fn events(&self) -> Vec<WireEvent> {
        self.0.lock().clone()
    }

    /// Frames written by the host, in order.
    pub fn writes(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                WireEvent::Write(s) => Some(s.clone()),
                WireEvent::Prompt => None,
            })
            .collect()
    }

    /// Number of writes seen so far.
    pub fn write_count(&self) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|e| matches!(e, WireEvent::Write(_)))
            .count()
    }

    /// True when every write is followed by its prompt before the next write.
    pub fn is_strictly_alternating(&self) -> bool {
        let mut awaiting_prompt = false;
        for event in self.0.lock().iter() {
            match event {
                WireEvent::Write(_) if awaiting_prompt => return false,
                WireEvent::Write(_) => awaiting_prompt = true,
                WireEvent::Prompt => awaiting_prompt = false,
            }
        }
        true
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Host side of the mock line.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
    log: WireLog,
}

/// Instrument side of the mock line.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
    log: WireLog,
}

/// Creates a new connected pair of `MockSerialPort` and `MockDeviceHarness`.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (host_to_device_tx, host_to_device_rx) = mpsc::unbounded_channel();
    let (device_to_host_tx, device_to_host_rx) = mpsc::unbounded_channel();
    let log = WireLog::default();

    let port = MockSerialPort {
        writes_tx: host_to_device_tx,
        reads_rx: device_to_host_rx,
        read_buffer: VecDeque::new(),
        log: log.clone(),
    };

    let harness = MockDeviceHarness {
        writes_rx: host_to_device_rx,
        reads_tx: device_to_host_tx,
        write_buffer: Vec::new(),
        log,
    };

    (port, harness)
}

impl MockSerialPort {
    fn deliver(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        if chunk.contains(&b'>') {
            self.log.push(WireEvent::Prompt);
        }
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.deliver(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.deliver(buf);
                Poll::Ready(Ok(()))
            }
            // Harness dropped: the device is gone, report EOF
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => {
                self.log
                    .push(WireEvent::Write(String::from_utf8_lossy(buf).into_owned()));
                Poll::Ready(Ok(buf.len()))
            }
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Handle on the host-side wire record.
    pub fn wire_log(&self) -> WireLog {
        self.log.clone()
    }

    /// Sends bytes to the host as if the device had transmitted them.
    ///
    /// # Errors
    /// Returns error if the host port has been dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: host port dropped")
    }

    /// Waits for the next CR-terminated frame from the host.
    ///
    /// Returns `None` once the host port is dropped and no complete frame remains.
    pub async fn next_frame(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.write_buffer.iter().position(|b| *b == b'\r') {
                let raw: Vec<u8> = self.write_buffer.drain(..=pos).collect();
                return Some(String::from_utf8_lossy(&raw[..pos]).trim().to_string());
            }
            let chunk = self.writes_rx.recv().await?;
            self.write_buffer.extend_from_slice(&chunk);
        }
    }

    /// Bytes written by the host that have not been consumed yet, without waiting.
    pub fn pending_write_bytes(&mut self) -> usize {
        loop {
            match self.writes_rx.try_recv() {
                Ok(chunk) => self.write_buffer.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.write_buffer.len()
    }

    /// Waits for the host to write `expected` and asserts on it.
    ///
    /// # Panics
    /// Panics if the bytes do not arrive within 2 seconds or do not match.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        use tokio::time::{timeout, Duration};

        let timeout_duration = Duration::from_secs(2);

        while self.write_buffer.len() < expected.len() {
            match timeout(timeout_duration, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Host port closed while expecting a write."),
                Err(_) => panic!(
                    "Timeout waiting for write. Expected `{:?}`, received `{:?}`.",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer),
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// Expects a write and sends a response in one operation.
    ///
    /// # Panics
    /// Same as [`MockDeviceHarness::expect_write`], or if the host port is gone.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        self.send_response(response)
            .expect("Failed to send response");
    }
}
