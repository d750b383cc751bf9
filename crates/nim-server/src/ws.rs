//! Event channel.
//!
//! Each WebSocket connection is one [`Observer`]. It receives the `connected` greeting,
//! then the cached values of every live device, then live events. A client may narrow
//! or widen what it follows with `{"action": "subscribe" | "unsubscribe", "device_id": ...}`.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use nim_core::{DeviceEvent, DeviceId};
use nim_session::Observer;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Client-to-server control message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Follow a device and receive its cached values.
    Subscribe {
        /// Device to follow.
        device_id: DeviceId,
    },
    /// Stop following a device.
    Unsubscribe {
        /// Device to drop.
        device_id: DeviceId,
    },
}

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut events) = mpsc::unbounded_channel();
    let observer = Observer::new(tx);
    let observer_id = observer.id;

    if send_event(&mut sink, &DeviceEvent::greeting()).await.is_err() {
        return;
    }
    state.manager.attach(observer.clone());
    debug!(%observer_id, "event client attached");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => handle_client_message(&state, &observer, &text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.manager.detach(observer_id);
    debug!(%observer_id, "event client detached");
}

fn handle_client_message(state: &AppState, observer: &Observer, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "ignoring malformed client message");
            return;
        }
    };
    let result = match &message {
        ClientMessage::Subscribe { device_id } => {
            state.manager.subscribe(observer.clone(), device_id)
        }
        ClientMessage::Unsubscribe { device_id } => {
            state.manager.unsubscribe(observer.id, device_id)
        }
    };
    if let Err(error) = result {
        warn!(?message, %error, "client message rejected");
    }
}

async fn send_event<S>(sink: &mut S, event: &DeviceEvent) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, event = event.name(), "event serialization failed");
            return Ok(());
        }
    };
    sink.send(Message::Text(text)).await.map_err(|_| ())
}
