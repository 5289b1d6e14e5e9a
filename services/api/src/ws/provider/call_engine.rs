//! Handles the real-time WebSocket connection to the call engine.
//!
//! The engine runs the voice side of a call (speech recognition, the
//! assistant, speech synthesis) and reports what happens as JSON frames that
//! map one-to-one onto [`TransportEvent`]s. We send it two frames: `start`
//! with the target and variable bindings, and `stop`.

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use interview_core::transport::{CallRequest, CallTransport, TransportError, TransportEvent};
use serde::Serialize;
use std::sync::{
    Mutex as StdMutex,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 128;

type EngineStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type EngineSink = SplitSink<EngineStream, WsMessage>;

/// Frames sent to the call engine.
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EngineCommand<'a> {
    Start {
        #[serde(flatten)]
        request: &'a CallRequest,
    },
    Stop,
}

/// Parses one text frame from the engine. Frames we cannot read are skipped.
fn parse_event(text: &str) -> Option<TransportEvent> {
    match serde_json::from_str::<TransportEvent>(text) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Skipping unreadable call engine frame");
            None
        }
    }
}

fn lock_events(
    events: &StdMutex<Option<mpsc::Sender<TransportEvent>>>,
) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<TransportEvent>>> {
    events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A `CallTransport` that talks to the call engine over a WebSocket.
///
/// One instance serves one session. Each `start` opens a fresh connection and
/// replaces any earlier one; its events go to the subscription that was
/// current when the start was requested, so a late frame from a replaced
/// call never reaches a newer subscriber.
pub struct CallEngineTransport {
    url: String,
    api_key: Option<String>,
    events: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
    outbound: Mutex<Option<EngineSink>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    /// Set when `stop` arrives while `start` is still connecting.
    stop_pending: AtomicBool,
}

impl CallEngineTransport {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
            events: StdMutex::new(None),
            outbound: Mutex::new(None),
            reader: StdMutex::new(None),
            stop_pending: AtomicBool::new(false),
        }
    }

    async fn connect(&self) -> Result<EngineStream, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if let Some(api_key) = &self.api_key {
            let value = format!("Bearer {}", api_key)
                .parse()
                .map_err(|_| TransportError::Connect("invalid API key header".to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(ws_stream)
    }
}

async fn send_stop(engine_tx: &mut EngineSink) -> Result<(), TransportError> {
    let frame = serde_json::to_string(&EngineCommand::Stop)?;
    engine_tx
        .send(WsMessage::Text(frame.into()))
        .await
        .map_err(|e| TransportError::Send(e.to_string()))?;
    engine_tx
        .close()
        .await
        .map_err(|e| TransportError::Send(e.to_string()))
}

/// Forwards engine frames to the subscriber until either side goes away.
///
/// A connection that closes without a `call-end` frame still ends the call.
async fn forward_events(
    mut engine_rx: SplitStream<EngineStream>,
    events: Option<mpsc::Sender<TransportEvent>>,
) {
    let Some(events) = events else {
        warn!("Call started without an event subscriber; engine events are dropped.");
        return;
    };

    let mut call_ended = false;
    while let Some(msg_result) = engine_rx.next().await {
        let event = match msg_result {
            Ok(WsMessage::Text(text)) => parse_event(text.as_str()),
            Ok(WsMessage::Close(frame)) => {
                debug!(?frame, "Call engine closed the connection");
                break;
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Error receiving from call engine");
                break;
            }
        };
        let Some(event) = event else { continue };

        call_ended |= event == TransportEvent::CallEnd;
        if events.send(event).await.is_err() {
            debug!("Event subscriber dropped; stopping call engine reader.");
            return;
        }
    }

    if !call_ended {
        info!("Call engine connection ended without call-end; ending call.");
        let _ = events.send(TransportEvent::CallEnd).await;
    }
}

#[async_trait]
impl CallTransport for CallEngineTransport {
    async fn start(&self, request: &CallRequest) -> Result<(), TransportError> {
        let events = lock_events(&self.events).clone();
        self.stop_pending.store(false, Ordering::SeqCst);

        let frame = serde_json::to_string(&EngineCommand::Start { request })?;
        let (mut engine_tx, engine_rx) = self.connect().await?.split();
        info!(call_target = %request.target, "Connected to call engine.");

        engine_tx
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;

        let reader = tokio::spawn(forward_events(engine_rx, events));
        let previous = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(reader);
        if let Some(previous) = previous {
            previous.abort();
        }

        let mut outbound = self.outbound.lock().await;
        if self.stop_pending.swap(false, Ordering::SeqCst) {
            drop(outbound);
            info!("Stop arrived while connecting; ending call.");
            return send_stop(&mut engine_tx).await;
        }
        let replaced = outbound.replace(engine_tx);
        drop(outbound);

        if let Some(mut replaced) = replaced {
            debug!("Closing connection of the previous call.");
            let _ = replaced.close().await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let mut outbound = self.outbound.lock().await;
        let Some(mut engine_tx) = outbound.take() else {
            debug!("Stop requested before the call engine connection opened.");
            self.stop_pending.store(true, Ordering::SeqCst);
            return Ok(());
        };
        drop(outbound);

        send_stop(&mut engine_tx).await?;
        info!("Sent stop to call engine.");
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *lock_events(&self.events) = Some(tx);
        rx
    }
}

impl Drop for CallEngineTransport {
    fn drop(&mut self) {
        if let Some(reader) = self
            .reader
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            reader.abort();
        }
    }
}
