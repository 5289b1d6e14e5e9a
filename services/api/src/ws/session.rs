//! Manages the WebSocket connection lifecycle for a call session.

use super::{
    protocol::{ClientMessage, ServerMessage, SessionMode},
    provider::CallEngineTransport,
};
use crate::{identity::identity_from_headers, state::AppState};
use anyhow::{Context, Result, anyhow, bail};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use interview_core::{
    feedback::FeedbackDispatcher,
    machine::CallStatus,
    runtime::{SessionHandle, SessionRuntime, SessionUpdate},
    session_config::{Identity, SessionConfig, TransportTargets},
};
use std::sync::Arc;
use tracing::{Instrument, error, info, instrument, warn};

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = identity_from_headers(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// Main handler for an individual WebSocket connection.
///
/// The first client message must be `init`; it decides the session mode.
/// Everything after that is relayed between the browser and a session runtime
/// until either side goes away.
#[instrument(name = "ws_session", skip_all, fields(conn_id, mode))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Option<Identity>) {
    let temp_id: u32 = rand::random();
    tracing::Span::current().record("conn_id", temp_id);
    info!(
        user_id = identity.as_ref().map(|i| i.id.as_str()),
        "New WebSocket connection. Awaiting initialization..."
    );

    let (mut socket_tx, mut socket_rx) = socket.split();

    let config = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => {
            serde_json::from_str::<ClientMessage>(text.as_str())
                .context("Malformed `init` message")
                .and_then(|msg| build_session_config(msg, identity.as_ref(), &state.targets))
        }
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        Some(Err(e)) => {
            error!(error = ?e, "Error receiving from client WebSocket before init.");
            return;
        }
        None => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };
    tracing::Span::current().record("mode", config.mode());

    let session_span = tracing::info_span!("call_relay", mode = config.mode());
    if let Err(e) = run_call_session(state, config, socket_tx, socket_rx)
        .instrument(session_span)
        .await
    {
        error!(error = ?e, "Call session terminated with error.");
    }
    info!("WebSocket connection closed.");
}

/// Turns the client's `init` message into a session configuration.
///
/// Interviews need both an interview id and a signed-in user: their
/// transcript is submitted for feedback under that user.
pub(crate) fn build_session_config(
    msg: ClientMessage,
    identity: Option<&Identity>,
    targets: &TransportTargets,
) -> Result<SessionConfig> {
    let ClientMessage::Init {
        mode,
        interview_id,
        questions,
    } = msg
    else {
        bail!("First message must be `init`");
    };

    match mode {
        SessionMode::Generate => Ok(SessionConfig::generate(identity)),
        SessionMode::Interview => {
            let interview_id = interview_id
                .filter(|id| !id.trim().is_empty())
                .context("`interview_id` is required for interview sessions")?;
            let user = identity.context("Interview sessions require a signed-in user")?;
            Ok(SessionConfig::interview(
                interview_id,
                user.id.clone(),
                targets.interviewer_id.clone(),
                questions,
            ))
        }
    }
}

/// Relays intents from the browser to the session runtime and its updates back.
///
/// Returning drops the `SessionHandle`, which tears the session down along
/// with any call or feedback submission still in flight.
async fn run_call_session(
    state: Arc<AppState>,
    config: SessionConfig,
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut socket_rx: SplitStream<WebSocket>,
) -> Result<()> {
    let mode = config.mode();
    let transport = Arc::new(CallEngineTransport::new(
        state.config.call_engine_url.clone(),
        state.config.call_engine_api_key.clone(),
    ));
    let dispatcher = FeedbackDispatcher::new(state.feedback.clone());
    let (handle, mut updates) =
        SessionRuntime::spawn(config, state.targets.clone(), transport, dispatcher);

    send_msg(&mut socket_tx, ServerMessage::Initialized { mode })
        .await
        .context("Failed to send Initialized message to client")?;
    send_msg(
        &mut socket_tx,
        ServerMessage::from(SessionUpdate::Status(CallStatus::Inactive)),
    )
    .await?;
    info!("Session initialized.");

    loop {
        tokio::select! {
            msg_result = socket_rx.next() => {
                let Some(msg_result) = msg_result else {
                    info!("Client stream ended. Shutting down session.");
                    break;
                };
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(msg) => relay_intent(&handle, msg).await?,
                        Err(e) => warn!(error = %e, "Ignoring malformed client message."),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Client sent close frame. Shutting down session.");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error receiving from client WebSocket: {:?}", e);
                        break;
                    }
                }
            },
            update = updates.recv() => {
                let Some(update) = update else {
                    info!("Session runtime stopped.");
                    break;
                };
                send_update(&mut socket_tx, update).await?;
            },
        }
    }

    drop(handle);
    Ok(())
}

async fn relay_intent(handle: &SessionHandle, msg: ClientMessage) -> Result<()> {
    match msg {
        ClientMessage::Start => handle.request_start().await?,
        ClientMessage::Stop => handle.request_stop().await?,
        ClientMessage::Init { .. } => warn!("Ignoring repeated `init` message."),
    }
    Ok(())
}

async fn send_update(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    update: SessionUpdate,
) -> Result<()> {
    if let SessionUpdate::Navigate(navigation) = &update {
        info!(path = %navigation.path(), "Session complete. Navigating client.");
    }
    send_msg(socket_tx, ServerMessage::from(update)).await
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
