//! Call transport capability
//!
//! The voice-call engine is an external collaborator. The core only needs it
//! to start and stop a call and to deliver lifecycle and transcript events,
//! which it models as a typed event stream.

use crate::transcript::Role;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// What the engine should run and the variables it is bound with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub target: String,
    pub variable_values: BTreeMap<String, String>,
}

/// Whether a speech-to-text hypothesis is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptState {
    Partial,
    Final,
}

/// Payload of a `message` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageEvent {
    #[serde(rename_all = "camelCase")]
    Transcript {
        role: Role,
        transcript_type: TranscriptState,
        transcript: String,
    },
    /// Any message kind the session does not act on (function calls, status updates, ...).
    #[serde(other)]
    Other,
}

/// Events emitted by the call engine, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportEvent {
    CallStart,
    CallEnd,
    Message { message: MessageEvent },
    /// The assistant started talking.
    SpeechStart,
    /// The assistant stopped talking.
    SpeechEnd,
    Error {
        #[serde(default)]
        message: String,
    },
}

impl TransportEvent {
    pub fn final_transcript(role: Role, text: impl Into<String>) -> Self {
        Self::Message {
            message: MessageEvent::Transcript {
                role,
                transcript_type: TranscriptState::Final,
                transcript: text.into(),
            },
        }
    }

    pub fn partial_transcript(role: Role, text: impl Into<String>) -> Self {
        Self::Message {
            message: MessageEvent::Transcript {
                role,
                transcript_type: TranscriptState::Partial,
                transcript: text.into(),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to call engine: {0}")]
    Connect(String),
    #[error("failed to send to call engine: {0}")]
    Send(String),
    #[error("failed to encode call engine frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Capability set the session runtime needs from a call engine.
#[async_trait]
pub trait CallTransport: Send + Sync {
    /// Starts a call. Completion means the request was accepted, not that the call is live;
    /// liveness is reported through `TransportEvent::CallStart`.
    async fn start(&self, request: &CallRequest) -> Result<(), TransportError>;

    /// Stops the current call, if any.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Opens the event stream. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> mpsc::Receiver<TransportEvent>;
}
