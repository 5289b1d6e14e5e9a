//! Defines the WebSocket message protocol between the browser client and the API server.

use interview_core::{machine::CallStatus, runtime::SessionUpdate, transcript::Role};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Generate,
    Interview,
}

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Configures the call view. This must be the first message.
    Init {
        mode: SessionMode,
        #[serde(default)]
        interview_id: Option<String>,
        #[serde(default)]
        questions: Vec<String>,
    },
    /// The user pressed the call button.
    Start,
    /// The user pressed the end button.
    Stop,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the session is configured and ready to start.
    Initialized { mode: &'static str },
    /// `end_control` tells the view to offer hanging up instead of calling.
    Status {
        status: CallStatus,
        idle: bool,
        end_control: bool,
    },
    /// The latest finalized utterance.
    Transcript { role: Role, content: String },
    Speaking { assistant: bool, user: bool },
    /// A non-fatal, user-facing message.
    Notice { message: String },
    /// The session is over; the client should move to `path`.
    Navigate { path: String },
    /// Reports a fatal error to the client.
    Error { message: String },
}

impl From<SessionUpdate> for ServerMessage {
    fn from(update: SessionUpdate) -> Self {
        match update {
            SessionUpdate::Status(status) => ServerMessage::Status {
                status,
                idle: status.is_idle(),
                end_control: status.shows_end_control(),
            },
            SessionUpdate::Transcript(entry) => ServerMessage::Transcript {
                role: entry.role,
                content: entry.content,
            },
            SessionUpdate::Speaking(speakers) => ServerMessage::Speaking {
                assistant: speakers.assistant_speaking,
                user: speakers.user_speaking,
            },
            SessionUpdate::Notice(message) => ServerMessage::Notice { message },
            SessionUpdate::Navigate(navigation) => ServerMessage::Navigate {
                path: navigation.path(),
            },
        }
    }
}
