//! Session State Machine
//!
//! A pure reducer over user intents and transport events. It owns the call
//! status, the transcript and the speaking indicators, and tells the runtime
//! which side effects to perform by returning [`Command`]s. Nothing here is
//! async or touches the network, so every transition can be exercised directly.

use crate::{
    Command,
    session_config::{SessionConfig, TransportTargets},
    transcript::{Role, Transcript, TranscriptEntry},
    transport::{MessageEvent, TranscriptState, TransportEvent},
};
use serde::Serialize;
use tracing::{debug, info};

/// Phase of the current session. Within one session it only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Inactive,
    Connecting,
    Active,
    Finished,
}

impl CallStatus {
    /// True when no call is running and a new one may be started.
    pub fn is_idle(self) -> bool {
        matches!(self, CallStatus::Inactive | CallStatus::Finished)
    }

    /// The end control replaces the call control only while a call is live.
    pub fn shows_end_control(self) -> bool {
        self == CallStatus::Active
    }
}

/// Ephemeral speaking indicators derived from transport events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpeakerActivity {
    pub assistant_speaking: bool,
    pub user_speaking: bool,
}

/// A user intent relayed from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Intent(Intent),
    Transport(TransportEvent),
}

/// Everything the feedback dispatcher needs once a session has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSession {
    pub config: SessionConfig,
    /// Transcript as it stood at the moment the session finished.
    pub transcript: Vec<TranscriptEntry>,
}

pub struct SessionMachine {
    config: SessionConfig,
    targets: TransportTargets,
    status: CallStatus,
    transcript: Transcript,
    speakers: SpeakerActivity,
    // Per-session guards; reset when a finished machine is started again.
    stop_issued: bool,
    dispatched: bool,
}

impl SessionMachine {
    pub fn new(config: SessionConfig, targets: TransportTargets) -> Self {
        Self {
            config,
            targets,
            status: CallStatus::Inactive,
            transcript: Transcript::new(),
            speakers: SpeakerActivity::default(),
            stop_issued: false,
            dispatched: false,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn speakers(&self) -> SpeakerActivity {
        self.speakers
    }

    /// Applies one input and returns the side effects it requires, in order.
    pub fn handle(&mut self, input: Input) -> Vec<Command> {
        match input {
            Input::Intent(Intent::Start) => self.request_start(),
            Input::Intent(Intent::Stop) => self.request_stop(),
            Input::Transport(event) => self.on_transport_event(event),
        }
    }

    fn request_start(&mut self) -> Vec<Command> {
        match self.status {
            CallStatus::Connecting | CallStatus::Active => {
                debug!(status = ?self.status, "Start requested while a call is in progress");
                vec![Command::StartRejected]
            }
            CallStatus::Inactive | CallStatus::Finished => {
                if self.status == CallStatus::Finished {
                    self.reset();
                }
                self.status = CallStatus::Connecting;
                let request = self.config.call_request(&self.targets);
                info!(mode = self.config.mode(), call_target = %request.target, "Starting call");
                vec![Command::StartCall(request)]
            }
        }
    }

    fn request_stop(&mut self) -> Vec<Command> {
        match self.status {
            CallStatus::Inactive | CallStatus::Finished => Vec::new(),
            CallStatus::Connecting | CallStatus::Active => {
                let mut commands = Vec::with_capacity(2);
                if !self.stop_issued {
                    self.stop_issued = true;
                    commands.push(Command::StopCall);
                }
                commands.extend(self.finish());
                commands
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Vec<Command> {
        match event {
            TransportEvent::CallStart => {
                if self.status == CallStatus::Connecting {
                    self.status = CallStatus::Active;
                    info!("Call is live");
                } else if self.status != CallStatus::Active {
                    debug!(status = ?self.status, "Ignoring call-start outside a connecting session");
                }
                Vec::new()
            }
            TransportEvent::CallEnd => match self.status {
                CallStatus::Connecting | CallStatus::Active => {
                    // The engine closed the call itself; there is nothing left to stop.
                    self.stop_issued = true;
                    self.finish().into_iter().collect()
                }
                CallStatus::Inactive | CallStatus::Finished => Vec::new(),
            },
            TransportEvent::Message { message } => {
                if !self.is_live() {
                    debug!(status = ?self.status, "Discarding message outside a live session");
                    return Vec::new();
                }
                if let MessageEvent::Transcript {
                    role,
                    transcript_type: TranscriptState::Final,
                    transcript,
                } = message
                {
                    self.speakers.user_speaking = role == Role::User;
                    self.transcript.push(TranscriptEntry::new(role, transcript));
                }
                Vec::new()
            }
            TransportEvent::SpeechStart => {
                if self.is_live() {
                    self.speakers.assistant_speaking = true;
                }
                Vec::new()
            }
            TransportEvent::SpeechEnd => {
                if self.is_live() {
                    self.speakers.assistant_speaking = false;
                }
                Vec::new()
            }
            TransportEvent::Error { message } => vec![Command::ReportError(message)],
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.status, CallStatus::Connecting | CallStatus::Active)
    }

    /// Moves to `Finished` and hands the transcript snapshot to the dispatcher, once.
    fn finish(&mut self) -> Option<Command> {
        self.status = CallStatus::Finished;
        self.speakers = SpeakerActivity::default();
        if self.dispatched {
            return None;
        }
        self.dispatched = true;
        info!(entries = self.transcript.len(), "Session finished");
        Some(Command::Dispatch(CompletedSession {
            config: self.config.clone(),
            transcript: self.transcript.entries().to_vec(),
        }))
    }

    fn reset(&mut self) {
        self.transcript.clear();
        self.speakers = SpeakerActivity::default();
        self.stop_issued = false;
        self.dispatched = false;
    }
}
