//! Defines the WebSocket message protocol between a voice client and the agent.
//!
//! Text frames carry the JSON messages below; binary frames carry mono PCM16
//! little-endian audio at the rate announced in `init`, in both directions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use voxline_core::{SessionEvent, Speaker, TurnState};

fn default_true() -> bool {
    true
}

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts a session. This must be the first message.
    Init {
        /// Room or call identifier, recorded on the session's logs.
        room: String,
        /// Rate of the client's audio, used for both directions.
        sample_rate: u32,
    },
    /// Speaks a fixed text once the agent is idle.
    Say {
        text: String,
        #[serde(default = "default_true")]
        allow_interruptions: bool,
    },
    /// Ends the session.
    Hangup,
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Initialized {
        session_id: Uuid,
        sample_rate: u32,
    },
    StateChanged {
        from: TurnState,
        to: TurnState,
    },
    /// A committed line of the conversation.
    Transcript {
        speaker: Speaker,
        text: String,
        truncated: bool,
    },
    /// `fatal` errors are followed by the connection closing.
    Error {
        message: String,
        fatal: bool,
    },
}

impl ServerMessage {
    /// The client-facing form of a session event, if it has one.
    pub fn from_event(event: &SessionEvent) -> Option<Self> {
        match event {
            SessionEvent::StateChanged { from, to } => Some(ServerMessage::StateChanged {
                from: *from,
                to: *to,
            }),
            SessionEvent::TranscriptCommitted(entry) => Some(ServerMessage::Transcript {
                speaker: entry.speaker,
                text: entry.text.clone(),
                truncated: entry.truncated,
            }),
            SessionEvent::Warning(err) | SessionEvent::RecoverableError(err) => Some(ServerMessage::Error {
                message: err.to_string(),
                fatal: false,
            }),
            SessionEvent::Fatal(err) => Some(ServerMessage::Error {
                message: err.to_string(),
                fatal: true,
            }),
            _ => None,
        }
    }
}
