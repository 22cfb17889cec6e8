//! Per-session configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the agent does after a recoverable collaborator failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReplyPolicy {
    /// Stay quiet and wait for the next user turn.
    #[default]
    Silent,
    /// Speak a short apology before waiting for the next user turn.
    Apologize(String),
}

/// How speech captured while the agent could not be interrupted is treated
/// once the agent finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BufferedSpeechPolicy {
    /// Turn-detector probability and silence observed during the gap are
    /// dropped; end-of-turn is evaluated afresh after the agent finishes.
    #[default]
    Reset,
    /// The last probability and the silence start observed during the gap
    /// carry over, so an already-finished turn can close immediately.
    PreserveConfidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParameters {
    pub voice: Option<String>,
    pub speaking_rate: f32,
}

impl Default for VoiceParameters {
    fn default() -> Self {
        Self {
            voice: None,
            speaking_rate: 1.0,
        }
    }
}

/// A fixed utterance spoken when the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub text: String,
    pub allow_interruptions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// BCP-47 language handed to the transcriber.
    pub language: String,
    /// Whether user speech may cut off the agent mid-response.
    pub allow_interruptions: bool,
    /// Turn-detector probability at which the user's turn is considered over.
    pub end_of_turn_threshold: f32,
    /// Silence after which the user's turn is closed regardless of the detector.
    #[serde(with = "millis")]
    pub max_silence: Duration,
    #[serde(with = "millis")]
    pub tool_call_timeout: Duration,
    pub max_consecutive_failures: u32,
    /// Upper bound on waiting for the transcriber's final segment after the
    /// turn has ended.
    #[serde(with = "millis")]
    pub transcript_flush_timeout: Duration,
    pub error_reply: ErrorReplyPolicy,
    pub buffered_speech: BufferedSpeechPolicy,
    pub voice: VoiceParameters,
    pub greeting: Option<Greeting>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            language: "cs".to_string(),
            allow_interruptions: true,
            end_of_turn_threshold: 0.8,
            max_silence: Duration::from_millis(1500),
            tool_call_timeout: Duration::from_secs(10),
            max_consecutive_failures: 3,
            transcript_flush_timeout: Duration::from_secs(2),
            error_reply: ErrorReplyPolicy::Silent,
            buffered_speech: BufferedSpeechPolicy::Reset,
            voice: VoiceParameters::default(),
            greeting: None,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
