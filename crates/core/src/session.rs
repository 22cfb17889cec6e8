//! Conversation data owned by a running session.

use crate::config::SessionConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

/// One finalized line of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    /// Finalization time; non-decreasing across a session's history.
    pub timestamp: DateTime<Utc>,
    /// Set for agent lines cut short by an interruption or a failure.
    pub truncated: bool,
}

/// Turn-taking state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    UserSpeaking,
    Thinking,
    AgentSpeaking,
    Interrupted,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Idle => "idle",
            TurnState::UserSpeaking => "user_speaking",
            TurnState::Thinking => "thinking",
            TurnState::AgentSpeaking => "agent_speaking",
            TurnState::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// A bounded span of user speech.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Final transcript segments accumulated so far.
    pub text: String,
    /// Latest interim hypothesis that has not been finalized yet.
    pub interim: String,
    pub is_final: bool,
}

impl Utterance {
    pub fn open(id: u64) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            ended_at: None,
            text: String::new(),
            interim: String::new(),
            is_final: false,
        }
    }

    pub fn push_final(&mut self, segment: &str) {
        let segment = segment.trim();
        if !segment.is_empty() {
            if !self.text.is_empty() {
                self.text.push(' ');
            }
            self.text.push_str(segment);
        }
        self.interim.clear();
    }

    pub fn set_interim(&mut self, hypothesis: &str) {
        self.interim = hypothesis.trim().to_string();
    }

    /// Finalized text plus the pending interim hypothesis.
    pub fn current_text(&self) -> String {
        match (self.text.is_empty(), self.interim.is_empty()) {
            (_, true) => self.text.clone(),
            (true, false) => self.interim.clone(),
            (false, false) => format!("{} {}", self.text, self.interim),
        }
    }

    pub fn finalize(&mut self) -> String {
        self.text = self.current_text();
        self.interim.clear();
        self.ended_at = Some(Utc::now());
        self.is_final = true;
        self.text.clone()
    }
}

/// One conversation instance.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub config: SessionConfig,
    pub history: Vec<TranscriptEntry>,
    pub state: TurnState,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            history: Vec::new(),
            state: TurnState::Idle,
        }
    }

    /// Appends a finalized line, keeping history timestamps non-decreasing.
    pub fn append(&mut self, speaker: Speaker, text: String, truncated: bool) -> &TranscriptEntry {
        let now = Utc::now();
        let timestamp = match self.history.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        self.history.push(TranscriptEntry {
            speaker,
            text,
            timestamp,
            truncated,
        });
        &self.history[self.history.len() - 1]
    }
}
