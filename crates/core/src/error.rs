//! Error taxonomy shared by the orchestrator, the tool registry and the
//! collaborator adapters.

use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

/// The external collaborator a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collaborator {
    Transcriber,
    ResponseGenerator,
    Synthesizer,
    ToolServer,
    AudioOutput,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Collaborator::Transcriber => "transcriber",
            Collaborator::ResponseGenerator => "response generator",
            Collaborator::Synthesizer => "synthesizer",
            Collaborator::ToolServer => "tool server",
            Collaborator::AudioOutput => "audio output",
        };
        f.write_str(name)
    }
}

/// Every failure a session can observe.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// A collaborator stream broke or timed out.
    #[error("{collaborator} transport error: {message}")]
    Transport {
        collaborator: Collaborator,
        message: String,
    },
    /// A tool call did not match its descriptor's parameter schema.
    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },
    /// Tool execution failed, timed out, or the tool is unknown.
    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },
    /// The remote tool listing could not be obtained at session start.
    #[error("remote tool discovery unavailable: {0}")]
    DiscoveryUnavailable(String),
    /// The same collaborator failed too many times in a row.
    #[error("session terminated after {failures} consecutive {collaborator} failures")]
    Fatal {
        collaborator: Collaborator,
        failures: u32,
    },
    /// The session has already ended.
    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn transport(collaborator: Collaborator, message: impl Into<String>) -> Self {
        Self::Transport {
            collaborator,
            message: message.into(),
        }
    }

    pub fn invalid_arguments(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether the session survives this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SessionError::Fatal { .. } | SessionError::Closed)
    }

    /// Short machine-readable tag used in structured tool results.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Transport { .. } => "transport_error",
            SessionError::InvalidArguments { .. } => "invalid_arguments",
            SessionError::Tool { .. } => "tool_error",
            SessionError::DiscoveryUnavailable(_) => "discovery_unavailable",
            SessionError::Fatal { .. } => "fatal_session_error",
            SessionError::Closed => "closed",
        }
    }
}

/// The outcome of one tool invocation, as fed back into the model.
pub type ToolOutcome = Result<Value, SessionError>;

/// Renders a tool outcome as the structured content the model receives.
///
/// Failures are never raised to the caller; the model sees them as data and
/// can react verbally.
pub fn tool_payload(outcome: &ToolOutcome) -> Value {
    match outcome {
        Ok(result) => json!({ "result": result }),
        Err(err) => failure_payload(err),
    }
}

pub fn failure_payload(err: &SessionError) -> Value {
    let message = match err {
        SessionError::InvalidArguments { message, .. } | SessionError::Tool { message, .. } => {
            message.clone()
        }
        other => other.to_string(),
    };
    json!({ "error": { "kind": err.kind(), "message": message } })
}
