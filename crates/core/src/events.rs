//! Events a running session reports to its owner.

use crate::error::{SessionError, ToolOutcome};
use crate::llm::ToolCallRequest;
use crate::session::{TranscriptEntry, TurnState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    /// Cancelled by barge-in or session teardown.
    Interrupted,
    /// Cancelled because a collaborator failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: TurnState,
        to: TurnState,
    },
    TranscriptCommitted(TranscriptEntry),
    GenerationStarted {
        generation: u64,
    },
    GenerationFinished {
        generation: u64,
        outcome: GenerationOutcome,
    },
    ToolCallDispatched {
        generation: u64,
        call: ToolCallRequest,
    },
    ToolCallResolved {
        generation: u64,
        call_id: String,
        name: String,
        outcome: ToolOutcome,
    },
    /// Degraded capability, e.g. remote tool discovery failed.
    Warning(SessionError),
    /// A collaborator failed; the session continues.
    RecoverableError(SessionError),
    /// The session is terminating; no transitions follow.
    Fatal(SessionError),
    Ended,
}
