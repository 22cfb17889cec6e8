pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod orchestrator;
pub mod session;
pub mod stt;
pub mod tools;
pub mod tts;
pub mod turn;
pub mod vad;

pub use error::{Collaborator, SessionError};
pub use events::{GenerationOutcome, SessionEvent};
pub use orchestrator::{Collaborators, SessionControl, SessionHandle, SessionOrchestrator};
pub use session::{Session, Speaker, TranscriptEntry, TurnState};
