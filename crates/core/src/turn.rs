//! End-of-turn estimation from the partial transcript.

use crate::error::SessionError;
use async_trait::async_trait;

#[async_trait]
pub trait TurnDetector: Send + Sync {
    /// Probability in `[0, 1]` that the user has finished their turn.
    async fn end_of_turn_probability(&self, partial_transcript: &str) -> Result<f32, SessionError>;
}

/// Cheap lexical stand-in for a turn-detection model: sentence-final
/// punctuation reads as a finished turn, a trailing comma or ellipsis as a
/// pause mid-thought.
#[derive(Debug, Clone, Default)]
pub struct PunctuationTurnDetector;

#[async_trait]
impl TurnDetector for PunctuationTurnDetector {
    async fn end_of_turn_probability(&self, partial_transcript: &str) -> Result<f32, SessionError> {
        let text = partial_transcript.trim_end();
        if text.is_empty() {
            return Ok(0.0);
        }
        let probability = if text.ends_with("...") || text.ends_with('…') || text.ends_with(',') {
            0.1
        } else if text.ends_with(['.', '?', '!']) {
            0.9
        } else {
            0.5
        };
        Ok(probability)
    }
}
