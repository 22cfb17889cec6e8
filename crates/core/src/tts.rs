//! Streaming text-to-speech.

use crate::audio::{AudioFrame, pcm16_from_le_bytes, split_frames};
use crate::config::VoiceParameters;
use crate::error::{Collaborator, SessionError};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// One synthesized frame. `text` carries the words this frame starts
/// speaking, so a consumer can tell how much text has actually been voiced.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedChunk {
    pub frame: AudioFrame,
    pub text: Option<String>,
}

pub type TextStream = Pin<Box<dyn Stream<Item = String> + Send>>;
pub type SynthesisStream = Pin<Box<dyn Stream<Item = Result<SynthesizedChunk, SessionError>> + Send>>;

/// The returned stream ends once the text stream has ended and all audio
/// for it has been produced. Dropping it cancels synthesis.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: TextStream, voice: &VoiceParameters) -> Result<SynthesisStream, SessionError>;
}

/// Splits streamed text at sentence boundaries. A terminator only closes a
/// sentence once the following whitespace has arrived.
#[derive(Debug, Default)]
pub struct SentenceChunker {
    buffer: String,
}

impl SentenceChunker {
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut sentences = Vec::new();
        loop {
            let boundary = self
                .buffer
                .char_indices()
                .zip(self.buffer.chars().skip(1))
                .find(|((_, c), next)| matches!(c, '.' | '!' | '?' | '…' | '\n') && next.is_whitespace())
                .map(|((i, c), _)| i + c.len_utf8());
            let Some(end) = boundary else { break };
            let sentence = self.buffer[..end].trim().to_string();
            self.buffer = self.buffer[end..].trim_start().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }
        sentences
    }

    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpSynthesizerConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub default_voice: String,
    /// Rate of the raw PCM the endpoint returns.
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub request_timeout: Duration,
}

/// Synthesizes sentence by sentence against an OpenAI-compatible
/// `/audio/speech` endpoint returning raw PCM16.
#[derive(Clone)]
pub struct HttpSynthesizer {
    config: HttpSynthesizerConfig,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(config: HttpSynthesizerConfig) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SessionError::transport(Collaborator::Synthesizer, e.to_string()))?;
        Ok(Self { config, client })
    }

    async fn speak(&self, sentence: &str, voice: &VoiceParameters) -> Result<Vec<i16>, SessionError> {
        let err = |e: reqwest::Error| SessionError::transport(Collaborator::Synthesizer, e.to_string());
        let url = format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "input": sentence,
            "voice": voice.voice.as_deref().unwrap_or(&self.config.default_voice),
            "response_format": "pcm",
            "speed": voice.speaking_rate,
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(err)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SessionError::transport(
                Collaborator::Synthesizer,
                format!("speech API error {}: {}", status, text),
            ));
        }
        let bytes = response.bytes().await.map_err(err)?;
        Ok(pcm16_from_le_bytes(&bytes))
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, mut text: TextStream, voice: &VoiceParameters) -> Result<SynthesisStream, SessionError> {
        let (tx, rx) = mpsc::channel(256);
        let this = self.clone();
        let voice = voice.clone();

        tokio::spawn(async move {
            let mut chunker = SentenceChunker::default();
            let mut offset = Duration::ZERO;
            let mut finished = false;
            while !finished {
                let sentences: Vec<String> = match text.next().await {
                    Some(delta) => chunker.push(&delta),
                    None => {
                        finished = true;
                        chunker.flush().into_iter().collect()
                    }
                };
                for sentence in sentences {
                    debug!(chars = sentence.len(), "Synthesizing sentence");
                    let samples = match this.speak(&sentence, &voice).await {
                        Ok(samples) => samples,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    let frames = split_frames(&samples, this.config.sample_rate, this.config.frame_ms, offset);
                    let mut label = Some(sentence);
                    for frame in frames {
                        offset += frame.duration();
                        let chunk = SynthesizedChunk {
                            frame,
                            text: label.take(),
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
