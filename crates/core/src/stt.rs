//! Streaming speech-to-text.
//!
//! A transcription is opened per utterance: the orchestrator pushes frames into
//! [`TranscriptionSession::audio`] and drops the sender when the turn ends;
//! the delta stream ends once the provider has flushed its last segment.

use crate::audio::{AudioFrame, encode_wav};
use crate::error::{Collaborator, SessionError};
use futures::Stream;
use serde::Deserialize;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptDelta {
    pub text: String,
    /// Final segments are never revised; interim ones are replaced by the next delta.
    pub is_final: bool,
}

impl TranscriptDelta {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_segment(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

pub type TranscriptStream = Pin<Box<dyn Stream<Item = Result<TranscriptDelta, SessionError>> + Send>>;

pub struct TranscriptionSession {
    pub audio: mpsc::Sender<AudioFrame>,
    pub deltas: TranscriptStream,
}

pub trait Transcriber: Send + Sync {
    /// Starts a transcription for one utterance. Connection work happens lazily
    /// so this never blocks the caller; failures surface on the delta stream.
    fn open(&self, language: &str) -> TranscriptionSession;
}

/// Settings for an OpenAI-compatible transcription endpoint.
#[derive(Debug, Clone)]
pub struct HttpTranscriberConfig {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub request_timeout: Duration,
}

/// Uploads the whole utterance as WAV once its audio input closes and emits a
/// single final segment.
#[derive(Clone)]
pub struct HttpTranscriber {
    config: HttpTranscriberConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

impl HttpTranscriber {
    pub fn new(config: HttpTranscriberConfig) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SessionError::transport(Collaborator::Transcriber, e.to_string()))?;
        Ok(Self { config, client })
    }

    async fn transcribe(&self, samples: Vec<i16>, sample_rate: u32, language: &str) -> Result<String, SessionError> {
        let err = |e: reqwest::Error| SessionError::transport(Collaborator::Transcriber, e.to_string());
        let wav = encode_wav(&samples, sample_rate);
        let url = format!("{}/audio/transcriptions", self.config.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(err)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("language", language.to_string());
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(err)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::transport(
                Collaborator::Transcriber,
                format!("transcription API error {}: {}", status, body),
            ));
        }
        let parsed: TranscriptionResponse = response.json().await.map_err(err)?;
        Ok(parsed.text.trim().to_string())
    }
}

impl Transcriber for HttpTranscriber {
    fn open(&self, language: &str) -> TranscriptionSession {
        let (audio_tx, mut audio_rx) = mpsc::channel::<AudioFrame>(512);
        let (delta_tx, delta_rx) = mpsc::channel(4);
        let this = self.clone();
        let language = language.to_string();

        tokio::spawn(async move {
            let mut samples = Vec::new();
            let mut sample_rate = 16000;
            while let Some(frame) = audio_rx.recv().await {
                sample_rate = frame.sample_rate;
                samples.extend_from_slice(&frame.samples);
            }
            if samples.is_empty() {
                return;
            }
            debug!(samples = samples.len(), "Uploading utterance for transcription");
            let item = this
                .transcribe(samples, sample_rate, &language)
                .await
                .map(TranscriptDelta::final_segment);
            if delta_tx.send(item).await.is_err() {
                warn!("Transcription finished after the utterance was abandoned.");
            }
        });

        TranscriptionSession {
            audio: audio_tx,
            deltas: Box::pin(ReceiverStream::new(delta_rx)),
        }
    }
}
