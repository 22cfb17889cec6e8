//! Shared Application State
//!
//! Process-wide resources built once at startup: the prewarmed VAD model and
//! the collaborator clients every session is assembled from.

use crate::config::Config;
use async_openai::config::OpenAIConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use voxline_core::Collaborators;
use voxline_core::llm::OpenAiCompatibleGenerator;
use voxline_core::stt::{HttpTranscriber, HttpTranscriberConfig};
use voxline_core::tts::{HttpSynthesizer, HttpSynthesizerConfig};
use voxline_core::turn::PunctuationTurnDetector;
use voxline_core::vad::{EnergyVadConfig, EnergyVadModel};

/// Rate of the raw PCM returned by OpenAI-compatible speech endpoints.
const SPEECH_SAMPLE_RATE: u32 = 24000;
const SPEECH_FRAME_MS: u32 = 20;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub collaborators: Collaborators,
    pub system_prompt: Arc<String>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, system_prompt: String) -> anyhow::Result<Self> {
        let api_key = config.chat_api_key().unwrap_or_default();
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(config.provider.api_base());
        let generator = OpenAiCompatibleGenerator::new(openai_config, config.chat_model.clone());

        let transcriber = HttpTranscriber::new(HttpTranscriberConfig {
            base_url: config.stt.url.clone(),
            api_key: config.stt.api_key.clone(),
            model: config.stt.model.clone(),
            request_timeout: REQUEST_TIMEOUT,
        })?;
        let synthesizer = HttpSynthesizer::new(HttpSynthesizerConfig {
            base_url: config.tts.url.clone(),
            api_key: config.tts.api_key.clone(),
            model: config.tts.model.clone(),
            default_voice: config.tts_voice.clone(),
            sample_rate: SPEECH_SAMPLE_RATE,
            frame_ms: SPEECH_FRAME_MS,
            request_timeout: REQUEST_TIMEOUT,
        })?;

        // Loaded once and shared read-only by every session.
        let vad = Arc::new(EnergyVadModel::new(EnergyVadConfig::default()));
        info!("VAD model prewarmed.");

        Ok(Self {
            collaborators: Collaborators {
                vad,
                turn_detector: Arc::new(PunctuationTurnDetector),
                transcriber: Arc::new(transcriber),
                generator: Arc::new(generator),
                synthesizer: Arc::new(synthesizer),
            },
            system_prompt: Arc::new(system_prompt),
            config: Arc::new(config),
        })
    }
}
