use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;
use voxline_core::config::{ErrorReplyPolicy, Greeting, SessionConfig};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Backend serving the chat completions used for responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
}

impl LlmProvider {
    pub fn api_base(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "https://api.openai.com/v1",
            LlmProvider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }
}

/// An OpenAI-compatible audio endpoint (transcription or speech).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpeechEndpoint {
    pub url: String,
    pub api_key: String,
    pub model: String,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: LlmProvider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub stt: SpeechEndpoint,
    pub tts: SpeechEndpoint,
    pub tts_voice: String,
    pub tool_server_url: Option<String>,
    pub assistant_key: Option<String>,
    pub session: SessionConfig,
    pub log_level: Level,
    pub prompts_path: PathBuf,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name, default.as_millis() as u64).map(Duration::from_millis)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let provider = match var("LLM_PROVIDER").unwrap_or_else(|| "openai".to_string()).to_lowercase().as_str() {
            "openai" => LlmProvider::OpenAI,
            "gemini" => LlmProvider::Gemini,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{}' is not one of openai, gemini", other),
                ));
            }
        };

        let openai_api_key = var("OPENAI_API_KEY");
        let gemini_api_key = var("GEMINI_API_KEY");
        match provider {
            LlmProvider::OpenAI if openai_api_key.is_none() => {
                return Err(ConfigError::MissingVar(
                    "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                ));
            }
            LlmProvider::Gemini if gemini_api_key.is_none() => {
                return Err(ConfigError::MissingVar(
                    "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                ));
            }
            _ => {}
        }

        let chat_model = var("CHAT_MODEL").unwrap_or_else(|| match provider {
            LlmProvider::OpenAI => "gpt-4o".to_string(),
            LlmProvider::Gemini => "gemini-2.0-flash".to_string(),
        });

        // Speech endpoints default to OpenAI and reuse its key.
        let speech_key = |name: &str| {
            var(name).or_else(|| openai_api_key.clone()).ok_or_else(|| {
                ConfigError::MissingVar(format!("{} (or OPENAI_API_KEY) must be set", name))
            })
        };
        let stt = SpeechEndpoint {
            url: var("STT_API_URL").unwrap_or_else(|| LlmProvider::OpenAI.api_base().to_string()),
            api_key: speech_key("STT_API_KEY")?,
            model: var("STT_MODEL").unwrap_or_else(|| "whisper-1".to_string()),
        };
        let tts = SpeechEndpoint {
            url: var("TTS_API_URL").unwrap_or_else(|| LlmProvider::OpenAI.api_base().to_string()),
            api_key: speech_key("TTS_API_KEY")?,
            model: var("TTS_MODEL").unwrap_or_else(|| "tts-1".to_string()),
        };
        let tts_voice = var("TTS_VOICE").unwrap_or_else(|| "alloy".to_string());

        let tool_server_url = var("TOOL_SERVER_URL");
        let assistant_key = var("ASSISTANT_KEY");

        let session = Self::session_from_env()?;

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./prompts"));

        Ok(Self {
            bind_address,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            stt,
            tts,
            tts_voice,
            tool_server_url,
            assistant_key,
            session,
            log_level,
            prompts_path,
        })
    }

    /// Per-session behaviour. Interruptions are off unless enabled.
    fn session_from_env() -> Result<SessionConfig, ConfigError> {
        let defaults = SessionConfig::default();
        let allow_interruptions = parse_var("ALLOW_INTERRUPTIONS", false)?;

        let end_of_turn_threshold = parse_var("END_OF_TURN_THRESHOLD", defaults.end_of_turn_threshold)?;
        if !(0.0..=1.0).contains(&end_of_turn_threshold) {
            return Err(ConfigError::InvalidValue(
                "END_OF_TURN_THRESHOLD".to_string(),
                format!("{} is outside 0.0..=1.0", end_of_turn_threshold),
            ));
        }

        let max_consecutive_failures = parse_var("MAX_CONSECUTIVE_FAILURES", defaults.max_consecutive_failures)?;
        if max_consecutive_failures == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_CONSECUTIVE_FAILURES".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let error_reply = match var("ERROR_REPLY").unwrap_or_else(|| "silent".to_string()).to_lowercase().as_str() {
            "silent" => ErrorReplyPolicy::Silent,
            "apologize" => ErrorReplyPolicy::Apologize(
                var("APOLOGY_TEXT")
                    .unwrap_or_else(|| "Promiňte, něco se pokazilo. Zkuste to prosím znovu.".to_string()),
            ),
            other => {
                return Err(ConfigError::InvalidValue(
                    "ERROR_REPLY".to_string(),
                    format!("'{}' is not one of silent, apologize", other),
                ));
            }
        };

        // The greeting is always heard in full unless explicitly allowed.
        let greeting_interruptible = parse_var("GREETING_ALLOW_INTERRUPTIONS", false)?;
        let greeting = var("GREETING").map(|text| Greeting {
            text,
            allow_interruptions: greeting_interruptible,
        });

        Ok(SessionConfig {
            language: var("LANGUAGE").unwrap_or(defaults.language),
            allow_interruptions,
            end_of_turn_threshold,
            max_silence: millis_var("MAX_SILENCE_MS", defaults.max_silence)?,
            tool_call_timeout: millis_var("TOOL_CALL_TIMEOUT_MS", defaults.tool_call_timeout)?,
            max_consecutive_failures,
            error_reply,
            greeting,
            ..defaults
        })
    }

    /// API key for the configured chat provider.
    pub fn chat_api_key(&self) -> Option<&str> {
        match self.provider {
            LlmProvider::OpenAI => self.openai_api_key.as_deref(),
            LlmProvider::Gemini => self.gemini_api_key.as_deref(),
        }
    }
}
