use secrecy::{ExposeSecret, SecretBox};
use std::env;
use thiserror::Error;
use url::Url;

use crate::protocol::{SessionUpdate, TranscriptionSettings, TurnDetection};

/// Version of the session configuration contract. Bump when the shape of the
/// `session.update` payload changes.
pub const SESSION_CONFIG_VERSION: u32 = 1;

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8787";

const UPSTREAM_ENDPOINT: &str = "wss://api.openai.com/v1/realtime";
const UPSTREAM_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";
const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Process-wide relay configuration. The upstream credential is read once at
/// startup and immutable afterwards; it is the only state shared across
/// client connections.
#[derive(Debug)]
pub struct RelayConfig {
    pub bind_address: String,
    pub upstream_url: Url,
    api_key: Option<SecretBox<String>>,
    pub session: SessionConfig,
}

impl RelayConfig {
    /// Load relay configuration from the environment.
    ///
    /// A missing credential does not fail the load: the relay still serves,
    /// answering upgrade attempts with a configuration error until the
    /// credential is provided.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let api_key = match env::var(API_KEY_ENV_VAR) {
            Ok(key) => {
                if key.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "api_key",
                        reason: format!("{} is set but empty", API_KEY_ENV_VAR),
                    });
                }
                Some(SecretBox::new(Box::new(key)))
            }
            Err(_) => {
                log::warn!(
                    "{} not set, client connections will be rejected",
                    API_KEY_ENV_VAR
                );
                None
            }
        };

        let session = SessionConfig::default();
        session.validate()?;

        Ok(Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            upstream_url: default_upstream_url()?,
            api_key,
            session,
        })
    }

    /// Build a configuration with an explicit credential, bypassing the
    /// environment. Used by tests and embedders.
    pub fn with_api_key(api_key: Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            upstream_url: default_upstream_url()?,
            api_key: api_key.map(|key| SecretBox::new(Box::new(key))),
            session: SessionConfig::default(),
        })
    }

    /// Get the upstream credential, or the configuration error a client
    /// connection should be rejected with.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_ref()
            .map(|key| key.expose_secret().as_str())
            .ok_or_else(|| ConfigError::MissingEnvVar(API_KEY_ENV_VAR.to_string()))
    }
}

fn default_upstream_url() -> Result<Url, ConfigError> {
    let mut url = Url::parse(UPSTREAM_ENDPOINT)?;
    url.query_pairs_mut().append_pair("model", UPSTREAM_MODEL);
    Ok(url)
}

/// The session parameters sent upstream in the one-shot `session.update`
/// handshake. A validated structure rather than an inline payload literal, so
/// voice and turn-detection changes are reviewable on their own.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub voice: String,
    pub instructions: String,
    pub transcription_model: String,
    pub turn_detection: TurnDetectionConfig,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnDetectionConfig {
    /// Voice-activity threshold in [0, 1].
    pub threshold: f32,
    /// Audio retained from before detected speech onset.
    pub prefix_padding_ms: u32,
    /// Trailing silence that ends a conversational turn.
    pub silence_duration_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            instructions: "You are a helpful voice assistant for marketplace sellers. \
                           You answer questions about onboarding and verification \
                           documents, product listings, inventory, order processing, \
                           payments, and product bundles. Be clear, concise, and helpful."
                .to_string(),
            transcription_model: "whisper-1".to_string(),
            turn_detection: TurnDetectionConfig {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 1000,
            },
            temperature: 0.8,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.voice.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "voice",
                reason: "voice persona cannot be empty".to_string(),
            });
        }
        if self.transcription_model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "transcription_model",
                reason: "transcription model cannot be empty".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.turn_detection.threshold) {
            return Err(ConfigError::InvalidValue {
                field: "turn_detection.threshold",
                reason: format!(
                    "threshold {} outside [0.0, 1.0]",
                    self.turn_detection.threshold
                ),
            });
        }
        if self.turn_detection.silence_duration_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "turn_detection.silence_duration_ms",
                reason: "silence duration must be positive".to_string(),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidValue {
                field: "temperature",
                reason: format!("temperature {} outside [0.0, 2.0]", self.temperature),
            });
        }
        Ok(())
    }

    /// Produce the wire payload for the upstream handshake. Audio format is
    /// fixed to PCM16 in both directions, matching the rest of the pipeline.
    pub fn to_session_update(&self) -> SessionUpdate {
        SessionUpdate {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionSettings {
                model: self.transcription_model.clone(),
            },
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
                threshold: self.turn_detection.threshold,
                prefix_padding_ms: self.turn_detection.prefix_padding_ms,
                silence_duration_ms: self.turn_detection.silence_duration_ms,
            },
            temperature: self.temperature,
        }
    }
}
