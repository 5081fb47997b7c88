//! JSON wire protocol shared by both legs of the pipeline.
//!
//! Every frame is a JSON text message carrying a `type` discriminant. The
//! message set is closed: both directions are modeled as tagged unions so
//! dispatch is a single exhaustive `match`, and extending the protocol means
//! adding a variant rather than another string comparison.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message whose shape is not part of the protocol.
#[derive(Error, Debug)]
#[error("Unrecognized message shape: {0}")]
pub struct ProtocolError(#[from] serde_json::Error);

/// Messages travelling client -> relay -> upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// The one-shot session configuration sent by the relay immediately after
    /// the upstream connection opens, before any audio is relayed.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },

    /// One captured audio frame, PCM16 mono in transport-text form.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
}

/// Messages travelling upstream -> relay -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// The upstream confirmed the session; streaming may begin.
    #[serde(rename = "session.created")]
    SessionCreated,

    /// A chunk of synthesized speech, PCM16 in transport-text form.
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },

    /// Incremental transcript of the synthesized speech.
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { delta: String },

    /// Completed transcript of one synthesized utterance.
    #[serde(rename = "response.audio_transcript.done")]
    ResponseAudioTranscriptDone { transcript: String },

    /// Transcript of the user's own speech.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted { transcript: String },

    #[serde(rename = "error")]
    Error { error: ErrorDetail },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
}

/// The `session` payload of a `session.update` event. Built from a validated
/// [`crate::config::SessionConfig`] rather than written inline, so parameter
/// changes stay reviewable apart from relay wiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionSettings,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl ServerEvent {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
