pub mod capture;
pub mod config;
pub mod pcm;
pub mod playback;
pub mod protocol;
pub mod relay;
pub mod session;

pub use capture::CaptureError;
pub use config::ConfigError;
pub use pcm::DecodeError;
pub use playback::PlaybackError;
pub use protocol::ProtocolError;
pub use relay::RelayError;
pub use session::{SessionError, SessionEvent, SessionState, TranscriptEvent};
