//! Client-side connection state machine.
//!
//! A [`SessionClient`] connects to the relay, waits for the upstream session
//! to be confirmed, and only then starts microphone capture. One task owns
//! the inbound half of the socket and demultiplexes messages strictly in
//! arrival order; a second task drains captured frames outbound while the
//! session is streaming. [`SessionClient::connect`] resolves exactly once on
//! entering [`SessionState::Streaming`] and returns the owned [`Session`]
//! handle required for `disconnect()`.

use crate::capture::{AudioFrame, CaptureConfig, CaptureError, FrameSource, MicCapture};
use crate::pcm;
use crate::playback::{CpalSink, PlaybackQueue, PlaybackSink};
use crate::protocol::{ClientEvent, ServerEvent};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<tokio::sync::Mutex<SplitSink<WsStream, Message>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingSession,
    Streaming,
    Closing,
    Closed,
    Failed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// Microphone or audio output unavailable, or permission denied.
    #[error("Audio device unavailable: {0}")]
    Device(String),

    /// The socket failed to open, or failed before the session was confirmed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The relay reported an error instead of confirming a session.
    #[error("Session was not established: {0}")]
    Session(String),
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        SessionError::Device(err.to_string())
    }
}

/// Transcript text from either side of the conversation. `is_final` is true
/// only for the completed transcript of a synthesized utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Transcript(TranscriptEvent),
    /// An error the upstream reported mid-session. Does not end the session
    /// by itself.
    UpstreamError { message: String },
    /// The session ended, by `disconnect()` or by the connection dropping.
    Disconnected,
}

/// Connection builder. Audio endpoints default to the real microphone and
/// output device; tests substitute scripted implementations.
pub struct SessionClient {
    relay_url: String,
    capture: Option<Box<dyn FrameSource>>,
    sink: Option<Arc<dyn PlaybackSink>>,
}

impl SessionClient {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            capture: None,
            sink: None,
        }
    }

    pub fn with_capture(mut self, capture: Box<dyn FrameSource>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn PlaybackSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Open the connection and wait for the upstream session.
    ///
    /// Resolves once, on entering [`SessionState::Streaming`] (which is also
    /// the sole trigger that starts capture), or rejects once with the reason
    /// the session could not be established. No timeout is imposed here;
    /// callers needing bounded latency wrap this in their own.
    pub async fn connect(self) -> Result<Session, SessionError> {
        let state = Arc::new(Mutex::new(SessionState::Idle));
        set_state(&state, SessionState::Connecting);
        log::info!("Session: connecting to {}", self.relay_url);

        let sink: Arc<dyn PlaybackSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(CpalSink::new().map_err(|e| {
                set_state(&state, SessionState::Failed);
                log::error!("Session: audio output unavailable: {}", e);
                SessionError::Device(e.to_string())
            })?),
        };
        let capture = self
            .capture
            .unwrap_or_else(|| Box::new(MicCapture::new(CaptureConfig::default())));

        let (ws, _) = connect_async(self.relay_url.as_str()).await.map_err(|e| {
            set_state(&state, SessionState::Failed);
            log::error!("Session: connection failed: {}", e);
            SessionError::Connection(e.to_string())
        })?;
        set_state(&state, SessionState::AwaitingSession);
        log::debug!("Session: socket open, waiting for session confirmation");

        let queue = PlaybackQueue::new(Arc::clone(&sink));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        // If this future is dropped before the handle exists, the guard
        // cancels the session task so nothing stays acquired.
        let guard = cancel.clone().drop_guard();

        let task = tokio::spawn(drive_session(
            ws,
            Arc::clone(&state),
            events_tx,
            queue,
            sink,
            capture,
            ready_tx,
            cancel.clone(),
        ));

        match ready_rx.await {
            Ok(Ok(())) => {
                guard.disarm();
                Ok(Session {
                    state,
                    events: events_rx,
                    cancel,
                    task: Some(task),
                })
            }
            Ok(Err(e)) => {
                log::error!("Session: connect rejected: {}", e);
                Err(e)
            }
            Err(_) => Err(SessionError::Connection(
                "session task ended before confirmation".to_string(),
            )),
        }
    }
}

/// Owned handle to a streaming session. Dropping the handle tears the
/// session down in the background; [`Session::disconnect`] does so
/// synchronously.
pub struct Session {
    state: Arc<Mutex<SessionState>>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Next transcript or error event, `None` once the session is over and
    /// drained.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Tear the session down: stop capture, clear and stop playback, close
    /// the socket. Idempotent: calling it again (or after an unexpected
    /// close) is a no-op.
    pub async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if task.await.is_err() {
                log::error!("Session: session task panicked during shutdown");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How the inbound loop ended.
enum Outcome {
    /// `disconnect()` was called or the handle was dropped.
    Disconnect,
    /// The remote closed the socket.
    RemoteClosed,
    SocketError(String),
    /// The relay sent an error before confirming the session.
    Rejected(String),
    CaptureFailed(CaptureError),
}

#[allow(clippy::too_many_arguments)]
async fn drive_session(
    ws: WsStream,
    state: Arc<Mutex<SessionState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    queue: PlaybackQueue,
    sink: Arc<dyn PlaybackSink>,
    mut capture: Box<dyn FrameSource>,
    ready: oneshot::Sender<Result<(), SessionError>>,
    cancel: CancellationToken,
) {
    let (write, mut read) = ws.split();
    let write: WsSink = Arc::new(tokio::sync::Mutex::new(write));
    let mut ready = Some(ready);
    let mut forwarder: Option<JoinHandle<()>> = None;

    // Inbound messages are handled strictly one at a time in arrival order.
    let outcome = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break Outcome::Disconnect,
            message = read.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let event = match ServerEvent::parse(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("Session: ignoring message: {}", e);
                        continue;
                    }
                };

                match event {
                    ServerEvent::SessionCreated => {
                        if state_of(&state) != SessionState::AwaitingSession {
                            log::warn!("Session: duplicate session confirmation ignored");
                            continue;
                        }
                        match capture.start() {
                            Ok(frames) => {
                                set_state(&state, SessionState::Streaming);
                                log::info!("Session: session established, streaming audio");
                                forwarder = Some(tokio::spawn(forward_frames(
                                    frames,
                                    Arc::clone(&write),
                                    cancel.clone(),
                                )));
                                if let Some(ready) = ready.take() {
                                    let _ = ready.send(Ok(()));
                                }
                            }
                            Err(e) => break Outcome::CaptureFailed(e),
                        }
                    }
                    ServerEvent::ResponseAudioDelta { delta } => {
                        match pcm::transport_text_to_pcm16(&delta) {
                            Ok(chunk) => queue.enqueue(chunk),
                            Err(e) => {
                                log::warn!("Session: dropping undecodable audio delta: {}", e)
                            }
                        }
                    }
                    ServerEvent::ResponseAudioTranscriptDelta { delta } => {
                        let _ = events.send(SessionEvent::Transcript(TranscriptEvent {
                            text: delta,
                            is_final: false,
                        }));
                    }
                    ServerEvent::ResponseAudioTranscriptDone { transcript } => {
                        let _ = events.send(SessionEvent::Transcript(TranscriptEvent {
                            text: transcript,
                            is_final: true,
                        }));
                    }
                    ServerEvent::InputAudioTranscriptionCompleted { transcript } => {
                        let _ = events.send(SessionEvent::Transcript(TranscriptEvent {
                            text: transcript,
                            is_final: false,
                        }));
                    }
                    ServerEvent::Error { error } => {
                        if ready.is_some() {
                            break Outcome::Rejected(error.message);
                        }
                        log::warn!("Session: upstream error: {}", error.message);
                        let _ = events.send(SessionEvent::UpstreamError {
                            message: error.message,
                        });
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break Outcome::RemoteClosed,
            Some(Ok(_)) => {} // binary/ping/pong are not part of the protocol
            Some(Err(e)) => break Outcome::SocketError(e.to_string()),
        }
    };

    // Identical cleanup on every exit path; all of it idempotent.
    let established = ready.is_none();
    if established {
        set_state(&state, SessionState::Closing);
    }

    cancel.cancel();
    capture.stop();
    queue.clear();
    queue.shutdown();
    if let Err(e) = sink.stop().await {
        log::warn!("Session: failed to stop audio output: {}", e);
    }
    {
        let mut write = write.lock().await;
        let _ = write.send(Message::Close(None)).await;
        let _ = write.close().await;
    }
    if let Some(forwarder) = forwarder {
        let _ = forwarder.await;
    }

    if let Some(ready) = ready {
        let error = match outcome {
            Outcome::Rejected(message) => SessionError::Session(message),
            Outcome::SocketError(message) => SessionError::Connection(message),
            Outcome::RemoteClosed => SessionError::Connection(
                "connection closed before the session was established".to_string(),
            ),
            Outcome::CaptureFailed(e) => SessionError::from(e),
            Outcome::Disconnect => SessionError::Connection(
                "connection abandoned before the session was established".to_string(),
            ),
        };
        set_state(&state, SessionState::Failed);
        let _ = ready.send(Err(error));
    } else {
        match outcome {
            Outcome::SocketError(message) => {
                log::error!("Session: socket error: {}", message);
                set_state(&state, SessionState::Failed);
            }
            _ => set_state(&state, SessionState::Closed),
        }
        let _ = events.send(SessionEvent::Disconnected);
    }
}

/// Drain captured frames and forward them as `input_audio_buffer.append`.
/// Runs only while the session is streaming; capture stopping or
/// cancellation ends it.
async fn forward_frames(
    mut frames: mpsc::Receiver<AudioFrame>,
    write: WsSink,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => None,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let pcm_data = pcm::floats_to_pcm16(&frame.samples);
        let event = ClientEvent::InputAudioBufferAppend {
            audio: pcm::pcm16_to_transport_text(&pcm_data),
        };
        let json = serde_json::to_string(&event).unwrap(); // Infallible

        if write.lock().await.send(Message::Text(json.into())).await.is_err() {
            log::warn!("Session: failed to send audio frame, stopping forwarder");
            break;
        }
    }
    log::debug!("Session: frame forwarder stopped");
}

fn state_of(state: &Arc<Mutex<SessionState>>) -> SessionState {
    *state.lock().unwrap()
}

fn set_state(state: &Arc<Mutex<SessionState>>, next: SessionState) {
    let mut current = state.lock().unwrap();
    if *current != next {
        log::debug!("Session: state {} -> {}", current, next);
        *current = next;
    }
}
