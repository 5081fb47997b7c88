//! Ordered playback of inbound audio chunks.
//!
//! The queue plays chunks strictly in arrival order, one at a time. Each raw
//! PCM16 chunk is framed as a minimal WAV container, decoded, and handed to a
//! [`PlaybackSink`] which plays it to completion before the next chunk is
//! touched. A chunk that fails to decode is logged and skipped without
//! stalling the queue.

use crate::pcm::{self, DecodeError};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Raw PCM16 bytes owned by the queue once enqueued.
pub type PlaybackChunk = Vec<u8>;

/// Pending chunks held before the oldest is dropped. At ~171ms per upstream
/// delta this is well over half a minute of backlog.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Audio output device error: {0}")]
    Device(String),

    #[error("Playback sink is stopped")]
    Stopped,
}

/// Audio output seam. The production implementation drives the default
/// output device through cpal; tests substitute a recording sink.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Play one decoded chunk of 24kHz mono samples to completion.
    async fn play(&self, samples: Vec<f32>) -> Result<(), PlaybackError>;

    /// Stop output and discard anything still buffered. Idempotent.
    async fn stop(&self) -> Result<(), PlaybackError>;
}

struct QueueState {
    chunks: VecDeque<PlaybackChunk>,
    playing: bool,
    dropped: u64,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    cancel: CancellationToken,
}

/// Strictly-ordered, single-at-a-time playback queue.
///
/// Clones share the same queue; one worker task drains it for the lifetime of
/// the queue.
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<QueueInner>,
}

impl PlaybackQueue {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Self {
        Self::with_capacity(sink, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(sink: Arc<dyn PlaybackSink>, capacity: usize) -> Self {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                playing: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_worker(Arc::clone(&inner), sink));

        Self { inner }
    }

    /// Append a chunk. If nothing is currently playing the worker picks it up
    /// immediately; otherwise it plays after everything queued before it.
    /// When the queue is full the oldest pending chunk is dropped.
    pub fn enqueue(&self, chunk: PlaybackChunk) {
        let mut state = self.inner.state.lock().unwrap();
        if state.chunks.len() >= self.inner.capacity {
            state.chunks.pop_front();
            state.dropped += 1;
            log::warn!(
                "Playback: queue full, dropped oldest chunk ({} dropped total)",
                state.dropped
            );
        }
        state.chunks.push_back(chunk);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Empty the queue and reset the playing flag. Only meaningful as part of
    /// full teardown, where the sink is stopped as well, so nothing keeps
    /// draining afterwards.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.chunks.clear();
        state.playing = false;
    }

    /// Stop the worker task. Called during teardown after [`clear`].
    ///
    /// [`clear`]: PlaybackQueue::clear
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.notify.notify_one();
    }

    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().unwrap().playing
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().unwrap().chunks.len()
    }

    /// Chunks discarded by the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.inner.state.lock().unwrap().dropped
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        // Last handle going away also releases the worker.
        if Arc::strong_count(&self.inner) <= 2 {
            self.shutdown();
        }
    }
}

async fn run_worker(inner: Arc<QueueInner>, sink: Arc<dyn PlaybackSink>) {
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let chunk = {
            let mut state = inner.state.lock().unwrap();
            match state.chunks.pop_front() {
                Some(chunk) => {
                    state.playing = true;
                    Some(chunk)
                }
                None => {
                    state.playing = false;
                    None
                }
            }
        };

        match chunk {
            Some(chunk) => match decode_chunk(&chunk) {
                Ok(samples) => {
                    if let Err(e) = sink.play(samples).await {
                        log::warn!("Playback: sink rejected chunk: {}", e);
                    }
                }
                Err(e) => {
                    log::warn!("Playback: skipping undecodable chunk: {}", e);
                }
            },
            None => {
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if inner.cancel.is_cancelled() {
                    break;
                }
                notified.await;
            }
        }
    }

    let mut state = inner.state.lock().unwrap();
    state.playing = false;
    log::debug!("Playback: worker stopped");
}

/// Frame the raw PCM16 bytes as a WAV container and decode it back into
/// playable samples.
fn decode_chunk(chunk: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if chunk.is_empty() || chunk.len() % 2 != 0 {
        return Err(DecodeError::Container(format!(
            "PCM16 payload must be a positive even number of bytes, got {}",
            chunk.len()
        )));
    }

    let wav = pcm::pcm16_to_wav(chunk);
    let mut reader =
        hound::WavReader::new(Cursor::new(wav)).map_err(|e| DecodeError::Container(e.to_string()))?;

    let samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
    let samples = samples.map_err(|e| DecodeError::Container(e.to_string()))?;

    Ok(samples
        .into_iter()
        .map(|s| s as f32 / 0x8000 as f32)
        .collect())
}

struct SinkShared {
    /// 24kHz mono samples waiting to be rendered by the output callback.
    queue: Mutex<VecDeque<f32>>,
    /// Signalled whenever the callback drains the buffer empty.
    drained: Notify,
    stopped: AtomicBool,
}

/// Playback sink driving the default output device through cpal. A dedicated
/// thread owns the device and stream; the output callback renders queued
/// samples with linear interpolation up to the device rate, so the sink works
/// against whatever configuration the device prefers.
pub struct CpalSink {
    shared: Arc<SinkShared>,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalSink {
    pub fn new() -> Result<Self, PlaybackError> {
        let shared = Arc::new(SinkShared {
            queue: Mutex::new(VecDeque::new()),
            drained: Notify::new(),
            stopped: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();

        let thread_shared = Arc::clone(&shared);
        let thread = thread::spawn(move || output_thread(thread_shared, ready_tx, stop_rx));

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                stop_tx: Mutex::new(Some(stop_tx)),
                thread: Mutex::new(Some(thread)),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(PlaybackError::Device(
                    "output thread exited before acquiring a device".to_string(),
                ))
            }
        }
    }
}

fn output_thread(
    shared: Arc<SinkShared>,
    ready_tx: std_mpsc::Sender<Result<(), PlaybackError>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(device) => device,
        None => {
            let _ = ready_tx.send(Err(PlaybackError::Device(
                "no default output device available".to_string(),
            )));
            return;
        }
    };

    let supported = match device.default_output_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready_tx.send(Err(PlaybackError::Device(e.to_string())));
            return;
        }
    };
    log::debug!("Playback: output config: {:?}", supported);

    let output_rate = supported.sample_rate().0;
    let output_channels = supported.channels() as usize;
    let callback_shared = Arc::clone(&shared);

    let stream = device.build_output_stream(
        &supported.config(),
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            render(&callback_shared, data, output_channels, output_rate);
        },
        |err| log::error!("Playback: stream error: {}", err),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(PlaybackError::Device(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(PlaybackError::Device(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // Park until stopped or dropped; the stream keeps rendering meanwhile.
    let _ = stop_rx.recv();
    drop(stream);
    log::debug!("Playback: output device released");
}

/// Fill one output buffer from the 24kHz queue, interpolating between
/// neighbouring input samples and duplicating across output channels.
fn render(shared: &SinkShared, data: &mut [f32], output_channels: usize, output_rate: u32) {
    let mut queue = shared.queue.lock().unwrap();
    let was_empty = queue.is_empty();

    let step = pcm::SAMPLE_RATE as f32 / output_rate as f32;
    let mut position = 0.0f32;

    for frame in data.chunks_mut(output_channels) {
        let sample = if queue.is_empty() {
            0.0
        } else {
            let floor = position.floor() as usize;
            let fract = position.fract();
            let current = queue.get(floor).copied().unwrap_or(0.0);
            let next = queue.get(floor + 1).copied().unwrap_or(current);
            current * (1.0 - fract) + next * fract
        };

        for channel in frame.iter_mut() {
            *channel = sample;
        }
        position += step;
    }

    let consumed = (position.ceil() as usize).min(queue.len());
    queue.drain(0..consumed);

    if queue.is_empty() && !was_empty {
        shared.drained.notify_waiters();
    }
}

#[async_trait]
impl PlaybackSink for CpalSink {
    async fn play(&self, samples: Vec<f32>) -> Result<(), PlaybackError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(PlaybackError::Stopped);
        }

        self.shared.queue.lock().unwrap().extend(samples);

        // Completion: wait until the output callback has drained everything.
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.stopped.load(Ordering::Acquire) {
                return Err(PlaybackError::Stopped);
            }
            if self.shared.queue.lock().unwrap().is_empty() {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn stop(&self) -> Result<(), PlaybackError> {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.queue.lock().unwrap().clear();
        self.shared.drained.notify_waiters();

        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(());
        }
        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(());
        }
        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Sink that records chunk lengths in play order and verifies that two
    /// chunks are never played concurrently. When gated, each play blocks
    /// until explicitly released.
    struct RecordingSink {
        played: Mutex<Vec<usize>>,
        active: AtomicBool,
        overlaps: AtomicUsize,
        gate: Option<tokio::sync::Semaphore>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                played: Mutex::new(Vec::new()),
                active: AtomicBool::new(false),
                overlaps: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn gated() -> Arc<Self> {
            Arc::new(Self {
                played: Mutex::new(Vec::new()),
                active: AtomicBool::new(false),
                overlaps: AtomicUsize::new(0),
                gate: Some(tokio::sync::Semaphore::new(0)),
            })
        }

        fn release(&self, count: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(count);
            }
        }
    }

    #[async_trait]
    impl PlaybackSink for RecordingSink {
        async fn play(&self, samples: Vec<f32>) -> Result<(), PlaybackError> {
            if self.active.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            match &self.gate {
                Some(gate) => {
                    gate.acquire().await.unwrap().forget();
                }
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
            self.played.lock().unwrap().push(samples.len());
            self.active.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), PlaybackError> {
            Ok(())
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    fn chunk_of(samples: usize) -> PlaybackChunk {
        vec![0u8; samples * 2]
    }

    #[tokio::test]
    async fn test_chunks_play_in_arrival_order() {
        let sink = RecordingSink::new();
        let queue = PlaybackQueue::new(sink.clone());

        for size in [10, 20, 30, 40, 50] {
            queue.enqueue(chunk_of(size));
        }

        wait_until(|| sink.played.lock().unwrap().len() == 5).await;
        assert_eq!(*sink.played.lock().unwrap(), vec![10, 20, 30, 40, 50]);
        assert_eq!(sink.overlaps.load(Ordering::SeqCst), 0);
        wait_until(|| !queue.is_playing()).await;
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_undecodable_chunk_is_skipped() {
        let sink = RecordingSink::new();
        let queue = PlaybackQueue::new(sink.clone());

        queue.enqueue(chunk_of(10));
        queue.enqueue(vec![0u8; 3]); // odd length, not valid PCM16
        queue.enqueue(chunk_of(20));

        wait_until(|| sink.played.lock().unwrap().len() == 2).await;
        assert_eq!(*sink.played.lock().unwrap(), vec![10, 20]);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_clear_empties_queue_and_resets_flag() {
        let sink = RecordingSink::new();
        let queue = PlaybackQueue::new(sink.clone());

        for _ in 0..10 {
            queue.enqueue(chunk_of(100));
        }
        queue.clear();

        assert_eq!(queue.pending(), 0);
        assert!(!queue.is_playing());
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_drop_oldest_when_full() {
        // Gated sink: the worker stays blocked on the first chunk while the
        // queue fills past capacity.
        let sink = RecordingSink::gated();
        let queue = PlaybackQueue::with_capacity(sink.clone(), 2);

        queue.enqueue(chunk_of(1));
        wait_until(|| queue.is_playing()).await;

        queue.enqueue(chunk_of(2));
        queue.enqueue(chunk_of(3));
        queue.enqueue(chunk_of(4)); // evicts chunk 2

        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.dropped(), 1);

        sink.release(3);
        wait_until(|| sink.played.lock().unwrap().len() == 3).await;
        assert_eq!(*sink.played.lock().unwrap(), vec![1, 3, 4]);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_enqueue_while_draining_appends() {
        // Gated sink keeps the first chunk draining while the second arrives.
        let sink = RecordingSink::gated();
        let queue = PlaybackQueue::new(sink.clone());

        queue.enqueue(chunk_of(5));
        wait_until(|| queue.is_playing()).await;
        queue.enqueue(chunk_of(6));

        sink.release(2);
        wait_until(|| sink.played.lock().unwrap().len() == 2).await;
        assert_eq!(*sink.played.lock().unwrap(), vec![5, 6]);
        queue.shutdown();
    }

    #[test]
    fn test_decode_chunk_round_trip() {
        let pcm = pcm::floats_to_pcm16(&[0.5, -0.5, 0.25]);
        let samples = decode_chunk(&pcm).unwrap();
        assert_eq!(samples.len(), 3);
        assert!((samples[0] - 0.5).abs() < 0.001);
        assert!((samples[1] + 0.5).abs() < 0.001);
    }

    #[test]
    fn test_decode_chunk_rejects_odd_length() {
        assert!(decode_chunk(&[1, 2, 3]).is_err());
        assert!(decode_chunk(&[]).is_err());
    }

    // Requires a real output device.
    #[cfg(feature = "test-audio")]
    #[serial_test::serial]
    #[tokio::test]
    async fn test_cpal_sink_play_and_stop() {
        match CpalSink::new() {
            Ok(sink) => {
                let samples: Vec<f32> = (0..2400)
                    .map(|i| {
                        (2.0 * std::f32::consts::PI * 440.0 * i as f32 / pcm::SAMPLE_RATE as f32)
                            .sin()
                            * 0.1
                    })
                    .collect();
                sink.play(samples).await.unwrap();
                sink.stop().await.unwrap();
                assert!(matches!(
                    sink.play(vec![0.0; 10]).await,
                    Err(PlaybackError::Stopped)
                ));
            }
            Err(e) => {
                log::warn!("no output device available in test environment: {}", e);
            }
        }
    }
}
