//! Microphone capture.
//!
//! A capture thread owns the cpal device and stream; the realtime callback
//! only assembles fixed-size frames and pushes them onto a bounded channel.
//! A single consumer task on the session side drains the channel, which keeps
//! shutdown ordering and backpressure explicit instead of hiding them in
//! callback lifetimes.

use crate::pcm;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, SupportedStreamConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::mpsc;

/// Samples per frame. At 24kHz this is ~171ms of audio per frame.
pub const FRAME_SAMPLES: usize = 4096;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// One batch of mono f32 samples in [-1, 1], produced by a single capture
/// callback cycle. Immutable once emitted and not retained past encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
}

/// Microphone capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
    /// Substring match against device names, as reported by the host.
    pub device_name: Option<String>,
    /// Prefer a platform echo-cancelled source when one exists.
    pub echo_cancellation: bool,
    /// Gate frames below the noise floor.
    pub noise_suppression: bool,
    /// Track the input peak and steer it toward a fixed target level.
    pub auto_gain_control: bool,
    /// Capacity of the bounded frame channel. When the consumer lags, the
    /// newest frame is dropped and counted.
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: pcm::SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES,
            device_name: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channel_capacity: 32,
        }
    }
}

/// Source of captured audio frames. The production implementation drives a
/// real microphone; tests drive sessions with scripted frames.
pub trait FrameSource: Send {
    /// Acquire the capture device and begin delivering fixed-size frames on
    /// the returned bounded channel. Acquisition failures are surfaced
    /// synchronously to the caller.
    fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError>;

    /// Release every acquired resource. Safe to call when never started or
    /// after being called already.
    fn stop(&mut self);
}

/// Microphone capture backed by cpal.
pub struct MicCapture {
    config: CaptureConfig,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    dropped_frames: Arc<AtomicU64>,
}

impl MicCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stop_tx: None,
            thread: None,
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Frames dropped because the consumer lagged behind the device.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

impl FrameSource for MicCapture {
    fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        if self.thread.is_some() {
            return Err(CaptureError::Stream("capture already started".to_string()));
        }

        let (frame_tx, frame_rx) = mpsc::channel(self.config.channel_capacity);
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();

        let config = self.config.clone();
        let dropped = Arc::clone(&self.dropped_frames);
        let thread = thread::spawn(move || {
            capture_thread(config, frame_tx, dropped, ready_tx, stop_rx);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(thread);
                log::info!("Capture: microphone stream started");
                Ok(frame_rx)
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::Device(
                    "capture thread exited before acquiring a device".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture: capture thread panicked during shutdown");
            }
            log::info!(
                "Capture: stopped ({} frames dropped)",
                self.dropped_frames.load(Ordering::Relaxed)
            );
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns the device and stream for the lifetime of one capture. Reports the
/// acquisition result through `ready_tx`, then parks until stopped.
fn capture_thread(
    config: CaptureConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
    ready_tx: std_mpsc::Sender<Result<(), CaptureError>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let host = cpal::default_host();

    let result = acquire_stream(&host, &config, frame_tx, dropped);
    let stream = match result {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Park until stop() is called or the MicCapture is dropped.
    let _ = stop_rx.recv();
    drop(stream);
    log::debug!("Capture: device released");
}

fn acquire_stream(
    host: &Host,
    config: &CaptureConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
) -> Result<cpal::Stream, CaptureError> {
    let device = select_input_device(host, config)?;
    let device_name = device
        .name()
        .map_err(|e| CaptureError::Device(format!("failed to get device name: {}", e)))?;
    log::info!("Capture: using input device: {}", device_name);

    let supported = negotiate_config(&device, config)?;
    let channels = supported.channels() as usize;
    let stream_config = supported.config();

    let mut assembler = FrameAssembler::new(config.frame_samples, channels);
    let mut conditioner = Conditioner::new(config.noise_suppression, config.auto_gain_control);

    let mut deliver = move |data: &[f32]| {
        for mut samples in assembler.push(data) {
            conditioner.process(&mut samples);
            if frame_tx.try_send(AudioFrame { samples }).is_err() {
                let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total % 16 == 1 {
                    log::warn!("Capture: consumer lagging, {} frames dropped", total);
                }
            }
        }
    };

    let err_fn = |err| log::error!("Capture: stream error: {}", err);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| deliver(data),
                err_fn,
                None,
            )
            .map_err(|e| CaptureError::Stream(format!("failed to build f32 stream: {}", e)))?,
        SampleFormat::I16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let float_data: Vec<f32> = data
                        .iter()
                        .map(|&sample| sample as f32 / i16::MAX as f32)
                        .collect();
                    deliver(&float_data);
                },
                err_fn,
                None,
            )
            .map_err(|e| CaptureError::Stream(format!("failed to build i16 stream: {}", e)))?,
        SampleFormat::U16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let float_data: Vec<f32> = data
                        .iter()
                        .map(|&sample| {
                            (sample as f32 - u16::MAX as f32 / 2.0) / (u16::MAX as f32 / 2.0)
                        })
                        .collect();
                    deliver(&float_data);
                },
                err_fn,
                None,
            )
            .map_err(|e| CaptureError::Stream(format!("failed to build u16 stream: {}", e)))?,
        format => {
            return Err(CaptureError::Stream(format!(
                "unsupported sample format: {:?}",
                format
            )))
        }
    };

    stream
        .play()
        .map_err(|e| CaptureError::Stream(format!("failed to start stream: {}", e)))?;

    Ok(stream)
}

/// Pick the input device. An explicit name wins; otherwise an echo-cancelled
/// source is preferred when requested (the platform convention is a device
/// name containing "echo-cancel"), falling back to the default input.
fn select_input_device(host: &Host, config: &CaptureConfig) -> Result<Device, CaptureError> {
    if let Some(wanted) = &config.device_name {
        let devices = host
            .input_devices()
            .map_err(|e| CaptureError::Device(format!("failed to enumerate devices: {}", e)))?;
        for device in devices {
            if let Ok(name) = device.name() {
                if name.contains(wanted) {
                    return Ok(device);
                }
            }
        }
        return Err(CaptureError::Device(format!(
            "input device '{}' not found",
            wanted
        )));
    }

    if config.echo_cancellation {
        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name() {
                    if name.contains("echo-cancel") {
                        log::info!("Capture: selected echo-cancelled source: {}", name);
                        return Ok(device);
                    }
                }
            }
        }
        log::debug!("Capture: no echo-cancelled source available, using default input");
    }

    host.default_input_device()
        .ok_or_else(|| CaptureError::Device("no default input device available".to_string()))
}

/// Find a supported configuration, preferring mono at the requested rate,
/// then any channel layout at the requested rate, then the nearest rate.
fn negotiate_config(
    device: &Device,
    config: &CaptureConfig,
) -> Result<SupportedStreamConfig, CaptureError> {
    let supported: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| CaptureError::Device(format!("failed to get supported configs: {}", e)))?
        .collect();

    let rate = cpal::SampleRate(config.sample_rate);

    for range in &supported {
        if range.channels() == 1 && range.min_sample_rate() <= rate && rate <= range.max_sample_rate()
        {
            return Ok(range.with_sample_rate(rate));
        }
    }

    for range in &supported {
        if range.min_sample_rate() <= rate && rate <= range.max_sample_rate() {
            log::debug!(
                "Capture: no mono config at {} Hz, extracting channel 0 of {}",
                config.sample_rate,
                range.channels()
            );
            return Ok(range.with_sample_rate(rate));
        }
    }

    // Last resort: nearest available rate.
    if let Some(range) = supported.first() {
        let clamped = config
            .sample_rate
            .clamp(range.min_sample_rate().0, range.max_sample_rate().0);
        log::warn!(
            "Capture: device cannot run at {} Hz, using {} Hz",
            config.sample_rate,
            clamped
        );
        return Ok(range.with_sample_rate(cpal::SampleRate(clamped)));
    }

    Err(CaptureError::Device(format!(
        "no suitable input configuration at {} Hz",
        config.sample_rate
    )))
}

/// Extracts channel 0 from interleaved input and batches it into fixed-size
/// frames.
struct FrameAssembler {
    frame_samples: usize,
    channels: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    fn new(frame_samples: usize, channels: usize) -> Self {
        Self {
            frame_samples,
            channels: channels.max(1),
            pending: Vec::with_capacity(frame_samples),
        }
    }

    fn push(&mut self, data: &[f32]) -> Vec<Vec<f32>> {
        for frame in data.chunks(self.channels) {
            self.pending.push(frame[0]);
        }

        let mut completed = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            completed.push(std::mem::replace(&mut self.pending, rest));
        }
        completed
    }
}

/// Frame conditioning: a noise gate below a fixed RMS floor and a slow
/// peak-tracking gain toward a target level.
struct Conditioner {
    noise_suppression: bool,
    auto_gain: bool,
    gain: f32,
}

const NOISE_GATE_RMS: f32 = 0.004;
const AGC_TARGET_PEAK: f32 = 0.7;
const AGC_ADAPT_RATE: f32 = 0.05;
const AGC_MIN_GAIN: f32 = 0.5;
const AGC_MAX_GAIN: f32 = 4.0;

impl Conditioner {
    fn new(noise_suppression: bool, auto_gain: bool) -> Self {
        Self {
            noise_suppression,
            auto_gain,
            gain: 1.0,
        }
    }

    fn process(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }

        if self.noise_suppression {
            let rms =
                (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
            if rms < NOISE_GATE_RMS {
                samples.fill(0.0);
                return;
            }
        }

        if self.auto_gain {
            let peak = samples.iter().fold(0.0f32, |max, s| max.max(s.abs()));
            if peak > f32::EPSILON {
                let desired = (AGC_TARGET_PEAK / peak).clamp(AGC_MIN_GAIN, AGC_MAX_GAIN);
                self.gain += AGC_ADAPT_RATE * (desired - self.gain);
            }
            for sample in samples.iter_mut() {
                *sample = (*sample * self.gain).clamp(-1.0, 1.0);
            }
        }
    }
}
