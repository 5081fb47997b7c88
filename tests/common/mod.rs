//! Shared helpers for the integration suites: scripted audio endpoints and
//! observation probes, standing in for the real microphone and speakers.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use voice_relay_rs::capture::{AudioFrame, CaptureError, FrameSource};
use voice_relay_rs::playback::{PlaybackError, PlaybackSink};

/// Observation handle for a [`ScriptedCapture`], kept by the test while the
/// capture itself is owned by the session.
#[derive(Clone)]
pub struct CaptureProbe {
    starts: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
}

impl CaptureProbe {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// True while the scripted device is acquired.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Frame source that delivers a fixed script of frames once started, and
/// tracks acquisition state the way a real device would.
pub struct ScriptedCapture {
    frames: Vec<AudioFrame>,
    fail_with: Option<String>,
    starts: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
    frame_tx: Option<mpsc::Sender<AudioFrame>>,
}

impl ScriptedCapture {
    pub fn new(frames: Vec<AudioFrame>) -> (Self, CaptureProbe) {
        let starts = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(false));
        let probe = CaptureProbe {
            starts: Arc::clone(&starts),
            releases: Arc::clone(&releases),
            active: Arc::clone(&active),
        };
        (
            Self {
                frames,
                fail_with: None,
                starts,
                releases,
                active,
                frame_tx: None,
            },
            probe,
        )
    }

    /// A capture whose `start()` fails, as when no microphone is available.
    pub fn failing(reason: &str) -> (Self, CaptureProbe) {
        let (mut capture, probe) = Self::new(Vec::new());
        capture.fail_with = Some(reason.to_string());
        (capture, probe)
    }

    pub fn frames_of(sample_sets: &[&[f32]]) -> Vec<AudioFrame> {
        sample_sets
            .iter()
            .map(|samples| AudioFrame {
                samples: samples.to_vec(),
            })
            .collect()
    }
}

impl FrameSource for ScriptedCapture {
    fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        if let Some(reason) = &self.fail_with {
            return Err(CaptureError::Device(reason.clone()));
        }

        self.starts.fetch_add(1, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(self.frames.len().max(1));
        for frame in &self.frames {
            tx.try_send(frame.clone()).expect("scripted channel sized to fit");
        }
        // Keep the sender so the channel stays open until stop().
        self.frame_tx = Some(tx);
        Ok(rx)
    }

    fn stop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
        self.frame_tx = None;
    }
}

/// Playback sink that records the sample count of each chunk in play order.
pub struct RecordingSink {
    played: Mutex<Vec<usize>>,
    stopped: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            played: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn played(&self) -> Vec<usize> {
        self.played.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackSink for RecordingSink {
    async fn play(&self, samples: Vec<f32>) -> Result<(), PlaybackError> {
        self.played.lock().unwrap().push(samples.len());
        Ok(())
    }

    async fn stop(&self) -> Result<(), PlaybackError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll until `condition` holds, panicking after a generous timeout.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}
