//! Physical audio endpoints
//!
//! A microphone endpoint captures blocks from a cpal input stream onto
//! the loop thread; a speaker endpoint plays queued samples through a
//! cpal output stream. Open and close are idempotent, and a closed
//! endpoint holds no native stream at all, which is what lets the
//! arbiter repeat the half-duplex device switch safely.

use std::collections::VecDeque;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::SampleFormat;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::audio::device::{input_device, output_device};
use crate::audio::SampleBlock;
use crate::constants::PLAYBACK_QUEUE_MAX_SAMPLES;
use crate::error::AudioError;

/// A physical audio device the arbiter can open and close
pub trait AudioEndpoint {
    /// Open the device. Opening an already-open endpoint is a no-op.
    fn open(&mut self) -> Result<(), AudioError>;
    /// Close the device. Closing an already-closed endpoint is a no-op.
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

/// Capture endpoint: cpal input stream delivering sample blocks onto the
/// loop thread through an unbounded channel
pub struct MicrophoneEndpoint {
    device_name: Option<String>,
    blocks: UnboundedSender<SampleBlock>,
    error_tx: Sender<AudioError>,
    error_rx: Receiver<AudioError>,
    stream: Option<cpal::Stream>,
}

impl MicrophoneEndpoint {
    pub fn new(device_name: Option<String>, blocks: UnboundedSender<SampleBlock>) -> Self {
        let (error_tx, error_rx) = bounded(16);
        Self {
            device_name,
            blocks,
            error_tx,
            error_rx,
            stream: None,
        }
    }

    /// Drain one stream error reported by the audio callback thread
    pub fn take_error(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl AudioEndpoint for MicrophoneEndpoint {
    fn open(&mut self) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device = input_device(self.device_name.as_deref())?;
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;
        if supported.sample_format() != SampleFormat::F32 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?}",
                supported.sample_format()
            )));
        }

        let config = supported.config();
        let blocks = self.blocks.clone();
        let error_tx = self.error_tx.clone();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let _ = blocks.send(data.to_vec());
                },
                move |err| {
                    let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        tracing::debug!("microphone opened");
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("microphone closed");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Bounded playback buffer shared with the output stream callback.
///
/// Overflow discards the oldest samples so playback never falls further
/// behind than the queue capacity; underrun plays silence.
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<Mutex<VecDeque<f32>>>,
}

impl PlaybackQueue {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push_block(&self, samples: &[f32]) {
        let mut queue = self.inner.lock();
        queue.extend(samples.iter().copied());
        let excess = queue.len().saturating_sub(PLAYBACK_QUEUE_MAX_SAMPLES);
        if excess > 0 {
            queue.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn fill(&self, out: &mut [f32]) {
        let mut queue = self.inner.lock();
        for slot in out.iter_mut() {
            *slot = queue.pop_front().unwrap_or(0.0);
        }
    }
}

/// Playback endpoint: cpal output stream fed from a [`PlaybackQueue`]
pub struct SpeakerEndpoint {
    device_name: Option<String>,
    queue: PlaybackQueue,
    error_tx: Sender<AudioError>,
    error_rx: Receiver<AudioError>,
    stream: Option<cpal::Stream>,
}

impl SpeakerEndpoint {
    pub fn new(device_name: Option<String>) -> Self {
        let (error_tx, error_rx) = bounded(16);
        Self {
            device_name,
            queue: PlaybackQueue::new(),
            error_tx,
            error_rx,
            stream: None,
        }
    }

    /// Handle for feeding samples to this endpoint. The queue survives
    /// close/open cycles, so buffered audio is not lost across a
    /// half-duplex switch.
    pub fn queue(&self) -> PlaybackQueue {
        self.queue.clone()
    }

    /// Drain one stream error reported by the audio callback thread
    pub fn take_error(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl AudioEndpoint for SpeakerEndpoint {
    fn open(&mut self) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device = output_device(self.device_name.as_deref())?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;
        if supported.sample_format() != SampleFormat::F32 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?}",
                supported.sample_format()
            )));
        }

        let config = supported.config();
        let queue = self.queue.clone();
        let error_tx = self.error_tx.clone();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    queue.fill(data);
                },
                move |err| {
                    let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        tracing::debug!("speaker opened");
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("speaker closed");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
