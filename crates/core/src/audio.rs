//! PCM frame transport between the participant and a session.
//!
//! The orchestrator treats frames as opaque: it forwards input frames to the
//! detectors and the transcriber, and output frames from the synthesizer to
//! an [`AudioOutput`]. Nothing here interprets codec internals.

use crate::error::{Collaborator, SessionError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One mono PCM16 frame with its position in the stream it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Arc<[i16]>,
    pub sample_rate: u32,
    /// Offset from the start of the stream.
    pub timestamp: Duration,
}

impl AudioFrame {
    pub fn new(samples: impl Into<Arc<[i16]>>, sample_rate: u32, timestamp: Duration) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            timestamp,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Root-mean-square level in dBFS; silence is clamped to -100 dB.
    pub fn level_db(&self) -> f32 {
        if self.samples.is_empty() {
            return -100.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = s as f64 / 32768.0;
                v * v
            })
            .sum();
        let rms = (sum / self.samples.len() as f64).sqrt();
        if rms <= 1e-5 {
            -100.0
        } else {
            (20.0 * rms.log10()) as f32
        }
    }
}

/// Sink for synthesized audio on its way to the participant.
///
/// A frame handed to `play` counts as committed: it is never retracted, even
/// if the generation that produced it is interrupted afterwards.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play(&self, frame: AudioFrame) -> Result<(), SessionError>;
}

/// [`AudioOutput`] backed by a channel; the receiving end belongs to the transport.
pub struct ChannelOutput {
    tx: mpsc::Sender<AudioFrame>,
}

impl ChannelOutput {
    pub fn new(tx: mpsc::Sender<AudioFrame>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl AudioOutput for ChannelOutput {
    async fn play(&self, frame: AudioFrame) -> Result<(), SessionError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| SessionError::transport(Collaborator::AudioOutput, "output closed"))
    }
}

/// Bidirectional frame transport for one session.
pub struct AudioFrameBus {
    pub input: mpsc::Receiver<AudioFrame>,
    pub output: Arc<dyn AudioOutput>,
}

/// The transport-side ends of an [`AudioFrameBus::channel`].
pub struct BusPeer {
    /// Push participant audio here.
    pub input: mpsc::Sender<AudioFrame>,
    /// Synthesized audio for the participant arrives here.
    pub output: mpsc::Receiver<AudioFrame>,
}

impl AudioFrameBus {
    pub fn channel(capacity: usize) -> (AudioFrameBus, BusPeer) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let bus = AudioFrameBus {
            input: in_rx,
            output: Arc::new(ChannelOutput::new(out_tx)),
        };
        let peer = BusPeer {
            input: in_tx,
            output: out_rx,
        };
        (bus, peer)
    }
}

/// Decodes little-endian PCM16 bytes; a trailing odd byte is dropped.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Splits a PCM16 buffer into frames of `frame_ms`, starting at `start`.
pub fn split_frames(
    samples: &[i16],
    sample_rate: u32,
    frame_ms: u32,
    start: Duration,
) -> Vec<AudioFrame> {
    let per_frame = ((sample_rate as u64 * frame_ms as u64) / 1000).max(1) as usize;
    let step = Duration::from_millis(frame_ms as u64);
    samples
        .chunks(per_frame)
        .enumerate()
        .map(|(i, chunk)| AudioFrame::new(chunk.to_vec(), sample_rate, start + step * i as u32))
        .collect()
}

/// Wraps mono PCM16 samples in a 16-bit WAV container for upload.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend_from_slice(&pcm16_to_le_bytes(samples));
    buf
}
