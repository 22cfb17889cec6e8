use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::time::Duration;
use voxline_core::audio::AudioFrame;

/// Rate the session pipeline (VAD, transcriber) runs at.
pub const PIPELINE_SAMPLE_RATE: u32 = 16000;
/// Length of the frames handed to a session.
pub const FRAME_MS: u32 = 20;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Resamples a continuous PCM16 stream delivered in arbitrarily sized pieces.
/// Samples that do not yet fill a resampler chunk are held for the next call.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        let resampler = if in_rate == out_rate {
            None
        } else {
            let chunk_size = (in_rate as u64 * FRAME_MS as u64 / 1000) as usize;
            Some(create_resampler(in_rate as f64, out_rate as f64, chunk_size)?)
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    pub fn process(&mut self, samples: &[i16]) -> anyhow::Result<Vec<i16>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };
        self.pending.extend(convert_i16_to_f32(samples));
        let mut out = Vec::new();
        while self.pending.len() >= resampler.input_frames_next() {
            let chunk: Vec<f32> = self.pending.drain(..resampler.input_frames_next()).collect();
            let resampled = resampler.process(&[chunk], None)?;
            out.extend(convert_f32_to_i16(&resampled[0]));
        }
        Ok(out)
    }
}

/// Cuts a sample stream into fixed-length frames with running timestamps.
pub struct FrameAssembler {
    sample_rate: u32,
    per_frame: usize,
    pending: Vec<i16>,
    elapsed: Duration,
}

impl FrameAssembler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            per_frame: (sample_rate as u64 * FRAME_MS as u64 / 1000) as usize,
            pending: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.per_frame {
            let chunk: Vec<i16> = self.pending.drain(..self.per_frame).collect();
            let frame = AudioFrame::new(chunk, self.sample_rate, self.elapsed);
            self.elapsed += frame.duration();
            frames.push(frame);
        }
        frames
    }
}
