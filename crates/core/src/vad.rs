//! Voice activity detection.
//!
//! A [`VadModel`] is loaded once per process and shared read-only between
//! sessions; each session draws its own stateful [`VoiceActivityDetector`].

use crate::audio::AudioFrame;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadEvent {
    pub is_speech: bool,
    pub confidence: f32,
}

/// Per-session detector state.
pub trait VoiceActivityDetector: Send {
    fn observe(&mut self, frame: &AudioFrame) -> VadEvent;
}

/// Process-scoped, read-only detection model.
pub trait VadModel: Send + Sync {
    fn stream(&self) -> Box<dyn VoiceActivityDetector>;
}

#[derive(Debug, Clone)]
pub struct EnergyVadConfig {
    /// Frames at or above this RMS level count as voiced.
    pub threshold_db: f32,
    /// Consecutive voiced frames needed before speech is reported.
    pub onset_frames: u32,
    /// Unvoiced frames tolerated before speech is reported as over.
    pub hangover_frames: u32,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            threshold_db: -40.0,
            onset_frames: 2,
            hangover_frames: 8,
        }
    }
}

/// RMS-energy detector with onset debouncing and a speech hangover.
#[derive(Debug, Clone, Default)]
pub struct EnergyVadModel {
    config: EnergyVadConfig,
}

impl EnergyVadModel {
    pub fn new(config: EnergyVadConfig) -> Self {
        Self { config }
    }
}

impl VadModel for EnergyVadModel {
    fn stream(&self) -> Box<dyn VoiceActivityDetector> {
        Box::new(EnergyVad {
            config: self.config.clone(),
            speaking: false,
            voiced_run: 0,
            unvoiced_run: 0,
        })
    }
}

pub struct EnergyVad {
    config: EnergyVadConfig,
    speaking: bool,
    voiced_run: u32,
    unvoiced_run: u32,
}

impl VoiceActivityDetector for EnergyVad {
    fn observe(&mut self, frame: &AudioFrame) -> VadEvent {
        let level = frame.level_db();
        let voiced = level >= self.config.threshold_db;
        if voiced {
            self.voiced_run += 1;
            self.unvoiced_run = 0;
            if !self.speaking && self.voiced_run >= self.config.onset_frames {
                self.speaking = true;
            }
        } else {
            self.unvoiced_run += 1;
            self.voiced_run = 0;
            if self.speaking && self.unvoiced_run > self.config.hangover_frames {
                self.speaking = false;
            }
        }
        // Map 20 dB either side of the threshold onto [0, 1].
        let confidence = ((level - self.config.threshold_db + 20.0) / 40.0).clamp(0.0, 1.0);
        VadEvent {
            is_speech: self.speaking,
            confidence,
        }
    }
}
