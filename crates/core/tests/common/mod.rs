//! Scripted collaborators and a driver for orchestrator scenario tests.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use voxline_core::audio::{AudioFrame, AudioFrameBus, AudioOutput, ChannelOutput};
use voxline_core::config::{SessionConfig, VoiceParameters};
use voxline_core::llm::{GenerationEvent, GenerationRequest, GenerationStream, ResponseGenerator, ToolCallRequest};
use voxline_core::stt::{TranscriptDelta, Transcriber, TranscriptionSession};
use voxline_core::tools::ToolRegistry;
use voxline_core::tts::{SynthesisStream, SynthesizedChunk, Synthesizer, TextStream};
use voxline_core::turn::{PunctuationTurnDetector, TurnDetector};
use voxline_core::vad::{EnergyVadConfig, EnergyVadModel};
use voxline_core::{
    Collaborator, Collaborators, Session, SessionError, SessionEvent, SessionHandle,
    SessionOrchestrator, TurnState,
};

pub const SAMPLE_RATE: u32 = 16000;
pub const FRAME_MS: u64 = 20;

pub fn frame(amplitude: i16, timestamp: Duration) -> AudioFrame {
    let samples: Vec<i16> = (0..(SAMPLE_RATE as u64 * FRAME_MS / 1000))
        .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
        .collect();
    AudioFrame::new(samples, SAMPLE_RATE, timestamp)
}

// --- Transcriber ---

pub type TranscriptScript = Vec<Result<TranscriptDelta, SessionError>>;

/// Plays one script per opened utterance: all deltas are released on the
/// first audio frame, and the stream ends once the audio input closes.
#[derive(Default)]
pub struct ScriptedTranscriber {
    scripts: Mutex<VecDeque<TranscriptScript>>,
    /// Final text for every utterance opened after the scripts run out.
    fallback: Option<String>,
    /// How long the delta stream stays open after the audio input closes.
    flush_delay: Duration,
    /// Frames received by each utterance, in open order.
    pub frames: Arc<Mutex<Vec<Arc<AtomicUsize>>>>,
}

impl ScriptedTranscriber {
    pub fn new(scripts: Vec<TranscriptScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub fn repeating(text: &str) -> Self {
        Self {
            fallback: Some(text.to_string()),
            ..Default::default()
        }
    }

    pub fn finals(texts: &[&str]) -> Self {
        Self::new(
            texts
                .iter()
                .map(|t| vec![Ok(TranscriptDelta::final_segment(*t))])
                .collect(),
        )
    }

    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    pub fn opened(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn frames_received(&self, utterance: usize) -> usize {
        self.frames.lock().unwrap()[utterance].load(Ordering::SeqCst)
    }
}

impl Transcriber for ScriptedTranscriber {
    fn open(&self, _language: &str) -> TranscriptionSession {
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| {
            self.fallback
                .iter()
                .map(|t| Ok(TranscriptDelta::final_segment(t.clone())))
                .collect()
        });
        let counter = Arc::new(AtomicUsize::new(0));
        self.frames.lock().unwrap().push(counter.clone());
        let (audio_tx, mut audio_rx) = mpsc::channel::<AudioFrame>(1024);
        let (delta_tx, delta_rx) = mpsc::channel(16);
        let flush_delay = self.flush_delay;
        tokio::spawn(async move {
            let mut script = Some(script);
            while audio_rx.recv().await.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(items) = script.take() {
                    for item in items {
                        let failed = item.is_err();
                        if delta_tx.send(item).await.is_err() || failed {
                            return;
                        }
                    }
                }
            }
            tokio::time::sleep(flush_delay).await;
            drop(delta_tx);
        });
        TranscriptionSession {
            audio: audio_tx,
            deltas: Box::pin(ReceiverStream::new(delta_rx)),
        }
    }
}

// --- Turn detector ---

/// Fixed probabilities per transcript, falling back to punctuation rules.
#[derive(Default)]
pub struct ScriptedTurnDetector {
    pub probabilities: HashMap<String, f32>,
    pub fallback: Option<f32>,
    pub evaluations: Mutex<Vec<String>>,
}

impl ScriptedTurnDetector {
    pub fn constant(probability: f32) -> Self {
        Self {
            fallback: Some(probability),
            ..Default::default()
        }
    }

    pub fn with(mut self, transcript: &str, probability: f32) -> Self {
        self.probabilities.insert(transcript.to_string(), probability);
        self
    }

    pub fn evaluations_of(&self, transcript: &str) -> usize {
        self.evaluations
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.as_str() == transcript)
            .count()
    }
}

#[async_trait]
impl TurnDetector for ScriptedTurnDetector {
    async fn end_of_turn_probability(&self, partial_transcript: &str) -> Result<f32, SessionError> {
        self.evaluations
            .lock()
            .unwrap()
            .push(partial_transcript.trim().to_string());
        if let Some(p) = self.probabilities.get(partial_transcript.trim()) {
            return Ok(*p);
        }
        match self.fallback {
            Some(p) => Ok(p),
            None => PunctuationTurnDetector.end_of_turn_probability(partial_transcript).await,
        }
    }
}

// --- Generator ---

pub type RoundScript = Vec<Result<GenerationEvent, SessionError>>;

pub fn text(t: &str) -> Result<GenerationEvent, SessionError> {
    Ok(GenerationEvent::TextDelta(t.to_string()))
}

pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Result<GenerationEvent, SessionError> {
    Ok(GenerationEvent::ToolCallRequest(ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }))
}

pub fn done() -> Result<GenerationEvent, SessionError> {
    Ok(GenerationEvent::Done)
}

pub fn generator_failure() -> Result<GenerationEvent, SessionError> {
    Err(SessionError::transport(Collaborator::ResponseGenerator, "stream reset"))
}

/// Serves one round script per `generate` call and records every request.
/// Once the scripts run out, each round answers with `fallback`.
#[derive(Default)]
pub struct ScriptedGenerator {
    rounds: Mutex<VecDeque<RoundScript>>,
    pub fallback: Option<String>,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(rounds: Vec<RoundScript>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            ..Default::default()
        }
    }

    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = Some(text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> GenerationRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, SessionError> {
        self.requests.lock().unwrap().push(request);
        let round = self.rounds.lock().unwrap().pop_front().unwrap_or_else(|| {
            let mut round = Vec::new();
            if let Some(fallback) = &self.fallback {
                round.push(text(fallback));
            }
            round.push(done());
            round
        });
        Ok(Box::pin(futures::stream::iter(round).then(|item| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            item
        })))
    }
}

// --- Synthesizer ---

/// Produces `frames_per_delta` paced 20 ms frames for every non-blank text
/// delta; the first frame of each delta carries its text.
pub struct PacedSynthesizer {
    pub frames_per_delta: usize,
    pub started: AtomicUsize,
    /// Releases a burst of extra frames into the current stream, ignoring pacing.
    pub flush: Arc<Notify>,
    pub flush_frames: usize,
    /// Fails the stream after this many frames.
    pub fail_after: Option<usize>,
}

impl PacedSynthesizer {
    pub fn new(frames_per_delta: usize) -> Self {
        Self {
            frames_per_delta,
            started: AtomicUsize::new(0),
            flush: Arc::new(Notify::new()),
            flush_frames: 0,
            fail_after: None,
        }
    }

    pub fn with_flush(mut self, frames: usize) -> Self {
        self.flush_frames = frames;
        self
    }

    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

#[async_trait]
impl Synthesizer for PacedSynthesizer {
    async fn synthesize(&self, mut text: TextStream, _voice: &VoiceParameters) -> Result<SynthesisStream, SessionError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(4096);
        let frames_per_delta = self.frames_per_delta;
        let flush = self.flush.clone();
        let flush_frames = self.flush_frames;
        let fail_after = self.fail_after;
        tokio::spawn(async move {
            let mut sent = 0;
            let mut offset = Duration::ZERO;
            let step = Duration::from_millis(FRAME_MS);
            let next_frame = |label: Option<String>, offset: &mut Duration| {
                let chunk = SynthesizedChunk {
                    frame: frame(1000, *offset),
                    text: label,
                };
                *offset += step;
                chunk
            };
            loop {
                tokio::select! {
                    _ = flush.notified(), if flush_frames > 0 => {
                        for _ in 0..flush_frames {
                            if tx.send(Ok(next_frame(None, &mut offset))).await.is_err() {
                                return;
                            }
                        }
                    }
                    delta = text.next() => {
                        let Some(delta) = delta else { return };
                        if delta.trim().is_empty() {
                            continue;
                        }
                        let mut label = Some(delta);
                        for _ in 0..frames_per_delta {
                            if fail_after == Some(sent) {
                                let error = SessionError::transport(Collaborator::Synthesizer, "tts connection reset");
                                let _ = tx.send(Err(error)).await;
                                return;
                            }
                            if tx.send(Ok(next_frame(label.take(), &mut offset))).await.is_err() {
                                return;
                            }
                            sent += 1;
                            tokio::time::sleep(step).await;
                        }
                    }
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Returns all of a delta's frames at once, the way an HTTP speech endpoint
/// hands back a whole sentence.
pub struct BurstSynthesizer {
    pub frames_per_delta: usize,
}

#[async_trait]
impl Synthesizer for BurstSynthesizer {
    async fn synthesize(&self, text: TextStream, _voice: &VoiceParameters) -> Result<SynthesisStream, SessionError> {
        let frames_per_delta = self.frames_per_delta;
        let chunks = text
            .filter(|delta| futures::future::ready(!delta.trim().is_empty()))
            .flat_map(move |delta| {
                let mut label = Some(delta);
                futures::stream::iter((0..frames_per_delta).map(move |_| {
                    Ok::<_, SessionError>(SynthesizedChunk {
                        frame: frame(1000, Duration::ZERO),
                        text: label.take(),
                    })
                }))
            });
        Ok(Box::pin(chunks))
    }
}

// --- Driver ---

pub struct Harness {
    pub handle: SessionHandle,
    input: mpsc::Sender<AudioFrame>,
    pub played: Arc<AtomicUsize>,
    pub log: Vec<SessionEvent>,
    clock: Duration,
}

pub fn vad() -> Arc<EnergyVadModel> {
    Arc::new(EnergyVadModel::new(EnergyVadConfig {
        onset_frames: 1,
        hangover_frames: 0,
        ..Default::default()
    }))
}

pub fn collaborators(
    turn_detector: Arc<dyn TurnDetector>,
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ResponseGenerator>,
    synthesizer: Arc<dyn Synthesizer>,
) -> Collaborators {
    Collaborators {
        vad: vad(),
        turn_detector,
        transcriber,
        generator,
        synthesizer,
    }
}

impl Harness {
    pub fn start(config: SessionConfig, collaborators: Collaborators, tools: Arc<ToolRegistry>) -> Self {
        let (output_tx, mut output_rx) = mpsc::channel(4096);
        let played = Arc::new(AtomicUsize::new(0));
        let counter = played.clone();
        tokio::spawn(async move {
            while output_rx.recv().await.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let mut harness = Self::start_with_output(config, collaborators, tools, Arc::new(ChannelOutput::new(output_tx)));
        harness.played = played;
        harness
    }

    /// Starts a session whose synthesized audio goes to `output`.
    pub fn start_with_output(
        config: SessionConfig,
        collaborators: Collaborators,
        tools: Arc<ToolRegistry>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::channel(4096);
        let bus = AudioFrameBus {
            input: input_rx,
            output,
        };
        let handle = SessionOrchestrator::new(config, collaborators, tools)
            .with_system_prompt("Jsi hlasový asistent chytré domácnosti.")
            .with_room("test-room")
            .spawn(bus);
        Self {
            handle,
            input: input_tx,
            played: Arc::new(AtomicUsize::new(0)),
            log: Vec::new(),
            clock: Duration::ZERO,
        }
    }

    async fn push(&mut self, amplitude: i16, ms: u64) {
        for _ in 0..(ms / FRAME_MS) {
            let _ = self.input.send(frame(amplitude, self.clock)).await;
            self.clock += Duration::from_millis(FRAME_MS);
            tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
        }
    }

    pub async fn speak(&mut self, ms: u64) {
        self.push(8000, ms).await;
    }

    pub async fn silence(&mut self, ms: u64) {
        self.push(0, ms).await;
    }

    pub fn played(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }

    /// Drains events into the log until one matches; panics if the session
    /// goes quiet for a minute of (virtual) time.
    pub async fn wait_for(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(60), self.handle.next_event())
                .await
                .expect("timed out waiting for session event")
                .expect("session event channel closed");
            self.log.push(event.clone());
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn wait_for_state(&mut self, state: TurnState) {
        self.wait_for(|e| matches!(e, SessionEvent::StateChanged { to, .. } if *to == state))
            .await;
    }

    /// Drains whatever is already queued without waiting.
    pub fn drain(&mut self) {
        while let Ok(event) = self.handle.events().try_recv() {
            self.log.push(event);
        }
    }

    pub fn states(&self) -> Vec<TurnState> {
        self.log
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    pub async fn finish(mut self) -> (Result<Session, SessionError>, Vec<SessionEvent>) {
        self.handle.hangup();
        let mut log = std::mem::take(&mut self.log);
        let Harness { mut handle, .. } = self;
        while let Some(event) = handle.next_event().await {
            let ended = event == SessionEvent::Ended;
            log.push(event);
            if ended {
                break;
            }
        }
        (handle.join().await, log)
    }
}
