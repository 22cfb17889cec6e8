//! The per-session turn-taking state machine.
//!
//! Every collaborator (VAD, transcriber, generator, synthesizer, tool calls)
//! runs in its own task and reports into one ordered queue. A single loop
//! consumes that queue and is the only place session state is mutated, so
//! transitions never interleave. Generations are tagged with a monotonic id;
//! anything arriving for an id that is no longer active is dropped.

use crate::audio::{AudioFrame, AudioFrameBus, AudioOutput};
use crate::config::{BufferedSpeechPolicy, ErrorReplyPolicy, SessionConfig};
use crate::error::{Collaborator, SessionError, ToolOutcome, tool_payload};
use crate::events::{GenerationOutcome, SessionEvent};
use crate::llm::{
    GenerationEvent, GenerationRequest, ResolvedToolCall, ResponseGenerator, ToolCallRequest,
    ToolExchange,
};
use crate::session::{Session, Speaker, TurnState, Utterance};
use crate::stt::{TranscriptDelta, Transcriber, TranscriptionSession};
use crate::tools::ToolRegistry;
use crate::tts::{SynthesizedChunk, Synthesizer, TextStream};
use crate::turn::TurnDetector;
use crate::vad::{VadEvent, VadModel, VoiceActivityDetector};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Frames kept from before speech onset so the first syllable reaches the transcriber.
const PRE_ROLL_FRAMES: usize = 10;
/// How far ahead of its playout time synthesized audio is handed to the output.
const PLAYOUT_LEAD: Duration = Duration::from_millis(100);

/// The collaborator backends a session is built from. Implementations are
/// chosen by whoever constructs the session; the orchestrator only sees the traits.
#[derive(Clone)]
pub struct Collaborators {
    /// Process-scoped model; each session draws its own detector from it.
    pub vad: Arc<dyn VadModel>,
    pub turn_detector: Arc<dyn TurnDetector>,
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

pub struct SessionOrchestrator {
    config: SessionConfig,
    collaborators: Collaborators,
    tools: Arc<ToolRegistry>,
    system_prompt: Option<String>,
    room: String,
}

impl SessionOrchestrator {
    pub fn new(config: SessionConfig, collaborators: Collaborators, tools: Arc<ToolRegistry>) -> Self {
        Self {
            config,
            collaborators,
            tools,
            system_prompt: None,
            room: String::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Room name recorded on the session's log span.
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    /// Starts the session on `bus` and returns its control handle.
    pub fn spawn(self, bus: AudioFrameBus) -> SessionHandle {
        let session = Session::new(self.config);
        let id = session.id;
        let (tx, inputs) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let span = info_span!("voice_session", session_id = %id, room = %self.room);

        let AudioFrameBus { input, output } = bus;
        let detector = self.collaborators.vad.stream();
        let ingest = tokio::spawn(ingest(input, detector, tx.clone()).instrument(span.clone()));

        let runner = Runner {
            session,
            collaborators: self.collaborators,
            tools: self.tools,
            system_prompt: self.system_prompt,
            output,
            inputs,
            tx: tx.clone(),
            events: events_tx,
            ingest,
            user_speaking: false,
            pre_roll: VecDeque::with_capacity(PRE_ROLL_FRAMES),
            listening: None,
            buffered: None,
            active: None,
            unanswered: false,
            say_queue: VecDeque::new(),
            failures: HashMap::new(),
            next_utterance: 0,
            next_generation: 0,
        };
        let task = tokio::spawn(runner.run().instrument(span));

        SessionHandle {
            id,
            events,
            control: SessionControl { tx },
            task,
        }
    }
}

/// Runs the per-session VAD over incoming frames.
async fn ingest(
    mut input: mpsc::Receiver<AudioFrame>,
    mut detector: Box<dyn VoiceActivityDetector>,
    tx: mpsc::UnboundedSender<Input>,
) {
    while let Some(frame) = input.recv().await {
        let vad = detector.observe(&frame);
        if tx.send(Input::Audio { frame, vad }).is_err() {
            return;
        }
    }
    let _ = tx.send(Input::InputClosed);
}

/// Clonable control side of a running session.
#[derive(Clone)]
pub struct SessionControl {
    tx: mpsc::UnboundedSender<Input>,
}

impl SessionControl {
    /// Speaks a fixed text; queued until the session is idle.
    pub fn say(&self, text: impl Into<String>, allow_interruptions: bool) -> Result<(), SessionError> {
        self.tx
            .send(Input::Say {
                text: text.into(),
                allow_interruptions,
            })
            .map_err(|_| SessionError::Closed)
    }

    pub fn hangup(&self) {
        let _ = self.tx.send(Input::Hangup);
    }
}

pub struct SessionHandle {
    pub id: Uuid,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    control: SessionControl,
    task: JoinHandle<Result<Session, SessionError>>,
}

impl SessionHandle {
    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    pub fn say(&self, text: impl Into<String>, allow_interruptions: bool) -> Result<(), SessionError> {
        self.control.say(text, allow_interruptions)
    }

    pub fn hangup(&self) {
        self.control.hangup();
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<SessionEvent> {
        &mut self.events
    }

    /// Waits for the session to end and returns its final state.
    pub async fn join(self) -> Result<Session, SessionError> {
        self.task.await.map_err(|_| SessionError::Closed)?
    }
}

/// Everything the session loop reacts to, in arrival order.
enum Input {
    Audio {
        frame: AudioFrame,
        vad: VadEvent,
    },
    InputClosed,
    Transcript {
        utterance: u64,
        delta: TranscriptDelta,
    },
    TranscriptEnded {
        utterance: u64,
    },
    TranscriptFailed {
        utterance: u64,
        error: SessionError,
    },
    TurnProbability {
        utterance: u64,
        probability: f32,
    },
    Generation {
        generation: u64,
        event: GenerationEvent,
    },
    GenerationFailed {
        generation: u64,
        error: SessionError,
    },
    Synthesis {
        generation: u64,
        chunk: SynthesizedChunk,
    },
    SynthesisEnded {
        generation: u64,
    },
    SynthesisFailed {
        generation: u64,
        error: SessionError,
    },
    ToolResult {
        generation: u64,
        call_id: String,
        outcome: ToolOutcome,
    },
    Say {
        text: String,
        allow_interruptions: bool,
    },
    Hangup,
}

enum Step {
    Continue,
    Stop,
    Fatal(SessionError),
}

struct OpenUtterance {
    utterance: Utterance,
    /// Transcriber input; dropped when the turn ends.
    audio: Option<mpsc::Sender<AudioFrame>>,
    _pump: DropGuard,
    silence_since: Option<Instant>,
    last_probability: f32,
    stream_ended: bool,
    /// Set once the turn has ended and the final segment is awaited.
    flush_deadline: Option<Instant>,
}

impl OpenUtterance {
    fn closing(&self) -> bool {
        self.flush_deadline.is_some()
    }
}

struct GenerationTask {
    id: u64,
    cancel: CancellationToken,
    interruptible: bool,
    /// Synthesizer input; dropped once the final round is done.
    text_tx: Option<mpsc::UnboundedSender<String>>,
    round_text: String,
    round_done: bool,
    round_calls: Vec<ToolCallRequest>,
    results: HashMap<String, Value>,
    exchanges: Vec<ToolExchange>,
    paused_for_tools: bool,
    generated: String,
    /// Text of audio already handed to the output.
    spoken: String,
    audio_started: bool,
    synthesis_ended: bool,
}

impl GenerationTask {
    fn tools_pending(&self) -> bool {
        self.round_calls.iter().any(|c| !self.results.contains_key(&c.id))
    }
}

struct ScriptedSpeech {
    text: String,
    allow_interruptions: bool,
}

struct Runner {
    session: Session,
    collaborators: Collaborators,
    tools: Arc<ToolRegistry>,
    system_prompt: Option<String>,
    output: Arc<dyn AudioOutput>,
    inputs: mpsc::UnboundedReceiver<Input>,
    tx: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<SessionEvent>,
    ingest: JoinHandle<()>,
    user_speaking: bool,
    pre_roll: VecDeque<AudioFrame>,
    /// The utterance that owns the user's turn.
    listening: Option<OpenUtterance>,
    /// Speech captured while it could not take the turn.
    buffered: Option<OpenUtterance>,
    active: Option<GenerationTask>,
    /// A committed user line is still waiting for a generation.
    unanswered: bool,
    say_queue: VecDeque<ScriptedSpeech>,
    failures: HashMap<Collaborator, u32>,
    next_utterance: u64,
    next_generation: u64,
}

impl Runner {
    async fn run(mut self) -> Result<Session, SessionError> {
        info!("Session started.");
        if let Some(err) = self.tools.degraded() {
            self.emit(SessionEvent::Warning(err.clone()));
        }
        if let Some(greeting) = self.session.config.greeting.clone() {
            self.start_scripted(greeting.text, greeting.allow_interruptions);
        }

        let step = loop {
            // Expired timers are handled before any queued input, so a busy
            // queue can never hold off the silence or flush timeout.
            self.fire_deadlines();
            let deadline = self.next_deadline();
            let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let input = tokio::select! {
                biased;
                _ = sleep_until(wake), if deadline.is_some() => continue,
                input = self.inputs.recv() => input,
            };
            let Some(input) = input else {
                break Step::Stop;
            };
            match self.handle(input).await {
                Step::Continue => {}
                other => break other,
            }
        };

        match step {
            Step::Fatal(err) => {
                warn!(error = %err, "Session terminated.");
                self.emit(SessionEvent::Fatal(err.clone()));
                self.teardown(false);
                self.emit(SessionEvent::Ended);
                Err(err)
            }
            _ => {
                self.teardown(true);
                info!(entries = self.session.history.len(), "Session ended.");
                self.emit(SessionEvent::Ended);
                Ok(self.session)
            }
        }
    }

    async fn handle(&mut self, input: Input) -> Step {
        match input {
            Input::Audio { frame, vad } => self.on_audio(frame, vad),
            Input::InputClosed => {
                info!("Participant audio closed.");
                return Step::Stop;
            }
            Input::Hangup => {
                info!("Hangup requested.");
                return Step::Stop;
            }
            Input::Transcript { utterance, delta } => self.on_transcript(utterance, delta),
            Input::TranscriptEnded { utterance } => self.on_transcript_ended(utterance),
            Input::TranscriptFailed { utterance, error } => {
                let owned = [&self.listening, &self.buffered]
                    .into_iter()
                    .flatten()
                    .any(|o| o.utterance.id == utterance);
                if owned {
                    return self.fail(Collaborator::Transcriber, error);
                }
            }
            Input::TurnProbability {
                utterance,
                probability,
            } => self.on_turn_probability(utterance, probability),
            Input::Generation { generation, event } => {
                return self.on_generation_event(generation, event);
            }
            Input::GenerationFailed { generation, error } => {
                if self.is_active(generation) {
                    return self.fail(Collaborator::ResponseGenerator, error);
                }
            }
            Input::Synthesis { generation, chunk } => {
                return self.on_synthesis(generation, chunk).await;
            }
            Input::SynthesisEnded { generation } => self.on_synthesis_ended(generation),
            Input::SynthesisFailed { generation, error } => {
                if self.is_active(generation) {
                    return self.fail(Collaborator::Synthesizer, error);
                }
            }
            Input::ToolResult {
                generation,
                call_id,
                outcome,
            } => return self.on_tool_result(generation, call_id, outcome),
            Input::Say {
                text,
                allow_interruptions,
            } => {
                self.say_queue.push_back(ScriptedSpeech {
                    text,
                    allow_interruptions,
                });
                self.on_idle();
            }
        }
        Step::Continue
    }

    // --- User side ---

    fn on_audio(&mut self, frame: AudioFrame, vad: VadEvent) {
        for open in [self.listening.as_ref(), self.buffered.as_ref()].into_iter().flatten() {
            if let Some(audio) = &open.audio {
                if audio.try_send(frame.clone()).is_err() {
                    debug!(utterance = open.utterance.id, "Transcriber not keeping up; frame dropped.");
                }
            }
        }
        if self.pre_roll.len() == PRE_ROLL_FRAMES {
            self.pre_roll.pop_front();
        }
        self.pre_roll.push_back(frame);

        let was_speaking = self.user_speaking;
        self.user_speaking = vad.is_speech;
        match (was_speaking, vad.is_speech) {
            (false, true) => self.on_speech_onset(),
            (true, false) => self.on_speech_offset(),
            _ => {}
        }
    }

    fn on_speech_onset(&mut self) {
        if let Some(open) = self.listening.as_mut() {
            if !open.closing() {
                open.silence_since = None;
                return;
            }
            // The turn is already closing; the new speech waits its turn.
            if self.buffered.is_none() {
                self.buffered = Some(self.open_utterance());
            }
            return;
        }
        if let Some(buffered) = self.buffered.as_mut() {
            buffered.silence_since = None;
            return;
        }
        match self.active.as_ref().map(|g| g.interruptible) {
            None => {
                self.listening = Some(self.open_utterance());
                self.set_state(TurnState::UserSpeaking);
            }
            Some(true) => self.barge_in(),
            Some(false) => {
                debug!("Agent is not interruptible; buffering user speech.");
                self.buffered = Some(self.open_utterance());
            }
        }
    }

    fn on_speech_offset(&mut self) {
        let now = Instant::now();
        let mut evaluate = Vec::new();
        for open in [self.listening.as_mut(), self.buffered.as_mut()].into_iter().flatten() {
            if !open.closing() {
                open.silence_since = Some(now);
                evaluate.push((open.utterance.id, open.utterance.current_text()));
            }
        }
        for (id, text) in evaluate {
            self.evaluate_turn(id, text);
        }
    }

    fn barge_in(&mut self) {
        let Some(generation) = self.active.take() else {
            return;
        };
        generation.cancel.cancel();
        info!(generation = generation.id, "User barged in; generation cancelled.");
        if generation.audio_started || self.session.state == TurnState::AgentSpeaking {
            self.set_state(TurnState::Interrupted);
            let spoken = generation.spoken.trim();
            if !spoken.is_empty() {
                self.commit(Speaker::Agent, spoken.to_string(), true);
            }
        }
        self.emit(SessionEvent::GenerationFinished {
            generation: generation.id,
            outcome: GenerationOutcome::Interrupted,
        });
        self.listening = Some(self.open_utterance());
        self.set_state(TurnState::UserSpeaking);
    }

    fn open_utterance(&mut self) -> OpenUtterance {
        self.next_utterance += 1;
        let id = self.next_utterance;
        let TranscriptionSession { audio, mut deltas } =
            self.collaborators.transcriber.open(&self.session.config.language);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.tx.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        item = deltas.next() => match item {
                            Some(Ok(delta)) => {
                                if tx.send(Input::Transcript { utterance: id, delta }).is_err() {
                                    return;
                                }
                            }
                            Some(Err(error)) => {
                                let _ = tx.send(Input::TranscriptFailed { utterance: id, error });
                                return;
                            }
                            None => {
                                let _ = tx.send(Input::TranscriptEnded { utterance: id });
                                return;
                            }
                        },
                    }
                }
            }
            .in_current_span(),
        );
        for frame in &self.pre_roll {
            let _ = audio.try_send(frame.clone());
        }
        debug!(utterance = id, "Utterance opened");
        OpenUtterance {
            utterance: Utterance::open(id),
            audio: Some(audio),
            _pump: cancel.drop_guard(),
            silence_since: None,
            last_probability: 0.0,
            stream_ended: false,
            flush_deadline: None,
        }
    }

    fn evaluate_turn(&self, utterance: u64, text: String) {
        if text.trim().is_empty() {
            return;
        }
        let detector = self.collaborators.turn_detector.clone();
        let tx = self.tx.clone();
        tokio::spawn(
            async move {
                match detector.end_of_turn_probability(&text).await {
                    Ok(probability) => {
                        let _ = tx.send(Input::TurnProbability {
                            utterance,
                            probability,
                        });
                    }
                    Err(e) => warn!(error = %e, "Turn detection failed; relying on the silence timeout."),
                }
            }
            .in_current_span(),
        );
    }

    fn on_transcript(&mut self, utterance: u64, delta: TranscriptDelta) {
        let Some(open) = [self.listening.as_mut(), self.buffered.as_mut()]
            .into_iter()
            .flatten()
            .find(|o| o.utterance.id == utterance)
        else {
            return;
        };
        if delta.is_final {
            open.utterance.push_final(&delta.text);
        } else {
            open.utterance.set_interim(&delta.text);
        }
        if open.silence_since.is_some() && !open.closing() {
            let text = open.utterance.current_text();
            self.evaluate_turn(utterance, text);
        }
    }

    fn on_transcript_ended(&mut self, utterance: u64) {
        self.failures.remove(&Collaborator::Transcriber);
        if let Some(buffered) = self.buffered.as_mut().filter(|o| o.utterance.id == utterance) {
            buffered.stream_ended = true;
            return;
        }
        let Some(open) = self.listening.as_mut().filter(|o| o.utterance.id == utterance) else {
            return;
        };
        open.stream_ended = true;
        if open.closing() {
            self.commit_utterance();
        }
    }

    fn on_turn_probability(&mut self, utterance: u64, probability: f32) {
        let threshold = self.session.config.end_of_turn_threshold;
        if let Some(buffered) = self.buffered.as_mut().filter(|o| o.utterance.id == utterance) {
            buffered.last_probability = probability;
            return;
        }
        let Some(open) = self
            .listening
            .as_mut()
            .filter(|o| o.utterance.id == utterance && !o.closing())
        else {
            return;
        };
        open.last_probability = probability;
        debug!(utterance, probability, "End-of-turn probability");
        if open.silence_since.is_some() && probability >= threshold {
            self.end_of_turn();
        }
    }

    /// Closes the transcriber input; the utterance is committed once the
    /// transcript stream ends or the flush timeout fires.
    fn end_of_turn(&mut self) {
        let flush_timeout = self.session.config.transcript_flush_timeout;
        let Some(open) = self.listening.as_mut().filter(|o| !o.closing()) else {
            return;
        };
        open.audio = None;
        open.silence_since = None;
        open.flush_deadline = Some(Instant::now() + flush_timeout);
        debug!(utterance = open.utterance.id, "End of user turn");
        if open.stream_ended {
            self.commit_utterance();
        }
    }

    fn commit_utterance(&mut self) {
        let Some(mut open) = self.listening.take() else {
            return;
        };
        let text = open.utterance.finalize();
        drop(open);
        if text.is_empty() {
            debug!("Discarding utterance with an empty transcript.");
        } else {
            self.commit(Speaker::User, text, false);
            self.unanswered = true;
        }

        // Speech that arrived while this turn was closing continues it; the
        // answer waits until that speech is committed too.
        if self.buffered.is_some() {
            self.promote_buffered();
        } else if self.unanswered {
            self.start_generation();
        } else {
            self.set_state(TurnState::Idle);
            self.on_idle();
        }
    }

    /// Hands the turn to speech captured while the agent could not be interrupted.
    fn promote_buffered(&mut self) {
        let Some(mut open) = self.buffered.take() else {
            return;
        };
        let policy = self.session.config.buffered_speech;
        let threshold = self.session.config.end_of_turn_threshold;
        if policy == BufferedSpeechPolicy::Reset {
            open.last_probability = 0.0;
            open.silence_since = (!self.user_speaking).then(Instant::now);
        }
        let silent = open.silence_since.is_some();
        let finished = policy == BufferedSpeechPolicy::PreserveConfidence
            && silent
            && open.last_probability >= threshold;
        let (id, text) = (open.utterance.id, open.utterance.current_text());
        info!(utterance = id, ?policy, "Resuming buffered user speech.");
        self.listening = Some(open);
        self.set_state(TurnState::UserSpeaking);
        if finished {
            self.end_of_turn();
        } else if silent {
            self.evaluate_turn(id, text);
        }
    }

    // --- Timers ---

    fn next_deadline(&self) -> Option<Instant> {
        let open = self.listening.as_ref()?;
        match open.flush_deadline {
            Some(flush) => Some(flush),
            None => open
                .silence_since
                .map(|since| since + self.session.config.max_silence),
        }
    }

    fn fire_deadlines(&mut self) {
        let now = Instant::now();
        let Some(open) = self.listening.as_ref() else {
            return;
        };
        if let Some(flush) = open.flush_deadline {
            if flush <= now {
                warn!(utterance = open.utterance.id, "Transcript flush timed out; committing what arrived.");
                self.commit_utterance();
            }
            return;
        }
        if let Some(since) = open.silence_since {
            if since + self.session.config.max_silence <= now {
                info!(
                    utterance = open.utterance.id,
                    probability = open.last_probability,
                    "Max silence elapsed; closing the user turn."
                );
                self.end_of_turn();
            }
        }
    }

    // --- Agent side ---

    fn next_generation_id(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn is_active(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|g| g.id == generation && !g.cancel.is_cancelled())
    }

    /// Creates a generation task and its synthesis pump.
    fn new_task(&mut self, interruptible: bool) -> GenerationTask {
        let id = self.next_generation_id();
        let cancel = CancellationToken::new();
        let (text_tx, text_rx) = mpsc::unbounded_channel::<String>();
        let synthesizer = self.collaborators.synthesizer.clone();
        let voice = self.session.config.voice.clone();
        let tx = self.tx.clone();
        let token = cancel.clone();
        tokio::spawn(
            async move {
                let text: TextStream = Box::pin(UnboundedReceiverStream::new(text_rx));
                let started = tokio::select! {
                    _ = token.cancelled() => return,
                    started = synthesizer.synthesize(text, &voice) => started,
                };
                let mut stream = match started {
                    Ok(stream) => stream,
                    Err(error) => {
                        let _ = tx.send(Input::SynthesisFailed { generation: id, error });
                        return;
                    }
                };
                // Frames are released at the pace they play out, so the session
                // stays speaking (and interruptible) until the caller has heard them.
                let mut playout = Instant::now();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        item = stream.next() => match item {
                            Some(Ok(chunk)) => {
                                playout = playout.max(Instant::now());
                                let release = playout.checked_sub(PLAYOUT_LEAD).unwrap_or(playout);
                                playout += chunk.frame.duration();
                                tokio::select! {
                                    _ = token.cancelled() => return,
                                    _ = sleep_until(release) => {}
                                }
                                if tx.send(Input::Synthesis { generation: id, chunk }).is_err() {
                                    return;
                                }
                            }
                            Some(Err(error)) => {
                                let _ = tx.send(Input::SynthesisFailed { generation: id, error });
                                return;
                            }
                            None => {
                                tokio::select! {
                                    _ = token.cancelled() => return,
                                    _ = sleep_until(playout) => {}
                                }
                                let _ = tx.send(Input::SynthesisEnded { generation: id });
                                return;
                            }
                        },
                    }
                }
            }
            .in_current_span(),
        );
        GenerationTask {
            id,
            cancel,
            interruptible,
            text_tx: Some(text_tx),
            round_text: String::new(),
            round_done: false,
            round_calls: Vec::new(),
            results: HashMap::new(),
            exchanges: Vec::new(),
            paused_for_tools: false,
            generated: String::new(),
            spoken: String::new(),
            audio_started: false,
            synthesis_ended: false,
        }
    }

    fn start_generation(&mut self) {
        self.unanswered = false;
        let generation = self.new_task(self.session.config.allow_interruptions);
        info!(generation = generation.id, "Generation started");
        self.emit(SessionEvent::GenerationStarted {
            generation: generation.id,
        });
        self.set_state(TurnState::Thinking);
        self.spawn_round(generation.id, generation.cancel.clone(), Vec::new());
        self.active = Some(generation);
    }

    fn start_scripted(&mut self, text: String, interruptible: bool) {
        let mut generation = self.new_task(interruptible);
        debug!(generation = generation.id, "Speaking scripted text");
        generation.generated = text.clone();
        generation.round_done = true;
        if let Some(text_tx) = generation.text_tx.take() {
            let _ = text_tx.send(text);
        }
        self.emit(SessionEvent::GenerationStarted {
            generation: generation.id,
        });
        self.set_state(TurnState::Thinking);
        self.active = Some(generation);
    }

    /// Requests one round from the generator with everything committed so far.
    fn spawn_round(&self, id: u64, token: CancellationToken, exchanges: Vec<ToolExchange>) {
        let request = GenerationRequest {
            system_prompt: self.system_prompt.clone(),
            history: self.session.history.clone(),
            tools: self.tools.descriptors().to_vec(),
            exchanges,
        };
        let generator = self.collaborators.generator.clone();
        let tx = self.tx.clone();
        tokio::spawn(
            async move {
                let started = tokio::select! {
                    _ = token.cancelled() => return,
                    started = generator.generate(request) => started,
                };
                let mut stream = match started {
                    Ok(stream) => stream,
                    Err(error) => {
                        let _ = tx.send(Input::GenerationFailed { generation: id, error });
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        item = stream.next() => {
                            let event = match item {
                                Some(Ok(event)) => event,
                                Some(Err(error)) => {
                                    let _ = tx.send(Input::GenerationFailed { generation: id, error });
                                    return;
                                }
                                None => GenerationEvent::Done,
                            };
                            let done = event == GenerationEvent::Done;
                            if tx.send(Input::Generation { generation: id, event }).is_err() || done {
                                return;
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn on_generation_event(&mut self, generation: u64, event: GenerationEvent) -> Step {
        if !self.is_active(generation) {
            debug!(generation, "Dropping output of an inactive generation.");
            return Step::Continue;
        }
        let state = self.session.state;
        let Some(task) = self.active.as_mut() else {
            return Step::Continue;
        };
        if task.round_done {
            return Step::Continue;
        }
        match event {
            GenerationEvent::TextDelta(text) => {
                task.paused_for_tools = false;
                task.round_text.push_str(&text);
                task.generated.push_str(&text);
                if let Some(text_tx) = &task.text_tx {
                    let _ = text_tx.send(text);
                }
                if state == TurnState::Thinking {
                    self.set_state(TurnState::AgentSpeaking);
                }
            }
            GenerationEvent::ToolCallRequest(call) => {
                if task.round_calls.iter().any(|c| c.id == call.id) {
                    warn!(call = %call.id, "Ignoring duplicate tool call id.");
                    return Step::Continue;
                }
                info!(tool = %call.name, call = %call.id, "Tool call requested");
                task.round_calls.push(call.clone());
                task.paused_for_tools = true;
                let tools = self.tools.clone();
                let tx = self.tx.clone();
                let dispatched = call.clone();
                tokio::spawn(
                    async move {
                        let outcome = tools.invoke(&dispatched.name, dispatched.arguments).await;
                        let _ = tx.send(Input::ToolResult {
                            generation,
                            call_id: dispatched.id,
                            outcome,
                        });
                    }
                    .in_current_span(),
                );
                self.emit(SessionEvent::ToolCallDispatched { generation, call });
                if state == TurnState::AgentSpeaking {
                    self.set_state(TurnState::Thinking);
                }
            }
            GenerationEvent::Done => {
                task.round_done = true;
                self.failures.remove(&Collaborator::ResponseGenerator);
                self.advance();
            }
        }
        Step::Continue
    }

    fn on_tool_result(&mut self, generation: u64, call_id: String, outcome: ToolOutcome) -> Step {
        if !self.is_active(generation) {
            debug!(generation, call = %call_id, "Discarding tool result for an inactive generation.");
            return Step::Continue;
        }
        let Some(task) = self.active.as_mut() else {
            return Step::Continue;
        };
        let Some(call) = task.round_calls.iter().find(|c| c.id == call_id).cloned() else {
            return Step::Continue;
        };
        if task.results.contains_key(&call_id) {
            return Step::Continue;
        }
        match &outcome {
            Ok(_) => debug!(tool = %call.name, "Tool call succeeded"),
            Err(e) => warn!(tool = %call.name, error = %e, "Tool call failed; reporting to the model."),
        }
        task.results.insert(call_id.clone(), tool_payload(&outcome));
        self.emit(SessionEvent::ToolCallResolved {
            generation,
            call_id,
            name: call.name,
            outcome,
        });
        self.advance();
        Step::Continue
    }

    /// Moves the active generation forward once its current round is done
    /// and all of the round's tool calls have resolved.
    fn advance(&mut self) {
        let Some(task) = self.active.as_mut() else {
            return;
        };
        if !task.round_done || task.tools_pending() {
            return;
        }
        if !task.round_calls.is_empty() {
            let calls = std::mem::take(&mut task.round_calls)
                .into_iter()
                .map(|request| ResolvedToolCall {
                    payload: task.results.remove(&request.id).unwrap_or(Value::Null),
                    request,
                })
                .collect();
            task.exchanges.push(ToolExchange {
                assistant_text: std::mem::take(&mut task.round_text),
                calls,
            });
            task.results.clear();
            task.round_done = false;
            if !task.generated.is_empty() && !task.generated.ends_with(char::is_whitespace) {
                task.generated.push(' ');
                if let Some(text_tx) = &task.text_tx {
                    let _ = text_tx.send(" ".to_string());
                }
            }
            debug!(generation = task.id, round = task.exchanges.len(), "Resuming generation with tool results");
            let (id, token, exchanges) = (task.id, task.cancel.clone(), task.exchanges.clone());
            self.spawn_round(id, token, exchanges);
            return;
        }
        // Final round: no more text is coming.
        task.text_tx = None;
        if task.synthesis_ended {
            self.complete_generation();
        }
    }

    async fn on_synthesis(&mut self, generation: u64, chunk: SynthesizedChunk) -> Step {
        if !self.is_active(generation) {
            debug!(generation, "Dropping audio of an inactive generation.");
            return Step::Continue;
        }
        if let Err(error) = self.output.play(chunk.frame).await {
            return self.fail(Collaborator::AudioOutput, error);
        }
        self.failures.remove(&Collaborator::AudioOutput);
        let state = self.session.state;
        let Some(task) = self.active.as_mut() else {
            return Step::Continue;
        };
        task.audio_started = true;
        if let Some(text) = chunk.text {
            if !task.spoken.is_empty() {
                task.spoken.push(' ');
            }
            task.spoken.push_str(&text);
        }
        if state == TurnState::Thinking && !task.paused_for_tools {
            self.set_state(TurnState::AgentSpeaking);
        }
        Step::Continue
    }

    fn on_synthesis_ended(&mut self, generation: u64) {
        if !self.is_active(generation) {
            return;
        }
        self.failures.remove(&Collaborator::Synthesizer);
        let Some(task) = self.active.as_mut() else {
            return;
        };
        task.synthesis_ended = true;
        if task.text_tx.is_none() && task.round_done && !task.tools_pending() {
            self.complete_generation();
        }
    }

    fn complete_generation(&mut self) {
        let Some(task) = self.active.take() else {
            return;
        };
        task.cancel.cancel();
        let text = task.generated.trim();
        if !text.is_empty() {
            self.commit(Speaker::Agent, text.to_string(), false);
        }
        info!(generation = task.id, "Generation completed");
        self.emit(SessionEvent::GenerationFinished {
            generation: task.id,
            outcome: GenerationOutcome::Completed,
        });
        self.set_state(TurnState::Idle);
        self.on_idle();
    }

    /// Picks up deferred work once nothing owns the turn.
    fn on_idle(&mut self) {
        if self.active.is_some() || self.listening.is_some() {
            return;
        }
        if self.buffered.is_some() {
            self.promote_buffered();
            return;
        }
        if let Some(speech) = self.say_queue.pop_front() {
            self.start_scripted(speech.text, speech.allow_interruptions);
        }
    }

    // --- Failures ---

    fn fail(&mut self, collaborator: Collaborator, error: SessionError) -> Step {
        let count = self.failures.entry(collaborator).or_insert(0);
        *count += 1;
        let failures = *count;
        warn!(%collaborator, failures, error = %error, "Collaborator failure");
        if failures >= self.session.config.max_consecutive_failures {
            return Step::Fatal(SessionError::Fatal {
                collaborator,
                failures,
            });
        }

        if let Some(task) = self.active.take() {
            task.cancel.cancel();
            let spoken = task.spoken.trim();
            if !spoken.is_empty() {
                self.commit(Speaker::Agent, spoken.to_string(), true);
            }
            self.emit(SessionEvent::GenerationFinished {
                generation: task.id,
                outcome: GenerationOutcome::Failed,
            });
        }
        let open: Vec<OpenUtterance> = [self.listening.take(), self.buffered.take()]
            .into_iter()
            .flatten()
            .collect();
        for mut open in open {
            let text = open.utterance.finalize();
            if !text.is_empty() {
                self.commit(Speaker::User, text, false);
            }
        }
        self.unanswered = false;
        self.set_state(TurnState::Idle);
        self.emit(SessionEvent::RecoverableError(error));

        if let ErrorReplyPolicy::Apologize(text) = &self.session.config.error_reply {
            self.say_queue.push_front(ScriptedSpeech {
                text: text.clone(),
                allow_interruptions: self.session.config.allow_interruptions,
            });
        }
        self.on_idle();
        Step::Continue
    }

    fn teardown(&mut self, commit: bool) {
        if let Some(task) = self.active.take() {
            task.cancel.cancel();
            let spoken = task.spoken.trim();
            if commit {
                if !spoken.is_empty() {
                    self.commit(Speaker::Agent, spoken.to_string(), true);
                }
                self.emit(SessionEvent::GenerationFinished {
                    generation: task.id,
                    outcome: GenerationOutcome::Interrupted,
                });
            }
        }
        self.listening = None;
        self.buffered = None;
        self.say_queue.clear();
        self.ingest.abort();
    }

    // --- Bookkeeping ---

    fn commit(&mut self, speaker: Speaker, text: String, truncated: bool) {
        let entry = self.session.append(speaker, text, truncated).clone();
        info!(speaker = ?entry.speaker, truncated, text = %entry.text, "Transcript entry committed");
        self.emit(SessionEvent::TranscriptCommitted(entry));
    }

    fn set_state(&mut self, to: TurnState) {
        let from = self.session.state;
        if from == to {
            return;
        }
        self.session.state = to;
        debug!(%from, %to, "Turn state changed");
        self.emit(SessionEvent::StateChanged { from, to });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
