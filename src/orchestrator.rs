//! Session orchestration: wires the microphone, VAD, STT, state machine,
//! turn processor, and background registry into one long-running loop.
//!
//! The microphone callback runs on its own OS thread and talks to the loop
//! only through non-blocking enqueues; everything else happens on the tokio
//! scheduler. Barge-in and turn completion race for the state lock, and the
//! loser backs off.

use crate::audio::staging::AudioStaging;
use crate::config::{OrchestratorConfig, SttIdlePolicy};
use crate::context::ContextStore;
use crate::error::{OrchestratorError, Result};
use crate::messages::{MicFrame, Role, SttEvent, TranscriptKind};
use crate::state::{ConversationEvent, ConversationState, SharedState, StateMachine};
use crate::tasks::TaskRegistry;
use crate::transcript::TranscriptLog;
use crate::traits::{
    LanguageModel, Memory, Player, SpeechToText, TextToSpeech, ToolSet, Vad,
};
use crate::turn::{TurnOutcome, TurnProcessor, TurnSignal};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queue size for microphone frames headed to STT.
const MIC_FRAME_CHANNEL_SIZE: usize = 64;

/// Backoff after a failed STT reconnect.
const STT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Events posted to the orchestrator loop from other threads.
#[derive(Debug, Clone, Copy)]
enum LoopEvent {
    /// VAD reported a speech onset.
    SpeechDetected { at: Instant },
}

/// The concrete collaborators bound at startup.
pub struct Collaborators {
    pub vad: Box<dyn Vad>,
    pub stt: Box<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
    pub player: Arc<dyn Player>,
    pub memory: Arc<dyn Memory>,
}

/// Cheap clone handed to the microphone thread and the HTTP surface.
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: mpsc::UnboundedSender<LoopEvent>,
    shutdown: CancellationToken,
    state: SharedState,
    tasks: TaskRegistry,
    staging: AudioStaging,
    session_id: Arc<str>,
    started_at: Instant,
}

impl OrchestratorHandle {
    /// Post a speech-detected event (VAD onset or a test driver).
    pub fn speech_detected(&self) {
        let _ = self.events.send(LoopEvent::SpeechDetected { at: Instant::now() });
    }

    /// Request a clean shutdown of the session loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn state(&self) -> ConversationState {
        self.state.state()
    }

    pub fn background_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn audio_queue_occupancy(&self) -> usize {
        self.staging.occupancy()
    }

    pub fn audio_pressure_events(&self) -> u64 {
        self.staging.pressure_events()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Runs VAD on the microphone thread and bridges into the loop.
///
/// `on_audio_frame` must never block: events go over an unbounded send,
/// frames over `try_send` with a drop counter.
pub struct MicGate {
    vad: Box<dyn Vad>,
    threshold_bits: Arc<AtomicU32>,
    stt_gate: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LoopEvent>,
    frames: mpsc::Sender<MicFrame>,
    in_speech: bool,
    dropped: u64,
}

impl MicGate {
    /// Handle one captured frame. Called on the microphone thread.
    pub fn on_audio_frame(&mut self, frame: MicFrame) {
        let threshold = f32::from_bits(self.threshold_bits.load(Ordering::Relaxed));
        let in_speech = self.vad.is_speech(&frame, threshold);
        if in_speech && !self.in_speech {
            let _ = self.events.send(LoopEvent::SpeechDetected {
                at: frame.captured_at,
            });
        }
        self.in_speech = in_speech;

        if self.stt_gate.load(Ordering::Relaxed)
            && let Err(mpsc::error::TrySendError::Full(_)) = self.frames.try_send(frame)
        {
            // Never block the audio thread; count and move on.
            self.dropped += 1;
            if self.dropped.is_multiple_of(64) {
                warn!("mic frame queue full, dropped {} frames so far", self.dropped);
            }
        }
    }

    /// Clear VAD hysteresis (e.g. after the pipeline resets).
    pub fn reset(&mut self) {
        self.vad.reset();
        self.in_speech = false;
    }
}

struct TurnHandle {
    handle: tokio::task::JoinHandle<Result<TurnOutcome>>,
    cancel: CancellationToken,
}

/// Owns the session: collaborators, state, registry, and the event loop.
pub struct Orchestrator {
    config: OrchestratorConfig,
    state: SharedState,
    tasks: TaskRegistry,
    context: ContextStore,
    staging: AudioStaging,
    turn: Arc<TurnProcessor>,
    stt: Box<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    player: Arc<dyn Player>,
    memory: Arc<dyn Memory>,
    transcript: Arc<std::sync::Mutex<TranscriptLog>>,
    session_id: Arc<str>,
    started_at: Instant,
    shutdown: CancellationToken,
    mic_cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<LoopEvent>>,
    frames_tx: mpsc::Sender<MicFrame>,
    frames_rx: Option<mpsc::Receiver<MicFrame>>,
    signals_rx: Option<mpsc::UnboundedReceiver<TurnSignal>>,
    threshold_bits: Arc<AtomicU32>,
    stt_gate: Arc<AtomicBool>,
    vad: Option<Box<dyn Vad>>,
}

impl Orchestrator {
    /// Wire a session from configuration, bound collaborators, the persona
    /// prompt, and the tool set.
    ///
    /// # Errors
    ///
    /// Returns an error if the transcript log directory cannot be created.
    pub fn new(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        persona: &str,
        tools: ToolSet,
    ) -> Result<Self> {
        let session_id: Arc<str> = Uuid::new_v4().to_string().into();

        // Transition listener mirrors the per-state VAD threshold and the
        // STT forwarding gate into atomics readable from the mic thread.
        let threshold_bits = Arc::new(AtomicU32::new(
            config.vad.threshold_normal.to_bits(),
        ));
        let stt_gate = Arc::new(AtomicBool::new(false));
        let mut machine = StateMachine::new();
        {
            let threshold_bits = Arc::clone(&threshold_bits);
            let stt_gate = Arc::clone(&stt_gate);
            let vad_config = config.vad.clone();
            machine.on_transition(Box::new(move |_, _, next| {
                threshold_bits.store(next.vad_threshold(&vad_config).to_bits(), Ordering::Relaxed);
                stt_gate.store(next.forwards_to_stt(), Ordering::Relaxed);
            }));
        }
        machine.on_transition(Box::new(|from, event, next| {
            info!("conversation: {from} --{event:?}--> {next}");
        }));
        let state = SharedState::new(machine);

        let tasks = TaskRegistry::new();
        let staging = AudioStaging::new();
        let context = ContextStore::new(persona, config.context.window_turns);
        let transcript = Arc::new(std::sync::Mutex::new(TranscriptLog::open(
            config.transcript_dir(),
            session_id.to_string(),
        )?));

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let turn = Arc::new(TurnProcessor::new(
            Arc::clone(&collaborators.llm),
            Arc::clone(&collaborators.tts),
            Arc::clone(&collaborators.player),
            Arc::clone(&collaborators.memory),
            context.clone(),
            tools,
            state.clone(),
            tasks.clone(),
            staging.clone(),
            config.turn.clone(),
            signals_tx,
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(MIC_FRAME_CHANNEL_SIZE);

        Ok(Self {
            config,
            state,
            tasks,
            context,
            staging,
            turn,
            stt: collaborators.stt,
            llm: collaborators.llm,
            tts: collaborators.tts,
            player: collaborators.player,
            memory: collaborators.memory,
            transcript,
            session_id,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            mic_cancel: CancellationToken::new(),
            events_tx,
            events_rx: Some(events_rx),
            frames_tx,
            frames_rx: Some(frames_rx),
            signals_rx: Some(signals_rx),
            threshold_bits,
            stt_gate,
            vad: Some(collaborators.vad),
        })
    }

    /// Register an observer for state transitions (metrics, tests).
    pub fn on_transition(&self, listener: crate::state::TransitionListener) {
        self.state.on_transition(listener);
    }

    /// The session's context store (message log and prompt inputs).
    pub fn context(&self) -> ContextStore {
        self.context.clone()
    }

    /// Handle for the microphone thread, the HTTP surface, and tests.
    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            events: self.events_tx.clone(),
            shutdown: self.shutdown.clone(),
            state: self.state.clone(),
            tasks: self.tasks.clone(),
            staging: self.staging.clone(),
            session_id: Arc::clone(&self.session_id),
            started_at: self.started_at,
        }
    }

    /// Token the capture loop must watch. Shutdown cancels it first, so the
    /// microphone goes quiet before anything downstream closes.
    pub fn mic_token(&self) -> CancellationToken {
        self.mic_cancel.clone()
    }

    /// Take the microphone gate. Callable once; the gate owns the VAD.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn mic_gate(&mut self) -> MicGate {
        let vad = self.vad.take().expect("mic gate already taken");
        MicGate {
            vad,
            threshold_bits: Arc::clone(&self.threshold_bits),
            stt_gate: Arc::clone(&self.stt_gate),
            events: self.events_tx.clone(),
            frames: self.frames_tx.clone(),
            in_speech: false,
            dropped: 0,
        }
    }

    /// Run the session until shutdown.
    ///
    /// Startup brings collaborators up in dependency order (memory, STT,
    /// player; the microphone is enabled by the caller once this is
    /// running); shutdown reverses it, cancelling background tasks before
    /// anything they might touch closes.
    ///
    /// # Errors
    ///
    /// Returns an error on unrecoverable startup failure.
    pub async fn run(mut self) -> Result<()> {
        info!(session = %self.session_id, "starting conversation pipeline");

        // Memory first: retrieved context for the session, failure non-fatal.
        let retrieved_budget = self.config.context.retrieved_target_tokens;
        match self.memory.pre_load("").await {
            Ok(text) if !text.trim().is_empty() => self
                .context
                .set_retrieved(crate::context::clamp_to_token_budget(&text, retrieved_budget)),
            Ok(_) => {}
            Err(e) => warn!("memory pre-load failed: {e}"),
        }

        let mut stt_events = self.stt.connect().await?;
        let mut stt_connected = true;
        self.player.start().await?;
        info!("pipeline ready (state: {})", self.state.state());

        let mut events_rx = self.events_rx.take().expect("run called twice");
        let mut frames_rx = self.frames_rx.take().expect("run called twice");
        let mut signals_rx = self.signals_rx.take().expect("run called twice");
        let shutdown = self.shutdown.clone();

        let mut current_turn: Option<TurnHandle> = None;
        let mut pending_partial: Option<String> = None;
        let mut committed: Option<String> = None;
        // Keeps a placeholder event channel open while STT is deliberately
        // disconnected, so the closed-stream branch stays quiet until frames
        // flow again.
        let mut _parked_stt_tx: Option<mpsc::UnboundedSender<SttEvent>> = None;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,

                Some(event) = events_rx.recv() => match event {
                    LoopEvent::SpeechDetected { at } => {
                        self.on_speech_detected(at, &mut current_turn).await;
                    }
                },

                Some(frame) = frames_rx.recv() => {
                    if !self.state.state().forwards_to_stt() {
                        continue;
                    }
                    if !stt_connected {
                        match self.stt.connect().await {
                            Ok(rx) => {
                                stt_events = rx;
                                stt_connected = true;
                                _parked_stt_tx = None;
                            }
                            Err(e) => {
                                warn!("STT reconnect failed: {e}");
                                tokio::time::sleep(STT_RECONNECT_BACKOFF).await;
                                continue;
                            }
                        }
                    }
                    if let Err(e) = self.stt.send_frame(&frame).await {
                        warn!("STT send failed, reconnecting: {e}");
                        match self.stt.connect().await {
                            Ok(rx) => {
                                stt_events = rx;
                                let _ = self.stt.send_frame(&frame).await;
                            }
                            Err(e) => {
                                warn!("STT reconnect failed: {e}");
                                stt_connected = false;
                            }
                        }
                    }
                },

                maybe_event = stt_events.recv() => match maybe_event {
                    Some(SttEvent::SessionStarted) => debug!("STT session started"),
                    Some(SttEvent::Transcript(event)) => match event.kind {
                        TranscriptKind::Partial => pending_partial = Some(event.text),
                        TranscriptKind::Final => committed = Some(event.text),
                    },
                    Some(SttEvent::UtteranceEnd) => {
                        if committed.is_none()
                            && let Some(partial) = pending_partial.as_deref()
                        {
                            debug!("utterance ended with uncommitted partial: {partial}");
                        }
                        pending_partial = None;
                        self.on_utterance_end(committed.take(), &mut current_turn);
                    }
                    Some(SttEvent::Error(message)) => {
                        warn!("STT session error, resetting connection: {message}");
                        match self.stt.connect().await {
                            Ok(rx) => stt_events = rx,
                            Err(e) => {
                                warn!("STT reconnect failed: {e}");
                                stt_connected = false;
                                tokio::time::sleep(STT_RECONNECT_BACKOFF).await;
                            }
                        }
                    }
                    None => {
                        if stt_connected {
                            // Event stream closed under us; re-establish.
                            warn!("STT event stream closed, reconnecting");
                            match self.stt.connect().await {
                                Ok(rx) => stt_events = rx,
                                Err(e) => {
                                    warn!("STT reconnect failed: {e}");
                                    stt_connected = false;
                                    let (tx, rx) = mpsc::unbounded_channel();
                                    _parked_stt_tx = Some(tx);
                                    stt_events = rx;
                                }
                            }
                        } else {
                            // Deliberately disconnected; park a placeholder
                            // channel and wait for frames to trigger a
                            // reconnect.
                            let (tx, rx) = mpsc::unbounded_channel();
                            _parked_stt_tx = Some(tx);
                            stt_events = rx;
                        }
                    }
                },

                Some(signal) = signals_rx.recv() => match signal {
                    TurnSignal::ActiveTimeout => {
                        if self
                            .state
                            .apply_if(ConversationState::Active, ConversationEvent::ActiveTimeout)
                            .is_some()
                        {
                            info!("active timeout: conversation idle");
                            if self.config.stt.idle_policy == SttIdlePolicy::Disconnect {
                                if let Err(e) = self.stt.disconnect().await {
                                    warn!("STT disconnect failed: {e}");
                                }
                                stt_connected = false;
                            }
                        }
                    }
                    TurnSignal::Persist { role, content } => {
                        self.persist_record(role, content);
                    }
                },
            }
        }

        self.shutdown_sequence(current_turn).await;
        Ok(())
    }

    /// Route a speech onset by current state.
    async fn on_speech_detected(&mut self, at: Instant, current_turn: &mut Option<TurnHandle>) {
        match self.state.state() {
            ConversationState::Idle => {
                let _ = self
                    .state
                    .apply_if(ConversationState::Idle, ConversationEvent::SpeechDetected);
            }
            ConversationState::Active => {
                self.turn.cancel_active_timer();
                let _ = self
                    .state
                    .apply_if(ConversationState::Active, ConversationEvent::SpeechDetected);
            }
            ConversationState::Speaking => {
                // Race against turn completion: whoever takes the state lock
                // first wins. Losing here means the turn already reached
                // Active, so this onset is ordinary follow-up speech.
                if self
                    .state
                    .apply_if(ConversationState::Speaking, ConversationEvent::SpeechDetected)
                    .is_some()
                {
                    debug!(latency_ms = at.elapsed().as_millis() as u64, "barge-in");
                    self.barge_in(current_turn).await;
                } else {
                    self.turn.cancel_active_timer();
                    let _ = self
                        .state
                        .apply_if(ConversationState::Active, ConversationEvent::SpeechDetected);
                }
            }
            ConversationState::Listening
            | ConversationState::Processing
            | ConversationState::Interrupted => {}
        }
    }

    /// Tear down the in-flight turn after the state reached `Interrupted`.
    ///
    /// Order matters: stop the sources (LLM, TTS), silence the sink, drain
    /// the queue, then await task cancellation. The partial assistant text
    /// is discarded — `run_turn` never appends on the cancelled path.
    async fn barge_in(&mut self, current_turn: &mut Option<TurnHandle>) {
        info!("barge-in: cancelling in-flight turn");
        self.llm.cancel();
        self.tts.flush().await;
        self.player.kill().await;
        let drained = self.staging.drain().await;
        debug!(drained, "audio staging drained");

        if let Some(turn) = current_turn.take() {
            turn.cancel.cancel();
            match turn.handle.await {
                Ok(Err(OrchestratorError::Cancelled)) | Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("turn ended with error during barge-in: {e}"),
                Err(e) => warn!("turn task join failed: {e}"),
            }
        }
        // Frames the producer managed to push between drain and unwind.
        let _ = self.staging.drain().await;

        let _ = self.state.apply_if(
            ConversationState::Interrupted,
            ConversationEvent::InterruptHandled,
        );
    }

    /// Start a turn for a committed transcript on utterance end.
    fn on_utterance_end(&mut self, committed: Option<String>, current_turn: &mut Option<TurnHandle>) {
        let Some(text) = committed else {
            debug!("utterance end without a committed transcript");
            return;
        };
        if self
            .state
            .apply_if(ConversationState::Listening, ConversationEvent::UtteranceComplete)
            .is_none()
        {
            debug!("utterance end outside LISTENING, ignored");
            return;
        }
        if let Some(stale) = current_turn.take()
            && !stale.handle.is_finished()
        {
            // State gating should make this impossible; never run two turns.
            warn!("previous turn still running at turn start, cancelling");
            stale.cancel.cancel();
        }

        info!(chars = text.chars().count(), "turn armed");
        let turn = Arc::clone(&self.turn);
        let memory = Arc::clone(&self.memory);
        let context = self.context.clone();
        let retrieved_budget = self.config.context.retrieved_target_tokens;
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let handle = tokio::spawn(async move {
            // Refresh retrieved context for this turn; failures are non-fatal.
            match memory.pre_load(&text).await {
                Ok(retrieved) if !retrieved.trim().is_empty() => context.set_retrieved(
                    crate::context::clamp_to_token_budget(&retrieved, retrieved_budget),
                ),
                Ok(_) => {}
                Err(e) => debug!("memory pre-load failed: {e}"),
            }
            turn.run_turn(text, child).await
        });
        *current_turn = Some(TurnHandle { handle, cancel });
    }

    /// Persist one conversation record through the registry.
    fn persist_record(&self, role: Role, content: String) {
        let transcript = Arc::clone(&self.transcript);
        self.tasks.spawn("transcript-append", move |_cancel| async move {
            let mut log = transcript.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = log.append(role, &content) {
                warn!("transcript append failed: {e}");
            }
        });
    }

    /// Reverse-order teardown: microphone first, then timers and the
    /// in-flight turn, then background tasks — all awaited before any
    /// connection closes, so no task observes a torn-down resource.
    async fn shutdown_sequence(&mut self, current_turn: Option<TurnHandle>) {
        info!("shutting down conversation pipeline");
        self.mic_cancel.cancel();
        self.turn.cancel_active_timer();

        if let Some(turn) = current_turn {
            self.llm.cancel();
            turn.cancel.cancel();
            let _ = turn.handle.await;
        }
        self.tasks.shutdown_all().await;

        if let Err(e) = self.stt.disconnect().await {
            warn!("STT disconnect failed: {e}");
        }
        self.player.kill().await;
        self.llm.cancel();
        self.tts.flush().await;

        if self.config.transcript.csv_export {
            let log = self.transcript.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = log.export_csv(chrono::Local::now().date_naive()) {
                warn!("transcript CSV export failed: {e}");
            }
        }
        info!("shutdown complete");
    }
}
