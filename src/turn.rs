//! Turn processing: one committed user utterance through the LLM, tools,
//! TTS, and the player.
//!
//! Each LLM iteration runs a producer task (stream → chunker → TTS →
//! staging) and a consumer task (staging → player) in parallel, so the first
//! sentence plays while later ones are still being generated. Both tasks
//! watch the turn's cancellation token; a barge-in unwinds them cleanly and
//! the partial assistant text never reaches the context.

use crate::audio::staging::{AudioStaging, StagedFrame};
use crate::chunker::SentenceChunker;
use crate::config::TurnConfig;
use crate::context::ContextStore;
use crate::error::{OrchestratorError, Result};
use crate::messages::{LlmEvent, Message, Role, ToolUse};
use crate::state::{ConversationEvent, ConversationState, SharedState};
use crate::tasks::{TaskId, TaskRegistry};
use crate::traits::{LanguageModel, LlmStream, Memory, Player, TextToSpeech, Tool, ToolSet};
use futures_util::StreamExt;
use rand::seq::SliceRandom;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Short lines spoken when a collaborator fails mid-turn.
const APOLOGY_LINES: &[&str] = &[
    "미안, 잠깐 문제가 생겼어. 다시 말해 줄래?",
    "잠시 연결이 불안정했어. 한 번만 더 말해 줘.",
    "미안, 방금 놓쳤어. 다시 한 번?",
];

/// Signals from turn processing back to the orchestrator loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnSignal {
    /// The active timer elapsed with no user speech.
    ActiveTimeout,
    /// A conversation record ready for transcript persistence.
    Persist { role: Role, content: String },
}

/// Result of a completed (or degraded) turn.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// Final assistant text appended to the context (empty when degraded).
    pub assistant_text: String,
    /// A collaborator failed and the apology path ran instead.
    pub degraded: bool,
}

/// What one LLM iteration produced.
struct IterationOutcome {
    text: String,
    tool_uses: Vec<ToolUse>,
    /// Whether any TTS frame reached the staging queue this iteration.
    spoke: bool,
}

/// Drives single turns end-to-end. One instance per session.
pub struct TurnProcessor {
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    player: Arc<dyn Player>,
    memory: Arc<dyn Memory>,
    context: ContextStore,
    tools: ToolSet,
    state: SharedState,
    tasks: TaskRegistry,
    staging: AudioStaging,
    config: TurnConfig,
    signals: tokio::sync::mpsc::UnboundedSender<TurnSignal>,
    active_timer: Mutex<Option<TaskId>>,
}

impl TurnProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
        player: Arc<dyn Player>,
        memory: Arc<dyn Memory>,
        context: ContextStore,
        tools: ToolSet,
        state: SharedState,
        tasks: TaskRegistry,
        staging: AudioStaging,
        config: TurnConfig,
        signals: tokio::sync::mpsc::UnboundedSender<TurnSignal>,
    ) -> Self {
        Self {
            llm,
            tts,
            player,
            memory,
            context,
            tools,
            state,
            tasks,
            staging,
            config,
            signals,
            active_timer: Mutex::new(None),
        }
    }

    /// Run one turn for a committed transcript.
    ///
    /// Returns `Ok` with a degraded outcome on caught collaborator failures
    /// (the apology path), and `Err(Cancelled)` when a barge-in or shutdown
    /// unwound the turn — in that case nothing was appended for the
    /// assistant.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Cancelled`] on cooperative cancellation.
    pub async fn run_turn(
        &self,
        user_text: String,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        self.cancel_active_timer();
        self.context.append(Message::user(user_text.clone()));
        self.persist(Role::User, &user_text);

        let mut final_text = String::new();
        let mut iteration = 0;
        loop {
            let system = self.context.system_blocks();
            let tool_defs = self.tools.definitions();
            let window = self.context.window();

            let stream = match self.llm.stream(&system, &tool_defs, &window).await {
                Ok(stream) => stream,
                Err(err) => return self.degraded_turn(err).await,
            };

            let outcome = match self.run_iteration(stream, &cancel).await {
                Ok(outcome) => outcome,
                Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(err) => return self.degraded_turn(err).await,
            };
            iteration += 1;

            if outcome.tool_uses.is_empty() {
                final_text = outcome.text;
                break;
            }
            if iteration >= self.config.max_tool_iterations {
                // Cap reached while the model still wants tools: drop the
                // pending calls and let the spoken text stand as the answer.
                // Text from earlier iterations is already in the log.
                warn!(
                    iteration,
                    pending = outcome.tool_uses.len(),
                    "tool iteration cap reached, ending turn"
                );
                final_text = outcome.text;
                break;
            }

            self.context
                .append(Message::assistant_with_tools(&outcome.text, &outcome.tool_uses));
            for tool_use in &outcome.tool_uses {
                if cancel.is_cancelled() {
                    return Err(OrchestratorError::Cancelled);
                }
                let result = self.execute_tool(tool_use).await;
                self.persist(Role::ToolResult, &result.content.text());
                self.context.append(result);
            }

            // The model emitted text and tools in the same iteration when we
            // are already speaking; a tool-only iteration self-loops.
            let from = if outcome.spoke {
                ConversationState::Speaking
            } else {
                ConversationState::Processing
            };
            let _ = self.state.apply_if(from, ConversationEvent::ToolIteration);
            debug!(iteration, "tool iteration complete");
        }

        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        // Close out under the state lock. If a barge-in reached INTERRUPTED
        // first, it won the race: the partial text is discarded.
        let _ = self
            .state
            .apply_if(ConversationState::Processing, ConversationEvent::TtsStarted);
        let became_active = self
            .state
            .apply_if(ConversationState::Speaking, ConversationEvent::TtsComplete)
            .is_some();
        if !became_active {
            return Err(OrchestratorError::Cancelled);
        }

        if !final_text.trim().is_empty() {
            self.context.append(Message::assistant(final_text.clone()));
            self.persist(Role::Assistant, &final_text);
        }
        self.arm_active_timer();
        self.spawn_memory_extraction();

        info!(chars = final_text.chars().count(), "turn complete");
        Ok(TurnOutcome {
            assistant_text: final_text,
            degraded: false,
        })
    }

    /// Run one LLM stream with paired producer and consumer tasks.
    async fn run_iteration(
        &self,
        stream: LlmStream,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome> {
        // Either side failing cancels the other so neither blocks forever on
        // a queue the peer no longer serves.
        let iter_cancel = cancel.child_token();

        let producer = tokio::spawn(run_producer(
            stream,
            Arc::clone(&self.tts),
            self.staging.clone(),
            self.state.clone(),
            iter_cancel.clone(),
        ));
        let consumer = tokio::spawn(run_consumer(
            Arc::clone(&self.player),
            self.staging.clone(),
            iter_cancel.clone(),
        ));

        let (producer_res, consumer_res) = tokio::join!(producer, consumer);
        let producer_res = flatten_join(producer_res);
        let consumer_res = flatten_join(consumer_res);

        match (producer_res, consumer_res) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            // Errors of one turn join at the boundary; the worst class wins.
            (Err(a), Err(b)) => Err(a.worst(b)),
        }
    }

    /// Execute one tool call. Errors come back as error tool results so the
    /// model can observe them.
    async fn execute_tool(&self, tool_use: &ToolUse) -> Message {
        match self.tools.get(&tool_use.name) {
            Some(tool) => {
                debug!(name = %tool_use.name, "executing tool");
                match tool.invoke(tool_use.input.clone()).await {
                    Ok(output) => Message::tool_result(&tool_use.id, output, false),
                    Err(message) => {
                        warn!(name = %tool_use.name, "tool failed: {message}");
                        Message::tool_result(&tool_use.id, serde_json::json!(message), true)
                    }
                }
            }
            None => Message::tool_result(
                &tool_use.id,
                serde_json::json!(format!("unknown tool: {}", tool_use.name)),
                true,
            ),
        }
    }

    /// Abort the turn after a collaborator failure: apologize over TTS and
    /// settle in `Active`. The session stays alive.
    async fn degraded_turn(&self, err: OrchestratorError) -> Result<TurnOutcome> {
        warn!("turn degraded: {err}");
        self.speak_apology().await;
        self.finish_speaking();
        Ok(TurnOutcome {
            assistant_text: String::new(),
            degraded: true,
        })
    }

    /// Best-effort apology playback, bypassing the staging queue.
    async fn speak_apology(&self) {
        let line = APOLOGY_LINES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(APOLOGY_LINES[0]);

        let mut frames = match self.tts.stream(line).await {
            Ok(frames) => frames,
            Err(e) => {
                warn!("apology TTS unavailable: {e}");
                return;
            }
        };
        if self.player.start().await.is_err() {
            return;
        }
        let _ = self
            .state
            .apply_if(ConversationState::Processing, ConversationEvent::TtsStarted);
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(pcm) => {
                    if let Err(e) = self.player.play(pcm).await {
                        warn!("apology playback failed: {e}");
                        break;
                    }
                }
                Err(e) => {
                    warn!("apology TTS stream failed: {e}");
                    break;
                }
            }
        }
        let _ = self.player.finish().await;
    }

    /// Close out the speaking phase: `TtsComplete` into `Active` and arm the
    /// active timer. A turn that produced no audio passes through `Speaking`
    /// so the machine still lands in `Active`.
    fn finish_speaking(&self) {
        let _ = self
            .state
            .apply_if(ConversationState::Processing, ConversationEvent::TtsStarted);
        let became_active = self
            .state
            .apply_if(ConversationState::Speaking, ConversationEvent::TtsComplete)
            .is_some();
        if became_active {
            self.arm_active_timer();
        }
    }

    /// Arm (or re-arm) the ACTIVE -> IDLE timer through the registry.
    fn arm_active_timer(&self) {
        let timeout = self.config.active_timeout;
        let signals = self.signals.clone();
        let id = self.tasks.spawn("active-timer", move |_cancel| async move {
            tokio::time::sleep(timeout).await;
            let _ = signals.send(TurnSignal::ActiveTimeout);
        });

        let previous = {
            let mut guard = self.active_timer.lock().unwrap_or_else(|e| e.into_inner());
            guard.replace(id)
        };
        if let Some(previous) = previous {
            self.tasks.cancel(previous);
        }
    }

    /// Cancel a pending active timer (the user spoke again).
    pub fn cancel_active_timer(&self) {
        let id = {
            let mut guard = self.active_timer.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(id) = id {
            self.tasks.cancel(id);
        }
    }

    /// Extract durable memory from the full log in the background.
    fn spawn_memory_extraction(&self) {
        let memory = Arc::clone(&self.memory);
        let log = self.context.log();
        self.tasks.spawn("memory-extract", move |_cancel| async move {
            if let Err(e) = memory.extract_and_save(&log).await {
                warn!("memory extraction failed: {e}");
            }
        });
    }

    fn persist(&self, role: Role, content: &str) {
        let _ = self.signals.send(TurnSignal::Persist {
            role,
            content: content.to_owned(),
        });
    }
}

/// Producer: LLM stream → sentence chunker → TTS → staging queue.
async fn run_producer(
    mut stream: LlmStream,
    tts: Arc<dyn TextToSpeech>,
    staging: AudioStaging,
    state: SharedState,
    cancel: CancellationToken,
) -> Result<IterationOutcome> {
    let result = async {
        let mut chunker = SentenceChunker::new();
        let mut text = String::new();
        let mut tool_uses = Vec::new();
        let mut spoke = false;
        let mut emitted_sentence = false;

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                event = stream.next() => event,
            };
            let Some(event) = event else { break };
            match event? {
                LlmEvent::TextDelta(delta) => {
                    text.push_str(&delta);
                    for sentence in chunker.push(&delta) {
                        synth_sentence(
                            &*tts,
                            &staging,
                            &state,
                            &cancel,
                            &sentence,
                            &mut spoke,
                            &mut emitted_sentence,
                        )
                        .await?;
                    }
                }
                LlmEvent::ToolUse(tool_use) => tool_uses.push(tool_use),
                LlmEvent::Stop => break,
            }
        }

        if let Some(rest) = chunker.finish() {
            synth_sentence(
                &*tts,
                &staging,
                &state,
                &cancel,
                &rest,
                &mut spoke,
                &mut emitted_sentence,
            )
            .await?;
        }
        tokio::select! {
            () = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            sent = staging.send(StagedFrame::EndOfUtterance) => sent?,
        }
        Ok(IterationOutcome {
            text,
            tool_uses,
            spoke,
        })
    }
    .await;

    if result.is_err() {
        cancel.cancel();
    }
    result
}

/// Synthesize one sentence into the staging queue.
///
/// A TTS failure skips the rest of this sentence and the turn continues with
/// the next one; only cancellation and a dead queue propagate.
async fn synth_sentence(
    tts: &dyn TextToSpeech,
    staging: &AudioStaging,
    state: &SharedState,
    cancel: &CancellationToken,
    sentence: &str,
    spoke: &mut bool,
    emitted_sentence: &mut bool,
) -> Result<()> {
    if *emitted_sentence {
        tokio::select! {
            () = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            sent = staging.send(StagedFrame::SentenceBoundary) => sent?,
        }
    }

    let mut frames = match tts.stream(sentence).await {
        Ok(frames) => frames,
        Err(e) => {
            warn!("TTS failed for sentence, skipping: {e}");
            *emitted_sentence = true;
            return Ok(());
        }
    };

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            frame = frames.next() => frame,
        };
        let Some(frame) = frame else { break };
        match frame {
            Ok(pcm) => {
                tokio::select! {
                    () = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                    sent = staging.send(StagedFrame::Pcm(pcm)) => sent?,
                }
                if !*spoke {
                    *spoke = true;
                    // First frame of the turn's audio: we are speaking now.
                    let _ = state
                        .apply_if(ConversationState::Processing, ConversationEvent::TtsStarted);
                }
            }
            Err(e) => {
                warn!("TTS stream failed mid-sentence, skipping rest: {e}");
                break;
            }
        }
    }
    *emitted_sentence = true;
    Ok(())
}

/// Consumer: staging queue → player, until the end-of-utterance sentinel.
async fn run_consumer(
    player: Arc<dyn Player>,
    staging: AudioStaging,
    cancel: CancellationToken,
) -> Result<()> {
    let result = async {
        player.start().await?;
        let mut skipping = false;
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                frame = staging.recv() => frame,
            };
            let Some(frame) = frame else { break };
            match frame {
                StagedFrame::Pcm(pcm) => {
                    if skipping {
                        continue;
                    }
                    if let Err(e) = player.play(pcm).await {
                        // Player crash: kill, restart at the next sentence;
                        // the current sentence is lost.
                        warn!("player failed, restarting: {e}");
                        player.kill().await;
                        player.start().await?;
                        skipping = true;
                    }
                }
                StagedFrame::SentenceBoundary => skipping = false,
                StagedFrame::EndOfUtterance => {
                    if let Err(e) = player.finish().await {
                        warn!("player drain failed: {e}");
                    }
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    if result.is_err() {
        cancel.cancel();
    }
    result
}

fn flatten_join<T>(res: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match res {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Err(OrchestratorError::Cancelled),
        Err(e) => Err(OrchestratorError::Channel(format!("turn task panicked: {e}"))),
    }
}
