//! Conversation state machine.
//!
//! Six states, a fixed legal-transition table, and nothing else: the next
//! state is a pure function of (current state, event). The orchestrator owns
//! the single instance and serializes every transition behind one lock, which
//! is what makes the barge-in race against turn completion decidable.

use crate::config::VadConfig;
use crate::error::{OrchestratorError, Result};
use serde::Serialize;
use tracing::{debug, warn};

/// The conversation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Nothing happening; microphone gated by VAD only.
    Idle,
    /// User speech in progress; frames forwarded to STT.
    Listening,
    /// Committed transcript being processed by the LLM (and tools).
    Processing,
    /// Assistant audio playing; VAD runs at the elevated threshold.
    Speaking,
    /// Assistant finished; waiting for a follow-up or the idle timeout.
    Active,
    /// User barged in; the in-flight turn is being torn down.
    Interrupted,
}

impl ConversationState {
    /// Initial state of a fresh session.
    pub const INITIAL: Self = Self::Idle;

    /// VAD sensitivity for this state. Elevated while `Speaking` so speaker
    /// bleed does not read as user speech.
    pub fn vad_threshold(self, vad: &VadConfig) -> f32 {
        match self {
            Self::Speaking => vad.threshold_speaking,
            _ => vad.threshold_normal,
        }
    }

    /// Whether microphone frames are forwarded to STT in this state.
    pub fn forwards_to_stt(self) -> bool {
        matches!(self, Self::Listening | Self::Interrupted)
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Active => "active",
            Self::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Events that drive state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationEvent {
    /// VAD reported sustained speech.
    SpeechDetected,
    /// STT committed a final transcript and signalled utterance end.
    UtteranceComplete,
    /// First TTS frame of the turn reached the audio staging queue.
    TtsStarted,
    /// The turn is executing tools and re-entering the LLM.
    ToolIteration,
    /// Playback of the assistant response finished.
    TtsComplete,
    /// Barge-in teardown finished; ready for the user's correction.
    InterruptHandled,
    /// No user speech within the active window.
    ActiveTimeout,
}

/// Next state for `(state, event)`, or `InvalidTransition`.
///
/// `ToolIteration` is accepted from both `Processing` (a tool-only
/// iteration) and `Speaking` (the model emitted text and tools in the same
/// iteration); both land in `Processing`.
pub fn transition(
    state: ConversationState,
    event: ConversationEvent,
) -> Result<ConversationState> {
    use ConversationEvent as E;
    use ConversationState as S;

    let next = match (state, event) {
        (S::Idle, E::SpeechDetected) => S::Listening,
        (S::Listening, E::UtteranceComplete) => S::Processing,
        (S::Processing, E::TtsStarted) => S::Speaking,
        (S::Processing, E::ToolIteration) => S::Processing,
        (S::Speaking, E::ToolIteration) => S::Processing,
        (S::Speaking, E::TtsComplete) => S::Active,
        (S::Speaking, E::SpeechDetected) => S::Interrupted,
        (S::Interrupted, E::InterruptHandled) => S::Listening,
        (S::Active, E::SpeechDetected) => S::Listening,
        (S::Active, E::ActiveTimeout) => S::Idle,
        (from, event) => {
            return Err(OrchestratorError::InvalidTransition { from, event });
        }
    };
    Ok(next)
}

/// Callback invoked after every accepted transition.
pub type TransitionListener =
    Box<dyn Fn(ConversationState, ConversationEvent, ConversationState) + Send + Sync>;

/// The conversation state machine instance.
///
/// Holds only the current state and the registered listeners; all
/// synchronization lives with the owner.
pub struct StateMachine {
    current: ConversationState,
    listeners: Vec<TransitionListener>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a machine in the initial `Idle` state.
    pub fn new() -> Self {
        Self {
            current: ConversationState::INITIAL,
            listeners: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConversationState {
        self.current
    }

    /// Register a listener called after each accepted transition.
    pub fn on_transition(&mut self, listener: TransitionListener) {
        self.listeners.push(listener);
    }

    /// Apply an event.
    ///
    /// An illegal transition is a programmer error: it panics in debug
    /// builds via `debug_assert!` and is logged and rejected in release.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidTransition`] for events not in
    /// the legal table.
    pub fn apply(&mut self, event: ConversationEvent) -> Result<ConversationState> {
        match transition(self.current, event) {
            Ok(next) => {
                let from = self.current;
                self.current = next;
                debug!("state: {from} --{event:?}--> {next}");
                for listener in &self.listeners {
                    listener(from, event, next);
                }
                Ok(next)
            }
            Err(err) => {
                debug_assert!(false, "illegal transition: {err}");
                warn!("ignoring illegal transition: {err}");
                Err(err)
            }
        }
    }

    /// Apply an event only if the machine is currently in `expected`.
    ///
    /// Used for race-prone events (barge-in vs. turn completion, the active
    /// timeout): whoever takes the state lock first wins, the loser sees a
    /// stale `expected` and backs off without error noise.
    pub fn apply_if(
        &mut self,
        expected: ConversationState,
        event: ConversationEvent,
    ) -> Option<ConversationState> {
        if self.current != expected {
            return None;
        }
        self.apply(event).ok()
    }
}

/// Thread-safe handle to the session's single state machine.
///
/// All transitions serialize on the inner lock; racing events (barge-in vs.
/// turn completion) resolve to whichever caller takes the lock first, and
/// the loser backs off via [`StateMachine::apply_if`].
#[derive(Clone)]
pub struct SharedState(std::sync::Arc<std::sync::Mutex<StateMachine>>);

impl Default for SharedState {
    fn default() -> Self {
        Self::new(StateMachine::new())
    }
}

impl SharedState {
    pub fn new(machine: StateMachine) -> Self {
        Self(std::sync::Arc::new(std::sync::Mutex::new(machine)))
    }

    pub fn state(&self) -> ConversationState {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).state()
    }

    /// Apply an event under the lock. See [`StateMachine::apply`].
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidTransition`] for illegal events.
    pub fn apply(&self, event: ConversationEvent) -> Result<ConversationState> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .apply(event)
    }

    /// Apply an event only from the expected state. See
    /// [`StateMachine::apply_if`].
    pub fn apply_if(
        &self,
        expected: ConversationState,
        event: ConversationEvent,
    ) -> Option<ConversationState> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .apply_if(expected, event)
    }

    /// Register a transition listener on the shared machine.
    pub fn on_transition(&self, listener: TransitionListener) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_transition(listener);
    }
}
