//! Error types for the conversation orchestrator.

use crate::state::{ConversationEvent, ConversationState};

/// Top-level error type for the voice conversation system.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Recoverable collaborator failure (network hiccup, stream reset).
    ///
    /// Surfaces as a degraded turn (apology playback); the session stays up.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A collaborator returned malformed frames; its connection is reset
    /// and the current turn is not retried.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Cooperative cancellation; unwinds quietly.
    #[error("cancelled")]
    Cancelled,

    /// Illegal state machine transition. Programmer error: fatal in debug
    /// builds, logged and ignored in release.
    #[error("invalid transition: {from:?} on {event:?}")]
    InvalidTransition {
        from: ConversationState,
        event: ConversationEvent,
    },

    /// Missing or invalid configuration. Fatal at startup only.
    #[error("config error: {0}")]
    Config(String),

    /// Audio queue overflow past the pressure warning, pool exhaustion.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Channel send/receive error between pipeline stages.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error (transcript log, CSV export).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Severity rank used when joining the producer and consumer errors of a
    /// single turn: the worst class wins.
    ///
    /// `Cancelled` ranks lowest — a cancelled peer never masks a real fault.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Cancelled => 0,
            Self::TransientNetwork(_) => 1,
            Self::Audio(_) | Self::Io(_) => 2,
            Self::Channel(_) => 3,
            Self::ResourceExhaustion(_) => 4,
            Self::ProtocolViolation(_) => 5,
            Self::InvalidTransition { .. } => 6,
            Self::Config(_) => 7,
        }
    }

    /// Pick the worse of two turn-level errors.
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Whether the session should keep running after this error surfaced
    /// from a turn.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
