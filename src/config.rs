//! Configuration for the conversation orchestrator.
//!
//! All options come from `SORI_*` environment variables with sensible
//! defaults. Missing required values and unparseable overrides are
//! [`OrchestratorError::Config`] failures, fatal at startup only.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Per-turn processing settings.
    pub turn: TurnConfig,
    /// Conversation context / system prompt settings.
    pub context: ContextConfig,
    /// HTTP control surface settings.
    pub server: ServerConfig,
    /// Conversation transcript persistence settings.
    pub transcript: TranscriptConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input sample rate in Hz.
    pub input_sample_rate: u32,
    /// Output sample rate in Hz (TTS PCM format).
    pub output_sample_rate: u32,
    /// Capture chunk size in samples (512 at 16kHz is ~32ms).
    pub chunk_samples: usize,
    /// Input device index (None = system default).
    pub input_device_index: Option<usize>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            chunk_samples: 512,
            input_device_index: None,
            output_device: None,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold while the assistant is not speaking.
    pub threshold_normal: f32,
    /// Elevated threshold while the assistant is speaking, so speaker bleed
    /// does not trigger a barge-in. A deliberate interruption is required.
    pub threshold_speaking: f32,
    /// Consecutive supra-threshold chunks before speech-start fires.
    pub attack_frames: u32,
    /// Consecutive sub-threshold chunks before speech-end fires.
    pub release_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold_normal: 0.01,
            threshold_speaking: 0.035,
            attack_frames: 3,
            release_frames: 8,
        }
    }
}

/// What to do with the STT session when the conversation goes idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SttIdlePolicy {
    /// Keep the connection open across idle periods (default).
    #[default]
    KeepWarm,
    /// Disconnect on ACTIVE -> IDLE and reconnect on the next utterance.
    Disconnect,
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// BCP-47 language code sent to the STT session.
    pub language: String,
    /// Connection handling when the conversation goes idle.
    pub idle_policy: SttIdlePolicy,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            language: "ko".to_owned(),
            idle_policy: SttIdlePolicy::KeepWarm,
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model identifier passed to the LLM client.
    pub model_id: String,
    /// Maximum tokens per response.
    pub max_tokens: usize,
    /// Optional reasoning effort hint ("low" / "medium" / "high").
    pub effort: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model_id: "claude-sonnet-4-5".to_owned(),
            max_tokens: 1024,
            effort: None,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Voice identifier passed to the TTS client.
    pub voice_id: String,
    /// Output PCM format label (sample rate is `audio.output_sample_rate`).
    pub output_format: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice_id: "default".to_owned(),
            output_format: "pcm_24000".to_owned(),
        }
    }
}

/// Per-turn processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// ACTIVE -> IDLE timeout after the assistant finishes speaking.
    pub active_timeout: Duration,
    /// Hard cap on tool iterations per turn. Further tool use is treated
    /// as end-of-turn.
    pub max_tool_iterations: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            active_timeout: Duration::from_secs(30),
            max_tool_iterations: 3,
        }
    }
}

/// Conversation context configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Number of recent turns presented to the LLM.
    pub window_turns: usize,
    /// Token budget hint for the retrieved-context block.
    pub retrieved_target_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_turns: 12,
            retrieved_target_tokens: 1500,
        }
    }
}

/// HTTP control surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the control surface, e.g. "0.0.0.0:8715".
    pub bind: String,
    /// Whether `GET /memory` (process memory snapshot) is served.
    pub memory_endpoint: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8715".to_owned(),
            memory_endpoint: false,
        }
    }
}

/// Conversation transcript persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Directory for daily JSONL conversation logs. None = data dir default.
    pub dir: Option<PathBuf>,
    /// Export the day's log as CSV on clean shutdown.
    pub csv_export: bool,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            dir: None,
            csv_export: false,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from `SORI_*` environment variables, starting
    /// from defaults.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Config`] for any unparseable value.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = env_parse::<u32>("SORI_SAMPLE_RATE")? {
            cfg.audio.input_sample_rate = v;
        }
        if let Some(v) = env_parse::<u32>("SORI_OUTPUT_SAMPLE_RATE")? {
            cfg.audio.output_sample_rate = v;
        }
        if let Some(v) = env_parse::<usize>("SORI_CHUNK_SAMPLES")? {
            cfg.audio.chunk_samples = v;
        }
        cfg.audio.input_device_index = env_parse::<usize>("SORI_MIC_DEVICE_INDEX")?;
        if let Some(v) = env_string("SORI_OUTPUT_DEVICE") {
            cfg.audio.output_device = Some(v);
        }

        if let Some(v) = env_parse::<f32>("SORI_VAD_THRESHOLD")? {
            cfg.vad.threshold_normal = v;
        }
        if let Some(v) = env_parse::<f32>("SORI_VAD_THRESHOLD_SPEAKING")? {
            cfg.vad.threshold_speaking = v;
        }
        if let Some(v) = env_parse::<u32>("SORI_VAD_ATTACK_FRAMES")? {
            cfg.vad.attack_frames = v;
        }
        if let Some(v) = env_parse::<u32>("SORI_VAD_RELEASE_FRAMES")? {
            cfg.vad.release_frames = v;
        }

        if let Some(v) = env_string("SORI_STT_LANGUAGE") {
            cfg.stt.language = v;
        }
        if let Some(v) = env_string("SORI_STT_IDLE_POLICY") {
            cfg.stt.idle_policy = match v.as_str() {
                "keep-warm" => SttIdlePolicy::KeepWarm,
                "disconnect" => SttIdlePolicy::Disconnect,
                other => {
                    return Err(OrchestratorError::Config(format!(
                        "SORI_STT_IDLE_POLICY must be keep-warm or disconnect, got '{other}'"
                    )));
                }
            };
        }

        if let Some(v) = env_string("SORI_LLM_MODEL") {
            cfg.llm.model_id = v;
        }
        if let Some(v) = env_parse::<usize>("SORI_LLM_MAX_TOKENS")? {
            cfg.llm.max_tokens = v;
        }
        if let Some(v) = env_string("SORI_LLM_EFFORT") {
            cfg.llm.effort = Some(v);
        }

        if let Some(v) = env_string("SORI_TTS_VOICE") {
            cfg.tts.voice_id = v;
        }
        if let Some(v) = env_string("SORI_TTS_FORMAT") {
            cfg.tts.output_format = v;
        }

        if let Some(v) = env_parse::<u64>("SORI_ACTIVE_TIMEOUT_S")? {
            cfg.turn.active_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("SORI_MAX_TOOL_ITERATIONS")? {
            cfg.turn.max_tool_iterations = v;
        }

        if let Some(v) = env_parse::<usize>("SORI_WINDOW_TURNS")? {
            cfg.context.window_turns = v;
        }
        if let Some(v) = env_parse::<usize>("SORI_RETRIEVED_TARGET_TOKENS")? {
            cfg.context.retrieved_target_tokens = v;
        }

        if let Some(v) = env_string("SORI_HTTP_BIND") {
            cfg.server.bind = v;
        }
        if let Some(v) = env_parse::<bool>("SORI_MEMORY_ENDPOINT")? {
            cfg.server.memory_endpoint = v;
        }

        if let Some(v) = env_string("SORI_TRANSCRIPT_DIR") {
            cfg.transcript.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse::<bool>("SORI_TRANSCRIPT_CSV")? {
            cfg.transcript.csv_export = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Sanity-check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Config`] when a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.audio.chunk_samples == 0 {
            return Err(OrchestratorError::Config(
                "SORI_CHUNK_SAMPLES must be non-zero".into(),
            ));
        }
        if self.vad.threshold_speaking < self.vad.threshold_normal {
            return Err(OrchestratorError::Config(format!(
                "speaking VAD threshold {} must not be below the normal threshold {}",
                self.vad.threshold_speaking, self.vad.threshold_normal
            )));
        }
        if self.turn.max_tool_iterations == 0 {
            return Err(OrchestratorError::Config(
                "SORI_MAX_TOOL_ITERATIONS must be at least 1".into(),
            ));
        }
        if self.context.window_turns == 0 {
            return Err(OrchestratorError::Config(
                "SORI_WINDOW_TURNS must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Directory for daily transcript logs, honoring the override.
    pub fn transcript_dir(&self) -> PathBuf {
        match &self.transcript.dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("sori")
                .join("transcripts"),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    let Some(raw) = env_string(key) else {
        return Ok(None);
    };
    raw.trim().parse::<T>().map(Some).map_err(|_| {
        OrchestratorError::Config(format!("cannot parse {key}='{raw}'"))
    })
}
