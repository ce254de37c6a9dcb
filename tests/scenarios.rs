//! End-to-end conversation scenarios over scripted collaborators.
//!
//! Each test assembles a full orchestrator with mock STT/LLM/TTS/player and
//! drives it the way the microphone thread and remote sessions would.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use sori::config::{OrchestratorConfig, SttIdlePolicy};
use sori::error::Result;
use sori::messages::{LlmEvent, Role};
use sori::orchestrator::{Collaborators, Orchestrator, OrchestratorHandle};
use sori::state::{ConversationEvent, ConversationState};
use sori::test_utils::{
    FixedTool, MockMemory, MockStt, NullVad, RecordingPlayer, ScriptedLlm, ScriptedTts,
    SttDriver, decode_tts_frame, tool_use_event,
};
use sori::traits::ToolSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Transition = (ConversationState, ConversationEvent, ConversationState);

struct Harness {
    handle: OrchestratorHandle,
    context: sori::context::ContextStore,
    stt: SttDriver,
    llm: Arc<ScriptedLlm>,
    tts: Arc<ScriptedTts>,
    player: RecordingPlayer,
    memory: Arc<MockMemory>,
    transitions: Arc<Mutex<Vec<Transition>>>,
    run_task: tokio::task::JoinHandle<Result<()>>,
    _transcript_dir: tempfile::TempDir,
}

impl Harness {
    fn spawn(
        llm: Arc<ScriptedLlm>,
        tts: Arc<ScriptedTts>,
        tools: ToolSet,
        mutate: impl FnOnce(&mut OrchestratorConfig),
    ) -> Self {
        let transcript_dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.transcript.dir = Some(transcript_dir.path().to_path_buf());
        mutate(&mut config);

        let (stt, stt_driver) = MockStt::new();
        let player = RecordingPlayer::new();
        let memory = MockMemory::new();

        let collaborators = Collaborators {
            vad: Box::new(NullVad),
            stt: Box::new(stt),
            llm: llm.clone(),
            tts: tts.clone(),
            player: Arc::new(player.clone()),
            memory: memory.clone(),
        };
        let orchestrator =
            Orchestrator::new(config, collaborators, "test persona", tools).unwrap();

        let transitions: Arc<Mutex<Vec<Transition>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let transitions = Arc::clone(&transitions);
            orchestrator.on_transition(Box::new(move |from, event, to| {
                transitions.lock().unwrap().push((from, event, to));
            }));
        }

        let handle = orchestrator.handle();
        let context = orchestrator.context();
        let run_task = tokio::spawn(orchestrator.run());

        Self {
            handle,
            context,
            stt: stt_driver,
            llm,
            tts,
            player,
            memory,
            transitions,
            run_task,
            _transcript_dir: transcript_dir,
        }
    }

    fn transitions(&self) -> Vec<Transition> {
        self.transitions.lock().unwrap().clone()
    }

    /// State sequence including the initial state.
    fn state_path(&self) -> Vec<ConversationState> {
        let mut path = vec![ConversationState::Idle];
        path.extend(self.transitions().into_iter().map(|(_, _, to)| to));
        path
    }

    async fn wait_for_state(&self, want: ConversationState) {
        wait_until(
            || self.handle.state() == want,
            &format!("state {want}"),
        )
        .await;
    }

    /// Drive one utterance: speech onset, then a committed transcript.
    async fn say(&self, text: &str) {
        self.handle.speech_detected();
        self.wait_for_state(ConversationState::Listening).await;
        self.stt.commit_utterance(text);
    }

    async fn shutdown(self) {
        self.handle.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.run_task)
            .await
            .expect("orchestrator loop did not stop");
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..600 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── S1: clean single turn ────────────────────────────────────────────

#[tokio::test]
async fn s1_clean_single_turn() {
    let llm = ScriptedLlm::with_text_response("반가워. 오늘 뭐 해?");
    let tts = ScriptedTts::new(4);
    let harness = Harness::spawn(llm, tts, ToolSet::new(), |_| {});

    harness.say("안녕").await;
    harness.wait_for_state(ConversationState::Active).await;

    // Two sentences, four frames each, in emission order.
    let played = harness.player.played();
    assert_eq!(played.len(), 8);
    let tags: Vec<(usize, usize)> = played
        .iter()
        .map(|pcm| decode_tts_frame(pcm).expect("tagged frame"))
        .collect();
    assert_eq!(
        tags,
        vec![
            (0, 0),
            (0, 1),
            (0, 2),
            (0, 3),
            (1, 0),
            (1, 1),
            (1, 2),
            (1, 3)
        ]
    );
    assert_eq!(
        harness.tts.sentences(),
        vec!["반가워.".to_owned(), "오늘 뭐 해?".to_owned()]
    );

    // State path: IDLE → LISTENING → PROCESSING → SPEAKING → ACTIVE.
    assert_eq!(
        harness.state_path(),
        vec![
            ConversationState::Idle,
            ConversationState::Listening,
            ConversationState::Processing,
            ConversationState::Speaking,
            ConversationState::Active,
        ]
    );

    // Message log holds exactly the user and assistant messages.
    let log = harness.context.log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].role, Role::User);
    assert_eq!(log[0].content.text(), "안녕");
    assert_eq!(log[1].role, Role::Assistant);
    assert_eq!(log[1].content.text(), "반가워. 오늘 뭐 해?");

    // Memory extraction ran in the background with the full log.
    wait_until(
        || harness.memory.extractions().first() == Some(&2),
        "memory extraction",
    )
    .await;

    harness.shutdown().await;
}

// ── S2: barge-in mid-sentence ────────────────────────────────────────

#[tokio::test]
async fn s2_barge_in_mid_sentence() {
    let llm = ScriptedLlm::with_text_response("반가워. 오늘 뭐 해?");
    // Frames trickle so the turn is still speaking when the user barges in.
    let tts = ScriptedTts::with_frame_delay(4, Duration::from_millis(25));
    let harness = Harness::spawn(llm, tts, ToolSet::new(), |_| {});
    let mut playback = harness.player.watch_playback();

    harness.say("안녕").await;

    // Barge in once the player has received frame 3.
    loop {
        let count = playback.recv().await.expect("playback progress");
        if count >= 3 {
            break;
        }
    }
    assert_eq!(harness.handle.state(), ConversationState::Speaking);
    harness.handle.speech_detected();
    harness.wait_for_state(ConversationState::Listening).await;

    assert!(harness.player.kills() >= 1, "player must be killed");
    assert!(harness.tts.flushes() >= 1, "TTS must be flushed");
    assert!(harness.llm.was_cancelled(), "LLM must be cancelled");
    assert_eq!(harness.handle.audio_queue_occupancy(), 0, "staging drained");

    // The partial assistant response is discarded.
    let log = harness.context.log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].role, Role::User);
    assert_eq!(log[0].content.text(), "안녕");

    // SPEAKING → INTERRUPTED → LISTENING happened.
    let transitions = harness.transitions();
    assert!(transitions.contains(&(
        ConversationState::Speaking,
        ConversationEvent::SpeechDetected,
        ConversationState::Interrupted,
    )));
    assert!(transitions.contains(&(
        ConversationState::Interrupted,
        ConversationEvent::InterruptHandled,
        ConversationState::Listening,
    )));

    harness.shutdown().await;
}

// ── S3: tool loop ────────────────────────────────────────────────────

#[tokio::test]
async fn s3_tool_loop() {
    let llm = ScriptedLlm::new(vec![
        vec![tool_use_event("tu-1", "get_time"), LlmEvent::Stop],
        vec![LlmEvent::TextDelta("10시 반이야.".to_owned()), LlmEvent::Stop],
    ]);
    let tts = ScriptedTts::new(4);
    let tool = FixedTool::new("get_time", serde_json::json!("10:30"));
    let mut tools = ToolSet::new();
    tools.register(tool.clone());

    let harness = Harness::spawn(llm, tts, tools, |_| {});
    harness.say("지금 몇 시야?").await;
    harness.wait_for_state(ConversationState::Active).await;

    assert_eq!(tool.calls(), 1);

    // Log ends with [user, tool_use, tool_result, assistant].
    let log = harness.context.log();
    let roles: Vec<Role> = log.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]
    );
    assert!(log[1].content.has_tool_use());
    assert_eq!(log[3].content.text(), "10시 반이야.");

    // PROCESSING self-loops once before reaching SPEAKING.
    let transitions = harness.transitions();
    assert!(transitions.contains(&(
        ConversationState::Processing,
        ConversationEvent::ToolIteration,
        ConversationState::Processing,
    )));
    let tool_loop_pos = transitions
        .iter()
        .position(|t| t.1 == ConversationEvent::ToolIteration)
        .unwrap();
    let speaking_pos = transitions
        .iter()
        .position(|t| t.1 == ConversationEvent::TtsStarted)
        .unwrap();
    assert!(tool_loop_pos < speaking_pos);

    // The second LLM call saw the tool result.
    let requests = harness.llm.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1]
        .messages
        .iter()
        .any(|m| m.role == Role::ToolResult));

    harness.shutdown().await;
}

// ── S4: shutdown while the LLM streams ───────────────────────────────

#[tokio::test]
async fn s4_shutdown_mid_stream() {
    // A long, slow response that will still be streaming at shutdown.
    let script: Vec<LlmEvent> = std::iter::repeat_n(
        LlmEvent::TextDelta("계속 말하는 중이야 ".to_owned()),
        200,
    )
    .chain([LlmEvent::Stop])
    .collect();
    let llm = ScriptedLlm::with_event_delay(vec![script], Duration::from_millis(20));
    let tts = ScriptedTts::new(2);
    let harness = Harness::spawn(llm, tts, ToolSet::new(), |_| {});

    harness.say("이야기 해 줘").await;
    // Let the stream get going.
    wait_until(|| !harness.llm.requests().is_empty(), "LLM stream open").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let handle = harness.handle.clone();
    let stt = harness.stt.clone();
    let started = std::time::Instant::now();
    harness.shutdown().await;
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(200),
        "shutdown took {elapsed:?}"
    );
    assert_eq!(handle.background_tasks(), 0, "registry must be empty");
    // The STT session closes only after background tasks are done.
    assert_eq!(stt.disconnects(), 1);
}

// ── S5: unbounded buffer guard ───────────────────────────────────────

#[tokio::test]
async fn s5_unterminated_stream_is_bounded() {
    // 3000 Hangul chars with no terminator, in 100-char deltas.
    let delta = "가".repeat(100);
    let script: Vec<LlmEvent> = std::iter::repeat_n(LlmEvent::TextDelta(delta), 30)
        .chain([LlmEvent::Stop])
        .collect();
    let llm = ScriptedLlm::new(vec![script]);
    let tts = ScriptedTts::new(1);
    let harness = Harness::spawn(llm, tts, ToolSet::new(), |_| {});

    harness.say("시 읽어 줘").await;
    harness.wait_for_state(ConversationState::Active).await;

    let sentences = harness.tts.sentences();
    assert_eq!(sentences.len(), 2, "overflow flush plus final remainder");
    assert!(sentences[0].chars().count() >= 2000);
    assert!(sentences[1].chars().count() <= 1000);
    let total: usize = sentences.iter().map(|s| s.chars().count()).sum();
    assert_eq!(total, 3000);

    harness.shutdown().await;
}

// ── S6: active timeout ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn s6_active_timeout_reaches_idle() {
    let llm = ScriptedLlm::with_text_response("반가워.");
    let tts = ScriptedTts::new(2);
    let harness = Harness::spawn(llm, tts, ToolSet::new(), |config| {
        config.stt.idle_policy = SttIdlePolicy::Disconnect;
    });

    harness.say("안녕").await;
    harness.wait_for_state(ConversationState::Active).await;

    // Jump the paused clock past the 30s active timer.
    tokio::time::advance(Duration::from_secs(31)).await;
    harness.wait_for_state(ConversationState::Idle).await;
    assert!(harness.transitions().contains(&(
        ConversationState::Active,
        ConversationEvent::ActiveTimeout,
        ConversationState::Idle,
    )));

    // Idle policy: the STT session was torn down.
    wait_until(|| harness.stt.disconnects() == 1, "STT disconnect").await;

    harness.shutdown().await;
}

// ── follow-up: prompt assembly stays cacheable across turns ──────────

#[tokio::test]
async fn prompt_blocks_stable_across_turns() {
    let llm = ScriptedLlm::new(vec![
        vec![LlmEvent::TextDelta("첫 번째 대답.".to_owned()), LlmEvent::Stop],
        vec![LlmEvent::TextDelta("두 번째 대답.".to_owned()), LlmEvent::Stop],
    ]);
    let tts = ScriptedTts::new(1);
    let harness = Harness::spawn(llm, tts, ToolSet::new(), |_| {});

    harness.say("하나").await;
    harness.wait_for_state(ConversationState::Active).await;
    harness.say("둘").await;
    harness.wait_for_state(ConversationState::Active).await;

    let requests = harness.llm.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        let last = request.system.last().unwrap();
        assert!(!last.cache, "dynamic block must never be cacheable");
        assert!(last.text.starts_with("Current time:"));
        assert!(request.system[0].cache);
    }
    // The cache-eligible persona block is byte-identical across turns.
    assert_eq!(requests[0].system[0], requests[1].system[0]);

    harness.shutdown().await;
}

// ── microphone path: VAD onset and STT forwarding ────────────────────

#[tokio::test]
async fn mic_gate_detects_speech_and_forwards_frames() {
    use sori::messages::MicFrame;
    use sori::vad::EnergyVad;
    use std::time::Instant;

    let llm = ScriptedLlm::with_text_response("응.");
    let tts = ScriptedTts::new(1);

    let transcript_dir = tempfile::tempdir().unwrap();
    let mut config = OrchestratorConfig::default();
    config.transcript.dir = Some(transcript_dir.path().to_path_buf());

    let (stt, stt_driver) = MockStt::new();
    let collaborators = Collaborators {
        vad: Box::new(EnergyVad::new(&config.vad)),
        stt: Box::new(stt),
        llm: llm.clone(),
        tts: tts.clone(),
        player: Arc::new(RecordingPlayer::new()),
        memory: MockMemory::new(),
    };
    let mut orchestrator =
        Orchestrator::new(config.clone(), collaborators, "persona", ToolSet::new()).unwrap();
    let handle = orchestrator.handle();
    let mut gate = orchestrator.mic_gate();
    let run_task = tokio::spawn(orchestrator.run());

    wait_until(|| stt_driver.connects() == 1, "pipeline up").await;

    let loud = || MicFrame {
        samples: vec![0.5; config.audio.chunk_samples],
        sample_rate: config.audio.input_sample_rate,
        captured_at: Instant::now(),
    };

    // Sustained speech crosses the attack window and posts speech_detected.
    for _ in 0..config.vad.attack_frames + 1 {
        gate.on_audio_frame(loud());
    }
    wait_until(
        || handle.state() == ConversationState::Listening,
        "listening",
    )
    .await;

    // While LISTENING, frames reach the STT session.
    for _ in 0..10 {
        gate.on_audio_frame(loud());
    }
    wait_until(|| stt_driver.frames_sent() >= 5, "frames forwarded").await;

    handle.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(2), run_task)
        .await
        .expect("loop stopped");
}

// ── degraded turn: LLM failure speaks an apology ─────────────────────

#[tokio::test]
async fn llm_failure_degrades_to_apology() {
    let llm = ScriptedLlm::with_text_response("안 쓰일 대답.");
    llm.fail_next_stream();
    let tts = ScriptedTts::new(2);
    let harness = Harness::spawn(llm, tts, ToolSet::new(), |_| {});

    harness.say("안녕").await;
    harness.wait_for_state(ConversationState::Active).await;

    // The apology went through TTS; no assistant message was appended.
    assert_eq!(harness.tts.sentences().len(), 1);
    let log = harness.context.log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].role, Role::User);

    // The next utterance proceeds normally.
    harness.say("다시 안녕").await;
    harness.wait_for_state(ConversationState::Active).await;
    let log = harness.context.log();
    assert_eq!(log.last().unwrap().content.text(), "안 쓰일 대답.");

    harness.shutdown().await;
}
