//! `sori` binary: wire collaborators, run the conversation loop, serve the
//! control surface, and shut everything down in order on Ctrl-C.

use anyhow::Context;
use sori::audio::capture::MicCapture;
use sori::audio::playback::CpalPlayer;
use sori::config::OrchestratorConfig;
use sori::dev::{LoopbackLlm, LoopbackStt, ToneTts};
use sori::orchestrator::{Collaborators, Orchestrator};
use sori::server::{self, BroadcastPlayer, ServerState};
use sori::traits::{NullMemory, Player, ToolSet};
use sori::vad::EnergyVad;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default persona when `SORI_PERSONA` is unset.
const DEFAULT_PERSONA: &str = "\
You are Sori, a warm Korean-speaking voice companion. Keep replies short and \
conversational; you are heard, not read.";

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("sori: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().context("configuration")?;
    init_tracing();

    let runtime = tokio::runtime::Runtime::new().context("tokio runtime")?;
    runtime.block_on(run_pipeline(config))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SORI_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = std::env::var("SORI_LOG_DIR").ok().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "sori.log");
        tracing_subscriber::fmt::layer()
            .with_writer(appender)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
}

async fn run_pipeline(config: OrchestratorConfig) -> anyhow::Result<()> {
    let mode = std::env::var("SORI_MODE").unwrap_or_else(|_| "loopback".to_owned());
    if mode != "loopback" {
        // Remote collaborator clients bind here once their crates are wired
        // in; without them (or their API keys) startup cannot proceed.
        anyhow::bail!("SORI_MODE='{mode}' requires remote STT/LLM/TTS clients and API keys");
    }
    info!("running with loopback collaborators");

    // The same output PCM the speaker plays also feeds /ws/audio.
    let audio_tx = server::audio_channel();
    let player: Arc<dyn Player> = Arc::new(BroadcastPlayer::new(
        Arc::new(CpalPlayer::new(&config.audio)),
        audio_tx.clone(),
    ));

    let collaborators = Collaborators {
        vad: Box::new(EnergyVad::new(&config.vad)),
        stt: Box::new(LoopbackStt::new()),
        llm: LoopbackLlm::new(),
        tts: ToneTts::new(&config.audio),
        player,
        memory: Arc::new(NullMemory),
    };

    let persona = std::env::var("SORI_PERSONA").unwrap_or_else(|_| DEFAULT_PERSONA.to_owned());
    let mut orchestrator = Orchestrator::new(config.clone(), collaborators, &persona, ToolSet::new())
        .context("orchestrator setup")?;
    let handle = orchestrator.handle();

    // HTTP control surface.
    let server_cancel = CancellationToken::new();
    let server_state = ServerState::new(handle.clone(), audio_tx, config.server.memory_endpoint);
    let server_task = tokio::spawn(server::serve(
        config.server.bind.clone(),
        server_state,
        server_cancel.clone(),
    ));

    // Microphone last: everything downstream is ready before frames flow.
    // The orchestrator owns the capture token and cancels it first at
    // shutdown, before any collaborator closes.
    let capture = MicCapture::new(&config.audio).context("audio device")?;
    let gate = orchestrator.mic_gate();
    let mic_cancel = orchestrator.mic_token();
    let capture_task = {
        let cancel = mic_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = capture.run(gate, cancel).await {
                error!("microphone capture failed: {e}");
            }
        })
    };

    // Ctrl-C requests a clean shutdown of the loop.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
                handle.shutdown();
            }
        });
    }

    let result = orchestrator.run().await;

    // The orchestrator disabled the mic on its way down; cancelling again
    // covers startup failures that never reached the shutdown sequence.
    mic_cancel.cancel();
    let _ = capture_task.await;
    server_cancel.cancel();
    if let Ok(Err(e)) = server_task.await {
        warn!("HTTP surface ended with error: {e}");
    }

    result.context("conversation pipeline")
}
