//! HTTP control surface and PCM WebSocket broadcast.
//!
//! Minimal axum router: health, state, diagnostics, an opt-in process
//! memory snapshot, and `/ws/audio`, which streams the same output PCM the
//! speaker plays to any connected listener. LAN-only; no auth.

use crate::error::{OrchestratorError, Result};
use crate::messages::PcmChunk;
use crate::orchestrator::OrchestratorHandle;
use crate::traits::Player;
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Broadcast capacity in PCM chunks. Slow listeners lag and skip.
const AUDIO_BROADCAST_CAPACITY: usize = 128;

/// Shared state behind the HTTP surface.
#[derive(Clone)]
pub struct ServerState {
    handle: OrchestratorHandle,
    audio_tx: broadcast::Sender<Bytes>,
    memory_endpoint: bool,
}

/// Create the output-PCM broadcast channel shared by the player tee and the
/// WebSocket handler.
pub fn audio_channel() -> broadcast::Sender<Bytes> {
    broadcast::channel(AUDIO_BROADCAST_CAPACITY).0
}

impl ServerState {
    pub fn new(
        handle: OrchestratorHandle,
        audio_tx: broadcast::Sender<Bytes>,
        memory_endpoint: bool,
    ) -> Self {
        Self {
            handle,
            audio_tx,
            memory_endpoint,
        }
    }
}

/// Player decorator that mirrors every PCM chunk into the WS broadcast.
pub struct BroadcastPlayer {
    inner: Arc<dyn Player>,
    audio_tx: broadcast::Sender<Bytes>,
}

impl BroadcastPlayer {
    pub fn new(inner: Arc<dyn Player>, audio_tx: broadcast::Sender<Bytes>) -> Self {
        Self { inner, audio_tx }
    }
}

#[async_trait]
impl Player for BroadcastPlayer {
    async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    async fn play(&self, pcm: PcmChunk) -> Result<()> {
        // No receivers is the common case; ignore it.
        let _ = self.audio_tx.send(pcm.clone());
        self.inner.play(pcm).await
    }

    async fn finish(&self) -> Result<()> {
        self.inner.finish().await
    }

    async fn kill(&self) {
        self.inner.kill().await;
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state: String,
}

#[derive(Serialize)]
struct StateResponse {
    state: String,
}

#[derive(Serialize)]
struct DiagnosticsResponse {
    state: String,
    session_id: String,
    uptime_s: u64,
    background_task_count: usize,
    audio_queue_occupancy: usize,
    audio_pressure_events: u64,
}

#[derive(Serialize)]
struct MemoryResponse {
    rss_bytes: Option<u64>,
    vm_bytes: Option<u64>,
}

/// Build the control-surface router.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(conversation_state))
        .route("/diagnostics", get(diagnostics))
        .route("/memory", get(memory_snapshot))
        .route("/ws/audio", get(ws_audio))
        .with_state(state)
}

/// Serve the control surface until cancelled.
///
/// # Errors
///
/// Returns an error if the bind address is unusable.
pub async fn serve(bind: String, state: ServerState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| OrchestratorError::Config(format!("cannot bind HTTP surface {bind}: {e}")))?;
    info!("HTTP control surface on http://{bind}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| OrchestratorError::Channel(format!("HTTP server failed: {e}")))?;
    Ok(())
}

async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        state: state.handle.state().to_string(),
    })
}

async fn conversation_state(State(state): State<ServerState>) -> Json<StateResponse> {
    Json(StateResponse {
        state: state.handle.state().to_string(),
    })
}

async fn diagnostics(State(state): State<ServerState>) -> Json<DiagnosticsResponse> {
    Json(DiagnosticsResponse {
        state: state.handle.state().to_string(),
        session_id: state.handle.session_id().to_owned(),
        uptime_s: state.handle.uptime().as_secs(),
        background_task_count: state.handle.background_tasks(),
        audio_queue_occupancy: state.handle.audio_queue_occupancy(),
        audio_pressure_events: state.handle.audio_pressure_events(),
    })
}

async fn memory_snapshot(State(state): State<ServerState>) -> impl IntoResponse {
    if !state.memory_endpoint {
        return (StatusCode::NOT_FOUND, "memory endpoint disabled").into_response();
    }
    let (rss_bytes, vm_bytes) = read_process_memory();
    Json(MemoryResponse {
        rss_bytes,
        vm_bytes,
    })
    .into_response()
}

async fn ws_audio(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    let rx = state.audio_tx.subscribe();
    ws.on_upgrade(move |socket| stream_audio(socket, rx))
}

/// Push broadcast PCM to one listener until either side goes away.
async fn stream_audio(mut socket: WebSocket, mut rx: broadcast::Receiver<Bytes>) {
    debug!("audio listener connected");
    loop {
        match rx.recv().await {
            Ok(pcm) => {
                if socket.send(WsMessage::Binary(pcm)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("audio listener lagged, skipped {skipped} chunks");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("audio listener disconnected");
}

/// Best-effort process memory reading from `/proc` (Linux only).
fn read_process_memory() -> (Option<u64>, Option<u64>) {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return (None, None);
    };
    let mut rss = None;
    let mut vm = None;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            vm = parse_kb(rest);
        }
    }
    (rss, vm)
}

fn parse_kb(rest: &str) -> Option<u64> {
    rest.trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .ok()
        .map(|kb| kb * 1024)
}
