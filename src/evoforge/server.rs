//! HTTP control plane: run management, SSE event streaming, WebSocket
//! multiplexing.
//!
//! The control plane never mutates run state itself.  Creating a run spawns
//! an orchestrator task; everything else reads copy-on-read snapshots or
//! subscribes to the run's event bus.  Operator actions (breeding) travel to
//! the orchestrator over its command channel.

use crate::evoforge::artifacts::Mandate;
use crate::evoforge::config::EvoForgeConfig;
use crate::evoforge::event::{EventKind, EvolutionEvent};
use crate::evoforge::oracle::OracleClient;
use crate::evoforge::orchestrator::{
    EvolutionRun, OrchestratorConfig, RunCommand, RunHandle, RunStatus,
};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

/// Interval between SSE keep-alive comments.
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(25);
/// Interval between server-initiated WebSocket pings.
const WS_PING_INTERVAL: Duration = Duration::from_secs(20);
/// A WebSocket client missing pongs for longer than this is dropped.
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    runs: Arc<RwLock<HashMap<String, Arc<RunHandle>>>>,
    config: Arc<EvoForgeConfig>,
    oracle: Arc<dyn OracleClient>,
}

impl AppState {
    pub fn new(config: EvoForgeConfig, oracle: Arc<dyn OracleClient>) -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            oracle,
        }
    }

    fn get_run(&self, id: &str) -> Option<Arc<RunHandle>> {
        self.runs.read().expect("runs map poisoned").get(id).cloned()
    }

    fn all_runs(&self) -> Vec<Arc<RunHandle>> {
        self.runs
            .read()
            .expect("runs map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Cancel every known run; used during graceful shutdown.
    pub fn cancel_all(&self) {
        for handle in self.all_runs() {
            handle.cancel();
        }
    }
}

/// Build the control-plane router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(run_status))
        .route("/runs/{id}/lineage", get(run_lineage))
        .route("/runs/{id}/events", get(run_events))
        .route("/runs/{id}/breed", post(breed))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Bind and serve until the provided shutdown future resolves, then cancel
/// all runs.
pub async fn serve<F>(
    config: EvoForgeConfig,
    oracle: Arc<dyn OracleClient>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let state = AppState::new(config.clone(), oracle);
    let app = router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("control plane listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    state.cancel_all();
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    title: String,
    #[serde(default)]
    description: String,
    domain: Option<String>,
    #[serde(default)]
    constraints: Vec<String>,
    #[serde(default)]
    success_criteria: Vec<String>,
    max_iterations: Option<u32>,
    max_agents: Option<usize>,
}

async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if req.title.trim().is_empty() {
        return Err(bad_request("title must not be empty"));
    }
    let max_agents = req.max_agents.unwrap_or(state.config.max_agents);
    if max_agents < 4 {
        return Err(bad_request(
            "max_agents must be at least 4 (one agent per role)",
        ));
    }

    let mut mandate = Mandate::new(req.title, req.description)
        .with_max_iterations(req.max_iterations.unwrap_or(state.config.max_iterations))
        .with_max_agents(max_agents);
    if let Some(domain) = req.domain {
        mandate = mandate.with_domain(domain);
    }
    for constraint in req.constraints {
        mandate = mandate.with_constraint(constraint);
    }
    for criterion in req.success_criteria {
        mandate = mandate.with_success_criterion(criterion);
    }

    let orchestrator_config = OrchestratorConfig {
        bus_capacity: state.config.event_bus_capacity,
        bus_retention: state.config.event_bus_capacity,
        models: state.config.models.clone(),
        ..OrchestratorConfig::default()
    };

    let handle = EvolutionRun::spawn(mandate, state.oracle.clone(), orchestrator_config)
        .map_err(|err| {
            log::error!("failed to start run: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
        })?;
    let run_id = handle.id.clone();
    state
        .runs
        .write()
        .expect("runs map poisoned")
        .insert(run_id.clone(), handle);
    Ok(Json(json!({"runId": run_id})))
}

async fn list_runs(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut summaries: Vec<serde_json::Value> = state
        .all_runs()
        .iter()
        .map(|handle| {
            let snapshot = handle.snapshot();
            json!({
                "runId": snapshot.run_id,
                "title": snapshot.title,
                "status": snapshot.status,
                "iteration": snapshot.iteration,
                "consensus": snapshot.consensus,
                "started": snapshot.started,
            })
        })
        .collect();
    summaries.sort_by(|a, b| {
        a["started"]
            .as_str()
            .unwrap_or("")
            .cmp(b["started"].as_str().unwrap_or(""))
    });
    Json(json!({"runs": summaries}))
}

async fn run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let handle = state.get_run(&id).ok_or(StatusCode::NOT_FOUND)?;
    let snapshot = handle.snapshot();
    let elapsed_ms = (chrono::Utc::now() - snapshot.started)
        .num_milliseconds()
        .max(0);
    Ok(Json(json!({
        "runId": snapshot.run_id,
        "title": snapshot.title,
        "status": snapshot.status,
        "iteration": snapshot.iteration,
        "maxIterations": snapshot.max_iterations,
        "consensus": snapshot.consensus,
        "consensusHistory": snapshot.consensus_history,
        "population": snapshot.population,
        "artifacts": {
            "ideas": snapshot.ideas,
            "simulations": snapshot.simulations,
            "critiques": snapshot.critiques,
        },
        "agentsSpawned": snapshot.agents_spawned,
        "termination": snapshot.termination,
        "started": snapshot.started,
        "elapsedMs": elapsed_ms,
    })))
}

async fn run_lineage(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let handle = state.get_run(&id).ok_or(StatusCode::NOT_FOUND)?;
    let snapshot = handle.snapshot();
    Ok(Json(json!({
        "runId": snapshot.run_id,
        "stats": snapshot.lineage_stats,
        "familyTree": snapshot.family_tree,
    })))
}

#[derive(Debug, Deserialize)]
struct BreedRequest {
    parent1: Option<String>,
    parent2: Option<String>,
}

async fn breed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BreedRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let handle = state.get_run(&id).ok_or(StatusCode::NOT_FOUND)?;
    if handle.snapshot().status != RunStatus::Running {
        return Err(StatusCode::CONFLICT);
    }
    let accepted = handle.send_command(RunCommand::Breed {
        parent1: req.parent1,
        parent2: req.parent2,
    });
    Ok(Json(json!({"accepted": accepted})))
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
}

// ── SSE ──────────────────────────────────────────────────────────────────

fn sse_frame(event: &EvolutionEvent) -> Event {
    let mut frame = Event::default()
        .event(event.kind.name())
        .data(serde_json::to_string(event).unwrap_or_default());
    if event.seq > 0 {
        frame = frame.id(event.seq.to_string());
    }
    frame
}

fn connected_event() -> EvolutionEvent {
    EvolutionEvent {
        seq: 0,
        timestamp: chrono::Utc::now(),
        kind: EventKind::Connected,
    }
}

async fn run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let handle = state.get_run(&id).ok_or(StatusCode::NOT_FOUND)?;
    let since = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());

    let (replay, subscription) = handle.bus().subscribe_since(since);
    let initial = stream::iter(
        std::iter::once(connected_event())
            .chain(replay.into_iter())
            .map(|event| Ok(sse_frame(&event)))
            .collect::<Vec<_>>(),
    );
    let live =
        ReceiverStream::new(subscription.into_receiver()).map(|event| Ok(sse_frame(&event)));

    Ok(Sse::new(initial.chain(live))
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE)))
}

// ── WebSocket ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Restrict the stream to one run; without it every current run is
    /// multiplexed.
    run: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_stream(socket, state, query.run))
}

async fn ws_stream(mut socket: WebSocket, state: AppState, run_filter: Option<String>) {
    let targets: Vec<Arc<RunHandle>> = match run_filter {
        Some(id) => match state.get_run(&id) {
            Some(handle) => vec![handle],
            None => {
                let _ = socket
                    .send(WsMessage::Text(
                        json!({"error": format!("unknown run '{}'", id)}).to_string().into(),
                    ))
                    .await;
                return;
            }
        },
        None => state.all_runs(),
    };

    type TaggedStream =
        std::pin::Pin<Box<dyn Stream<Item = (String, EvolutionEvent)> + Send>>;
    let mut streams: Vec<TaggedStream> = targets
        .into_iter()
        .map(|handle| {
            let run_id = handle.id.clone();
            let rx = handle.bus().subscribe().into_receiver();
            Box::pin(ReceiverStream::new(rx).map(move |event| (run_id.clone(), event)))
                as TaggedStream
        })
        .collect();
    // keeps the merged stream alive when no runs exist yet
    streams.push(Box::pin(stream::pending()));
    let mut merged = stream::select_all(streams);

    let connected = connected_event();
    let greeting = serde_json::to_string(&connected).unwrap_or_default();
    if socket.send(WsMessage::Text(greeting.into())).await.is_err() {
        return;
    }

    let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            outbound = merged.next() => match outbound {
                Some((run_id, event)) => {
                    let mut frame = serde_json::to_value(&event).unwrap_or_default();
                    if let Some(obj) = frame.as_object_mut() {
                        obj.insert(String::from("runId"), json!(run_id));
                    }
                    if socket
                        .send(WsMessage::Text(frame.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = socket.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    last_pong = Instant::now();
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    log::info!("websocket client missed pongs for over {:?}, closing", WS_PONG_TIMEOUT);
                    break;
                }
                if socket
                    .send(WsMessage::Ping(Vec::new().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
