use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;

use fwmon::queue::EventQueueManager;
use fwmon::sink::{read_events, SinkMessage};
use fwmon::stats::{PipelineStats, StatsSnapshot};
use fwmon_common::Event;

pub struct AppState {
    pub stats: Arc<PipelineStats>,
    pub queue: Arc<EventQueueManager<SinkMessage>>,
    pub events_path: PathBuf,
    pub live: broadcast::Sender<Event>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    packets_received: Counter,
    packets_malformed: Counter,
    callback_failures: Counter,
    events_emitted: Counter,
    events_written: Counter,
    queue_shards: Gauge,
    queued_events: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let packets_received = Counter::default();
        let packets_malformed = Counter::default();
        let callback_failures = Counter::default();
        let events_emitted = Counter::default();
        let events_written = Counter::default();
        let queue_shards = Gauge::default();
        let queued_events = Gauge::default();

        registry.register(
            "fwmon_packets_received",
            "Packets delivered by the kernel queues",
            packets_received.clone(),
        );
        registry.register(
            "fwmon_packets_malformed",
            "Captures that could not be parsed",
            packets_malformed.clone(),
        );
        registry.register(
            "fwmon_callback_failures",
            "Policy callbacks that returned an error or panicked",
            callback_failures.clone(),
        );
        registry.register(
            "fwmon_events_emitted",
            "Events queued for the event log",
            events_emitted.clone(),
        );
        registry.register(
            "fwmon_events_written",
            "Events appended to the event log",
            events_written.clone(),
        );
        registry.register(
            "fwmon_event_queue_shards",
            "Active event queue shards",
            queue_shards.clone(),
        );
        registry.register(
            "fwmon_event_queue_items",
            "Events waiting for the sink",
            queued_events.clone(),
        );

        Self {
            registry,
            packets_received,
            packets_malformed,
            callback_failures,
            events_emitted,
            events_written,
            queue_shards,
            queued_events,
        }
    }

    /// Bring the monotonic counters up to the current totals.
    fn sync(&self, snapshot: &StatsSnapshot) {
        for (counter, total) in [
            (&self.packets_received, snapshot.packets_received),
            (&self.packets_malformed, snapshot.packets_malformed),
            (&self.callback_failures, snapshot.callback_failures),
            (&self.events_emitted, snapshot.events_emitted),
            (&self.events_written, snapshot.events_written),
        ] {
            let current = counter.get();
            if total > current {
                counter.inc_by(total - current);
            }
        }
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    packets_received: u64,
    queued_events: usize,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    #[serde(flatten)]
    counters: StatsSnapshot,
    shard_capacity: usize,
    shard_sizes: Vec<usize>,
}

#[derive(Deserialize)]
pub struct EventsParams {
    limit: Option<usize>,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    let metrics = Arc::new(Metrics::new());

    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/events", get(get_events))
        .route("/api/stream", get(ws_handler))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        packets_received: state.stats.snapshot().packets_received,
        queued_events: state.queue.len(),
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        counters: state.stats.snapshot(),
        shard_capacity: state.queue.capacity(),
        shard_sizes: state.queue.shard_sizes(),
    })
}

async fn get_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).min(1000);
    let path = state.events_path.clone();

    match tokio::task::spawn_blocking(move || read_events(path)).await {
        Ok(Ok(mut events)) => {
            let start = events.len().saturating_sub(limit);
            let recent = events.split_off(start);
            (StatusCode::OK, Json(serde_json::json!(recent)))
        }
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let (tx, mut rx) = mpsc::channel(64);
    let feed = tokio::spawn(stream_events(
        state.events_path.clone(),
        state.live.subscribe(),
        tx,
    ));

    while let Some(frame) = rx.recv().await {
        if socket.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }
    feed.abort();
}

/// Feed one stream subscriber: every event already in the log, then each new one as it is
/// written. Ends when the subscriber goes away or the sink stops.
///
/// The live receiver is taken before the log is read, so an event written in between can be
/// sent twice but is never missed.
async fn stream_events(
    path: PathBuf,
    mut live: broadcast::Receiver<Event>,
    tx: mpsc::Sender<String>,
) {
    match tokio::task::spawn_blocking(move || read_events(path)).await {
        Ok(Ok(events)) => {
            for event in events {
                if !send_event(&tx, &event).await {
                    return;
                }
            }
        }
        Ok(Err(e)) => tracing::warn!("Failed to replay event log: {}", e),
        Err(e) => tracing::warn!("Event log replay task failed: {}", e),
    }

    loop {
        let event = tokio::select! {
            received = live.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Stream subscriber lagged, {} events skipped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = tx.closed() => return,
        };
        if !send_event(&tx, &event).await {
            return;
        }
    }
}

async fn send_event(tx: &mpsc::Sender<String>, event: &Event) -> bool {
    match event.to_line() {
        Ok(line) => tx.send(line).await.is_ok(),
        Err(e) => {
            tracing::warn!("Failed to encode event: {}", e);
            true
        }
    }
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    metrics.sync(&state.stats.snapshot());
    metrics.queue_shards.set(state.queue.shard_count() as i64);
    metrics.queued_events.set(state.queue.len() as i64);

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
