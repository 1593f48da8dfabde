use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fwmon::stats::PipelineStats;
use fwmon::{
    create_observer, EventEmitter, EventQueueManager, EventSink, PacketRecord, SinkMessage,
    SinkOptions, Subscription,
};

mod api;
mod config;

use config::{CliArgs, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── Event queue & sink ────────────────────────────────────────────
    let stats = Arc::new(PipelineStats::new());
    let queue = Arc::new(EventQueueManager::<SinkMessage>::new(config.shard_capacity));
    let sink = EventSink::spawn(
        &config.events_path,
        queue.clone(),
        SinkOptions {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            fsync: config.fsync,
        },
        stats.clone(),
    )?;

    // ── Queue observer ────────────────────────────────────────────────
    let mut observer = create_observer(stats.clone())?;
    for queue_config in &config.queues {
        let mut subscription =
            Subscription::new(queue_config.display_name()).callback(audit(sink.emitter()));
        if let Some(queue_num) = queue_config.queue_num {
            subscription = subscription.queue_num(queue_num);
        }
        tracing::info!(
            "Subscribing {} to queue {:?}",
            subscription.name(),
            queue_config.queue_num
        );
        observer.subscribe(subscription)?;
    }
    if config.queues.is_empty() {
        tracing::warn!("no kernel queues configured, only the status API will run");
    }
    observer.start()?;

    // ── Shard Cleanup Task ────────────────────────────────────────────
    let queue_cleanup = queue.clone();
    tokio::spawn(async move {
        let mut cleanup_interval = interval(Duration::from_secs(10));
        loop {
            cleanup_interval.tick().await;
            queue_cleanup.cleanup();
        }
    });

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        stats: stats.clone(),
        queue: queue.clone(),
        events_path: PathBuf::from(&config.events_path),
        live: sink.live(),
        start_time: std::time::Instant::now(),
    });
    let app = api::router(app_state);

    let addr = format!("{}:{}", config.listen, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Status API running on http://{}", addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Status API failed: {}", e);
        }
    });

    // ── Shutdown ──────────────────────────────────────────────────────
    // Runs until ctrl-c, or until the sink dies: without a writer, events would pile up.
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sink_check = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                tracing::info!("Shutting down");
                break;
            }
            _ = sink_check.tick() => {
                if !sink.is_running() {
                    tracing::error!("Event sink stopped, shutting down");
                    break;
                }
            }
        }
    }

    // Capture threads go first so no callback emits after the sentinel.
    tokio::task::spawn_blocking(move || {
        observer.stop();
        sink.shutdown()
    })
    .await??;

    Ok(())
}

/// Default callback: record every packet that announces a synapse identity.
///
/// Blocking decisions belong to the policy plugged in by the operator; this one only observes,
/// so every packet keeps the default verdict.
fn audit(emitter: EventEmitter) -> impl Fn(&PacketRecord) -> anyhow::Result<()> + Send + Sync {
    move |packet: &PacketRecord| {
        if packet.identity().and_then(|id| id.hotkey()).is_some() {
            emitter.emit(packet.to_event("Synapse observed"));
        }
        Ok(())
    }
}
