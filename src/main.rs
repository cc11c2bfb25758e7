//! Sermon Ingest - upload ingestion server for large WAV recordings

use clap::Parser;
use sermon_ingest::api::handlers::AppState;
use sermon_ingest::config::Config;
use sermon_ingest::hash_index::HashIndex;
use sermon_ingest::metrics::Metrics;
use sermon_ingest::notify::{CommitNotifier, NotificationSink, NullSink, WebhookSink};
use sermon_ingest::orchestrator::UploadOrchestrator;
use sermon_ingest::session::SessionRegistry;
use sermon_ingest::storage::{ObjectStore, S3Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Version string including build timestamp for --version output
fn version_long() -> &'static str {
    // e.g. "1.2.0 (built 2026-02-23T21:40:07Z)"
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("SI_BUILD_TIME"),
        )
    })
}

/// Sermon Ingest — streaming WAV upload service backed by S3-compatible storage
#[derive(Parser, Debug)]
#[command(name = "sermon-ingest")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Config is loaded before the runtime exists so the blocking thread
    // count can shape runtime construction.
    let pre_config = if let Some(ref path) = cli.config {
        Config::from_file(path).unwrap_or_else(|_| Config::load())
    } else {
        Config::load()
    };

    // Explicit runtime builder instead of `#[tokio::main]` so blocking
    // threads stay configurable; the tokio default pool (512 threads) is
    // oversized for the single-board machines this runs on.
    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();
    if let Some(bt) = pre_config.blocking_threads {
        runtime_builder.max_blocking_threads(bt);
    }
    let runtime = runtime_builder.build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // Priority: RUST_LOG > SERMON_INGEST_LOG_LEVEL > --verbose > default
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("SERMON_INGEST_LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("sermon_ingest=trace,tower_http=trace")
            } else {
                EnvFilter::new("sermon_ingest=info,tower_http=info")
            }
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()
    };

    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    info!(
        "Starting Sermon Ingest v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("SI_BUILD_TIME"),
    );
    info!("  Listen address: {}", config.listen_addr);
    info!("  Bucket: {}", config.store.bucket);
    if let Some(ref ep) = config.store.endpoint {
        info!("  Endpoint: {}", ep);
    }
    info!(
        "  Large-file threshold: {} MB",
        config.large_file_threshold / 1024 / 1024
    );
    info!(
        "  Max object size: {} MB",
        config.max_object_size / 1024 / 1024
    );
    info!(
        "  Proxy concurrency: {} uploads",
        config.effective_upload_concurrency()
    );
    info!(
        "  Session idle TTL: {}",
        humantime::format_duration(config.session_idle_ttl)
    );
    if let Some(ref url) = config.notify_webhook_url {
        info!("  Notifications: webhook {}", url);
    } else {
        info!("  Notifications: disabled");
    }

    // Prometheus metrics
    let metrics = Arc::new(Metrics::new());
    metrics.process_start_time_seconds.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    );
    metrics
        .build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    // Object store
    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(&config.store, config.part_size));
    store.ensure_bucket().await?;

    // Session registry, restored from disk when persistence is configured
    let sessions = Arc::new(match config.session_file {
        Some(ref path) => {
            let registry = SessionRegistry::load_from(path)?;
            let restored = registry.list().len();
            if restored > 0 {
                info!("  Restored {} persisted sessions", restored);
            }
            registry
        }
        None => SessionRegistry::new(),
    });

    // Commit notifier
    let sink: Arc<dyn NotificationSink> = match config.notify_webhook_url {
        Some(ref url) => Arc::new(WebhookSink::new(url.clone())),
        None => Arc::new(NullSink),
    };
    let notifier = CommitNotifier::spawn(
        sink,
        config.batch_notify_threshold,
        config.batch_notify_window,
    );

    // Hash index + orchestrator
    let index = Arc::new(HashIndex::new());
    let orchestrator = Arc::new(UploadOrchestrator::new(
        store.clone(),
        index.clone(),
        sessions.clone(),
        notifier,
        Some(metrics.clone()),
        config.clone(),
    ));

    // Restored sessions must be re-synced with the store before serving.
    orchestrator.reconcile_sessions().await;

    // Warm-load the hash index in the background; until it finishes, ticket
    // and duplicate endpoints answer 503 rather than falsely claim uniqueness.
    {
        let index = index.clone();
        let store = store.clone();
        let concurrency = config.warm_load_concurrency;
        tokio::spawn(async move {
            if let Err(err) = index.warm_load(store, concurrency).await {
                error!(error = %err, "hash index warm load failed");
            }
        });
    }

    // Periodic idle-session sweep
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(300));
            loop {
                tick.tick().await;
                orchestrator.sweep_sessions().await;
            }
        });
    }

    // Periodic session-file flush
    if let Some(path) = config.session_file.clone() {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                if let Err(err) = sessions.save_to(&path) {
                    warn!(error = %err, "session file flush failed");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        orchestrator,
        metrics: Some(metrics),
    });
    let app = sermon_ingest::api::router(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Sermon Ingest listening on http://{}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Final session flush so restarts pick up where we left off.
    if let Some(ref path) = config.session_file {
        if let Err(err) = sessions.save_to(path) {
            warn!(error = %err, "final session flush failed");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Resolve when the process is asked to stop (Ctrl+C, or SIGTERM on unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("SIGTERM handler installation failed");
    #[cfg(unix)]
    let sigterm = sigterm.recv();

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.expect("Ctrl+C handler installation failed");
            warn!("Ctrl+C caught; draining in-flight uploads before exit");
        }
        _ = sigterm => {
            warn!("SIGTERM caught; draining in-flight uploads before exit");
        }
    }
}
