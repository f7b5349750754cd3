// modelmux — OpenAI-compatible fan-out gateway.
//
// Startup: load + validate YAML config (fatal on error), build the
// translator and model registries, restore the metrics snapshot, serve.
// Shutdown: SIGINT/SIGTERM stops the listener, in-flight requests drain
// within a bounded wait, the snapshot flushes, exit 0.

use log::{error, info, warn};
use modelmux::atoms::constants::SHUTDOWN_DRAIN_SECS;
use modelmux::atoms::error::GatewayResult;
use modelmux::engine::clock::Clock;
use modelmux::engine::dispatcher::Dispatcher;
use modelmux::engine::metrics::{self, GlobalCounters};
use modelmux::engine::providers::TranslatorRegistry;
use modelmux::engine::registry::ModelRegistry;
use modelmux::engine::config;
use modelmux::server::{self, Gateway};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        error!("[main] fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> GatewayResult<()> {
    // Config path: first CLI argument, then $MODELMUX_CONFIG, then ./config.yaml.
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MODELMUX_CONFIG").ok())
        .unwrap_or_else(|| "config.yaml".into());
    let config = config::load(Path::new(&config_path))?;

    let clock = Clock::system();
    let translators = TranslatorRegistry::with_builtins();
    let registry = Arc::new(ModelRegistry::build(&config, &translators, clock.clone())?);

    let snapshot_path = PathBuf::from(&config.server.metrics_path);
    if let Some(snapshot) = metrics::load_snapshot(&snapshot_path) {
        registry.apply_snapshot(&snapshot);
    }

    let counters = Arc::new(GlobalCounters::default());
    let gateway = Arc::new(Gateway {
        registry: registry.clone(),
        dispatcher: Dispatcher::new(registry.clone(), counters.clone(), clock.clone()),
        counters,
        in_flight: AtomicU64::new(0),
    });

    // Periodic snapshot flush, so a crash loses at most one interval.
    let flush_registry = registry.clone();
    let flush_path = snapshot_path.clone();
    let flush_interval = config.server.flush_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(flush_interval.max(1)));
        ticker.tick().await; // the immediate first tick
        loop {
            ticker.tick().await;
            let snapshot = flush_registry.collect_snapshot();
            if let Err(e) = metrics::write_snapshot(&flush_path, &snapshot) {
                warn!("[metrics] periodic flush failed: {e}");
            }
        }
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("[server] listening on http://{addr}");

    axum::serve(listener, server::router(gateway.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    drain(&gateway.in_flight).await;

    let snapshot = registry.collect_snapshot();
    if let Err(e) = metrics::write_snapshot(&snapshot_path, &snapshot) {
        warn!("[metrics] final snapshot flush failed: {e}");
    }
    info!("[main] clean shutdown");
    Ok(())
}

/// Resolve on SIGINT or (on unix) SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("[main] cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("[main] shutdown signal received — draining");
}

/// Bounded wait for in-flight dispatches to finish.
async fn drain(in_flight: &AtomicU64) {
    let deadline = std::time::Instant::now() + Duration::from_secs(SHUTDOWN_DRAIN_SECS);
    while in_flight.load(Ordering::SeqCst) > 0 {
        if std::time::Instant::now() >= deadline {
            warn!(
                "[main] drain timeout with {} requests still in flight",
                in_flight.load(Ordering::SeqCst)
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
