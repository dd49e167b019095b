use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{
    CounterBackend, CounterStoreConfig, GatekeeperConfig, LoggingConfig, PolicyBackend,
    PolicyStoreConfig,
};
use gatekeeper::error::GatekeeperError;
use gatekeeper::grpc::GrpcServer;
use gatekeeper::ratelimit::{
    BroadcastNotifier, CounterStore, EventNotifier, FanoutNotifier, InMemoryCounterStore,
    InMemoryPolicyStore, LogNotifier, PolicyStore, RateLimiterEngine, SqlitePolicyStore,
};

/// API key quota service.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "GATEKEEPER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = GatekeeperConfig::load(args.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Gatekeeper Quota Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        policy_backend = ?config.policy_store.backend,
        counter_backend = ?config.counter_store.backend,
        "Configuration loaded"
    );

    let policies = policy_store(&config.policy_store)?;
    let counters = counter_store(&config.counter_store).await?;

    // Events go to the log (if enabled) and to WatchEvents subscribers
    let events = BroadcastNotifier::new(config.events.broadcast_capacity);
    let mut notifier = FanoutNotifier::default();
    if config.events.log {
        notifier.push(Arc::new(LogNotifier));
    }
    notifier.push(Arc::new(events.clone()));

    let engine = Arc::new(RateLimiterEngine::new(
        policies,
        counters,
        Arc::new(notifier),
    ));
    info!("Rate limiter engine initialized");

    GrpcServer::new(config.server.grpc_addr, engine)
        .with_events(events)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Gatekeeper Quota Service stopped");
    Ok(())
}

/// `RUST_LOG` wins over the configured level when set.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn policy_store(config: &PolicyStoreConfig) -> Result<Arc<dyn PolicyStore>, GatekeeperError> {
    match config.backend {
        PolicyBackend::Memory => {
            warn!("Using in-memory policy store; policies are lost on restart");
            Ok(Arc::new(InMemoryPolicyStore::new()))
        }
        PolicyBackend::Sqlite => {
            let store = SqlitePolicyStore::open(
                &config.path,
                Duration::from_millis(config.busy_timeout_ms),
            )?;
            info!(path = %config.path.display(), "Opened SQLite policy store");
            Ok(Arc::new(store))
        }
    }
}

async fn counter_store(
    config: &CounterStoreConfig,
) -> Result<Arc<dyn CounterStore>, GatekeeperError> {
    match config.backend {
        CounterBackend::Memory => {
            let store = Arc::new(InMemoryCounterStore::new());
            // The sweeper exits on its own once the store is dropped
            store.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs.max(1)));
            info!(
                sweep_interval_secs = config.sweep_interval_secs,
                "Using in-memory counter store"
            );
            Ok(store)
        }
        #[cfg(feature = "redis-store")]
        CounterBackend::Redis => {
            let store = gatekeeper::ratelimit::RedisCounterStore::connect(
                &config.url,
                config.key_prefix.clone(),
            )
            .await?;
            info!(key_prefix = %config.key_prefix, "Connected to Redis counter store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        CounterBackend::Redis => Err(GatekeeperError::Config(
            "counter_store.backend = redis requires the `redis-store` feature".to_string(),
        )),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
