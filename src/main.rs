//! TemporalLayr binary entry point.
//!
//! Loads configuration, wires the engine together and serves the HTTP and
//! WebSocket API until Ctrl+C or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use temporallayr::{
    AlertDispatcher, EventStream, FailureDetector, FanoutBroadcaster, IngestionPipeline,
    PipelineDeps, QueryEngine, RuleEngine, RuleStore, StorageBuilder, StoragePort,
    TimeseriesAggregator,
    config::AppConfig,
    server::{AppState, create_router},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// TemporalLayr - execution-trace ingestion engine
#[derive(Parser, Debug)]
#[command(name = "temporallayr", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "TEMPORALLAYR_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "TEMPORALLAYR_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "TEMPORALLAYR_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, env = "TEMPORALLAYR_DB_URL")]
    db_url: Option<String>,
}

/// Components torn down on shutdown, in order.
struct Services {
    pipeline: Arc<IngestionPipeline>,
    fanout: FanoutBroadcaster,
    alerts: AlertDispatcher,
    storage: Arc<dyn StoragePort>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,temporallayr=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!(path = %cli.config, "Loading configuration");
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(url) = cli.db_url {
        config.database.url = url;
    }
    config.validate()?;

    tracing::info!(
        bind = %config.server.bind,
        port = config.server.port,
        database = %config.database.url,
        "Configuration loaded"
    );

    let storage = StorageBuilder::new(&config.database.url)
        .max_connections(config.database.max_connections)
        .connect_retry(config.database.connect_retry)
        .build()
        .await?;

    let rules = RuleStore::with_ttl(storage.clone(), config.rules.cache_ttl);
    let alerts = AlertDispatcher::new(storage.clone(), config.alerts.clone())?;
    let fanout = FanoutBroadcaster::new(config.fanout.clone());
    let stream = EventStream::new(config.stream.capacity);

    let pipeline = Arc::new(IngestionPipeline::start(
        config.ingestion.clone(),
        PipelineDeps {
            storage: storage.clone(),
            rules: RuleEngine::new(rules.clone()),
            detector: FailureDetector::new(),
            alerts: alerts.clone(),
            fanout: fanout.clone(),
            stream: stream.clone(),
        },
    ));

    let app = create_router(AppState {
        storage: storage.clone(),
        pipeline: pipeline.clone(),
        rules,
        query: QueryEngine::new(storage.clone(), config.query.clone()),
        timeseries: TimeseriesAggregator::new(storage.clone(), config.query.clone()),
        fanout: fanout.clone(),
        stream,
        alerts: alerts.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Listening");

    let services = Services {
        pipeline,
        fanout,
        alerts,
        storage,
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown(services).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        _ = terminate => tracing::info!("Received terminate signal"),
    }
}

async fn shutdown(services: Services) {
    tracing::info!("Stopping ingestion pipeline...");
    services.pipeline.stop().await;

    tracing::info!("Closing live subscriptions...");
    services.fanout.shutdown().await;

    tracing::info!("Waiting for alert deliveries...");
    services.alerts.shutdown().await;

    tracing::info!("Closing storage...");
    services.storage.close().await;
}
