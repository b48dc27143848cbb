//! Application entrypoint and state wiring.

use std::process::ExitCode;
use std::sync::Arc;

use provenance_ledger::{
    config::{AppConfig, SourceKind},
    indexer::{EventIndexer, SyncJob},
    integrity::IntegrityFacade,
    pricing::{PriceRefresher, RandomPriceFeed},
    routes,
    rpc::RpcEventSource,
    scheduler::Scheduler,
    source::{ChainEventSource, FileEventSource},
    store::SqliteStore,
    AppState,
};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,provenance_ledger=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(false),
            )
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    // 1) local ledger
    let integrity = Arc::new(IntegrityFacade::open(&config.ledger.data_dir)?);
    if !integrity.is_valid() {
        error!(faults = ?integrity.audit(), "ledger on disk failed verification");
    }
    info!(records = integrity.len(), "ledger ready");

    // 2) store, event source, indexer
    let store = Arc::new(SqliteStore::open(&config.store.database_path)?);
    let source: Arc<dyn ChainEventSource> = match config.source.kind {
        SourceKind::File => Arc::new(FileEventSource::new(&config.source.snapshot_path)),
        SourceKind::Rpc => Arc::new(RpcEventSource::new(
            config.source.rpc_url.clone(),
            &config.source.contract_address,
            config.source.request_timeout(),
        )?),
    };
    info!(kind = ?config.source.kind, "event source ready");
    let indexer = Arc::new(
        EventIndexer::new(source, store.clone())
            .with_max_deferred_cycles(config.indexer.max_deferred_cycles),
    );

    // 3) scheduled jobs
    let refresher = Arc::new(PriceRefresher::new(
        store,
        Arc::new(RandomPriceFeed::default()),
    ));
    let scheduler = Scheduler::new()
        .every(config.sync_interval(), Arc::new(SyncJob::new(indexer.clone())))
        .every(config.price_interval(), refresher)
        .start();

    // 4) router
    let app = routes::router(AppState { integrity, indexer });

    // 5) serve
    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    info!("shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}
