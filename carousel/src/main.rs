use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use carousel::config::Args;
use carousel::{telemetry, Config, FsBlobStore, HttpInferenceEngine, InMemoryStorage, Orchestrator, Storage};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

/// Run the orchestrator on `storage` until a shutdown signal arrives.
async fn serve<S: Storage + 'static>(storage: Arc<S>, config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.blob_root).await?;
    let blobs = Arc::new(FsBlobStore::new(config.blob_root.clone()));
    let engine = Arc::new(HttpInferenceEngine::new(config.engine.clone()));

    tracing::info!(
        engine = %config.engine.base_url,
        blob_root = %config.blob_root.display(),
        "Starting carousel"
    );

    let orchestrator = Orchestrator::new(storage, engine, blobs, config);
    let services = orchestrator.run(CancellationToken::new()).await?;

    shutdown_signal().await;
    services.shutdown().await;
    tracing::info!("Carousel stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;
    tracing::debug!("{:?}", args);

    let result = match config.database_url.clone() {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new().connect(&url).await?;
            let storage = carousel::PostgresStorage::new(pool);
            storage.migrate().await?;
            tracing::info!("Using PostgreSQL storage");
            serve(Arc::new(storage), config).await
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => Err(anyhow::anyhow!(
            "database_url is set but carousel was built without the postgres feature"
        )),
        None => {
            tracing::warn!("No database_url configured, jobs are kept in memory and lost on exit");
            serve(Arc::new(InMemoryStorage::new()), config).await
        }
    };

    telemetry::shutdown_telemetry();
    result
}
