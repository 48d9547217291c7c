use std::net::SocketAddr;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenant_ledger::api::{self, AppState};
use tenant_ledger::audit::{ChainReconciler, LedgerWriter};
use tenant_ledger::config::AppConfig;
use tenant_ledger::database::Database;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenant_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tenant audit ledger");

    let config = AppConfig::load()?;

    let database = Database::new(&config.database_url).await?;
    info!("Database connected");

    database.run_migrations().await?;

    let pool = database.pool().clone();
    let writer = LedgerWriter::new(pool.clone(), &config.writer);

    // Background backfill and validation
    let reconciler = if config.reconciler.enabled {
        let handle =
            ChainReconciler::new(pool.clone(), writer.clone(), config.reconciler.clone()).spawn();
        info!("Chain reconciler started");
        Some(handle)
    } else {
        info!("Chain reconciler disabled");
        None
    };

    let app = api::router(AppState::new(pool, writer));

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = reconciler {
        info!("Waiting for the chain reconciler to finish its cycle");
        handle.shutdown().await;
    }

    info!("Tenant audit ledger stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
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
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}
