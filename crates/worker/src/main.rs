//! Herald delivery worker binary entrypoint.
//!
//! Runs one outbox scheduler against PostgreSQL. Any number of workers may
//! share the database; claims are partitioned between them.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_notifier::default_registry;
use herald_outbox::{LeaseSettings, PgEventStore, Phase, Scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_worker=info,herald_outbox=info,herald_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald worker starting...");

    // Load configuration; malformed outbox settings are fatal here
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;

    // Run migrations
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let store = Arc::new(PgEventStore::new(pool, LeaseSettings::from_config(&config.outbox)));
    let registry = default_registry(&config)?;
    let scheduler = Scheduler::from_config(store, registry, &config.outbox)?;
    let phase = scheduler.subscribe_phase();

    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    shutdown_signal().await;
    if *phase.borrow() == Phase::Idle {
        tracing::info!("Received shutdown signal, stopping...");
    } else {
        tracing::info!("Received shutdown signal, finishing in-flight batch...");
    }
    shutdown.cancel();

    if let Err(e) = handle.await {
        tracing::error!(error = %e, "Scheduler task ended abnormally");
        return Err(e.into());
    }

    tracing::info!("Herald worker stopped.");
    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on Unix.
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
}
