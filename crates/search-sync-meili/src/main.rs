mod config;
mod error;
mod lease;
mod meili;
mod store;

use std::sync::Arc;

use clap::Parser;
use search_sync_core::{
    IndexSync, LeaseStoreSource, MemoryLeaseStore, SearchIndexProvider, StaticLeaseSource,
    SyncOrchestrator, SyncOutcome,
};
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, LeaseBackend};
use lease::FileLeaseSource;
use meili::{MeiliClientHandle, DEFAULT_TASK_POLL_INTERVAL};
use store::SqliteDocumentStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting search-sync-meili");
    info!("  Search enabled: {}", config.search);
    info!("  Indexing disabled: {}", config.meili_no_sync);
    info!(
        "  Meilisearch host: {}",
        config.meili_host.as_deref().unwrap_or("NOT SET")
    );
    info!(
        "  Meilisearch master key: {}",
        if config.meili_master_key.is_some() { "SET" } else { "NOT SET" }
    );
    info!("  Sync threshold: {}", config.sync_threshold);
    info!("  Database: {}", config.database_url);
    info!("  Lease backend: {}", config.lease_backend);

    // Meilisearch client, built on first use
    let search: Arc<dyn SearchIndexProvider> = Arc::new(
        MeiliClientHandle::new(config.meili_host.clone(), config.meili_master_key.clone())
            .with_task_polling(DEFAULT_TASK_POLL_INTERVAL, config.task_timeout()),
    );

    // Document store (SQLite)
    let store = SqliteDocumentStore::connect(&config.database_url, search.clone(), config.batch_size)
        .await?;
    store.migrate().await?;

    // Lease source for the sync flow
    let leases: Arc<dyn LeaseStoreSource> = match config.lease_backend {
        LeaseBackend::File => {
            let dir = config.effective_lease_dir();
            info!("  Lease dir: {}", dir.display());
            Arc::new(FileLeaseSource::new(dir))
        }
        LeaseBackend::Memory => Arc::new(StaticLeaseSource::new(Arc::new(MemoryLeaseStore::new()))),
        LeaseBackend::None => Arc::new(StaticLeaseSource::unavailable()),
    };

    let orchestrator = SyncOrchestrator::new(Arc::new(store), search, config.sync_settings());
    let index_sync = IndexSync::new(orchestrator, leases, config.index_sync_options());

    let mut shutdown_rx = create_shutdown_signal();

    match config.interval() {
        None => {
            tokio::select! {
                outcome = run_once(&index_sync) => report(&outcome),
                _ = shutdown_rx.wait_for(|&v| v) => info!("Shutdown requested before sync finished"),
            }
        }
        Some(period) => {
            info!("Running sync every {} secs", period.as_secs());

            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = timer.tick() => {
                        report(&index_sync.run().await);
                    }
                }
            }
        }
    }

    index_sync.shutdown();
    info!("search-sync-meili shutdown complete");
    Ok(())
}

/// Run the sync once and wait for any index recovery it schedules.
async fn run_once(index_sync: &IndexSync) -> SyncOutcome {
    let outcome = index_sync.run().await;
    if outcome == SyncOutcome::RecoveryScheduled {
        index_sync.wait_for_recovery().await;
    }
    outcome
}

fn report(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(result) | SyncOutcome::Degraded(result) => info!(
            outcome = outcome.label(),
            messages = result.messages_sync,
            conversations = result.convos_sync,
            "Index sync finished"
        ),
        SyncOutcome::Failed(message) => {
            error!(outcome = outcome.label(), "Index sync failed: {}", message)
        }
        SyncOutcome::NotConfigured | SyncOutcome::Unreachable => {
            warn!(outcome = outcome.label(), "Index sync did not run")
        }
        _ => info!(outcome = outcome.label(), "Index sync finished"),
    }
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
