use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::harvester::api_client::UnsplashClient;
use crate::harvester::categorizer::{Categorizer, CategoryTable};
use crate::harvester::config_loader::ConfigManager;
use crate::harvester::database::Database;
use crate::harvester::download_engine::DownloadEngine;
use crate::harvester::logger;
use crate::harvester::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::harvester::quality_filter::QualityFilter;

mod harvester;

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config".to_string());

    let config_manager = ConfigManager::new(&config_dir).context("failed to load configuration")?;
    let config = config_manager.get();

    // Guard must outlive the run so buffered log lines reach the file
    let _guard = logger::init_tracing(&config.logging).context("failed to initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_manager.config_path().display(),
        "Unsplash harvester starting"
    );

    if !config_manager.has_valid_credentials() {
        bail!(
            "no API access key configured; set access_key in {} or export UNSPLASH_ACCESS_KEY",
            config_manager.config_path().display()
        );
    }

    let table = CategoryTable::from_config(&config.categories);
    let database = Arc::new(
        Database::open(
            &config.storage.database_file,
            &table,
            config.storage.log_url_access,
        )
        .context("failed to open database")?,
    );

    log_startup_summary(&database).await;

    let client = UnsplashClient::new(&config.api).context("failed to build API client")?;
    let downloader =
        DownloadEngine::new(config.api.timeout_secs).context("failed to build download engine")?;

    let orchestrator = Orchestrator::new(
        client,
        downloader,
        database.clone(),
        Categorizer::new(table),
        QualityFilter::new(&config.quality),
        OrchestratorSettings::from_config(&config),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                let _ = shutdown_tx.send(());
            }
            Err(e) => error!("Failed to listen for interrupts: {}", e),
        }
    });

    orchestrator.run(shutdown_rx).await;

    log_shutdown_summary(&database).await;
    info!("Unsplash harvester stopped");
    Ok(())
}

/// Log what the library already holds, so a restart is easy to read.
async fn log_startup_summary(database: &Database) {
    match database.totals().await {
        Ok(totals) => info!(
            images = totals.images,
            bytes = totals.total_file_size,
            "Library totals"
        ),
        Err(e) => warn!("Failed to read library totals: {}", e),
    }

    match database.category_counters().await {
        Ok(counters) => {
            for counter in counters {
                debug!(
                    category = %counter.category,
                    slug = %counter.slug,
                    count = counter.count,
                    "Category"
                );
            }
        }
        Err(e) => warn!("Failed to read category counters: {}", e),
    }
}

async fn log_shutdown_summary(database: &Database) {
    match database.strategy_stats().await {
        Ok(stats) => {
            for entry in stats {
                info!(
                    strategy = %entry.strategy,
                    requests = entry.total_requests,
                    successful = entry.successful_requests,
                    images = entry.total_images,
                    new = entry.new_images,
                    "Strategy totals"
                );
            }
        }
        Err(e) => warn!("Failed to read strategy stats: {}", e),
    }
}
