use cellfix_provider::config::ProviderConfig;
use cellfix_provider::http;
use cellfix_provider::module::cells::SnapshotCellSource;
use cellfix_provider::module::dataset::CsvDataset;
use cellfix_provider::module::engine::{CellLocationCache, PositionEngine, SystemClock};
use cellfix_provider::module::online::HttpOnlineLocator;
use cellfix_provider::module::settings::LocationSettings;
use cellfix_provider::module::watcher;
use cellfix_provider::service::PositionService;

use anyhow::{Context, Result};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = ProviderConfig::from_file(&config_path)?;

    // Initialize logging
    let _logging_guard = cellfix_provider::logging::init_logging(&config.log_dir, "cellfix-provider", &config.log_level)?;

    tracing::info!("Cellfix provider starting...");
    tracing::info!("Loaded configuration from {}", config_path);

    let dataset = CsvDataset::new(config.dataset.dirs.clone());
    let cells = SnapshotCellSource::new(&config.cells.snapshot);
    let mut engine = PositionEngine::new(
        CellLocationCache::new(Box::new(dataset)),
        Box::new(cells),
        Arc::new(SystemClock),
    )
    .with_zero_signal_policy(config.positioning.zero_signal_policy);

    match &config.online.endpoint {
        Some(endpoint) => {
            let online = HttpOnlineLocator::new(
                endpoint.clone(),
                config.online.timeout(),
                config.online.wlan_snapshot.clone(),
            )
            .context("Failed to create online locator")?;
            tracing::info!("Online positioning through {}", endpoint);
            engine = engine.with_online(Arc::new(online));
        }
        None => tracing::info!("No online endpoint configured, using offline positioning only"),
    }

    let settings = LocationSettings::load(&config.settings.path);
    let (service, handle) = PositionService::new(engine, settings);

    // Change notifications from the modem helper, WLAN scanner and settings file
    let mut watchers = Vec::new();
    let cells_handle = handle.clone();
    watchers.push(watcher::watch(
        config.cells.snapshot.clone(),
        config.cells.poll_interval(),
        move || cells_handle.cells_changed().is_ok(),
    ));
    if let Some(wlan_snapshot) = &config.online.wlan_snapshot {
        let wlan_handle = handle.clone();
        watchers.push(watcher::watch(
            wlan_snapshot.clone(),
            config.cells.poll_interval(),
            move || wlan_handle.environment_changed().is_ok(),
        ));
    }
    let settings_handle = handle.clone();
    let settings_path = config.settings.path.clone();
    watchers.push(watcher::watch(
        config.settings.path.clone(),
        config.settings.poll_interval(),
        move || settings_handle.settings_changed(LocationSettings::load(&settings_path)).is_ok(),
    ));

    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.server_address()))?;
    tracing::info!("HTTP server listening on {}", config.server_address());
    let app = http::router(handle);

    let result = tokio::select! {
        result = service.run() => result,
        result = async { axum::serve(listener, app).await } => result.context("HTTP server failed"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    };

    for watcher in watchers {
        watcher.abort();
    }

    tracing::info!("Cellfix provider stopped");
    result
}
