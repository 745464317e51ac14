mod archive;
mod config;
mod diode;
mod dispatch;
mod events;
mod filetransfer;
mod framing;
mod groups;
mod http;
mod model;
mod notify;
mod retention;
mod settings;
mod tasks;

use crate::config::Config;
use crate::events::{Category, EventLog};
use crate::filetransfer::{FileTransfer, StagingArea};
use crate::groups::{GroupManager, ObservationBoard};
use crate::retention::RetentionIndex;
use crate::settings::SettingsStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,diode_forwarder=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let config = Config::from_env()?;

    std::fs::create_dir_all(config.cache_dir())
        .with_context(|| format!("create {}", config.cache_dir().display()))?;
    let settings = SettingsStore::open(&config.settings_path())?;
    settings.init_defaults()?;

    let notifier = notify::Notifier::new();
    let events = EventLog::new(&config.events_path(), notifier.clone());
    let cancel = CancellationToken::new();
    let _relay = notify::spawn_trace_relay(&notifier, cancel.clone());

    // Every traffic-class sender is up before anything produces data.
    let proxies = Arc::new(
        diode::ProxyRegistry::open_all(&config.proxies, config.queue_capacity, &events).await,
    );
    if proxies.is_empty() {
        events.log(Category::Warning, "No diode proxy", "No diode proxy defined; data is archived only");
    }

    let archive = archive::spawn_archive_thread(
        config.cache_dir(),
        config.archive_prefix.clone(),
        config.rotate_minutes,
    )?;

    let index = Arc::new(RetentionIndex::new(&config.cache_dir()));
    if let Err(err) = index.refresh() {
        tracing::warn!(error=%err, "initial cache scan failed");
    }
    let _pruner = retention::spawn_pruner(
        index.clone(),
        settings.clone(),
        events.clone(),
        notifier.clone(),
        config.prune_interval,
        cancel.clone(),
    );

    let staging = StagingArea::new(&config.outgoing_dir());
    match FileTransfer::new(
        staging.clone(),
        &proxies,
        settings.clone(),
        notifier.clone(),
        events.clone(),
    ) {
        Ok(pipeline) => {
            let _transfer =
                filetransfer::spawn_file_transfer(pipeline, config.scan_interval, cancel.clone());
        }
        Err(err) => {
            events.log(Category::Error, "File transfer disabled", err.to_string());
            if let Err(err) = staging.ensure_dirs() {
                tracing::warn!(error=%err, "failed to create staging directories");
            }
        }
    }

    let board = ObservationBoard::new();
    let groups = Arc::new(GroupManager::new(
        config.groups.clone(),
        Arc::new(board.clone()),
        dispatch::Dispatcher::new(proxies.clone(), archive.clone(), notifier.clone()),
        events.clone(),
        notifier.clone(),
        config.batch_capacity,
        config.meta_interval,
    ));
    for group in config.groups.iter().filter(|g| g.run_at_start) {
        if let Err(err) = groups.start(&group.name) {
            tracing::warn!(group=%group.name, error=%err, "group not started");
        }
    }

    let app = http::router(http::HttpState {
        index,
        staging,
        proxies,
        settings,
        groups: groups.clone(),
        board,
        events: events.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("bind {}", config.http_bind))?;
    tracing::info!(bind=%config.http_bind, "diode-forwarder HTTP listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = http_handle => {
            tracing::warn!("http server exited");
        }
    }

    cancel.cancel();
    groups.stop_all().await;
    if let Err(err) = archive.close().await {
        tracing::warn!(error=%err, "archive close failed");
    }
    events.log(Category::Info, "Shutdown", "diode-forwarder stopped");
    Ok(())
}
