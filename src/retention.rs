use crate::archive::{parse_archive_timestamp, read_archive};
use crate::diode::{ProxyRegistry, TrafficClass};
use crate::events::{Category, EventLog};
use crate::filetransfer::StagingArea;
use crate::notify::Notifier;
use crate::settings::SettingsStore;
use crate::tasks::{spawn_supervised, TaskFailure};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheItem {
    /// Path relative to the cache root, `/` separated.
    pub filename: String,
    /// `None` when the name carries no parseable timestamp.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheInfo {
    pub size: u64,
    pub count: usize,
    pub first_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
    pub items: Vec<CacheItem>,
}

/// Catalog of archive files under the cache root, rebuilt by a full walk.
pub struct RetentionIndex {
    root: PathBuf,
    catalog: Mutex<CacheInfo>,
}

impl RetentionIndex {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            catalog: Mutex::new(CacheInfo::default()),
        }
    }

    /// Rebuilds the catalog and returns the fresh copy.
    pub fn refresh(&self) -> Result<CacheInfo> {
        let mut catalog = self
            .catalog
            .lock()
            .map_err(|_| anyhow!("cache catalog lock poisoned"))?;

        let mut items = Vec::new();
        if self.root.exists() {
            for entry in WalkDir::new(&self.root).min_depth(1) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!(error=%err, "cache walk error");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                    continue;
                };
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                let name = entry.file_name().to_string_lossy();
                let time = parse_archive_timestamp(&name);
                if time.is_none() {
                    tracing::debug!(path=%rel.display(), "cache file name carries no timestamp");
                }
                items.push(CacheItem {
                    filename: rel.to_string_lossy().replace('\\', "/"),
                    time,
                    size,
                });
            }
        }
        items.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.filename.cmp(&b.filename)));

        *catalog = CacheInfo {
            size: items.iter().map(|item| item.size).sum(),
            count: items.len(),
            first_time: items.iter().find_map(|item| item.time),
            last_time: items.last().and_then(|item| item.time),
            items,
        };
        Ok(catalog.clone())
    }

    /// Last refreshed catalog without walking the tree.
    pub fn snapshot(&self) -> CacheInfo {
        self.catalog.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Deletes every archive older than `days` relative to `now`. Files without
    /// a parseable timestamp count as older than any window. A window too large
    /// to represent keeps every timestamped file.
    pub fn prune(&self, now: DateTime<Utc>, days: u64) -> Result<usize> {
        let info = self.refresh()?;
        let window = i64::try_from(days).ok().and_then(ChronoDuration::try_days);
        let mut pruned = 0;
        for item in &info.items {
            let expired = match (item.time, window) {
                (None, _) => true,
                (Some(time), Some(window)) => now.signed_duration_since(time) > window,
                (Some(_), None) => false,
            };
            if !expired {
                continue;
            }
            let path = self.root.join(&item.filename);
            match fs::remove_file(&path) {
                Ok(()) => {
                    pruned += 1;
                    if let Some(parent) = path.parent() {
                        remove_empty_dirs(parent, &self.root);
                    }
                }
                Err(err) => tracing::warn!(path=%path.display(), error=%err, "failed to prune cache file"),
            }
        }
        if pruned > 0 {
            self.refresh()?;
        }
        Ok(pruned)
    }

    /// Re-injects the selected archives into the file transfer stage. Returns
    /// how many were queued; 0 without any diode proxy.
    pub fn resend(&self, items: &[CacheItem], staging: &StagingArea, proxies: &ProxyRegistry) -> usize {
        if proxies.is_empty() {
            tracing::warn!("no proxy defined; resend ignored");
            return 0;
        }
        let info = match self.refresh() {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(error=%err, "failed to refresh cache catalog");
                return 0;
            }
        };

        let mut queued = 0;
        for item in items {
            if !info.items.iter().any(|known| known.filename == item.filename) {
                tracing::debug!(filename=%item.filename, "resend item not in cache");
                continue;
            }
            let rel = PathBuf::from(&item.filename);
            match staging.inject(&self.root.join(&rel), &rel) {
                Ok(path) => {
                    tracing::info!(filename=%item.filename, staged=%path.display(), "cache item queued for resend");
                    queued += 1;
                }
                Err(err) => {
                    tracing::warn!(filename=%item.filename, error=%err, "failed to queue cache item");
                }
            }
        }
        queued
    }

    /// Copies the whole cache tree into the stage. The first copy error aborts
    /// the walk.
    pub fn send_all(&self, staging: &StagingArea) -> Result<usize> {
        let mut copied = 0;
        if !self.root.exists() {
            return Ok(0);
        }
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.with_context(|| format!("walk {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            staging
                .inject(entry.path(), rel)
                .with_context(|| format!("copy {} to stage", entry.path().display()))?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Re-sends the batches of one archive over the DATA class of the first
    /// proxy. Returns the number of batches enqueued.
    pub async fn replay(&self, filename: &str, proxies: &ProxyRegistry) -> Result<usize> {
        let proxy = proxies.first().ok_or_else(|| anyhow!("no proxy defined"))?;
        let rel = Path::new(filename);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(anyhow!("invalid cache filename {filename}"));
        }
        let path = self.root.join(rel);
        let batches = tokio::task::spawn_blocking(move || read_archive(&path)).await??;

        let mut sent = 0;
        for batch in &batches {
            let payload = serde_json::to_vec(batch)?;
            if proxy.send(TrafficClass::Data, payload) {
                sent += 1;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(sent)
    }
}

fn remove_empty_dirs(mut dir: &Path, root: &Path) {
    while dir != root && dir.starts_with(root) {
        if fs::remove_dir(dir).is_err() {
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }
}

pub fn spawn_pruner(
    index: Arc<RetentionIndex>,
    settings: SettingsStore,
    events: EventLog,
    notifier: Notifier,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), TaskFailure>> {
    spawn_supervised("cache pruner", async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let days = settings.retention_days();
                    let pruning = index.clone();
                    let result = match tokio::task::spawn_blocking(move || pruning.prune(Utc::now(), days)).await {
                        Ok(result) => result,
                        Err(err) => Err(anyhow!("prune task failed: {err}")),
                    };
                    match result {
                        Ok(0) => {}
                        Ok(count) => {
                            tracing::info!(pruned = count, remaining = index.snapshot().count, days, "cache pruned");
                            events.log(Category::Info, "Cache pruned", format!("{count} files pruned from cache"));
                            notifier.publish("cache.pruned", &count);
                        }
                        Err(err) => tracing::warn!(error=%err, "cache prune failed"),
                    }
                }
            }
        }
        Ok(())
    })
}
