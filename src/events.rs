use crate::notify::Notifier;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Trace,
    Info,
    Warning,
    Error,
}

impl Category {
    fn as_str(self) -> &'static str {
        match self {
            Category::Trace => "trace",
            Category::Info => "info",
            Category::Warning => "warning",
            Category::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub time: DateTime<Utc>,
    pub category: Category,
    pub title: String,
    pub description: String,
}

/// Append-only operator log (`events.jsonl`), mirrored to tracing and to
/// `logger.<category>` notifications.
#[derive(Clone)]
pub struct EventLog {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
    notifier: Notifier,
}

impl EventLog {
    pub fn new(path: &Path, notifier: Notifier) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Arc::new(Mutex::new(())),
            notifier,
        }
    }

    pub fn log(&self, category: Category, title: &str, description: impl Into<String>) {
        let entry = EventEntry {
            time: Utc::now(),
            category,
            title: title.to_string(),
            description: description.into(),
        };

        match category {
            Category::Trace => tracing::debug!(title, description=%entry.description, "event"),
            Category::Info => tracing::info!(title, description=%entry.description, "event"),
            Category::Warning => tracing::warn!(title, description=%entry.description, "event"),
            Category::Error => tracing::error!(title, description=%entry.description, "event"),
        }

        if let Err(err) = self.append(&entry) {
            tracing::warn!(path=%self.path.display(), error=%err, "failed to append event log");
        }
        self.notifier
            .publish(&format!("logger.{}", category.as_str()), &entry);
    }

    fn append(&self, entry: &EventEntry) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<EventEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path).context("read event log")?;
        let mut entries: Vec<EventEntry> = raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if entries.len() > limit {
            entries = entries.split_off(entries.len() - limit);
        }
        Ok(entries)
    }
}
