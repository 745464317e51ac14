use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RETENTION_DAYS_KEY: &str = "cache.retention";
pub const TRANSFER_MODULUS_KEY: &str = "filetransfer.modulus";
pub const TRANSFER_DELAY_KEY: &str = "filetransfer.delay";

pub const DEFAULT_RETENTION_DAYS: u64 = 7;
pub const DEFAULT_TRANSFER_MODULUS: u64 = 20;
pub const DEFAULT_TRANSFER_DELAY_MS: u64 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub value: String,
    #[serde(default)]
    pub description: String,
}

/// Key/value settings persisted as a single JSON object. Values are read on
/// every use so operators can change them without a restart.
#[derive(Clone)]
pub struct SettingsStore {
    path: PathBuf,
    values: Arc<Mutex<BTreeMap<String, Setting>>>,
}

impl SettingsStore {
    pub fn open(path: &Path) -> Result<Self> {
        let values = if path.exists() {
            let raw = fs::read_to_string(path).context("read settings")?;
            serde_json::from_str(&raw).context("parse settings")?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            values: Arc::new(Mutex::new(values)),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().ok()?;
        values.get(key).map(|s| s.value.clone())
    }

    pub fn all(&self) -> BTreeMap<String, Setting> {
        self.values.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        let entry = values.entry(key.to_string()).or_insert_with(|| Setting {
            value: String::new(),
            description: String::new(),
        });
        entry.value = value.trim().to_string();
        persist(&self.path, &values)
    }

    /// Writes the default only when the key is absent.
    pub fn init(&self, key: &str, value: &str, description: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        if values.contains_key(key) {
            return Ok(());
        }
        tracing::info!(key, value, "setting initialized");
        values.insert(
            key.to_string(),
            Setting {
                value: value.to_string(),
                description: description.to_string(),
            },
        );
        persist(&self.path, &values)
    }

    pub fn init_defaults(&self) -> Result<()> {
        self.init(
            RETENTION_DAYS_KEY,
            &DEFAULT_RETENTION_DAYS.to_string(),
            "Number of days to retain cached files",
        )?;
        self.init(
            TRANSFER_MODULUS_KEY,
            &DEFAULT_TRANSFER_MODULUS.to_string(),
            "Number of file transfer datagrams sent between pauses",
        )?;
        self.init(
            TRANSFER_DELAY_KEY,
            &DEFAULT_TRANSFER_DELAY_MS.to_string(),
            "Pause in milliseconds after each file transfer datagram burst",
        )
    }

    pub fn retention_days(&self) -> u64 {
        self.positive(RETENTION_DAYS_KEY, DEFAULT_RETENTION_DAYS)
    }

    pub fn transfer_modulus(&self) -> u64 {
        self.positive(TRANSFER_MODULUS_KEY, DEFAULT_TRANSFER_MODULUS)
    }

    pub fn transfer_delay(&self) -> Duration {
        let ms = self
            .get(TRANSFER_DELAY_KEY)
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TRANSFER_DELAY_MS);
        Duration::from_millis(ms)
    }

    fn positive(&self, key: &str, default: u64) -> u64 {
        match self.get(key).and_then(|raw| raw.parse::<i64>().ok()) {
            Some(value) if value >= 1 => value as u64,
            _ => default,
        }
    }
}

fn persist(path: &Path, values: &BTreeMap<String, Setting>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(values)?).context("write settings tmp")?;
    fs::rename(&tmp, path).context("rename settings")?;
    Ok(())
}
