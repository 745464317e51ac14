use crate::diode::ProxyConfig;
use crate::groups::GroupConfig;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub http_bind: String,

    pub archive_prefix: String,
    pub rotate_minutes: u32,
    pub prune_interval: Duration,

    pub scan_interval: Duration,

    pub batch_capacity: usize,
    pub queue_capacity: usize,
    pub meta_interval: Duration,

    pub proxies: Vec<ProxyConfig>,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct SetupConfig {
    #[serde(default)]
    proxies: Vec<ProxyConfig>,
    #[serde(default)]
    groups: Vec<GroupConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(env_string("DIODE_DATA_DIR", Some(".".to_string()))?);
        let http_bind = env_string("DIODE_HTTP_BIND", Some("127.0.0.1:9102".to_string()))?;

        let archive_prefix = env_string("DIODE_ARCHIVE_PREFIX", Some("dd".to_string()))?;
        let rotate_minutes = env_u64("DIODE_ROTATE_MINUTES", Some(5))?.clamp(1, 60) as u32;
        let prune_interval =
            Duration::from_secs(env_u64("DIODE_PRUNE_INTERVAL_SECONDS", Some(3600))?.max(1));
        let scan_interval =
            Duration::from_millis(env_u64("DIODE_SCAN_INTERVAL_MS", Some(500))?.max(10));

        let batch_capacity = env_u64("DIODE_BATCH_CAPACITY", Some(10))?.max(1) as usize;
        let queue_capacity = env_u64("DIODE_QUEUE_CAPACITY", Some(1024))?.max(1) as usize;
        let meta_interval =
            Duration::from_secs(env_u64("DIODE_META_INTERVAL_SECONDS", Some(600))?.max(1));

        let setup_path = env_optional("DIODE_SETUP_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("setup.json"));
        let setup = load_setup_config(&setup_path);

        let mut proxies = setup.proxies;
        if let Some(ip) = env_optional("DIODE_PROXY_IP") {
            let next_id = proxies.iter().map(|p| p.id).max().map_or(1, |id| id + 1);
            proxies.push(ProxyConfig {
                id: next_id,
                name: env_string("DIODE_PROXY_NAME", Some("default".to_string()))?,
                ip,
                data_port: env_port("DIODE_PROXY_DATA_PORT")?,
                meta_port: env_port("DIODE_PROXY_META_PORT")?,
                file_port: env_port("DIODE_PROXY_FILE_PORT")?,
            });
        }

        Ok(Self {
            data_dir,
            http_bind,
            archive_prefix,
            rotate_minutes,
            prune_interval,
            scan_interval,
            batch_capacity,
            queue_capacity,
            meta_interval,
            proxies,
            groups: setup.groups,
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn outgoing_dir(&self) -> PathBuf {
        self.data_dir.join("outgoing")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join("events.jsonl")
    }
}

fn load_setup_config(path: &Path) -> SetupConfig {
    if !path.exists() {
        return SetupConfig::default();
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(path=%path.display(), error=%err, "failed to read setup config; no proxies or groups");
            return SetupConfig::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(setup) => setup,
        Err(err) => {
            tracing::warn!(path=%path.display(), error=%err, "failed to parse setup config; no proxies or groups");
            SetupConfig::default()
        }
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_port(key: &str) -> Result<u16> {
    let raw = env_string(key, None)?;
    raw.parse::<u16>().with_context(|| format!("invalid {key}"))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: &Path) -> Config {
    Config {
        data_dir: data_dir.to_path_buf(),
        http_bind: "127.0.0.1:0".to_string(),
        archive_prefix: "dd".to_string(),
        rotate_minutes: 5,
        prune_interval: Duration::from_secs(3600),
        scan_interval: Duration::from_millis(500),
        batch_capacity: 10,
        queue_capacity: 64,
        meta_interval: Duration::from_secs(600),
        proxies: Vec::new(),
        groups: Vec::new(),
    }
}
