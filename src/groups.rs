use crate::dispatch::{Batcher, Dispatcher};
use crate::events::{Category, EventLog};
use crate::model::{MeasurementPoint, Observation, TagInfo};
use crate::notify::Notifier;
use crate::tasks::{spawn_supervised, TaskFailure};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub run_at_start: bool,
}

fn default_interval_seconds() -> u64 {
    1
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("unknown group {0}")]
    Unknown(String),
    #[error("group {0} is already running")]
    AlreadyRunning(String),
    #[error("group {0} is not running")]
    NotRunning(String),
    #[error("group {0} has no tags")]
    NoTags(String),
}

/// Supplies the current observations of a group on every collection cycle.
pub trait MeasurementSource: Send + Sync {
    fn read(&self, group: &str) -> Vec<(String, Observation)>;
}

/// Latest observed value per tag, per group. Reads are snapshots; values stay
/// until overwritten.
#[derive(Clone, Default)]
pub struct ObservationBoard {
    inner: Arc<Mutex<HashMap<String, HashMap<String, Observation>>>>,
}

impl ObservationBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, group: &str, observations: HashMap<String, Observation>) -> usize {
        let count = observations.len();
        let Ok(mut guard) = self.inner.lock() else {
            tracing::error!(group, "observation board lock poisoned");
            return 0;
        };
        guard.entry(group.to_string()).or_default().extend(observations);
        count
    }
}

impl MeasurementSource for ObservationBoard {
    fn read(&self, group: &str) -> Vec<(String, Observation)> {
        let Ok(guard) = self.inner.lock() else {
            return Vec::new();
        };
        let mut out: Vec<(String, Observation)> = guard
            .get(group)
            .map(|tags| tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[derive(Debug, Clone, Serialize)]
struct GroupStatus<'a> {
    group: &'a str,
    observed: usize,
    expected: usize,
}

struct RunningGroup {
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), TaskFailure>>,
}

/// Owns the collector task of every started group.
pub struct GroupManager {
    configs: BTreeMap<String, GroupConfig>,
    source: Arc<dyn MeasurementSource>,
    dispatcher: Dispatcher,
    events: EventLog,
    notifier: Notifier,
    batch_capacity: usize,
    meta_interval: Duration,
    running: Mutex<HashMap<String, RunningGroup>>,
}

impl GroupManager {
    pub fn new(
        configs: Vec<GroupConfig>,
        source: Arc<dyn MeasurementSource>,
        dispatcher: Dispatcher,
        events: EventLog,
        notifier: Notifier,
        batch_capacity: usize,
        meta_interval: Duration,
    ) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.name.clone(), c)).collect(),
            source,
            dispatcher,
            events,
            notifier,
            batch_capacity,
            meta_interval,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn configs(&self) -> impl Iterator<Item = &GroupConfig> {
        self.configs.values()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.get(name).is_some_and(|g| !g.handle.is_finished()))
            .unwrap_or(false)
    }

    pub fn start(&self, name: &str) -> Result<(), GroupError> {
        let result = self.try_start(name);
        if let Err(err) = &result {
            self.events
                .log(Category::Error, "Group start failed", err.to_string());
        }
        result
    }

    fn try_start(&self, name: &str) -> Result<(), GroupError> {
        let config = self
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| GroupError::Unknown(name.to_string()))?;
        if config.tags.is_empty() {
            return Err(GroupError::NoTags(name.to_string()));
        }

        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = running.get(name) {
            if !existing.handle.is_finished() {
                return Err(GroupError::AlreadyRunning(name.to_string()));
            }
        }

        let cancel = CancellationToken::new();
        let collector = Collector {
            batcher: Batcher::new(&config.name, config.interval_seconds, self.batch_capacity),
            config,
            source: self.source.clone(),
            dispatcher: self.dispatcher.clone(),
            events: self.events.clone(),
            notifier: self.notifier.clone(),
            meta_interval: self.meta_interval,
        };
        let handle = spawn_supervised(format!("group {name}"), collector.run(cancel.clone()));
        running.insert(name.to_string(), RunningGroup { cancel, handle });
        Ok(())
    }

    /// Cancels the collector and waits for it to flush its partial batch.
    pub async fn stop(&self, name: &str) -> Result<(), GroupError> {
        let group = self
            .running
            .lock()
            .ok()
            .and_then(|mut running| running.remove(name))
            .ok_or_else(|| GroupError::NotRunning(name.to_string()))?;

        group.cancel.cancel();
        match group.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => tracing::warn!(group=%name, error=%failure, "group had already failed"),
            Err(err) => tracing::warn!(group=%name, error=%err, "group task join failed"),
        }

        self.events
            .log(Category::Info, "Group stopped", format!("Group {name} stopped"));
        self.notifier.publish("group.stopped", &name);
        Ok(())
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self
            .running
            .lock()
            .map(|running| running.keys().cloned().collect())
            .unwrap_or_default();
        for name in names {
            if let Err(err) = self.stop(&name).await {
                tracing::warn!(group=%name, error=%err, "failed to stop group");
            }
        }
    }
}

struct Collector {
    config: GroupConfig,
    batcher: Batcher,
    source: Arc<dyn MeasurementSource>,
    dispatcher: Dispatcher,
    events: EventLog,
    notifier: Notifier,
    meta_interval: Duration,
}

impl Collector {
    async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let tags: Vec<TagInfo> = self
            .config
            .tags
            .iter()
            .map(|name| TagInfo {
                name: name.clone(),
                group: self.config.name.clone(),
            })
            .collect();
        self.dispatcher.publish_meta(&tags);

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.interval_seconds.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut meta_ticker = tokio::time::interval(self.meta_interval);
        meta_ticker.tick().await;

        let mut first_cycle = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let observed = self.collect();
                    if first_cycle {
                        first_cycle = false;
                        self.report_start(observed);
                    }
                }
                _ = meta_ticker.tick() => {
                    self.dispatcher.publish_meta(&tags);
                }
            }
        }

        if let Some(batch) = self.batcher.take_partial() {
            self.dispatcher.dispatch(batch);
        }
        Ok(())
    }

    /// One collection cycle. Returns how many configured tags were observed.
    fn collect(&mut self) -> usize {
        let wanted: HashSet<&str> = self.config.tags.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        for (name, obs) in self.source.read(&self.config.name) {
            if !wanted.contains(name.as_str()) {
                continue;
            }
            seen.insert(name.clone());
            let point = MeasurementPoint::from_observation(name, obs);
            if let Some(batch) = self.batcher.push(point) {
                self.dispatcher.dispatch(batch);
            }
        }
        seen.len()
    }

    fn report_start(&self, observed: usize) {
        let name = &self.config.name;
        let status = GroupStatus {
            group: name,
            observed,
            expected: self.config.tags.len(),
        };
        if observed == status.expected {
            self.events
                .log(Category::Info, "Group started", format!("Group {name} started"));
            self.notifier.publish("group.started", &status);
        } else {
            self.events.log(
                Category::Warning,
                "Group started with missing tags",
                format!("Group {name}: {observed} of {} tags observed", status.expected),
            );
            self.notifier.publish("group.warning", &status);
        }
    }
}
