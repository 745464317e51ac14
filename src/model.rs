use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Default for PointValue {
    fn default() -> Self {
        PointValue::Number(0.0)
    }
}

/// One observation as handed over by the upstream measurement source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub value: PointValue,
    #[serde(default)]
    pub quality: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPoint {
    pub time: DateTime<Utc>,
    pub name: String,
    pub value: PointValue,
    pub quality: i32,
}

impl MeasurementPoint {
    pub fn from_observation(name: impl Into<String>, obs: Observation) -> Self {
        Self {
            time: obs.timestamp,
            name: name.into(),
            value: obs.value,
            quality: obs.quality,
        }
    }
}

/// Wire message for the DATA class. One batch is one datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBatch {
    pub version: u32,
    pub group: String,
    pub interval: u64,
    pub sequence: u64,
    pub count: usize,
    pub points: Vec<MeasurementPoint>,
}

impl DataBatch {
    pub fn new(group: &str, interval: u64, sequence: u64, capacity: usize) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            group: group.to_string(),
            interval,
            sequence,
            count: capacity,
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn is_full(&self) -> bool {
        self.points.len() >= self.count
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Tag description published on the META class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    pub name: String,
    pub group: String,
}
