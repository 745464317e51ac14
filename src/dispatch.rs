use crate::archive::ArchiveHandle;
use crate::diode::{ProxyRegistry, TrafficClass};
use crate::model::{DataBatch, MeasurementPoint, TagInfo};
use crate::notify::Notifier;
use std::sync::Arc;

const META_CHUNK: usize = 100;

/// Fills fixed-capacity batches for one group. A full batch is handed out
/// and replaced by a fresh one with the next sequence number.
#[derive(Debug)]
pub struct Batcher {
    capacity: usize,
    current: DataBatch,
}

impl Batcher {
    pub fn new(group: &str, interval: u64, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            current: DataBatch::new(group, interval, 0, capacity),
        }
    }

    pub fn pending(&self) -> usize {
        self.current.points.len()
    }

    pub fn push(&mut self, point: MeasurementPoint) -> Option<DataBatch> {
        self.current.points.push(point);
        if self.current.is_full() {
            Some(self.roll())
        } else {
            None
        }
    }

    /// Hands out the partially filled batch, if any. Used at group stop.
    pub fn take_partial(&mut self) -> Option<DataBatch> {
        if self.current.points.is_empty() {
            return None;
        }
        let mut batch = self.roll();
        batch.count = batch.points.len();
        Some(batch)
    }

    fn roll(&mut self) -> DataBatch {
        let next = DataBatch::new(
            &self.current.group,
            self.current.interval,
            self.current.sequence + 1,
            self.capacity,
        );
        std::mem::replace(&mut self.current, next)
    }
}

/// Routes finished batches to the DATA class of the first proxy and to the
/// archive writer.
#[derive(Clone)]
pub struct Dispatcher {
    proxies: Arc<ProxyRegistry>,
    archive: ArchiveHandle,
    notifier: Notifier,
}

impl Dispatcher {
    pub fn new(proxies: Arc<ProxyRegistry>, archive: ArchiveHandle, notifier: Notifier) -> Self {
        Self {
            proxies,
            archive,
            notifier,
        }
    }

    /// Returns whether the live send was enqueued. The batch is archived
    /// either way.
    pub fn dispatch(&self, batch: DataBatch) -> bool {
        let payload = match batch.encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(group=%batch.group, sequence=batch.sequence, error=%err, "failed to encode batch");
                return false;
            }
        };

        let sent = match self.proxies.first() {
            Some(proxy) => proxy.send(TrafficClass::Data, payload.clone()),
            None => false,
        };
        if !sent {
            tracing::debug!(group=%batch.group, sequence=batch.sequence, "batch not sent live");
        }

        self.notifier
            .publish("data.message", &String::from_utf8_lossy(&payload));
        self.archive.write(batch);
        sent
    }

    /// Publishes tag descriptions on the META class in chunks of 100.
    pub fn publish_meta(&self, tags: &[TagInfo]) -> usize {
        let Some(proxy) = self.proxies.first() else {
            return 0;
        };
        let mut sent = 0;
        for chunk in tags.chunks(META_CHUNK) {
            match serde_json::to_vec(chunk) {
                Ok(payload) => {
                    if proxy.send(TrafficClass::Meta, payload) {
                        sent += 1;
                    }
                }
                Err(err) => tracing::warn!(error=%err, "failed to encode meta data"),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{read_archive, spawn_archive_thread};
    use crate::diode::ProxyConfig;
    use crate::events::EventLog;
    use crate::model::PointValue;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::UdpSocket;

    fn point(i: usize) -> MeasurementPoint {
        MeasurementPoint {
            time: Utc::now(),
            name: format!("tag{i}"),
            value: PointValue::Number(i as f64),
            quality: 192,
        }
    }

    #[test]
    fn batches_are_full_and_sequenced() {
        let mut batcher = Batcher::new("boilers", 1, 10);
        let mut out = Vec::new();
        for i in 0..25 {
            if let Some(batch) = batcher.push(point(i)) {
                out.push(batch);
            }
        }
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|b| b.points.len() == 10 && b.count == 10));
        assert_eq!(out[0].sequence, 0);
        assert_eq!(out[1].sequence, 1);
        assert_eq!(out[1].points[0].name, "tag10");
        assert_eq!(batcher.pending(), 5);

        let partial = batcher.take_partial().unwrap();
        assert_eq!(partial.sequence, 2);
        assert_eq!(partial.points.len(), 5);
        assert_eq!(partial.count, 5);
        assert!(batcher.take_partial().is_none());
        let next = batcher.push(point(99)).map(|b| b.sequence);
        assert_eq!(next, None);
        assert_eq!(batcher.take_partial().unwrap().sequence, 3);
    }

    #[test]
    fn partial_batches_carry_over_between_cycles() {
        let mut batcher = Batcher::new("slow", 60, 10);
        for i in 0..4 {
            assert!(batcher.push(point(i)).is_none());
        }
        for i in 4..8 {
            assert!(batcher.push(point(i)).is_none());
        }
        assert_eq!(batcher.pending(), 8);
    }

    #[tokio::test]
    async fn dispatch_sends_and_archives() {
        let dir = TempDir::new().unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let meta_receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let events = EventLog::new(&dir.path().join("events.jsonl"), Notifier::new());
        let config = ProxyConfig {
            id: 1,
            name: "north".to_string(),
            ip: "127.0.0.1".to_string(),
            data_port: receiver.local_addr().unwrap().port(),
            meta_port: meta_receiver.local_addr().unwrap().port(),
            file_port: 0,
        };
        let proxies = Arc::new(ProxyRegistry::open_all(&[config], 16, &events).await);
        let cache = dir.path().join("cache");
        let archive = spawn_archive_thread(cache.clone(), "dd".to_string(), 5).unwrap();
        let dispatcher = Dispatcher::new(proxies, archive.clone(), Notifier::new());

        let mut batcher = Batcher::new("boilers", 1, 10);
        let mut expected = Vec::new();
        for i in 0..20 {
            if let Some(batch) = batcher.push(point(i)) {
                expected.push(batch.clone());
                assert!(dispatcher.dispatch(batch));
            }
        }

        let mut buf = vec![0u8; 8192];
        for want in &expected {
            let n = tokio::time::timeout(Duration::from_secs(2), receiver.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let got: DataBatch = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(&got, want);
        }

        let tags: Vec<TagInfo> = (0..150)
            .map(|i| TagInfo { name: format!("tag{i}"), group: "boilers".to_string() })
            .collect();
        assert_eq!(dispatcher.publish_meta(&tags), 2);
        let n = tokio::time::timeout(Duration::from_secs(2), meta_receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let first: Vec<TagInfo> = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(first.len(), 100);

        archive.close().await.unwrap();
        let mut archived = Vec::new();
        for entry in walkdir::WalkDir::new(&cache).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_file() {
                archived.extend(read_archive(entry.path()).unwrap());
            }
        }
        archived.sort_by_key(|b| b.sequence);
        assert_eq!(archived, expected);
    }
}
