use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const NOTIFY_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub topic: String,
    pub payload: Value,
}

/// Best-effort fan-out to UI subscribers. Publishing never blocks and
/// succeeds whether or not anybody is listening; slow subscribers lag.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(NOTIFY_CAPACITY);
        Self { tx }
    }

    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(topic, error=%err, "notification payload not serializable");
                return;
            }
        };
        let _ = self.tx.send(Notification {
            topic: topic.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirrors every notification to the debug log until cancelled.
pub fn spawn_trace_relay(notifier: &Notifier, cancel: CancellationToken) -> JoinHandle<()> {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(note) => tracing::debug!(topic=%note.topic, payload=%note.payload, "notification"),
                    Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "notification relay lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
pub(crate) fn drain_topics(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let notifier = Notifier::new();
        notifier.publish("transfer.complete", &serde_json::json!({"name": "a.txt"}));
    }

    #[test]
    fn subscribers_see_topic_and_payload() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        notifier.publish("group.started", &"boilers");
        let got = drain_topics(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].topic, "group.started");
        assert_eq!(got[0].payload, Value::String("boilers".to_string()));
    }
}
