use crate::events::{Category, EventLog};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficClass {
    Data,
    Meta,
    File,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 3] = [TrafficClass::Data, TrafficClass::Meta, TrafficClass::File];

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficClass::Data => "data",
            TrafficClass::Meta => "meta",
            TrafficClass::File => "file",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One receiving side of the diode: an address and one UDP port per class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub ip: String,
    pub data_port: u16,
    pub meta_port: u16,
    pub file_port: u16,
}

impl ProxyConfig {
    pub fn port(&self, class: TrafficClass) -> u16 {
        match class {
            TrafficClass::Data => self.data_port,
            TrafficClass::Meta => self.meta_port,
            TrafficClass::File => self.file_port,
        }
    }

    pub fn target(&self, class: TrafficClass) -> String {
        let ip = self.ip.trim();
        if ip.contains(':') && !ip.starts_with('[') {
            format!("[{}]:{}", ip, self.port(class))
        } else {
            format!("{}:{}", ip, self.port(class))
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelStats {
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
    pub sent: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub class: TrafficClass,
    pub target: String,
    pub open: bool,
    pub enqueued: u64,
    pub dropped: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Bounded queue in front of one class sender task. A full queue drops the
/// newest payload; the producer never waits on the network.
#[derive(Clone)]
pub struct ClassSender {
    class: TrafficClass,
    target: String,
    tx: mpsc::Sender<Bytes>,
    stats: Arc<ChannelStats>,
}

impl ClassSender {
    fn new(class: TrafficClass, target: String, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            class,
            target,
            tx,
            stats: Arc::new(ChannelStats::default()),
        }
    }

    pub fn send(&self, payload: impl Into<Bytes>) -> bool {
        match self.tx.try_send(payload.into()) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    tracing::warn!(class=%self.class, target=%self.target, dropped, "diode queue full; dropping newest payload");
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(class=%self.class, target=%self.target, "diode sender stopped");
                false
            }
        }
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus {
            class: self.class,
            target: self.target.clone(),
            open: !self.tx.is_closed(),
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            sent: self.stats.sent.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

/// DATA and META each own a queue and sender task. FILE has no queue: it is
/// dialed once at open to check reachability, and file transfers connect
/// their own socket to [`DiodeProxy::file_target`].
pub struct DiodeProxy {
    pub config: ProxyConfig,
    data: Option<ClassSender>,
    meta: Option<ClassSender>,
    file_target: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub id: u32,
    pub name: String,
    pub ip: String,
    pub channels: Vec<ChannelStatus>,
    pub missing: Vec<TrafficClass>,
}

impl DiodeProxy {
    /// Dials each class independently; a failed class stays absent and the
    /// proxy remains usable for the others.
    pub async fn open(config: ProxyConfig, queue_capacity: usize, events: &EventLog) -> Self {
        let mut proxy = Self {
            config,
            data: None,
            meta: None,
            file_target: None,
        };
        for class in TrafficClass::ALL {
            let target = proxy.config.target(class);
            let opened = match class {
                TrafficClass::Data => open_class(&proxy.config, class, queue_capacity)
                    .await
                    .map(|sender| proxy.data = Some(sender)),
                TrafficClass::Meta => open_class(&proxy.config, class, queue_capacity)
                    .await
                    .map(|sender| proxy.meta = Some(sender)),
                TrafficClass::File => reach_class(&proxy.config, class)
                    .await
                    .map(|target| proxy.file_target = Some(target)),
            };
            match opened {
                Ok(()) => {
                    events.log(
                        Category::Trace,
                        &format!("Setting up outgoing {}", class.as_str().to_uppercase()),
                        target,
                    );
                }
                Err(err) => {
                    events.log(
                        Category::Error,
                        &format!("Failed to open {class} emitter"),
                        format!("UDP {class} emitter to {target} could not be opened, error: {err:#}"),
                    );
                }
            }
        }
        tracing::info!(proxy_id = proxy.config.id, name=%proxy.config.name, "diode proxy initialized");
        proxy
    }

    /// Queued sender for DATA or META. Always `None` for FILE.
    pub fn channel(&self, class: TrafficClass) -> Option<&ClassSender> {
        match class {
            TrafficClass::Data => self.data.as_ref(),
            TrafficClass::Meta => self.meta.as_ref(),
            TrafficClass::File => None,
        }
    }

    /// Address of the FILE port when it was reachable at open.
    pub fn file_target(&self) -> Option<&str> {
        self.file_target.as_deref()
    }

    /// Enqueues on the class queue. False when the class is unavailable or
    /// the payload was dropped.
    pub fn send(&self, class: TrafficClass, payload: impl Into<Bytes>) -> bool {
        match self.channel(class) {
            Some(sender) => sender.send(payload),
            None => false,
        }
    }

    pub fn status(&self) -> ProxyStatus {
        let mut channels = Vec::new();
        let mut missing = Vec::new();
        for class in TrafficClass::ALL {
            if let Some(sender) = self.channel(class) {
                channels.push(sender.status());
            } else if let (TrafficClass::File, Some(target)) = (class, &self.file_target) {
                channels.push(ChannelStatus {
                    class,
                    target: target.clone(),
                    open: true,
                    enqueued: 0,
                    dropped: 0,
                    sent: 0,
                    failed: 0,
                });
            } else {
                missing.push(class);
            }
        }
        ProxyStatus {
            id: self.config.id,
            name: self.config.name.clone(),
            ip: self.config.ip.clone(),
            channels,
            missing,
        }
    }
}

/// Proxies in registration order. Built once before any producer starts and
/// read-only afterwards.
#[derive(Default)]
pub struct ProxyRegistry {
    proxies: Vec<DiodeProxy>,
}

impl ProxyRegistry {
    pub async fn open_all(configs: &[ProxyConfig], queue_capacity: usize, events: &EventLog) -> Self {
        let mut proxies = Vec::with_capacity(configs.len());
        for config in configs {
            proxies.push(DiodeProxy::open(config.clone(), queue_capacity, events).await);
        }
        Self { proxies }
    }

    pub fn first(&self) -> Option<&DiodeProxy> {
        self.proxies.first()
    }

    pub fn get(&self, id: u32) -> Option<&DiodeProxy> {
        self.proxies.iter().find(|p| p.config.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn statuses(&self) -> Vec<ProxyStatus> {
        self.proxies.iter().map(DiodeProxy::status).collect()
    }
}

/// Resolves `target` and returns a socket connected to it.
pub async fn connect_udp(target: &str) -> Result<UdpSocket> {
    let addr = tokio::net::lookup_host(target)
        .await
        .with_context(|| format!("resolve {target}"))?
        .next()
        .ok_or_else(|| anyhow!("no address for {target}"))?;
    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await.context("bind udp socket")?;
    socket
        .connect(addr)
        .await
        .with_context(|| format!("connect {addr}"))?;
    Ok(socket)
}

fn class_target(config: &ProxyConfig, class: TrafficClass) -> Result<String> {
    if config.ip.trim().is_empty() {
        bail!("proxy {} has no ip", config.id);
    }
    if config.port(class) == 0 {
        bail!("no {class} port configured");
    }
    Ok(config.target(class))
}

/// Dials and drops a socket; only the resolved target is kept.
async fn reach_class(config: &ProxyConfig, class: TrafficClass) -> Result<String> {
    let target = class_target(config, class)?;
    connect_udp(&target).await?;
    Ok(target)
}

async fn open_class(config: &ProxyConfig, class: TrafficClass, queue_capacity: usize) -> Result<ClassSender> {
    let target = class_target(config, class)?;
    let socket = connect_udp(&target).await?;
    let (tx, rx) = mpsc::channel::<Bytes>(queue_capacity.max(1));
    let sender = ClassSender::new(class, target, tx);
    spawn_class_sender(&sender, socket, rx);
    Ok(sender)
}

fn spawn_class_sender(sender: &ClassSender, socket: UdpSocket, mut rx: mpsc::Receiver<Bytes>) {
    let class = sender.class;
    let target = sender.target.clone();
    let stats = sender.stats.clone();
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            match socket.send(&payload).await {
                Ok(_) => {
                    stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%class, %target, bytes = payload.len(), error=%err, "diode send failed");
                }
            }
        }
        tracing::debug!(%class, %target, "diode sender exited");
    });
}
