use crate::diode::{connect_udp, ProxyRegistry};
use crate::events::{Category, EventLog};
use crate::framing::{self, FileHeader, CHUNK_CAPACITY};
use crate::notify::Notifier;
use crate::settings::SettingsStore;
use crate::tasks::{spawn_supervised, TaskFailure};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

const PROGRESS_EVERY: u64 = 1000;
const HASH_BUFFER: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no diode proxy with a file channel defined; at least one proxy must be defined")]
    NoProxy,
    #[error("file is empty: {0}")]
    EmptyFile(PathBuf),
    #[error("file not found: {0}")]
    Missing(PathBuf),
    #[error("directory, not file: {0}")]
    NotAFile(PathBuf),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("file channel {target} unavailable: {reason}")]
    Network { target: String, reason: String },
}

impl TransferError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TransferError::Io {
            context: context.into(),
            source,
        }
    }
}

/// A staged file: name, directory relative to the stage root, size and mtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferFile {
    pub name: String,
    pub directory: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl TransferFile {
    pub fn relative_path(&self) -> PathBuf {
        if self.directory.is_empty() {
            PathBuf::from(&self.name)
        } else {
            Path::new(&self.directory).join(&self.name)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileProgress {
    pub file: TransferFile,
    pub total_sent: u64,
    pub percent_done: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub file: TransferFile,
    pub hash_hex: String,
    pub chunks: u64,
    pub bytes: u64,
}

/// `outgoing/{new,processing,done}` with mirrored relative directories.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.new_dir())?;
        fs::create_dir_all(self.processing_dir())?;
        fs::create_dir_all(self.done_dir())
    }

    pub fn new_dir(&self) -> PathBuf {
        self.root.join("new")
    }

    pub fn processing_dir(&self) -> PathBuf {
        self.root.join("processing")
    }

    pub fn done_dir(&self) -> PathBuf {
        self.root.join("done")
    }

    /// Relative paths of every regular file waiting in `new`, sorted.
    pub fn pending(&self) -> Vec<PathBuf> {
        let new_dir = self.new_dir();
        let mut out: Vec<PathBuf> = WalkDir::new(&new_dir)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.path().strip_prefix(&new_dir).ok().map(Path::to_path_buf))
            .collect();
        out.sort();
        out
    }

    /// Moves `new/<rel>` to `processing/<rel>`. The rename is the lock: when it
    /// fails another worker owns the file and `None` is returned.
    pub fn claim(&self, rel: &Path) -> Option<TransferFile> {
        let from = self.new_dir().join(rel);
        let to = self.processing_dir().join(rel);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).ok()?;
        }
        fs::rename(&from, &to).ok()?;
        let meta = fs::metadata(&to).ok()?;
        Some(describe(rel, &meta))
    }

    /// Copies `src` into `new/<rel>`. The copy lands in `tmp` first and is
    /// renamed in, so a scan never sees a half-written file.
    pub fn inject(&self, src: &Path, rel: &Path) -> std::io::Result<PathBuf> {
        let tmp = self.root.join("tmp").join(rel);
        let to = self.new_dir().join(rel);
        for dir in [tmp.parent(), to.parent()].into_iter().flatten() {
            fs::create_dir_all(dir)?;
        }
        fs::copy(src, &tmp)?;
        fs::rename(&tmp, &to)?;
        Ok(to)
    }

    fn finish(&self, file: &TransferFile) -> std::io::Result<PathBuf> {
        let rel = file.relative_path();
        let from = self.processing_dir().join(&rel);
        let to = self.done_dir().join(&rel);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &to)?;
        Ok(to)
    }
}

fn describe(rel: &Path, meta: &fs::Metadata) -> TransferFile {
    let name = rel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let directory = rel
        .parent()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    TransferFile {
        name,
        directory,
        size: meta.len(),
        modified: meta
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now),
    }
}

pub struct FileTransfer {
    staging: StagingArea,
    target: String,
    settings: SettingsStore,
    notifier: Notifier,
    events: EventLog,
}

impl FileTransfer {
    /// Streams to the file port of the first registered proxy.
    pub fn new(
        staging: StagingArea,
        proxies: &ProxyRegistry,
        settings: SettingsStore,
        notifier: Notifier,
        events: EventLog,
    ) -> Result<Self, TransferError> {
        let target = proxies
            .first()
            .and_then(|proxy| proxy.file_target())
            .ok_or(TransferError::NoProxy)?
            .to_string();
        staging
            .ensure_dirs()
            .map_err(|err| TransferError::io("create staging directories", err))?;
        Ok(Self {
            target,
            staging,
            settings,
            notifier,
            events,
        })
    }

    #[cfg(test)]
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// One pass over `new`: claims and sends each file in turn. Returns the
    /// number of completed transfers. Directory walks and renames run on the
    /// blocking pool.
    pub async fn scan_once(&self) -> usize {
        let staging = self.staging.clone();
        let pending = match tokio::task::spawn_blocking(move || staging.pending()).await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(error=%err, "staging scan failed");
                return 0;
            }
        };
        let mut completed = 0;
        for rel in pending {
            let staging = self.staging.clone();
            let claiming = rel.clone();
            let claimed = tokio::task::spawn_blocking(move || staging.claim(&claiming))
                .await
                .ok()
                .flatten();
            let Some(file) = claimed else {
                continue;
            };
            tracing::info!(path=%rel.display(), "requested processing of file");
            self.notifier.publish("transfer.request", &file);
            match self.transfer(&file).await {
                Ok(_) => completed += 1,
                Err(err) => {
                    self.events.log(
                        Category::Error,
                        "File transfer failed",
                        format!("{}: {err}", rel.display()),
                    );
                    self.notifier.publish("transfer.failed", &file);
                }
            }
        }
        completed
    }

    /// Sends one claimed file from `processing` and moves it to `done`.
    pub async fn transfer(&self, file: &TransferFile) -> Result<TransferReport, TransferError> {
        let path = self.staging.processing_dir().join(file.relative_path());
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::Missing(path));
            }
            Err(err) => return Err(TransferError::io(format!("stat {}", path.display()), err)),
        };
        if meta.is_dir() {
            return Err(TransferError::NotAFile(path));
        }
        let size = meta.len();
        if size == 0 {
            return Err(TransferError::EmptyFile(path));
        }

        let hash_hex = sha256_file(&path).await?;
        let socket = connect_udp(&self.target)
            .await
            .map_err(|err| TransferError::Network {
                target: self.target.clone(),
                reason: format!("{err:#}"),
            })?;

        let header = framing::encode_header(&FileHeader {
            name: file.name.clone(),
            directory: file.directory.clone(),
            size,
            hash_hex: hash_hex.clone(),
        });
        send_datagram(&socket, &header).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let modulus = self.settings.transfer_modulus();
        let delay = self.settings.transfer_delay();

        let mut reader = tokio::fs::File::open(&path)
            .await
            .map_err(|err| TransferError::io(format!("open {}", path.display()), err))?;
        let mut chunk = vec![0u8; CHUNK_CAPACITY];
        let mut sequence: u32 = 0;
        let mut chunks: u64 = 0;
        let mut total: u64 = 0;
        loop {
            let n = read_chunk(&mut reader, &mut chunk)
                .await
                .map_err(|err| TransferError::io(format!("read {}", path.display()), err))?;
            if n == 0 {
                break;
            }
            send_datagram(&socket, &framing::encode_chunk(sequence, &chunk[..n])).await;
            sequence = sequence.wrapping_add(1);
            chunks += 1;
            total += n as u64;

            if chunks % PROGRESS_EVERY == 0 {
                let percent_done = total as f64 / size as f64 * 100.0;
                tracing::debug!(name=%file.name, total, size, percent_done, "file transfer progress");
                self.notifier.publish(
                    "transfer.progress",
                    &FileProgress {
                        file: file.clone(),
                        total_sent: total,
                        percent_done,
                    },
                );
            }
            if chunks % modulus == 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if n < CHUNK_CAPACITY {
                break;
            }
        }
        send_datagram(&socket, &framing::encode_footer()).await;
        drop(reader);

        let staging = self.staging.clone();
        let finishing = file.clone();
        let done = tokio::task::spawn_blocking(move || staging.finish(&finishing))
            .await
            .map_err(std::io::Error::other)
            .and_then(|moved| moved)
            .map_err(|err| TransferError::io(format!("move {} to done", path.display()), err))?;
        self.events.log(
            Category::Trace,
            "File transfer complete",
            format!("{} ({} bytes, {} chunks) -> {}", path.display(), total, chunks, done.display()),
        );
        self.notifier.publish("transfer.complete", file);

        Ok(TransferReport {
            file: file.clone(),
            hash_hex,
            chunks,
            bytes: total,
        })
    }
}

pub fn spawn_file_transfer(
    pipeline: FileTransfer,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), TaskFailure>> {
    spawn_supervised("file transfer", async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    pipeline.scan_once().await;
                }
            }
        }
        Ok(())
    })
}

async fn send_datagram(socket: &UdpSocket, datagram: &[u8]) {
    // One-way link: a failed write is only observable here.
    if let Err(err) = socket.send(datagram).await {
        tracing::debug!(error=%err, "file datagram send failed");
    }
}

async fn read_chunk(reader: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub async fn sha256_file(path: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| TransferError::io(format!("open {}", path.display()), err))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|err| TransferError::io(format!("hash {}", path.display()), err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diode::ProxyConfig;
    use crate::notify::drain_topics;
    use crate::settings::{TRANSFER_DELAY_KEY, TRANSFER_MODULUS_KEY};
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        receiver: UdpSocket,
        notifier: Notifier,
        events: EventLog,
        settings: SettingsStore,
        pipeline: FileTransfer,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let notifier = Notifier::new();
        let events = EventLog::new(&dir.path().join("events.jsonl"), notifier.clone());
        let settings = SettingsStore::open(&dir.path().join("settings.json")).unwrap();
        settings.put(TRANSFER_MODULUS_KEY, "1000").unwrap();
        settings.put(TRANSFER_DELAY_KEY, "0").unwrap();

        let config = ProxyConfig {
            id: 1,
            name: "north".to_string(),
            ip: "127.0.0.1".to_string(),
            data_port: 0,
            meta_port: 0,
            file_port: receiver.local_addr().unwrap().port(),
        };
        let proxies = ProxyRegistry::open_all(&[config], 8, &events).await;
        let staging = StagingArea::new(&dir.path().join("outgoing"));
        let pipeline = FileTransfer::new(
            staging,
            &proxies,
            settings.clone(),
            notifier.clone(),
            events.clone(),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            receiver,
            notifier,
            events,
            settings,
            pipeline,
        }
    }

    async fn collect(socket: &UdpSocket) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_millis(300), socket.recv(&mut buf)).await {
                Ok(Ok(n)) => out.push(buf[..n].to_vec()),
                _ => break,
            }
        }
        out
    }

    fn stage(fx: &Fixture, rel: &str, content: &[u8]) {
        let path = fx.pipeline.staging().new_dir().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn five_thousand_byte_file_is_framed_and_hashed() {
        let fx = fixture().await;
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let expected_hash = hex::encode(Sha256::digest(&content));
        stage(&fx, "report.bin", &content);

        assert_eq!(fx.pipeline.scan_once().await, 1);
        let datagrams = collect(&fx.receiver).await;

        assert!(datagrams.iter().all(|d| d.len() == framing::DATAGRAM_SIZE));
        assert_eq!(datagrams.len(), 1 + 5 + 1);

        let header = framing::decode_header(&datagrams[0]).unwrap();
        assert_eq!(header.name, "report.bin");
        assert_eq!(header.size, 5000);
        assert_eq!(header.hash_hex, expected_hash);

        let mut body = Vec::new();
        for (i, datagram) in datagrams[1..6].iter().enumerate() {
            let (seq, payload) = framing::decode_chunk(datagram).unwrap();
            assert_eq!(seq, i as u32);
            body.extend_from_slice(payload);
        }
        let (_, last) = framing::decode_chunk(&datagrams[5]).unwrap();
        assert_eq!(last.len(), 5000 % CHUNK_CAPACITY);
        assert_eq!(body, content);
        assert!(framing::is_footer(&datagrams[6]));
    }

    #[tokio::test]
    async fn exact_multiple_ends_with_full_chunk() {
        let fx = fixture().await;
        stage(&fx, "even.bin", &vec![9u8; CHUNK_CAPACITY * 2]);
        fx.pipeline.scan_once().await;
        let datagrams = collect(&fx.receiver).await;
        assert_eq!(datagrams.len(), 4);
        let (seq, last) = framing::decode_chunk(&datagrams[2]).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(last.len(), CHUNK_CAPACITY);
    }

    #[tokio::test]
    async fn staged_file_moves_to_done_with_one_completion() {
        let fx = fixture().await;
        let mut rx = fx.notifier.subscribe();
        stage(&fx, "sub/a.txt", b"hello diode");

        fx.pipeline.scan_once().await;
        let staging = fx.pipeline.staging();
        assert!(!staging.new_dir().join("sub/a.txt").exists());
        assert!(!staging.processing_dir().join("sub/a.txt").exists());
        assert_eq!(
            fs::read(staging.done_dir().join("sub/a.txt")).unwrap(),
            b"hello diode"
        );

        let header = framing::decode_header(&collect(&fx.receiver).await[0]).unwrap();
        assert_eq!(header.directory, "sub");

        let topics: Vec<String> = drain_topics(&mut rx).into_iter().map(|n| n.topic).collect();
        assert_eq!(topics.iter().filter(|t| *t == "transfer.complete").count(), 1);
        assert_eq!(topics.iter().filter(|t| *t == "transfer.request").count(), 1);

        fx.pipeline.scan_once().await;
        let again: Vec<String> = drain_topics(&mut rx).into_iter().map(|n| n.topic).collect();
        assert!(!again.iter().any(|t| t == "transfer.complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_rereads_settings_and_sleeps_every_modulus_chunks() {
        let fx = fixture().await;
        fx.settings.put(TRANSFER_MODULUS_KEY, "2").unwrap();
        fx.settings.put(TRANSFER_DELAY_KEY, "20").unwrap();
        stage(&fx, "paced.bin", &vec![1u8; 5000]);
        let file = fx.pipeline.staging().claim(Path::new("paced.bin")).unwrap();

        let started = tokio::time::Instant::now();
        let report = fx.pipeline.transfer(&file).await.unwrap();
        let elapsed = started.elapsed();
        assert_eq!(report.chunks, 5);
        // 1 ms after the header, then 20 ms after chunks 2 and 4.
        assert!(elapsed >= Duration::from_millis(41), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(50), "{elapsed:?}");

        fx.settings.put(TRANSFER_MODULUS_KEY, "5").unwrap();
        fx.settings.put(TRANSFER_DELAY_KEY, "30").unwrap();
        stage(&fx, "paced2.bin", &vec![2u8; 5000]);
        let file = fx.pipeline.staging().claim(Path::new("paced2.bin")).unwrap();

        let started = tokio::time::Instant::now();
        fx.pipeline.transfer(&file).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(31), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(40), "{elapsed:?}");

        assert_eq!(collect(&fx.receiver).await.len(), 2 * (1 + 5 + 1));
    }

    #[tokio::test]
    async fn progress_is_published_every_thousand_chunks() {
        let fx = fixture().await;
        let mut rx = fx.notifier.subscribe();
        let size = 1000 * CHUNK_CAPACITY + 10;
        stage(&fx, "large.bin", &vec![7u8; size]);

        assert_eq!(fx.pipeline.scan_once().await, 1);
        let progress: Vec<_> = drain_topics(&mut rx)
            .into_iter()
            .filter(|n| n.topic == "transfer.progress")
            .collect();
        assert_eq!(progress.len(), 1);

        let payload = &progress[0].payload;
        let sent = (1000 * CHUNK_CAPACITY) as u64;
        assert_eq!(payload["total_sent"].as_u64(), Some(sent));
        assert_eq!(
            payload["percent_done"].as_f64(),
            Some(sent as f64 / size as f64 * 100.0)
        );
        assert_eq!(payload["file"]["name"], "large.bin");
    }

    #[tokio::test]
    async fn scan_task_transfers_staged_file_once_per_tick() {
        let Fixture {
            _dir,
            receiver: _receiver,
            notifier,
            pipeline,
            ..
        } = fixture().await;
        let mut rx = notifier.subscribe();
        let staging = pipeline.staging().clone();
        let cancel = CancellationToken::new();
        let handle = spawn_file_transfer(pipeline, Duration::from_millis(20), cancel.clone());

        let path = staging.new_dir().join("sub/a.txt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"ticked").unwrap();

        loop {
            let note = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if note.topic == "transfer.complete" {
                assert_eq!(note.payload["name"], "a.txt");
                break;
            }
        }
        assert_eq!(fs::read(staging.done_dir().join("sub/a.txt")).unwrap(), b"ticked");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let later: Vec<String> = drain_topics(&mut rx).into_iter().map(|n| n.topic).collect();
        assert!(!later.iter().any(|t| t == "transfer.complete"));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn empty_file_is_rejected_without_network_traffic() {
        let fx = fixture().await;
        let mut rx = fx.notifier.subscribe();
        stage(&fx, "empty.dat", b"");

        assert_eq!(fx.pipeline.scan_once().await, 0);
        assert!(collect(&fx.receiver).await.is_empty());
        assert!(fx.pipeline.staging().processing_dir().join("empty.dat").exists());
        assert!(!fx.pipeline.staging().done_dir().join("empty.dat").exists());

        let topics: Vec<String> = drain_topics(&mut rx).into_iter().map(|n| n.topic).collect();
        assert!(topics.contains(&"transfer.failed".to_string()));
        assert!(!topics.contains(&"transfer.complete".to_string()));
        let logged = fx.events.recent(10).unwrap();
        assert!(logged.iter().any(|e| e.category == Category::Error && e.description.contains("empty")));
    }

    #[tokio::test]
    async fn vanished_file_aborts_transfer() {
        let fx = fixture().await;
        let ghost = TransferFile {
            name: "gone.txt".to_string(),
            directory: String::new(),
            size: 10,
            modified: Utc::now(),
        };
        let err = fx.pipeline.transfer(&ghost).await.unwrap_err();
        assert!(matches!(err, TransferError::Missing(_)));
        assert!(collect(&fx.receiver).await.is_empty());

        let dir_entry = fx.pipeline.staging().processing_dir().join("folder");
        fs::create_dir_all(&dir_entry).unwrap();
        let folder = TransferFile {
            name: "folder".to_string(),
            ..ghost
        };
        let err = fx.pipeline.transfer(&folder).await.unwrap_err();
        assert!(matches!(err, TransferError::NotAFile(_)));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        staging.ensure_dirs().unwrap();
        fs::create_dir_all(staging.new_dir().join("sub")).unwrap();
        fs::write(staging.new_dir().join("sub/a.txt"), b"x").unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let staging = staging.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    staging.claim(Path::new("sub/a.txt")).is_some()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(staging.processing_dir().join("sub/a.txt").exists());
    }

    #[tokio::test]
    async fn no_proxy_disables_pipeline() {
        let dir = TempDir::new().unwrap();
        let notifier = Notifier::new();
        let events = EventLog::new(&dir.path().join("events.jsonl"), notifier.clone());
        let settings = SettingsStore::open(&dir.path().join("settings.json")).unwrap();
        let proxies = ProxyRegistry::default();
        let result = FileTransfer::new(
            StagingArea::new(&dir.path().join("outgoing")),
            &proxies,
            settings,
            notifier,
            events,
        );
        assert!(matches!(result, Err(TransferError::NoProxy)));
    }
}
