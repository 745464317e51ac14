use crate::model::DataBatch;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

const ARCHIVE_SUFFIX: &str = ".json.gz";
const STAMP_FORMAT: &str = "%Y_%m_%d-%H_%M";
const STAMP_LEN: usize = 16;

#[derive(Debug)]
pub enum ArchiveCommand {
    Write(DataBatch),
    Close { respond_to: oneshot::Sender<()> },
}

/// Producer side of the archive writer thread. Cloned into every dispatcher.
#[derive(Clone)]
pub struct ArchiveHandle {
    tx: mpsc::UnboundedSender<ArchiveCommand>,
}

impl ArchiveHandle {
    pub fn new(tx: mpsc::UnboundedSender<ArchiveCommand>) -> Self {
        Self { tx }
    }

    pub fn write(&self, batch: DataBatch) {
        if self.tx.send(ArchiveCommand::Write(batch)).is_err() {
            tracing::debug!("archive thread stopped; batch not archived");
        }
    }

    /// Finalizes the open archive file and waits until it is on disk.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ArchiveCommand::Close { respond_to: tx })
            .map_err(|_| anyhow!("archive thread stopped"))?;
        rx.await.context("archive thread dropped response")
    }
}

pub fn spawn_archive_thread(
    cache_dir: PathBuf,
    prefix: String,
    rotate_minutes: u32,
) -> Result<ArchiveHandle> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ArchiveCommand>();

    std::thread::Builder::new()
        .name("archive-writer".to_string())
        .spawn(move || {
            let mut writer = ArchiveWriter::new(cache_dir, prefix, rotate_minutes);
            run_archive_thread(&mut writer, &mut rx);
        })
        .context("failed to spawn archive thread")?;

    Ok(ArchiveHandle::new(tx))
}

fn run_archive_thread(writer: &mut ArchiveWriter, rx: &mut mpsc::UnboundedReceiver<ArchiveCommand>) {
    if let Err(err) = writer.rotate(Utc::now()) {
        tracing::error!(error=%err, "failed to open archive file");
    }

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            ArchiveCommand::Write(batch) => {
                let now = Utc::now();
                if let Err(err) = writer.rotate_if_due(now) {
                    tracing::error!(error=%err, "archive rotation failed");
                }
                if let Err(err) = writer.write(&batch) {
                    tracing::warn!(error=%err, group=%batch.group, sequence=batch.sequence, "failed to archive batch");
                }
            }
            ArchiveCommand::Close { respond_to } => {
                if let Err(err) = writer.close() {
                    tracing::warn!(error=%err, "failed to finalize archive file");
                }
                let _ = respond_to.send(());
            }
        }
    }

    if let Err(err) = writer.close() {
        tracing::warn!(error=%err, "failed to finalize archive file");
    }
}

/// Edge-triggered rotation: fires when the wall-clock minute enters a new
/// multiple of `period`, once per window.
#[derive(Debug, Clone)]
pub struct RotationClock {
    period: u32,
    prev_remainder: Option<u32>,
}

impl RotationClock {
    pub fn new(period: u32) -> Self {
        Self {
            period: period.max(1),
            prev_remainder: None,
        }
    }

    pub fn mark(&mut self, minute: u32) {
        self.prev_remainder = Some(minute % self.period);
    }

    pub fn observe(&mut self, minute: u32) -> bool {
        let remainder = minute % self.period;
        let due = remainder == 0 && self.prev_remainder != Some(remainder);
        self.prev_remainder = Some(remainder);
        due
    }
}

struct OpenArchive {
    path: PathBuf,
    writer: BufWriter<GzEncoder<fs::File>>,
    entries: u64,
}

pub struct ArchiveWriter {
    cache_dir: PathBuf,
    prefix: String,
    clock: RotationClock,
    current: Option<OpenArchive>,
}

impl ArchiveWriter {
    pub fn new(cache_dir: PathBuf, prefix: String, rotate_minutes: u32) -> Self {
        Self {
            cache_dir,
            prefix,
            clock: RotationClock::new(rotate_minutes),
            current: None,
        }
    }

    #[cfg(test)]
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|open| open.path.as_path())
    }

    /// Appends one batch as the next JSON array element. Drops the batch when
    /// no file is open.
    pub fn write(&mut self, batch: &DataBatch) -> Result<()> {
        let Some(open) = self.current.as_mut() else {
            return Ok(());
        };
        let separator: &[u8] = if open.entries == 0 { b"[" } else { b"," };
        open.writer.write_all(separator)?;
        serde_json::to_writer(&mut open.writer, batch)?;
        open.entries += 1;
        Ok(())
    }

    pub fn rotate_if_due(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if !self.clock.observe(now.minute()) {
            return Ok(false);
        }
        self.rotate(now)?;
        Ok(true)
    }

    pub fn rotate(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.close()?;

        let dir = archive_dir(&self.cache_dir, now);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(archive_file_name(&self.prefix, now));

        // A restart inside the same minute appends a second gzip member.
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let writer = BufWriter::new(GzEncoder::new(file, Compression::default()));

        tracing::info!(path=%path.display(), "archive file opened");
        self.clock.mark(now.minute());
        self.current = Some(OpenArchive {
            path,
            writer,
            entries: 0,
        });
        Ok(())
    }

    /// Writes the closing bracket and the gzip trailer. No-op when nothing is open.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut open) = self.current.take() else {
            return Ok(());
        };
        if open.entries == 0 {
            open.writer.write_all(b"[")?;
        }
        open.writer.write_all(b"]")?;
        open.writer.flush()?;
        let encoder = open
            .writer
            .into_inner()
            .map_err(|err| anyhow!("flush archive buffer: {}", err.error()))?;
        let file = encoder.finish().context("finish gzip stream")?;
        if let Err(err) = file.sync_data() {
            tracing::warn!(path=%open.path.display(), error=%err, "archive fsync failed");
        }
        tracing::debug!(path=%open.path.display(), entries=open.entries, "archive file finalized");
        Ok(())
    }
}

pub fn archive_dir(cache_dir: &Path, at: DateTime<Utc>) -> PathBuf {
    cache_dir
        .join(format!("{}", at.year()))
        .join(format!("{:02}", at.month()))
        .join(format!("{:02}", at.day()))
}

pub fn archive_file_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}{}", prefix, at.format(STAMP_FORMAT), ARCHIVE_SUFFIX)
}

/// Creation time encoded in an archive file name, `None` when the name does
/// not follow `<prefix>_YYYY_MM_DD-HH_MM.json.gz`.
pub fn parse_archive_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let stem = file_name.strip_suffix(ARCHIVE_SUFFIX)?;
    if stem.len() < STAMP_LEN + 1 || !stem.is_char_boundary(stem.len() - STAMP_LEN) {
        return None;
    }
    let (head, stamp) = stem.split_at(stem.len() - STAMP_LEN);
    if !head.ends_with('_') {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Decodes every batch of a finalized archive. Multiple gzip members (one per
/// reopen) are read back to back.
pub fn read_archive(path: &Path) -> Result<Vec<DataBatch>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    let mut raw = Vec::new();
    if let Err(err) = decoder.read_to_end(&mut raw) {
        tracing::warn!(path=%path.display(), error=%err, "archive truncated; decoding readable part");
    }

    let mut out = Vec::new();
    for chunk in serde_json::Deserializer::from_slice(&raw).into_iter::<Vec<DataBatch>>() {
        match chunk {
            Ok(batches) => out.extend(batches),
            Err(err) => {
                tracing::warn!(path=%path.display(), error=%err, "skipping undecodable archive content");
                break;
            }
        }
    }
    Ok(out)
}
