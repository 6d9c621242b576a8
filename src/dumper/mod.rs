use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::form_urlencoded;

use crate::batch::Batch;
use crate::sender::Sender;

pub const DUMP_EXTENSION: &str = "dmp";
const CORRUPT_EXTENSION: &str = "corrupt";
const SLUG_MAX_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("dump I/O failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dump file {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: &'static str },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DumpError + '_ {
    move |source| DumpError::Io {
        path: path.to_owned(),
        source,
    }
}

/// A batch read back from the spill directory.
#[derive(Debug)]
pub struct DumpRecord {
    pub key: String,
    /// Taken from the file name; `None` for files not written by this dumper.
    pub timestamp: Option<SystemTime>,
    pub content: Bytes,
    pub path: PathBuf,
}

impl DumpRecord {
    pub fn into_batch(self) -> Batch {
        let created_at = self.timestamp.unwrap_or_else(SystemTime::now);
        Batch::from_content(self.key, self.content, created_at)
    }
}

/// Persists undeliverable batches as one file each under a spill directory.
///
/// File layout: a `query=<form-urlencoded key>` header line, `\n`, then the
/// exact batch content. Names are `<created-at unix-nanos>-<sequence>-<slug>.dmp`,
/// zero-padded so lexical order is batch creation order.
#[derive(Debug)]
pub struct FileDumper {
    dir: PathBuf,
    sequence: AtomicU64,
}

impl FileDumper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn set_path(&mut self, dir: impl Into<PathBuf>) {
        self.dir = dir.into();
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write `batch` to a new file and return its path.
    ///
    /// The file is written under a temporary name, synced, then renamed, so a
    /// reader never observes a partial dump.
    pub async fn dump(&self, batch: &Batch) -> Result<PathBuf, DumpError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        let path = self.dir.join(self.next_file_name(batch));
        let tmp = path.with_extension("tmp");

        let mut header = String::from("query=");
        header.extend(form_urlencoded::byte_serialize(batch.key().as_bytes()));
        header.push('\n');

        if let Err(e) = write_synced(&tmp, header.as_bytes(), &batch.content()).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        fs::rename(&tmp, &path).await.map_err(io_error(&path))?;
        Ok(path)
    }

    fn next_file_name(&self, batch: &Batch) -> String {
        let nanos = batch
            .created_at()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{nanos:020}-{seq:08}-{}.{DUMP_EXTENSION}", slug(batch.key()))
    }

    /// Dump files waiting for replay, oldest first. A missing directory has none.
    pub async fn pending(&self) -> Result<Vec<PathBuf>, DumpError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir)(e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.dir))? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == DUMP_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub async fn read(path: &Path) -> Result<DumpRecord, DumpError> {
        let raw = Bytes::from(fs::read(path).await.map_err(io_error(path))?);
        let corrupt = |reason| DumpError::Corrupt {
            path: path.to_owned(),
            reason,
        };

        let newline = raw
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| corrupt("missing header line"))?;
        let key = form_urlencoded::parse(&raw[..newline])
            .find(|(k, _)| k == "query")
            .map(|(_, v)| v.into_owned())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| corrupt("missing query header"))?;

        Ok(DumpRecord {
            key,
            timestamp: timestamp_from_name(path),
            content: raw.slice(newline + 1..),
            path: path.to_owned(),
        })
    }

    /// Resubmit dumped batches oldest first, deleting each one that is delivered.
    ///
    /// Stops at the first delivery failure so order is kept; the remaining files
    /// are retried on the next pass. Returns the number of files replayed.
    pub async fn replay<S: Sender>(&self, sender: &S) -> Result<usize, DumpError> {
        let mut replayed = 0;
        for path in self.pending().await? {
            let record = match Self::read(&path).await {
                Ok(record) => record,
                Err(e @ DumpError::Corrupt { .. }) => {
                    error!(error = %e, "setting aside corrupt dump file");
                    let aside = path.with_extension(CORRUPT_EXTENSION);
                    fs::rename(&path, &aside).await.map_err(io_error(&path))?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let batch = record.into_batch();
            if let Err(e) = sender.try_deliver(&batch).await {
                warn!(error = %e, path = %path.display(), "dump replay failed, will retry");
                break;
            }
            fs::remove_file(&path).await.map_err(io_error(&path))?;
            info!(
                path = %path.display(),
                key = batch.key(),
                rows = batch.row_count(),
                "replayed dump file"
            );
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Run `replay` every `interval` until cancelled.
    pub fn spawn_replay<S: Sender>(
        self: Arc<Self>,
        sender: Arc<S>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                tokio::select! {
                    result = self.replay(&*sender) => {
                        if let Err(e) = result {
                            error!(error = %e, "dump replay pass failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

async fn write_synced(path: &Path, header: &[u8], content: &[u8]) -> Result<(), DumpError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(io_error(path))?;
    file.write_all(header).await.map_err(io_error(path))?;
    file.write_all(content).await.map_err(io_error(path))?;
    file.sync_all().await.map_err(io_error(path))
}

/// Filesystem-safe, lowercase rendering of a query for file names.
fn slug(key: &str) -> String {
    let mut out = String::with_capacity(SLUG_MAX_LEN);
    for c in key.chars() {
        if out.len() >= SLUG_MAX_LEN {
            break;
        }
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "batch".to_owned()
    } else {
        trimmed.to_owned()
    }
}

fn timestamp_from_name(path: &Path) -> Option<SystemTime> {
    let name = path.file_name()?.to_str()?;
    let nanos: u64 = name.split('-').next()?.parse().ok()?;
    Some(UNIX_EPOCH + Duration::from_nanos(nanos))
}
