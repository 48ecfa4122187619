//! ABOUTME: Active-logger registry, log streaming with live tail, retention
//! ABOUTME: HTTP tailers consume bounded channels fed from the files here

use crate::logger::{log_file_path, ExecutionLogger};
use crate::message::StreamMessage;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wf_core::{Error, Result};

/// Log manager settings
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    pub directory: PathBuf,
    pub max_size_bytes: u64,
    pub flush_interval: Duration,
    pub retention: Duration,
    pub scan_interval: Duration,
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/logs"),
            max_size_bytes: 16 * 1024 * 1024,
            flush_interval: Duration::from_millis(100),
            retention: Duration::from_secs(14 * 24 * 3600),
            scan_interval: Duration::from_secs(3600),
        }
    }
}

/// Capacity of the per-consumer stream channel; slow consumers block the
/// tailer, never the writer.
const STREAM_CHANNEL_CAP: usize = 100;

/// Owns the active loggers and serves log streams over them
pub struct LogManager {
    config: LogManagerConfig,
    active: RwLock<HashMap<Uuid, Arc<ExecutionLogger>>>,
}

impl LogManager {
    pub fn new(config: LogManagerConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.directory).map_err(|e| {
            Error::Storage(format!(
                "Cannot create log directory {:?}: {}",
                config.directory, e
            ))
        })?;
        Ok(Arc::new(Self {
            config,
            active: RwLock::new(HashMap::new()),
        }))
    }

    pub fn directory(&self) -> &PathBuf {
        &self.config.directory
    }

    /// Open (or re-acquire) the logger for an execution. A suspended
    /// execution resumed in the same process gets its still-open logger back.
    pub async fn open_logger(&self, exec_id: Uuid) -> Result<Arc<ExecutionLogger>> {
        let mut active = self.active.write().await;
        if let Some(existing) = active.get(&exec_id) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }

        let logger = Arc::new(ExecutionLogger::open(
            &self.config.directory,
            exec_id,
            self.config.max_size_bytes,
        )?);
        logger.start_flusher(self.config.flush_interval);
        active.insert(exec_id, logger.clone());
        Ok(logger)
    }

    /// Close and drop the active logger of an execution, if any
    pub async fn close_logger(&self, exec_id: Uuid) -> Result<()> {
        let logger = self.active.write().await.remove(&exec_id);
        match logger {
            Some(logger) => logger.close(),
            None => Ok(()),
        }
    }

    pub async fn active_logger(&self, exec_id: Uuid) -> Option<Arc<ExecutionLogger>> {
        self.active.read().await.get(&exec_id).cloned()
    }

    /// Stream an execution's log. Archived files come first in index order;
    /// with a live logger the current file is tailed until it closes, then
    /// drained. Lines are filtered to the latest retry per action: a line
    /// survives iff its retry equals the caller's recorded maximum for its
    /// action (absent entries and absent line retries both mean 1).
    pub async fn stream_logs(
        &self,
        ctx: CancellationToken,
        exec_id: Uuid,
        action_retries: HashMap<String, u32>,
    ) -> Result<mpsc::Receiver<StreamMessage>> {
        let live = match self.active_logger(exec_id).await {
            Some(logger) if !logger.is_closed() => Some(logger),
            _ => None,
        };

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAP);
        let directory = self.config.directory.clone();

        tokio::spawn(async move {
            let filter = RetryFilter::new(action_retries);
            let outcome = match live {
                Some(logger) => stream_live(&directory, logger, &filter, &tx, &ctx).await,
                None => stream_archived(&directory, exec_id, &filter, &tx, &ctx).await,
            };
            if let Err(e) = outcome {
                warn!(exec_id = %exec_id, error = %e, "Log stream ended with error");
            }
        });

        Ok(rx)
    }

    /// Spawn the retention sweeper
    pub fn start_retention(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                scan_interval_secs = manager.config.scan_interval.as_secs(),
                retention_secs = manager.config.retention.as_secs(),
                "Log retention sweeper started"
            );
            let mut ticker = tokio::time::interval(manager.config.scan_interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match manager.sweep_once().await {
                    Ok(0) => {}
                    Ok(n) => info!(deleted = n, "Log retention sweep"),
                    Err(e) => warn!(error = %e, "Log retention sweep failed"),
                }
            }
        });
    }

    /// One retention pass: delete log files older than the retention window
    /// whose execution has no active (unclosed) logger.
    pub async fn sweep_once(&self) -> Result<u64> {
        let cutoff = std::time::SystemTime::now()
            .checked_sub(self.config.retention)
            .unwrap_or(std::time::UNIX_EPOCH);

        let entries = std::fs::read_dir(&self.config.directory)
            .map_err(|e| Error::Storage(format!("Cannot scan log directory: {}", e)))?;

        let mut deleted = 0u64;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(exec_id) = parse_exec_id(&path) else {
                continue;
            };

            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if !old_enough {
                continue;
            }

            if let Some(logger) = self.active_logger(exec_id).await {
                if !logger.is_closed() {
                    continue;
                }
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Expired log file deleted");
                    deleted += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Log delete failed"),
            }
        }
        Ok(deleted)
    }
}

/// `<uuid>.<index>` → uuid
fn parse_exec_id(path: &std::path::Path) -> Option<Uuid> {
    let name = path.file_name()?.to_str()?;
    let (uuid_part, index_part) = name.rsplit_once('.')?;
    index_part.parse::<u32>().ok()?;
    uuid_part.parse::<Uuid>().ok()
}

struct RetryFilter {
    action_retries: HashMap<String, u32>,
}

impl RetryFilter {
    fn new(action_retries: HashMap<String, u32>) -> Self {
        Self { action_retries }
    }

    fn keep(&self, msg: &StreamMessage) -> bool {
        let latest = self.action_retries.get(&msg.action_id).copied().unwrap_or(1);
        msg.retry == latest
    }
}

/// Send one line downstream; false means the consumer went away or the
/// stream was cancelled.
async fn forward(
    line: &str,
    filter: &RetryFilter,
    tx: &mpsc::Sender<StreamMessage>,
    ctx: &CancellationToken,
) -> bool {
    let msg = match StreamMessage::parse_line(line) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Skipping malformed log line");
            return true;
        }
    };
    if !filter.keep(&msg) {
        return true;
    }
    tokio::select! {
        _ = ctx.cancelled() => false,
        sent = tx.send(msg) => sent.is_ok(),
    }
}

/// All archived files of a finished execution, in index order
async fn stream_archived(
    directory: &PathBuf,
    exec_id: Uuid,
    filter: &RetryFilter,
    tx: &mpsc::Sender<StreamMessage>,
    ctx: &CancellationToken,
) -> Result<()> {
    let mut indices: Vec<u32> = Vec::new();
    let prefix = format!("{}.", exec_id);
    let entries = std::fs::read_dir(directory)
        .map_err(|e| Error::Storage(format!("Cannot scan log directory: {}", e)))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(index) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u32>().ok()) {
            indices.push(index);
        }
    }
    indices.sort_unstable();

    for index in indices {
        let path = log_file_path(directory, exec_id, index);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::Storage(format!("Cannot open {:?}: {}", path, e)))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Storage(format!("Read failed on {:?}: {}", path, e)))?;
            if n == 0 {
                break;
            }
            if !forward(&line, filter, tx, ctx).await {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Archived indices first, then follow the live file until the logger
/// closes, finishing with a drain. Rotation mid-tail rolls the reader over
/// to the next index.
async fn stream_live(
    directory: &PathBuf,
    logger: Arc<ExecutionLogger>,
    filter: &RetryFilter,
    tx: &mpsc::Sender<StreamMessage>,
    ctx: &CancellationToken,
) -> Result<()> {
    let exec_id = logger.exec_id();
    let mut sync_rx = logger.subscribe();
    let mut index = 0u32;

    loop {
        let path = log_file_path(directory, exec_id, index);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::Storage(format!("Cannot open {:?}: {}", path, e)))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();

        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Storage(format!("Read failed on {:?}: {}", path, e)))?;
            if n > 0 {
                if !forward(&line, filter, tx, ctx).await {
                    return Ok(());
                }
                continue;
            }

            // EOF on the file we are reading
            if logger.current_index() > index {
                // writer rotated past us: this file is now immutable
                break;
            }
            if logger.is_closed() {
                // final flush landed before the closed flag; one more EOF
                // means we have drained everything
                return Ok(());
            }
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                changed = sync_rx.changed() => {
                    if changed.is_err() {
                        // writer gone without close; drain what we have
                        return Ok(());
                    }
                }
            }
        }
        index += 1;
    }
}
