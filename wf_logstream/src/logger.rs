//! ABOUTME: Append-only execution logger with buffered writes and rotation
//! ABOUTME: A flush ticker drains the buffer; only the highest index is live

use crate::message::{MessageType, StreamMessage};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;
use wf_core::{Error, Result};

struct Inner {
    buffer: Vec<u8>,
    file: File,
    file_index: u32,
    /// Bytes already flushed into the current file
    written_current: u64,
}

/// Per-execution logger. Appends serialise under one mutex, so lines within
/// a logger are totally ordered; the flusher copies them out in order.
pub struct ExecutionLogger {
    exec_id: Uuid,
    dir: PathBuf,
    max_size_bytes: u64,
    inner: Mutex<Inner>,
    /// Set first: new appends are rejected while the final flush runs
    close_started: AtomicBool,
    /// Set after the final flush: tailers seeing this can drain and stop
    closed: AtomicBool,
    /// Bumped on every flush and on close; tailers wait on this
    sync_tx: watch::Sender<u64>,
}

impl ExecutionLogger {
    /// Open a logger for an execution. A fresh execution starts at index 0;
    /// when archives already exist (a resumed execution after restart) the
    /// logger continues at the next index so lower indices stay immutable.
    pub fn open(dir: impl Into<PathBuf>, exec_id: Uuid, max_size_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        let file_index = next_index(&dir, exec_id)?;
        let path = log_file_path(&dir, exec_id, file_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Cannot open log file {:?}: {}", path, e)))?;

        debug!(exec_id = %exec_id, index = file_index, "Execution logger opened");

        let (sync_tx, _) = watch::channel(0u64);
        Ok(Self {
            exec_id,
            dir,
            max_size_bytes,
            inner: Mutex::new(Inner {
                buffer: Vec::new(),
                file,
                file_index,
                written_current: 0,
            }),
            close_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sync_tx,
        })
    }

    pub fn exec_id(&self) -> Uuid {
        self.exec_id
    }

    /// Index of the file currently being appended
    pub fn current_index(&self) -> u32 {
        self.inner.lock().unwrap().file_index
    }

    /// Non-blocking closed check
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to flush signals for tailing
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.sync_tx.subscribe()
    }

    /// Append one record to the buffer
    pub fn append(&self, message: &StreamMessage) -> Result<()> {
        if self.close_started.load(Ordering::SeqCst) {
            return Err(Error::Storage("logger closed".to_string()));
        }
        let line = message.to_line()?;
        self.inner.lock().unwrap().buffer.extend_from_slice(line.as_bytes());
        Ok(())
    }

    /// Drain the buffer to disk, rotating first when the current file is
    /// over size. Fsyncs so `stream_logs` sees everything up to this flush.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.written_current > self.max_size_bytes {
            let next = inner.file_index + 1;
            let path = log_file_path(&self.dir, self.exec_id, next);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| Error::Storage(format!("Cannot rotate to {:?}: {}", path, e)))?;
            debug!(exec_id = %self.exec_id, index = next, "Log file rotated");
            inner.file = file;
            inner.file_index = next;
            inner.written_current = 0;
        }

        if !inner.buffer.is_empty() {
            let buffer = std::mem::take(&mut inner.buffer);
            inner
                .file
                .write_all(&buffer)
                .map_err(|e| Error::Storage(format!("Log write failed: {}", e)))?;
            inner
                .file
                .sync_all()
                .map_err(|e| Error::Storage(format!("Log sync failed: {}", e)))?;
            inner.written_current += buffer.len() as u64;
        }
        drop(inner);

        self.sync_tx.send_modify(|n| *n += 1);
        Ok(())
    }

    /// Flush and close. Idempotent; later appends fail. The closed flag is
    /// only set after the final flush, so a tailer that observes it can
    /// drain to EOF and is guaranteed to have seen every line written
    /// before close() returned.
    pub fn close(&self) -> Result<()> {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.flush_on_close();
        self.closed.store(true, Ordering::SeqCst);
        // Always signal so tailers move to the drain phase.
        self.sync_tx.send_modify(|n| *n += 1);
        debug!(exec_id = %self.exec_id, "Execution logger closed");
        result
    }

    fn flush_on_close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.buffer.is_empty() {
            let buffer = std::mem::take(&mut inner.buffer);
            inner
                .file
                .write_all(&buffer)
                .map_err(|e| Error::Storage(format!("Final log write failed: {}", e)))?;
            inner.written_current += buffer.len() as u64;
        }
        inner
            .file
            .sync_all()
            .map_err(|e| Error::Storage(format!("Final log sync failed: {}", e)))
    }

    /// Spawn the background flush ticker for this logger
    pub fn start_flusher(self: &Arc<Self>, interval: std::time::Duration) {
        let logger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if logger.is_closed() {
                    return;
                }
                if let Err(e) = logger.flush() {
                    // Log trouble never propagates into the handler
                    warn!(exec_id = %logger.exec_id, error = %e, "Log flush failed");
                }
            }
        });
    }
}

/// Logger decorator pre-stamped with the action, node, and retry number.
/// Executors write raw output and checkpoints through this.
#[derive(Clone)]
pub struct ScopedLogger {
    logger: Arc<ExecutionLogger>,
    action_id: String,
    node_id: String,
    retry: u32,
}

impl ScopedLogger {
    pub fn new(
        logger: Arc<ExecutionLogger>,
        action_id: impl Into<String>,
        node_id: impl Into<String>,
        retry: u32,
    ) -> Self {
        Self {
            logger,
            action_id: action_id.into(),
            node_id: node_id.into(),
            retry,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Stream raw output bytes as a log record
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.checkpoint(MessageType::Log, bytes)
    }

    /// Emit a structured checkpoint record
    pub fn checkpoint(&self, message_type: MessageType, value: &[u8]) -> Result<()> {
        self.logger.append(&StreamMessage::new(
            self.action_id.clone(),
            self.node_id.clone(),
            self.retry,
            message_type,
            value.to_vec(),
        ))
    }
}

/// `<dir>/<exec_id>.<index>`
pub(crate) fn log_file_path(dir: &std::path::Path, exec_id: Uuid, index: u32) -> PathBuf {
    dir.join(format!("{}.{}", exec_id, index))
}

/// 0 for a fresh execution, max+1 when archives exist
fn next_index(dir: &std::path::Path, exec_id: Uuid) -> Result<u32> {
    let mut max_seen: Option<u32> = None;
    let prefix = format!("{}.", exec_id);
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Storage(format!("Cannot read log directory {:?}: {}", dir, e)))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(index) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u32>().ok()) {
            max_seen = Some(max_seen.map_or(index, |m| m.max(index)));
        }
    }
    Ok(max_seen.map_or(0, |m| m + 1))
}
