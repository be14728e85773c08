//! Event log tailer.
//!
//! The gateway writes newline-delimited JSON records to a log file. Two kinds
//! of free-text message inside those records describe tool activity:
//!
//! ```text
//! {"1": "embedded run tool start: runId=r1 tool=exec toolCallId=c1", ...}
//! {"0": "[tools] exec failed: exit status 2", ...}
//! ```
//!
//! [`LogTailer`] follows the file from a fixed [`TailCursor`], turns matching
//! lines into [`ToolEvent`]s and pushes them into a bounded channel. Every
//! other line is skipped. The tailer polls rather than watching for file
//! changes because the log is rotated externally.

use regex::Regex;
use serde_json::Value;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

static TOOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"embedded run tool (start|end): runId=(\S+) tool=(\S+) toolCallId=(\S+)")
        .expect("tool event pattern is valid")
});

static TOOL_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\[tools\]\s+(\S+)\s+failed:\s*(.*)").expect("tool failure pattern is valid")
});

/// A tool-activity fact extracted from the gateway log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolEvent {
    Start { tool: String, call_id: String },
    End { tool: String, call_id: String },
    /// Failure detail. The log line names the tool but not the call.
    Detail { tool: String, message: String },
}

impl ToolEvent {
    pub fn tool(&self) -> &str {
        match self {
            Self::Start { tool, .. } | Self::End { tool, .. } | Self::Detail { tool, .. } => tool,
        }
    }
}

/// Parse one raw log line. Anything unrecognised or malformed yields `None`.
pub fn parse_log_line(line: &str) -> Option<ToolEvent> {
    let line = line.trim();
    if line.is_empty() || (!line.contains("embedded run tool") && !line.contains("[tools]")) {
        return None;
    }

    let record: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            trace!(error = %e, "skipping malformed log record");
            return None;
        }
    };

    let field = |key: &str| record.get(key).and_then(Value::as_str).unwrap_or("");

    if let Some(caps) = TOOL_RE.captures(field("1")) {
        let tool = caps[3].to_string();
        let call_id = caps[4].to_string();
        return Some(match &caps[1] {
            "start" => ToolEvent::Start { tool, call_id },
            _ => ToolEvent::End { tool, call_id },
        });
    }

    if let Some(caps) = TOOL_FAILURE_RE.captures(field("0")) {
        return Some(ToolEvent::Detail {
            tool: caps[1].to_string(),
            message: caps[2].trim().to_string(),
        });
    }

    None
}

/// Most recent log file in `dir` named `<prefix>*.log`.
///
/// Log names embed a sortable date, so the lexicographically last one wins.
pub fn latest_log_file(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(prefix) && name.ends_with(".log"))
        })
        .filter(|path| path.is_file())
        .max()
}

/// Where a gateway keeps its logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSource {
    pub dir: PathBuf,
    pub prefix: String,
}

impl LogSource {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Start tailing the newest log from its current end.
    ///
    /// Returns `None` when there is no log to follow; tool annotation is then
    /// simply absent for the session.
    pub async fn start_tailer(
        &self,
        poll_interval: Duration,
        events: mpsc::Sender<ToolEvent>,
    ) -> Option<LogTailer> {
        let Some(path) = latest_log_file(&self.dir, &self.prefix) else {
            debug!(dir = %self.dir.display(), "no gateway log found, tool activity disabled");
            return None;
        };

        let cursor = match TailCursor::at_end_of(&path).await {
            Ok(cursor) => cursor,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "cannot stat gateway log");
                return None;
            }
        };

        Some(LogTailer::spawn(path, cursor, poll_interval, events))
    }
}

/// Byte offset at which one session starts reading the log.
///
/// Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TailCursor(u64);

impl TailCursor {
    pub fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Cursor positioned at the current end of `path`.
    pub async fn at_end_of(path: &Path) -> io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self(meta.len()))
    }

    pub fn offset(&self) -> u64 {
        self.0
    }

    fn advance(&mut self, bytes: usize) {
        self.0 = self.0.saturating_add(bytes as u64);
    }
}

/// Handle on a background log-tailing task.
///
/// [`LogTailer::shutdown`] signals the task and waits for it. Dropping the
/// handle without shutting down aborts the task, which closes the file.
pub struct LogTailer {
    path: PathBuf,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl LogTailer {
    pub fn spawn(
        path: PathBuf,
        cursor: TailCursor,
        poll_interval: Duration,
        events: mpsc::Sender<ToolEvent>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            match tail(&task_path, cursor, poll_interval, events, stop_rx).await {
                Ok(cursor) => {
                    debug!(path = %task_path.display(), offset = cursor.offset(), "log tailer stopped")
                }
                Err(e) => {
                    debug!(path = %task_path.display(), error = %e, "log tailer gave up")
                }
            }
        });

        Self {
            path,
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the task and wait until it has released the file.
    pub async fn shutdown(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop_tx.send(true);
            handle.abort();
        }
    }
}

async fn tail(
    path: &Path,
    mut cursor: TailCursor,
    poll_interval: Duration,
    events: mpsc::Sender<ToolEvent>,
    mut stop: watch::Receiver<bool>,
) -> io::Result<TailCursor> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(cursor.offset())).await?;

    let mut pending: Vec<u8> = Vec::new();

    loop {
        if *stop.borrow() {
            break;
        }

        let read = reader.read_until(b'\n', &mut pending).await?;
        if read == 0 {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(poll_interval) => continue,
            }
        }
        cursor.advance(read);

        // A writer may be mid-line; wait for the rest of it.
        if pending.last() != Some(&b'\n') {
            continue;
        }

        let line = String::from_utf8_lossy(&pending).into_owned();
        pending.clear();

        let Some(event) = parse_log_line(&line) else {
            continue;
        };
        trace!(?event, "tool event");

        tokio::select! {
            _ = stop.changed() => break,
            sent = events.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    Ok(cursor)
}
