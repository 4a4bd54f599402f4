//! Structured event notifications for external observers.
//!
//! The node emits a [`LogEntry`] for every significant action (accounts
//! created or removed, money moved, server started or stopped). Entries go to
//! a Tokio `broadcast` channel, so emitting never waits for a consumer and
//! entries are simply dropped when nobody subscribes. Each entry is mirrored
//! to `tracing` as well.

use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        })
    }
}

/// One structured notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    /// Short tag such as `AC` or `SERVER`.
    pub event: String,
    pub message: String,
}

/// Cloneable handle used to emit and subscribe to [`LogEntry`] values.
#[derive(Debug, Clone)]
pub struct Events {
    sender: broadcast::Sender<LogEntry>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    pub fn new() -> Self {
        // Slow subscribers skip entries instead of holding up the bank.
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }

    pub fn info(&self, event: &str, message: impl Into<String>) {
        self.emit(Level::Info, event, message.into());
    }

    pub fn warn(&self, event: &str, message: impl Into<String>) {
        self.emit(Level::Warn, event, message.into());
    }

    pub fn error(&self, event: &str, message: impl Into<String>) {
        self.emit(Level::Error, event, message.into());
    }

    fn emit(&self, level: Level, event: &str, message: String) {
        match level {
            Level::Info => info!(event, "{message}"),
            Level::Warn => warn!(event, "{message}"),
            Level::Error => error!(event, "{message}"),
        }

        // An error only means there are no subscribers right now.
        let _ = self.sender.send(LogEntry {
            timestamp: Utc::now(),
            level,
            event: event.to_string(),
            message,
        });
    }
}

/// Appends every entry from `events` to `path` as one JSON object per line.
///
/// The task ends once every [`Events`] handle has been dropped.
pub fn spawn_jsonl_sink(events: &Events, path: PathBuf) -> JoinHandle<()> {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                warn!(error = ?err, path = %path.display(), "failed to create event log directory");
                return;
            }
        }

        let mut file = match OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) => {
                warn!(error = ?err, path = %path.display(), "failed to open event log");
                return;
            }
        };

        loop {
            let entry = match receiver.recv().await {
                Ok(entry) => entry,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log fell behind");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let mut line = match serde_json::to_vec(&entry) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = ?err, "failed to encode event");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(err) = file.write_all(&line).await {
                warn!(error = ?err, "failed to append event");
            }
        }

        let _ = file.flush().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_entries() {
        let events = Events::new();
        let mut rx = events.subscribe();

        events.info("AC", "Created account 10000/10.0.0.5");

        let entry = rx.recv().await.expect("entry");
        assert_eq!(entry.level, Level::Info);
        assert_eq!(entry.event, "AC");
        assert_eq!(entry.message, "Created account 10000/10.0.0.5");
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let events = Events::new();
        events.warn("SNAPSHOT", "nobody is listening");
        events.error("SERVER", "still nobody");
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("events.jsonl");

        let events = Events::new();
        let sink = spawn_jsonl_sink(&events, path.clone());
        events.info("AD", "Deposited 5 to 10000");
        events.warn("AW", "Withdrawal rejected");
        drop(events);
        sink.await.expect("sink task");

        let contents = std::fs::read_to_string(&path).expect("read log");
        let entries: Vec<LogEntry> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "AD");
        assert_eq!(entries[1].level, Level::Warn);
    }
}
