// src/notification_log.rs
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{io_context, LogError};
use crate::interfaces::NotificationLog;
use crate::model::{normalize_id, AnomalyKind, Channel, NotificationKey, NotificationRecord};

const HEADER: [&str; 5] = ["individual_id", "date", "kind", "channel", "sent_at"];

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    individual_id: String,
    date: String,
    kind: AnomalyKind,
    channel: Channel,
    sent_at: String,
}

impl LogEntry {
    fn into_key(self) -> Result<NotificationKey, LogError> {
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
            .map_err(|e| LogError::Malformed(format!("date '{}': {}", self.date, e)))?;
        DateTime::parse_from_rfc3339(&self.sent_at)
            .map_err(|e| LogError::Malformed(format!("sent_at '{}': {}", self.sent_at, e)))?;
        Ok(NotificationKey {
            individual_id: normalize_id(&self.individual_id),
            date,
            kind: self.kind,
            channel: self.channel,
        })
    }
}

/// Append-only CSV of dispatched notifications, one row per key.
///
/// A crash mid-append can leave a partial last line. Such a tail is skipped on load
/// and terminated before the next append; malformed rows elsewhere are errors.
pub struct CsvNotificationLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvNotificationLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl NotificationLog for CsvNotificationLog {
    async fn load(&self) -> Result<HashSet<NotificationKey>, LogError> {
        if !self.path.exists() {
            info!(
                "Notification log {} does not exist yet, starting empty",
                self.path.display()
            );
            return Ok(HashSet::new());
        }

        let contents = std::fs::read(&self.path)
            .map_err(|e| io_context(e, format!("reading {}", self.path.display())))?;
        let torn = !contents.is_empty() && !contents.ends_with(b"\n");

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(contents.as_slice());
        let entries: Vec<Result<LogEntry, csv::Error>> = reader.deserialize().collect();
        let last = entries.len().saturating_sub(1);

        let mut keys = HashSet::new();
        for (i, entry) in entries.into_iter().enumerate() {
            match entry.map_err(LogError::from).and_then(LogEntry::into_key) {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(e) if torn && i == last => {
                    warn!(
                        "Ignoring incomplete last entry of {}: {}",
                        self.path.display(),
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
        debug!(
            "Loaded {} notification keys from {}",
            keys.len(),
            self.path.display()
        );
        Ok(keys)
    }

    async fn append(&self, record: &NotificationRecord) -> Result<(), LogError> {
        let _guard = self.write_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_context(e, format!("opening {}", self.path.display())))?;
        let mut existing = Vec::new();
        file.read_to_end(&mut existing)
            .map_err(|e| io_context(e, format!("reading {}", self.path.display())))?;

        // Not even the header made it to disk: start over.
        let torn_header = !existing.is_empty() && !existing.contains(&b'\n');
        if torn_header {
            warn!("Notification log {} has a partial header, rewriting it", self.path.display());
            file.set_len(0)
                .map_err(|e| io_context(e, format!("truncating {}", self.path.display())))?;
        } else if !existing.is_empty() && !existing.ends_with(b"\n") {
            warn!(
                "Notification log {} ends in a partial line, terminating it",
                self.path.display()
            );
            file.write_all(b"\n")
                .map_err(|e| io_context(e, "terminating partial notification log line"))?;
        }
        let is_new = existing.is_empty() || torn_header;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(HEADER)?;
        }
        writer.serialize(LogEntry {
            individual_id: record.key.individual_id.clone(),
            date: record.key.date.format("%Y-%m-%d").to_string(),
            kind: record.key.kind,
            channel: record.key.channel,
            sent_at: record.sent_at.to_rfc3339(),
        })?;
        writer
            .flush()
            .map_err(|e| io_context(e, "flushing notification log"))?;
        let file = writer.into_inner().map_err(|e| {
            io_context(
                std::io::Error::new(e.error().kind(), e.error().to_string()),
                "flushing notification log",
            )
        })?;
        file.sync_all()
            .map_err(|e| io_context(e, "syncing notification log"))?;

        debug!("Recorded notification {}", record.key);
        Ok(())
    }
}
