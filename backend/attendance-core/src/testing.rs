// src/testing.rs
//! In-memory fakes for the pipeline's external capabilities.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{DeliveryError, LogError, SheetError, SourceError};
use crate::interfaces::{
    AttendanceSource, MessagingSink, NotificationLog, OutboundMessage, RowWriteOutcome, SheetStore,
};
use crate::model::{DateRange, Individual, NotificationKey, NotificationRecord, RawEvent, RowKey, SheetRow};

// --- Attendance Source ---

#[derive(Clone, Default)]
pub struct StaticAttendanceSource {
    roster: Vec<Individual>,
    events: Arc<Mutex<Vec<RawEvent>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl StaticAttendanceSource {
    pub fn new(roster: Vec<Individual>, events: Vec<RawEvent>) -> Self {
        Self {
            roster,
            events: Arc::new(Mutex::new(events)),
            unavailable: Arc::new(Mutex::new(false)),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    pub fn push_event(&self, event: RawEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn check(&self) -> Result<(), SourceError> {
        if *self.unavailable.lock().unwrap() {
            return Err(SourceError::Api {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AttendanceSource for StaticAttendanceSource {
    async fn fetch_roster(&self) -> Result<Vec<Individual>, SourceError> {
        self.check()?;
        Ok(self.roster.clone())
    }

    async fn fetch_events(&self, range: &DateRange) -> Result<Vec<RawEvent>, SourceError> {
        self.check()?;
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| range.contains(e.date()))
            .cloned()
            .collect())
    }
}

// --- Sheet Store ---

#[derive(Clone, Default)]
pub struct InMemorySheetStore {
    rows: Arc<Mutex<BTreeMap<RowKey, SheetRow>>>,
    fail_reads: Arc<Mutex<bool>>,
    write_conflict: Arc<Mutex<bool>>,
    failing_rows: Arc<Mutex<HashSet<RowKey>>>,
    upserts: Arc<AtomicU32>,
}

impl InMemorySheetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, row: SheetRow) {
        self.rows.lock().unwrap().insert(row.key(), row);
    }

    pub fn rows(&self) -> Vec<SheetRow> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    pub fn row(&self, key: &RowKey) -> Option<SheetRow> {
        self.rows.lock().unwrap().get(key).cloned()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        *self.fail_reads.lock().unwrap() = fail;
    }

    /// Rejects every upsert as if the sheet layout changed underneath it.
    pub fn set_write_conflict(&self, conflict: bool) {
        *self.write_conflict.lock().unwrap() = conflict;
    }

    /// Reports this row as failed on upsert and leaves it unwritten.
    pub fn fail_row(&self, key: RowKey) {
        self.failing_rows.lock().unwrap().insert(key);
    }

    /// Rows written across all upsert calls.
    pub fn upsert_count(&self) -> u32 {
        self.upserts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), SheetError> {
        if *self.fail_reads.lock().unwrap() {
            return Err(SheetError::Api {
                status: 500,
                message: "sheet unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SheetStore for InMemorySheetStore {
    async fn read_rows(&self, keys: &[RowKey]) -> Result<Vec<SheetRow>, SheetError> {
        self.check()?;
        let rows = self.rows.lock().unwrap();
        Ok(keys.iter().filter_map(|k| rows.get(k).cloned()).collect())
    }

    async fn read_between(&self, range: &DateRange) -> Result<Vec<SheetRow>, SheetError> {
        self.check()?;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| range.contains(r.date))
            .cloned()
            .collect())
    }

    async fn upsert_rows(&self, rows: &[SheetRow]) -> Result<Vec<RowWriteOutcome>, SheetError> {
        if *self.write_conflict.lock().unwrap() {
            return Err(SheetError::WriteConflict(
                "header row does not match the expected layout".to_string(),
            ));
        }
        let failing = self.failing_rows.lock().unwrap();
        let mut stored = self.rows.lock().unwrap();
        let outcomes = rows
            .iter()
            .map(|row| {
                if failing.contains(&row.key()) {
                    return RowWriteOutcome::Failed {
                        key: row.key(),
                        reason: "protected range".to_string(),
                    };
                }
                stored.insert(row.key(), row.clone());
                self.upserts.fetch_add(1, Ordering::SeqCst);
                RowWriteOutcome::Written(row.key())
            })
            .collect();
        Ok(outcomes)
    }
}

// --- Messaging ---

type ErrorFactory = Box<dyn Fn() -> DeliveryError + Send + Sync>;

/// Records every message it accepts; can be told to fail the next N attempts.
pub struct RecordingSink {
    sent: Mutex<Vec<OutboundMessage>>,
    attempts: AtomicU32,
    failures_remaining: AtomicU32,
    make_error: ErrorFactory,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::failing(0, || DeliveryError::Rejected("unused".to_string()))
    }

    pub fn failing<F>(failures: u32, make_error: F) -> Self
    where
        F: Fn() -> DeliveryError + Send + Sync + 'static,
    {
        Self {
            sent: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(failures),
            make_error: Box::new(make_error),
        }
    }

    pub fn fail_next(&self, failures: u32) {
        self.failures_remaining.store(failures, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
        self.attempts.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessagingSink for RecordingSink {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err((self.make_error)());
        }
        debug!("Mock message sent: {}", message.text);
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

// --- Notification Log ---

#[derive(Default)]
pub struct InMemoryNotificationLog {
    records: Mutex<Vec<NotificationRecord>>,
    fail_loads: Mutex<bool>,
    fail_appends: Mutex<bool>,
}

impl InMemoryNotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn set_fail_loads(&self, fail: bool) {
        *self.fail_loads.lock().unwrap() = fail;
    }

    pub fn set_fail_appends(&self, fail: bool) {
        *self.fail_appends.lock().unwrap() = fail;
    }
}

#[async_trait]
impl NotificationLog for InMemoryNotificationLog {
    async fn load(&self) -> Result<HashSet<NotificationKey>, LogError> {
        if *self.fail_loads.lock().unwrap() {
            return Err(LogError::Malformed("log unreadable".to_string()));
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.key.clone())
            .collect())
    }

    async fn append(&self, record: &NotificationRecord) -> Result<(), LogError> {
        if *self.fail_appends.lock().unwrap() {
            return Err(LogError::Io {
                context: "appending to notification log".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
