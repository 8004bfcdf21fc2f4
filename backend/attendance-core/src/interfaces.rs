// src/interfaces.rs
use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::{DeliveryError, LogError, SheetError, SourceError};
use crate::model::{DateRange, Individual, NotificationKey, NotificationRecord, RawEvent, RowKey, SheetRow};

//=============================================================================
// Attendance Source
//=============================================================================

#[async_trait]
pub trait AttendanceSource: Send + Sync {
    async fn fetch_roster(&self) -> Result<Vec<Individual>, SourceError>;

    /// Events for every individual with activity in `range`, both ends inclusive.
    async fn fetch_events(&self, range: &DateRange) -> Result<Vec<RawEvent>, SourceError>;
}

//=============================================================================
// Sheet Store
//=============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowWriteOutcome {
    Written(RowKey),
    Failed { key: RowKey, reason: String },
}

#[async_trait]
pub trait SheetStore: Send + Sync {
    /// Existing rows for the given keys. Keys without a row are simply missing from the result.
    async fn read_rows(&self, keys: &[RowKey]) -> Result<Vec<SheetRow>, SheetError>;

    /// Every row dated within `range`, for reporting.
    async fn read_between(&self, range: &DateRange) -> Result<Vec<SheetRow>, SheetError>;

    /// Inserts or replaces rows by key. Rows not named are left untouched.
    ///
    /// Returns `SheetError::WriteConflict` when the sheet changed underneath the writer.
    async fn upsert_rows(&self, rows: &[SheetRow]) -> Result<Vec<RowWriteOutcome>, SheetError>;
}

//=============================================================================
// Messaging
//=============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Slack mrkdwn for the channel, plain text for email.
    pub text: String,
    /// Direct recipient. Channel sinks ignore it; email sinks require it.
    pub recipient: Option<String>,
    pub subject: Option<String>,
}

impl OutboundMessage {
    /// A message for the shared channel.
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            recipient: None,
            subject: None,
        }
    }

    /// A message addressed to one person.
    pub fn direct<R, S, T>(recipient: R, subject: S, text: T) -> Self
    where
        R: Into<String>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            text: text.into(),
            recipient: Some(recipient.into()),
            subject: Some(subject.into()),
        }
    }
}

#[async_trait]
pub trait MessagingSink: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

//=============================================================================
// Notification Log
//=============================================================================

#[async_trait]
pub trait NotificationLog: Send + Sync {
    async fn load(&self) -> Result<HashSet<NotificationKey>, LogError>;

    /// Durably records a dispatched notification. Never called before the send succeeded.
    async fn append(&self, record: &NotificationRecord) -> Result<(), LogError>;
}
