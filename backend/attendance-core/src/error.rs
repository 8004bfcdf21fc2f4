// src/error.rs
use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

use crate::model::NotificationKey;
use crate::resolver::DataQualityIssue;
use crate::retry::Retryable;

// --- Attendance Source ---

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Attendance API rejected credentials (Status {0})")]
    Unauthorized(u16),

    #[error("Rate limit exceeded (Status 429)")]
    RateLimitExceeded,

    #[error("Attendance API error: Status={status}, Message='{message}'")]
    Api { status: u16, message: String },

    #[error("Attendance API did not answer within {0:?}")]
    Timeout(Duration),
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        match self {
            SourceError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SourceError::RateLimitExceeded | SourceError::Timeout(_) => true,
            SourceError::Api { status, .. } => *status >= 500,
            SourceError::Json(_) | SourceError::Unauthorized(_) => false,
        }
    }

    fn timed_out(after: Duration) -> Self {
        SourceError::Timeout(after)
    }
}

// --- Sheet Store ---

#[derive(Error, Debug)]
pub enum SheetError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sheets authentication failed: {0}")]
    Auth(String),

    #[error("Rate limit exceeded (Status 429)")]
    RateLimitExceeded,

    #[error("Sheets API error: Status={status}, Message='{message}'")]
    Api { status: u16, message: String },

    #[error("Sheet was modified concurrently: {0}")]
    WriteConflict(String),

    #[error("Sheets API did not answer within {0:?}")]
    Timeout(Duration),
}

impl Retryable for SheetError {
    fn is_retryable(&self) -> bool {
        match self {
            SheetError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SheetError::RateLimitExceeded | SheetError::Timeout(_) => true,
            SheetError::Api { status, .. } => *status >= 500,
            SheetError::Json(_) | SheetError::Auth(_) | SheetError::WriteConflict(_) => false,
        }
    }

    fn timed_out(after: Duration) -> Self {
        SheetError::Timeout(after)
    }
}

// --- Messaging Sink ---

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Rate limit exceeded (Status 429)")]
    RateLimitExceeded,

    #[error("Messaging API error: Status={status}, Message='{message}'")]
    Api { status: u16, message: String },

    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("SMTP delivery failed: {message}")]
    Smtp { message: String, transient: bool },

    #[error("Messaging API did not answer within {0:?}")]
    Timeout(Duration),
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            DeliveryError::RateLimitExceeded | DeliveryError::Timeout(_) => true,
            DeliveryError::Api { status, .. } => *status >= 500,
            // Slack reports throttling in the body as well as with a 429
            DeliveryError::Rejected(reason) => reason == "ratelimited",
            DeliveryError::Smtp { transient, .. } => *transient,
        }
    }

    fn timed_out(after: Duration) -> Self {
        DeliveryError::Timeout(after)
    }
}

// --- Local State ---

#[derive(Error, Debug)]
pub enum LogError {
    #[error("File I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Malformed notification log entry: {0}")]
    Malformed(String),
}

pub(crate) fn io_context<S: Into<String>>(source: std::io::Error, context: S) -> LogError {
    LogError::Io {
        source,
        context: context.into(),
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing or invalid environment variable: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("Could not read {path}: {reason}")]
    File { path: String, reason: String },
}

// --- Pipeline ---

/// Failures recorded against a run. Every variant increments the run error count
/// except `DataQuality`, which is reported as a warning.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Attendance source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),

    #[error("Data quality problem for {individual_id} on {date}: {issue}")]
    DataQuality {
        individual_id: String,
        date: NaiveDate,
        issue: DataQualityIssue,
    },

    #[error("Sheet write conflict: {0}")]
    SheetWriteConflict(String),

    #[error("Sheet store unavailable: {0}")]
    SheetUnavailable(#[source] SheetError),

    #[error("Sheet row {key} was not written: {reason}")]
    RowWriteFailed { key: String, reason: String },

    #[error("Delivery failed for {key}: {source}")]
    DeliveryFailed {
        key: String,
        #[source]
        source: DeliveryError,
    },

    #[error("Notification log error: {0}")]
    NotificationLog(#[source] LogError),
}

impl PipelineError {
    pub fn delivery(key: &NotificationKey, source: DeliveryError) -> Self {
        PipelineError::DeliveryFailed {
            key: key.to_string(),
            source,
        }
    }

    pub fn from_sheet(err: SheetError) -> Self {
        match err {
            SheetError::WriteConflict(detail) => PipelineError::SheetWriteConflict(detail),
            other => PipelineError::SheetUnavailable(other),
        }
    }

    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, PipelineError::DataQuality { .. })
    }
}
