// src/excusals.rs
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::model::RowKey;

#[derive(Debug, Deserialize)]
struct ExcusalRecord {
    individual_id: String,
    date: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Approved absences, keyed by individual and date.
#[derive(Debug, Clone, Default)]
pub struct Excusals {
    entries: HashMap<RowKey, String>,
}

impl Excusals {
    /// Reads a CSV with an `individual_id,date,reason` header. Dates are `YYYY-MM-DD`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file_error = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| file_error(e.to_string()))?;

        let mut excusals = Self::default();
        for (line, record) in reader.deserialize::<ExcusalRecord>().enumerate() {
            let record = record.map_err(|e| file_error(e.to_string()))?;
            let date = NaiveDate::parse_from_str(&record.date, "%Y-%m-%d").map_err(|e| {
                file_error(format!("row {}: invalid date '{}' ({})", line + 2, record.date, e))
            })?;
            if record.individual_id.trim().is_empty() {
                warn!("Skipping excusal on row {} without an individual", line + 2);
                continue;
            }
            excusals.insert(&record.individual_id, date, record.reason.unwrap_or_default());
        }
        info!("Loaded {} excusals from {}", excusals.len(), path.display());
        Ok(excusals)
    }

    pub fn insert(&mut self, individual_id: &str, date: NaiveDate, reason: String) {
        self.entries.insert(RowKey::new(individual_id, date), reason);
    }

    pub fn is_excused(&self, individual_id: &str, date: NaiveDate) -> bool {
        self.entries
            .contains_key(&RowKey::new(individual_id, date))
    }

    pub fn reason(&self, individual_id: &str, date: NaiveDate) -> Option<&str> {
        self.entries
            .get(&RowKey::new(individual_id, date))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
