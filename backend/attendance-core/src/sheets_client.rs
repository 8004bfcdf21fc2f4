// src/sheets_client.rs
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::SheetsConfig;
use crate::error::{ConfigError, SheetError};
use crate::interfaces::{RowWriteOutcome, SheetStore};
use crate::model::{AttendanceStatus, DateRange, RowKey, SheetRow};
use crate::retry::{with_retry, RetryPolicy};

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

pub const HEADER_ROW: [&str; 6] = [
    "Individual ID",
    "Name",
    "Date",
    "Status",
    "Minutes Late",
    "Last Updated",
];

// --- Credentials ---

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file_error = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        serde_json::from_str(raw.trim_start_matches('\u{feff}')).map_err(|e| file_error(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

enum Credentials {
    ServiceAccount(ServiceAccountKey),
    #[cfg(test)]
    Static(String),
}

// --- API Data Structures ---

#[derive(Debug, Deserialize, Default)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorPayload {
    error: GoogleErrorInfo,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorInfo {
    message: Option<String>,
}

// --- Row Mapping ---

fn cell_text(cell: Option<&Value>) -> String {
    match cell {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Key of a data row, even when the rest of it is unreadable.
fn parse_key(cells: &[Value]) -> Option<RowKey> {
    let id = cell_text(cells.first());
    if id.is_empty() || id == HEADER_ROW[0] {
        return None;
    }
    let date = NaiveDate::parse_from_str(&cell_text(cells.get(2)), "%Y-%m-%d").ok()?;
    Some(RowKey::new(&id, date))
}

/// Parses one sheet row. Returns `None` for header, blank or foreign rows.
pub fn parse_row(cells: &[Value]) -> Option<SheetRow> {
    let key = parse_key(cells)?;
    let status: AttendanceStatus = cell_text(cells.get(3)).parse().ok()?;
    let minutes_late = cell_text(cells.get(4)).parse::<u32>().ok();
    let last_updated = DateTime::parse_from_rfc3339(&cell_text(cells.get(5)))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH.fixed_offset());
    Some(SheetRow {
        individual_id: key.individual_id,
        name: cell_text(cells.get(1)),
        date: key.date,
        status,
        minutes_late,
        last_updated,
    })
}

pub fn row_values(row: &SheetRow) -> Vec<Value> {
    vec![
        json!(row.individual_id),
        json!(row.name),
        json!(row.date.format("%Y-%m-%d").to_string()),
        json!(row.status.as_str()),
        row.minutes_late.map_or_else(|| json!(""), |m| json!(m)),
        json!(row.last_updated.to_rfc3339()),
    ]
}

/// Snapshot of the sheet: parsed rows with their 1-based row numbers.
#[derive(Debug, Clone, Default)]
pub struct SheetSnapshot {
    pub rows: Vec<(usize, SheetRow)>,
    /// Rows with a valid key whose other cells could not be read, e.g. a hand-typed status.
    /// They are overwritten in place rather than duplicated.
    pub unreadable: Vec<(usize, RowKey)>,
    /// Number of non-empty lines returned, header included.
    pub used_rows: usize,
    pub has_header: bool,
}

impl SheetSnapshot {
    pub fn from_values(values: &[Vec<Value>]) -> Self {
        let mut rows = Vec::new();
        let mut unreadable = Vec::new();
        for (i, cells) in values.iter().enumerate() {
            match parse_row(cells) {
                Some(row) => rows.push((i + 1, row)),
                None if i == 0 => {}
                None => match parse_key(cells) {
                    Some(key) => {
                        warn!("Sheet row {} for {} has unreadable cells", i + 1, key);
                        unreadable.push((i + 1, key));
                    }
                    None if cells.iter().any(|c| !cell_text(Some(c)).is_empty()) => {
                        warn!("Ignoring unrecognized sheet row {}", i + 1)
                    }
                    None => {}
                },
            }
        }
        Self {
            rows,
            unreadable,
            used_rows: values.len(),
            has_header: values
                .first()
                .map(|cells| cell_text(cells.first()) == HEADER_ROW[0])
                .unwrap_or(false),
        }
    }

    /// First row number for every key.
    pub fn index(&self) -> HashMap<RowKey, usize> {
        let mut index: HashMap<RowKey, usize> = HashMap::new();
        let keyed = self
            .rows
            .iter()
            .map(|(number, row)| (*number, row.key()))
            .chain(self.unreadable.iter().cloned());
        for (number, key) in keyed {
            index
                .entry(key)
                .and_modify(|first| *first = (*first).min(number))
                .or_insert(number);
        }
        index
    }
}

/// Checks that the rows about to be written are where the last read left them.
pub fn detect_conflict(
    previous: &HashMap<RowKey, usize>,
    current: &HashMap<RowKey, usize>,
    rows: &[SheetRow],
) -> Result<(), String> {
    for row in rows {
        let key = row.key();
        match (previous.get(&key), current.get(&key)) {
            (Some(before), Some(now)) if before != now => {
                return Err(format!("row for {} moved from {} to {}", key, before, now));
            }
            (Some(before), None) => {
                return Err(format!("row for {} (line {}) disappeared", key, before));
            }
            (None, Some(now)) => {
                return Err(format!("row for {} was added at line {} by someone else", key, now));
            }
            _ => {}
        }
    }
    Ok(())
}

// --- Client ---

pub struct GoogleSheetsClient {
    config: SheetsConfig,
    credentials: Credentials,
    http_client: Client,
    retry: RetryPolicy,
    api_base: String,
    token: Mutex<Option<CachedToken>>,
    /// Row positions observed by the last read, used for conflict detection.
    last_index: Mutex<Option<HashMap<RowKey, usize>>>,
}

impl GoogleSheetsClient {
    pub fn new(config: SheetsConfig, key: ServiceAccountKey, retry: RetryPolicy) -> Result<Self, SheetError> {
        let http_client = Client::builder()
            .timeout(retry.attempt_timeout + Duration::from_secs(1))
            .build()?;
        Ok(Self {
            config,
            credentials: Credentials::ServiceAccount(key),
            http_client,
            retry,
            api_base: SHEETS_API_BASE.to_string(),
            token: Mutex::new(None),
            last_index: Mutex::new(None),
        })
    }

    #[cfg(test)]
    fn with_static_token(config: SheetsConfig, api_base: String, retry: RetryPolicy) -> Self {
        Self {
            config,
            credentials: Credentials::Static("test-token".to_string()),
            http_client: Client::new(),
            retry,
            api_base,
            token: Mutex::new(None),
            last_index: Mutex::new(None),
        }
    }

    // --- Authentication ---

    async fn access_token(&self) -> Result<String, SheetError> {
        let key = match &self.credentials {
            Credentials::ServiceAccount(key) => key,
            #[cfg(test)]
            Credentials::Static(token) => return Ok(token.clone()),
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.access_token.clone());
            }
        }

        let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: SHEETS_SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + 3600,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| SheetError::Auth(format!("invalid service account key: {}", e)))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| SheetError::Auth(format!("failed to sign assertion: {}", e)))?;

        let resp = self
            .http_client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("Token exchange failed: Status={}, Body='{}'", status, body);
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => SheetError::RateLimitExceeded,
                s if s.is_server_error() => SheetError::Api {
                    status: s.as_u16(),
                    message: body,
                },
                s => SheetError::Auth(format!("token endpoint returned {}", s)),
            });
        }
        let token: TokenResponse = resp.json().await?;
        debug!("Obtained Sheets access token valid for {}s", token.expires_in);

        *cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(token.access_token)
    }

    // --- Requests ---

    fn url(&self, segments: &[&str]) -> Result<Url, SheetError> {
        let mut url = Url::parse(&self.api_base).map_err(|e| SheetError::Api {
            status: 0,
            message: format!("invalid Sheets API base '{}': {}", self.api_base, e),
        })?;
        url.path_segments_mut()
            .map_err(|_| SheetError::Api {
                status: 0,
                message: format!("Sheets API base '{}' cannot have a path", self.api_base),
            })?
            .pop_if_empty()
            .push("spreadsheets")
            .push(&self.config.sheet_id)
            .extend(segments);
        Ok(url)
    }

    fn a1(&self, cells: &str) -> String {
        format!("'{}'!{}", self.config.tab.replace('\'', "''"), cells)
    }

    async fn send_and_deserialize<T: DeserializeOwned>(
        &self,
        request_builder: RequestBuilder,
        context_msg: &str,
    ) -> Result<T, SheetError> {
        let token = self.access_token().await?;
        let resp = request_builder
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        let status = resp.status();
        debug!("Received response for '{}': Status={}", context_msg, status);

        if status.is_success() {
            return Ok(resp.json::<T>().await?);
        }

        let error_body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
        error!(
            "Sheets API error for '{}': Status={}, Body='{}'",
            context_msg, status, error_body
        );
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SheetError::RateLimitExceeded);
        }
        let message = serde_json::from_str::<GoogleErrorPayload>(&error_body)
            .ok()
            .and_then(|p| p.error.message)
            .unwrap_or(error_body);
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(SheetError::Auth(message));
        }
        Err(SheetError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Reads the whole tab.
    pub async fn read_snapshot(&self) -> Result<SheetSnapshot, SheetError> {
        let url = self.url(&["values", &self.a1("A1:F")])?;
        let range: ValueRange = with_retry(&self.retry, "read sheet", || {
            self.send_and_deserialize(self.http_client.get(url.clone()), "read sheet")
        })
        .await?;
        let snapshot = SheetSnapshot::from_values(&range.values);
        debug!(
            "Read {} attendance rows from '{}'",
            snapshot.rows.len(),
            self.config.tab
        );
        *self.last_index.lock().await = Some(snapshot.index());
        Ok(snapshot)
    }

    async fn batch_update(&self, updates: &[(usize, &SheetRow)]) -> Result<(), SheetError> {
        let url = self.url(&["values:batchUpdate"])?;
        let data: Vec<Value> = updates
            .iter()
            .map(|(number, row)| {
                json!({
                    "range": self.a1(&format!("A{0}:F{0}", number)),
                    "values": [row_values(row)],
                })
            })
            .collect();
        let body = json!({ "valueInputOption": "RAW", "data": data });
        with_retry(&self.retry, "update sheet rows", || {
            self.send_and_deserialize::<Value>(
                self.http_client.post(url.clone()).json(&body),
                "update sheet rows",
            )
        })
        .await
        .map(|_| ())
    }

    async fn append(&self, rows: &[&SheetRow], with_header: bool) -> Result<(), SheetError> {
        let mut url = self.url(&["values", &format!("{}:append", self.a1("A1:F"))])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");

        let mut values: Vec<Vec<Value>> = Vec::with_capacity(rows.len() + 1);
        if with_header {
            values.push(HEADER_ROW.iter().map(|h| json!(h)).collect());
        }
        values.extend(rows.iter().map(|row| row_values(row)));
        let body = json!({ "values": values });

        with_retry(&self.retry, "append sheet rows", || {
            self.send_and_deserialize::<Value>(
                self.http_client.post(url.clone()).json(&body),
                "append sheet rows",
            )
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl SheetStore for GoogleSheetsClient {
    async fn read_rows(&self, keys: &[RowKey]) -> Result<Vec<SheetRow>, SheetError> {
        let wanted: HashSet<&RowKey> = keys.iter().collect();
        let snapshot = self.read_snapshot().await?;
        Ok(snapshot
            .rows
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| wanted.contains(&row.key()))
            .collect())
    }

    async fn read_between(&self, range: &DateRange) -> Result<Vec<SheetRow>, SheetError> {
        let snapshot = self.read_snapshot().await?;
        Ok(snapshot
            .rows
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| range.contains(row.date))
            .collect())
    }

    async fn upsert_rows(&self, rows: &[SheetRow]) -> Result<Vec<RowWriteOutcome>, SheetError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let previous = self.last_index.lock().await.clone();
        let snapshot = self.read_snapshot().await?;
        let current = snapshot.index();
        if let Some(previous) = previous {
            detect_conflict(&previous, &current, rows).map_err(SheetError::WriteConflict)?;
        }

        let mut updates: Vec<(usize, &SheetRow)> = Vec::new();
        let mut appends: Vec<&SheetRow> = Vec::new();
        for row in rows {
            match current.get(&row.key()) {
                Some(number) => updates.push((*number, row)),
                None => appends.push(row),
            }
        }

        let mut outcomes = Vec::with_capacity(rows.len());
        let mut record = |written: &[&SheetRow], result: &Result<(), SheetError>| {
            for row in written {
                outcomes.push(match result {
                    Ok(()) => RowWriteOutcome::Written(row.key()),
                    Err(e) => RowWriteOutcome::Failed {
                        key: row.key(),
                        reason: e.to_string(),
                    },
                });
            }
        };

        if !updates.is_empty() {
            let result = self.batch_update(&updates).await;
            let written: Vec<&SheetRow> = updates.iter().map(|(_, row)| *row).collect();
            record(&written, &result);
        }
        if !appends.is_empty() {
            let result = self.append(&appends, !snapshot.has_header && snapshot.used_rows == 0).await;
            record(&appends, &result);
        }

        // Appends shift nothing, but the positions of new rows are unknown until re-read.
        *self.last_index.lock().await = None;
        info!(
            "Sheet upsert: {} updated, {} appended",
            updates.len(),
            appends.len()
        );
        Ok(outcomes)
    }
}
