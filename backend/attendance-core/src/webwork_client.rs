// src/webwork_client.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::WebWorkConfig;
use crate::error::SourceError;
use crate::interfaces::AttendanceSource;
use crate::model::{normalize_id, DateRange, EventKind, Individual, RawEvent};
use crate::retry::{with_retry, RetryPolicy};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

// --- API Data Structures ---

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimelineResponse {
    #[serde(default)]
    pub date_report: Vec<DateReport>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateReport {
    pub email: Option<String>,
    #[serde(default)]
    pub projects: Vec<ProjectReport>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectReport {
    pub project_name: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskReport>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    #[serde(default)]
    pub time_entries: Vec<TimeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub begin_datetime: Option<String>,
    /// Missing while the entry is still running.
    pub end_datetime: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebWorkUser {
    pub email: Option<String>,
    pub fullname: Option<String>,
}

// --- Conversion ---

fn parse_clock(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .ok()
}

fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&date.and_time(time)).earliest()
}

/// Flattens a timeline payload for `date` into check-in/out events.
///
/// Each time entry contributes an `In` at its begin time and, when it has finished on
/// the same day, an `Out` at its end time.
pub fn events_from_report(report: &TimelineResponse, date: NaiveDate, tz: Tz) -> Vec<RawEvent> {
    let mut events = Vec::new();
    for person in &report.date_report {
        let Some(email) = person.email.as_deref().filter(|e| !e.trim().is_empty()) else {
            continue;
        };
        let individual_id = normalize_id(email);

        for project in &person.projects {
            let entries = project.tasks.iter().flat_map(|t| t.time_entries.iter());
            for entry in entries {
                let Some(begin) = entry.begin_datetime.as_deref().and_then(parse_clock) else {
                    warn!("Skipping time entry for {} without a usable begin time", individual_id);
                    continue;
                };
                let Some(begin_at) = local_instant(tz, date, begin) else {
                    continue;
                };
                events.push(RawEvent {
                    individual_id: individual_id.clone(),
                    timestamp: begin_at,
                    kind: EventKind::In,
                    project: project.project_name.clone(),
                });

                let end = entry.end_datetime.as_deref().and_then(parse_clock);
                match end {
                    Some(end) if end > begin => {
                        if let Some(end_at) = local_instant(tz, date, end) {
                            events.push(RawEvent {
                                individual_id: individual_id.clone(),
                                timestamp: end_at,
                                kind: EventKind::Out,
                                project: project.project_name.clone(),
                            });
                        }
                    }
                    Some(_) => debug!(
                        "Time entry for {} starting {} ends after midnight",
                        individual_id, begin
                    ),
                    None => {}
                }
            }
        }
    }
    events
}

// --- Client ---

pub struct WebWorkClient {
    config: WebWorkConfig,
    http_client: Client,
    timezone: Tz,
    retry: RetryPolicy,
}

impl WebWorkClient {
    pub fn new(config: WebWorkConfig, timezone: Tz, retry: RetryPolicy) -> Result<Self, SourceError> {
        let http_client = Client::builder()
            .timeout(retry.attempt_timeout + Duration::from_secs(1))
            .build()?;
        Ok(Self {
            config,
            http_client,
            timezone,
            retry,
        })
    }

    fn auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.config.api_user, self.config.api_key);
        format!("Basic {}", STANDARD.encode(credentials))
    }

    fn get(&self, url: &str) -> RequestBuilder {
        self.http_client
            .get(url)
            .header(AUTHORIZATION, self.auth_header())
            .header(ACCEPT, "application/json")
    }

    async fn send_and_deserialize<T: DeserializeOwned>(
        &self,
        request_builder: RequestBuilder,
        context_msg: &str,
    ) -> Result<T, SourceError> {
        let resp = request_builder.send().await.map_err(|e| {
            error!("HTTP request failed for '{}': {}", context_msg, e);
            SourceError::Request(e)
        })?;
        let status = resp.status();
        debug!("Received response for '{}': Status={}", context_msg, status);

        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
            error!(
                "WebWork API error for '{}': Status={}, Body='{}'",
                context_msg, status, error_body
            );
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimitExceeded,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    SourceError::Unauthorized(status.as_u16())
                }
                _ => SourceError::Api {
                    status: status.as_u16(),
                    message: error_body,
                },
            });
        }

        let bytes = resp.bytes().await?;
        let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes[..]);
        serde_json::from_slice::<T>(body).map_err(|e| {
            error!("JSON deserialization failed for '{}': {}", context_msg, e);
            SourceError::Json(e)
        })
    }

    pub async fn fetch_timeline(&self, date: NaiveDate) -> Result<TimelineResponse, SourceError> {
        let day = date.format("%Y-%m-%d").to_string();
        let context_msg = format!("timeline {}", day);
        with_retry(&self.retry, &context_msg, || {
            let request = self
                .get(&self.config.api_url)
                .query(&[("start_date", day.as_str()), ("end_date", day.as_str())]);
            self.send_and_deserialize::<TimelineResponse>(request, &context_msg)
        })
        .await
    }
}

#[async_trait]
impl AttendanceSource for WebWorkClient {
    async fn fetch_roster(&self) -> Result<Vec<Individual>, SourceError> {
        let users: Vec<WebWorkUser> = with_retry(&self.retry, "users", || {
            self.send_and_deserialize(self.get(&self.config.users_api_url), "users")
        })
        .await?;

        let roster: Vec<Individual> = users
            .iter()
            .filter_map(|u| {
                let email = u.email.as_deref()?;
                (!email.trim().is_empty())
                    .then(|| Individual::new(email, u.fullname.as_deref().unwrap_or("")))
            })
            .collect();
        info!("Fetched {} WebWork users", roster.len());
        Ok(roster)
    }

    async fn fetch_events(&self, range: &DateRange) -> Result<Vec<RawEvent>, SourceError> {
        let mut events = Vec::new();
        for date in range.days() {
            let timeline = self.fetch_timeline(date).await?;
            let day_events = events_from_report(&timeline, date, self.timezone);
            debug!(
                "{} people and {} events on {}",
                timeline.date_report.len(),
                day_events.len(),
                date
            );
            events.extend(day_events);
        }
        info!("Fetched {} attendance events for {}", events.len(), range);
        Ok(events)
    }
}
