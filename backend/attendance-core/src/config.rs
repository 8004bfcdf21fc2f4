// src/config.rs
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::{normalize_id, AnomalyKind};
use crate::resolver::DayThresholds;
use crate::retry::RetryPolicy;
use crate::roster::{Department, TrackingRules};

//=============================================================================
// Raw environment
//=============================================================================

/// Environment variables as envy sees them. Lists are comma separated.
#[derive(Debug, Deserialize, Clone)]
pub struct RawConfig {
    // WebWork
    pub webwork_api_url: String,
    pub webwork_users_api_url: String,
    pub webwork_api_user: String,
    pub webwork_api_key: String,

    // Google Sheets
    pub google_service_account_file: PathBuf,
    pub google_sheet_id: String,
    #[serde(default = "default_sheet_tab")]
    pub google_sheet_tab: String,

    // Slack
    pub slack_bot_token: String,
    pub slack_channel_id: String,
    pub slack_mention_user_id: Option<String>,
    #[serde(default = "default_slack_api_url")]
    pub slack_api_url: String,

    // Attendance policy
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_start_time")]
    pub start_time: String,
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: u32,
    #[serde(default = "default_absence_cutoff")]
    pub absence_cutoff: String,
    #[serde(default)]
    pub custom_start_times: Vec<String>,
    #[serde(default = "default_anomaly_kinds")]
    pub anomaly_kinds: Vec<String>,
    /// `Name:Project A|Project B` entries, in priority order.
    #[serde(default)]
    pub departments: Vec<String>,
    /// `Name=HH:MM` entries.
    #[serde(default)]
    pub department_start_times: Vec<String>,

    // Tracking
    #[serde(default)]
    pub tracked_projects: Vec<String>,
    #[serde(default)]
    pub additional_emails: Vec<String>,
    #[serde(default)]
    pub excluded_emails: Vec<String>,
    pub excusals_file: Option<PathBuf>,

    // Email to individuals
    #[serde(default)]
    pub email_automation_enabled: bool,
    pub smtp_server: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub email_sender: Option<String>,
    pub hr_email: Option<String>,

    // Local state
    #[serde(default = "default_notification_log_path")]
    pub notification_log_path: PathBuf,

    // Retries
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_sheet_tab() -> String {
    "Attendance".to_string()
}
fn default_slack_api_url() -> String {
    "https://slack.com/api".to_string()
}
fn default_timezone() -> String {
    "America/New_York".to_string()
}
fn default_start_time() -> String {
    "09:00".to_string()
}
fn default_grace_minutes() -> u32 {
    5
}
fn default_absence_cutoff() -> String {
    "17:00".to_string()
}
fn default_anomaly_kinds() -> Vec<String> {
    AnomalyKind::ALL.iter().map(|k| k.as_str().to_string()).collect()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_notification_log_path() -> PathBuf {
    PathBuf::from("notification_log.csv")
}
fn default_retry_max_attempts() -> u32 {
    4
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    8000
}
fn default_request_timeout_secs() -> u64 {
    30
}

//=============================================================================
// Validated configuration
//=============================================================================

#[derive(Debug, Clone)]
pub struct WebWorkConfig {
    pub api_url: String,
    pub users_api_url: String,
    pub api_user: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub service_account_file: PathBuf,
    pub sheet_id: String,
    pub tab: String,
}

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub api_url: String,
    pub bot_token: String,
    pub channel_id: String,
    pub mention_user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub sender: String,
    /// Contact named in the message body for questions.
    pub hr_email: Option<String>,
}

/// Everything the resolver and reconciler need to classify a day.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendancePolicy {
    pub timezone: Tz,
    pub default_start: NaiveTime,
    pub grace_minutes: u32,
    pub absence_cutoff: NaiveTime,
    /// Per-individual expected start, keyed by normalized id.
    pub custom_start_times: HashMap<String, NaiveTime>,
    pub anomaly_kinds: BTreeSet<AnomalyKind>,
    pub departments: Vec<Department>,
}

impl AttendancePolicy {
    /// Start time precedence: the individual's own, then their department's, then the default.
    pub fn thresholds_for(&self, individual_id: &str, department: Option<&str>) -> DayThresholds {
        let department_start = department.and_then(|name| {
            self.departments
                .iter()
                .find(|d| d.name == name)
                .and_then(|d| d.start)
        });
        let expected_start = self
            .custom_start_times
            .get(individual_id)
            .copied()
            .or(department_start)
            .unwrap_or(self.default_start);
        DayThresholds {
            expected_start,
            grace_minutes: self.grace_minutes,
            absence_cutoff: self.absence_cutoff,
        }
    }
}

/// Immutable configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub webwork: WebWorkConfig,
    pub sheets: SheetsConfig,
    pub slack: SlackConfig,
    /// Set when email automation is enabled.
    pub email: Option<EmailConfig>,
    pub policy: AttendancePolicy,
    pub tracking: TrackingRules,
    pub excusals_file: Option<PathBuf>,
    pub notification_log_path: PathBuf,
    pub retry: RetryPolicy,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        dotenv::dotenv().ok();
        let raw = envy::from_env::<RawConfig>()?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let timezone: Tz = raw.timezone.trim().parse().map_err(|e| ConfigError::Invalid {
            var: "TIMEZONE",
            reason: format!("{}", e),
        })?;
        let default_start = parse_clock_time("START_TIME", &raw.start_time)?;
        let absence_cutoff = parse_clock_time("ABSENCE_CUTOFF", &raw.absence_cutoff)?;
        if absence_cutoff <= default_start {
            return Err(ConfigError::Invalid {
                var: "ABSENCE_CUTOFF",
                reason: format!(
                    "{} must be later than START_TIME {}",
                    raw.absence_cutoff, raw.start_time
                ),
            });
        }

        let custom_start_times = parse_custom_start_times(&raw.custom_start_times)?;
        let departments = parse_departments(&raw.departments, &raw.department_start_times)?;
        for department in &departments {
            if let Some(start) = department.start.filter(|start| *start >= absence_cutoff) {
                return Err(ConfigError::Invalid {
                    var: "DEPARTMENT_START_TIMES",
                    reason: format!(
                        "{} starts at {}, not before ABSENCE_CUTOFF {}",
                        department.name,
                        start.format("%H:%M"),
                        raw.absence_cutoff
                    ),
                });
            }
        }
        let email = if raw.email_automation_enabled {
            Some(EmailConfig {
                smtp_server: required_for_email("SMTP_SERVER", raw.smtp_server)?,
                smtp_port: raw.smtp_port,
                username: required_for_email("SMTP_USERNAME", raw.smtp_username)?,
                password: required_for_email("SMTP_PASSWORD", raw.smtp_password)?,
                sender: required_for_email("EMAIL_SENDER", raw.email_sender)?,
                hr_email: raw.hr_email.filter(|e| !e.trim().is_empty()),
            })
        } else {
            None
        };

        // Department projects are tracked too.
        let mut tracked_projects = raw.tracked_projects.clone();
        tracked_projects.extend(departments.iter().flat_map(|d| d.projects.iter().cloned()));

        let mut anomaly_kinds = BTreeSet::new();
        for kind in raw.anomaly_kinds.iter().filter(|k| !k.trim().is_empty()) {
            let kind = kind.parse::<AnomalyKind>().map_err(|reason| ConfigError::Invalid {
                var: "ANOMALY_KINDS",
                reason,
            })?;
            anomaly_kinds.insert(kind);
        }

        if raw.retry_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "RETRY_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        let retry = RetryPolicy {
            max_attempts: raw.retry_max_attempts,
            base_delay: Duration::from_millis(raw.retry_base_delay_ms),
            max_delay: Duration::from_millis(raw.retry_max_delay_ms.max(raw.retry_base_delay_ms)),
            attempt_timeout: Duration::from_secs(raw.request_timeout_secs.max(1)),
            ..RetryPolicy::default()
        };

        Ok(Self {
            webwork: WebWorkConfig {
                api_url: raw.webwork_api_url,
                users_api_url: raw.webwork_users_api_url,
                api_user: raw.webwork_api_user,
                api_key: raw.webwork_api_key,
            },
            sheets: SheetsConfig {
                service_account_file: raw.google_service_account_file,
                sheet_id: raw.google_sheet_id,
                tab: raw.google_sheet_tab,
            },
            slack: SlackConfig {
                api_url: raw.slack_api_url.trim_end_matches('/').to_string(),
                bot_token: raw.slack_bot_token,
                channel_id: raw.slack_channel_id,
                mention_user_id: raw.slack_mention_user_id.filter(|id| !id.trim().is_empty()),
            },
            email,
            policy: AttendancePolicy {
                timezone,
                default_start,
                grace_minutes: raw.grace_minutes,
                absence_cutoff,
                custom_start_times,
                anomaly_kinds,
                departments,
            },
            tracking: TrackingRules::new(
                &tracked_projects,
                &raw.additional_emails,
                &raw.excluded_emails,
            ),
            excusals_file: raw.excusals_file,
            notification_log_path: raw.notification_log_path,
            retry,
        })
    }
}

fn parse_clock_time(var: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| ConfigError::Invalid {
        var,
        reason: format!("'{}' is not HH:MM ({})", value, e),
    })
}

/// Parses `email=HH:MM` pairs.
fn parse_custom_start_times(entries: &[String]) -> Result<HashMap<String, NaiveTime>, ConfigError> {
    let mut starts = HashMap::new();
    for entry in entries.iter().filter(|e| !e.trim().is_empty()) {
        let (email, time) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
            var: "CUSTOM_START_TIMES",
            reason: format!("'{}' is not email=HH:MM", entry),
        })?;
        let time = parse_clock_time("CUSTOM_START_TIMES", time)?;
        starts.insert(normalize_id(email), time);
    }
    Ok(starts)
}

/// Parses `Name:Project A|Project B` departments and their `Name=HH:MM` start times.
fn parse_departments(entries: &[String], start_entries: &[String]) -> Result<Vec<Department>, ConfigError> {
    let mut departments: Vec<Department> = Vec::new();
    for entry in entries.iter().filter(|e| !e.trim().is_empty()) {
        let (name, projects) = entry.split_once(':').ok_or_else(|| ConfigError::Invalid {
            var: "DEPARTMENTS",
            reason: format!("'{}' is not Name:Project|Project", entry),
        })?;
        let projects: Vec<&str> = projects.split('|').collect();
        let department = Department::new(name, &projects, None);
        if department.name.is_empty() || department.projects.is_empty() {
            return Err(ConfigError::Invalid {
                var: "DEPARTMENTS",
                reason: format!("'{}' needs a name and at least one project", entry),
            });
        }
        if departments.iter().any(|d| d.name == department.name) {
            return Err(ConfigError::Invalid {
                var: "DEPARTMENTS",
                reason: format!("department '{}' is listed twice", department.name),
            });
        }
        departments.push(department);
    }

    for entry in start_entries.iter().filter(|e| !e.trim().is_empty()) {
        let (name, time) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
            var: "DEPARTMENT_START_TIMES",
            reason: format!("'{}' is not Name=HH:MM", entry),
        })?;
        let start = parse_clock_time("DEPARTMENT_START_TIMES", time)?;
        let department = departments
            .iter_mut()
            .find(|d| d.name == name.trim())
            .ok_or_else(|| ConfigError::Invalid {
                var: "DEPARTMENT_START_TIMES",
                reason: format!("'{}' is not a configured department", name.trim()),
            })?;
        department.start = Some(start);
    }
    Ok(departments)
}

fn required_for_email(var: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::Invalid {
            var,
            reason: "required when EMAIL_AUTOMATION_ENABLED is set".to_string(),
        })
}
