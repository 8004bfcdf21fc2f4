// src/model.rs
use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type IndividualId = String;

/// Emails are the stable identifier WebWork gives us; compare them trimmed and lower-cased.
pub fn normalize_id(raw: &str) -> IndividualId {
    raw.trim().to_lowercase()
}

// --- Roster & Events ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Individual {
    pub id: IndividualId,
    pub name: String,
}

impl Individual {
    pub fn new(id: &str, name: &str) -> Self {
        let id = normalize_id(id);
        let name = if name.trim().is_empty() {
            id.clone()
        } else {
            name.trim().to_string()
        };
        Self { id, name }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub individual_id: IndividualId,
    pub timestamp: DateTime<Tz>,
    pub kind: EventKind,
    /// Project the underlying time entry was logged against, used for roster selection.
    pub project: Option<String>,
}

impl RawEvent {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

// --- Statuses ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Excused,
    Unknown,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Late => "Late",
            AttendanceStatus::Absent => "Absent",
            AttendanceStatus::Excused => "Excused",
            AttendanceStatus::Unknown => "Unknown",
        }
    }

    /// The anomaly this status represents, if any.
    pub fn anomaly_kind(&self) -> Option<AnomalyKind> {
        match self {
            AttendanceStatus::Late => Some(AnomalyKind::Late),
            AttendanceStatus::Absent => Some(AnomalyKind::Absent),
            AttendanceStatus::Unknown => Some(AnomalyKind::Unknown),
            AttendanceStatus::Present | AttendanceStatus::Excused => None,
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "absent" => Ok(AttendanceStatus::Absent),
            "excused" => Ok(AttendanceStatus::Excused),
            "unknown" => Ok(AttendanceStatus::Unknown),
            other => Err(format!("unrecognized attendance status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyKind {
    Late,
    Absent,
    Unknown,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 3] = [AnomalyKind::Late, AnomalyKind::Absent, AnomalyKind::Unknown];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Late => "late",
            AnomalyKind::Absent => "absent",
            AnomalyKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "late" => Ok(AnomalyKind::Late),
            "absent" => Ok(AnomalyKind::Absent),
            "unknown" => Ok(AnomalyKind::Unknown),
            other => Err(format!("unrecognized anomaly kind '{}'", other)),
        }
    }
}

/// Where an anomaly notification goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// The shared Slack channel.
    Slack,
    /// A direct email to the individual concerned.
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Slack => "slack",
            Channel::Email => "email",
        }
    }

    /// Data issues are for the people running the tracker, never for the individual.
    pub fn carries(&self, kind: AnomalyKind) -> bool {
        match self {
            Channel::Slack => true,
            Channel::Email => kind != AnomalyKind::Unknown,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved attendance for one individual on one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyStatus {
    pub individual_id: IndividualId,
    pub individual_name: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    /// Only set for `Late`.
    pub minutes_late: Option<u32>,
    pub first_check_in: Option<NaiveTime>,
    /// Indices into the event slice the status was resolved from, in chronological order.
    pub source_events: Vec<usize>,
    /// Human readable explanation for `Unknown`, `Excused` and absent-after-cutoff statuses.
    pub detail: Option<String>,
    /// Department the individual was assigned to for this run, if any.
    pub department: Option<String>,
}

impl DailyStatus {
    pub fn key(&self) -> RowKey {
        RowKey {
            individual_id: self.individual_id.clone(),
            date: self.date,
        }
    }
}

// --- Persisted State ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub individual_id: IndividualId,
    pub date: NaiveDate,
}

impl RowKey {
    pub fn new(individual_id: &str, date: NaiveDate) -> Self {
        Self {
            individual_id: normalize_id(individual_id),
            date,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.individual_id, self.date)
    }
}

/// A row of the attendance sheet, the durable snapshot of the last known truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    pub individual_id: IndividualId,
    pub name: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub minutes_late: Option<u32>,
    pub last_updated: DateTime<FixedOffset>,
}

impl SheetRow {
    pub fn key(&self) -> RowKey {
        RowKey {
            individual_id: self.individual_id.clone(),
            date: self.date,
        }
    }

    pub fn from_status(status: &DailyStatus, last_updated: DateTime<FixedOffset>) -> Self {
        Self {
            individual_id: status.individual_id.clone(),
            name: status.individual_name.clone(),
            date: status.date,
            status: status.status,
            minutes_late: status.minutes_late,
            last_updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationKey {
    pub individual_id: IndividualId,
    pub date: NaiveDate,
    pub kind: AnomalyKind,
    pub channel: Channel,
}

impl fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{} via {}",
            self.individual_id, self.date, self.kind, self.channel
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub key: NotificationKey,
    pub sent_at: DateTime<FixedOffset>,
}

// --- Date Ranges ---

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Inclusive range of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Monday of `date`'s ISO week through `date` itself.
    pub fn week_to_date(date: NaiveDate) -> Self {
        let offset = u64::from(date.weekday().num_days_from_monday());
        let monday = date.checked_sub_days(Days::new(offset)).unwrap_or(date);
        Self {
            start: monday,
            end: date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn weekdays(&self) -> impl Iterator<Item = NaiveDate> {
        self.days().filter(|d| is_weekday(*d))
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{} to {}", self.start, self.end)
        }
    }
}
