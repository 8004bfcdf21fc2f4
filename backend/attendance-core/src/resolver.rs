// src/resolver.rs
use chrono::{DateTime, Duration, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::debug;

use crate::model::{AttendanceStatus, DailyStatus, EventKind, Individual, RawEvent};

/// Thresholds that apply to one individual on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayThresholds {
    pub expected_start: NaiveTime,
    pub grace_minutes: u32,
    /// A first check-in at or after this time counts as no check-in at all.
    pub absence_cutoff: NaiveTime,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataQualityIssue {
    #[error("check-out at {at} has no matching check-in")]
    OrphanCheckOut { at: NaiveTime },

    #[error("check-in at {at} while the check-in from {open_since} is still open")]
    OverlappingCheckIn { at: NaiveTime, open_since: NaiveTime },

    #[error("event at {at} is dated {found}, expected {expected}")]
    WrongDate {
        at: NaiveTime,
        found: NaiveDate,
        expected: NaiveDate,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: DailyStatus,
    /// Present when the events could not be paired; the status is then `Unknown`.
    pub issue: Option<DataQualityIssue>,
}

/// Classifies one individual's day. Pure: the same inputs always give the same output.
pub fn resolve_day(
    individual: &Individual,
    date: NaiveDate,
    events: &[RawEvent],
    thresholds: &DayThresholds,
    excused: bool,
) -> Resolution {
    // On equal timestamps a check-out closes the previous entry before the next one opens.
    let mut order: Vec<usize> = (0..events.len()).collect();
    order.sort_by_key(|&i| (events[i].timestamp, events[i].kind == EventKind::In));

    let base = DailyStatus {
        individual_id: individual.id.clone(),
        individual_name: individual.name.clone(),
        date,
        status: AttendanceStatus::Unknown,
        minutes_late: None,
        first_check_in: None,
        source_events: order.clone(),
        detail: None,
        department: None,
    };

    let first_in = match first_check_in(date, events, &order) {
        Ok(first_in) => first_in,
        Err(issue) => {
            debug!(
                "Unresolvable events for {} on {}: {}",
                individual.id, date, issue
            );
            return Resolution {
                status: DailyStatus {
                    detail: Some(issue.to_string()),
                    ..base
                },
                issue: Some(issue),
            };
        }
    };

    let arrived = first_in
        .map(|i| events[i].timestamp.time())
        .filter(|time| *time < thresholds.absence_cutoff);

    let Some(arrival) = arrived else {
        let status = if excused {
            AttendanceStatus::Excused
        } else {
            AttendanceStatus::Absent
        };
        let detail = first_in.map(|i| {
            format!(
                "first check-in at {} is after the {} cutoff",
                events[i].timestamp.format("%H:%M"),
                thresholds.absence_cutoff.format("%H:%M")
            )
        });
        return Resolution {
            status: DailyStatus {
                status,
                first_check_in: first_in.map(|i| events[i].timestamp.time()),
                detail,
                ..base
            },
            issue: None,
        };
    };

    let late_by = arrival.signed_duration_since(thresholds.expected_start);
    let grace = Duration::minutes(i64::from(thresholds.grace_minutes));
    let status = if late_by > grace {
        DailyStatus {
            status: AttendanceStatus::Late,
            minutes_late: Some(late_by.num_minutes().max(0) as u32),
            first_check_in: Some(arrival),
            ..base
        }
    } else {
        DailyStatus {
            status: AttendanceStatus::Present,
            first_check_in: Some(arrival),
            ..base
        }
    };
    Resolution {
        status,
        issue: None,
    }
}

/// Pairs events in chronological order and returns the index of the first check-in.
fn first_check_in(
    date: NaiveDate,
    events: &[RawEvent],
    order: &[usize],
) -> Result<Option<usize>, DataQualityIssue> {
    let mut open: Option<DateTime<Tz>> = None;
    let mut first_in = None;

    for &i in order {
        let event = &events[i];
        if event.date() != date {
            return Err(DataQualityIssue::WrongDate {
                at: event.timestamp.time(),
                found: event.date(),
                expected: date,
            });
        }
        match (event.kind, open) {
            (EventKind::In, None) => {
                open = Some(event.timestamp);
                first_in.get_or_insert(i);
            }
            (EventKind::In, Some(since)) => {
                return Err(DataQualityIssue::OverlappingCheckIn {
                    at: event.timestamp.time(),
                    open_since: since.time(),
                });
            }
            (EventKind::Out, Some(_)) => open = None,
            (EventKind::Out, None) => {
                return Err(DataQualityIssue::OrphanCheckOut {
                    at: event.timestamp.time(),
                });
            }
        }
    }
    Ok(first_in)
}

/// Whether a day can be resolved yet. Past days always can; today only once the
/// individual has activity or the absence cutoff has passed, so nobody is marked
/// absent in the morning before they had a chance to check in.
pub fn is_settled(
    date: NaiveDate,
    events: &[RawEvent],
    thresholds: &DayThresholds,
    now: DateTime<Tz>,
) -> bool {
    let today = now.date_naive();
    if date < today {
        return true;
    }
    if date > today {
        return false;
    }
    !events.is_empty() || now.time() >= thresholds.absence_cutoff
}
