// src/report.rs
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashSet};

use crate::model::{AttendanceStatus, DailyStatus, DateRange, IndividualId, RowKey, SheetRow};

// --- Digest Input ---

/// One individual-day, from either the sheet or a fresh resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestEntry {
    pub individual_id: IndividualId,
    pub name: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub minutes_late: Option<u32>,
}

impl From<&SheetRow> for DigestEntry {
    fn from(row: &SheetRow) -> Self {
        Self {
            individual_id: row.individual_id.clone(),
            name: row.name.clone(),
            date: row.date,
            status: row.status,
            minutes_late: row.minutes_late,
        }
    }
}

impl From<&DailyStatus> for DigestEntry {
    fn from(status: &DailyStatus) -> Self {
        Self {
            individual_id: status.individual_id.clone(),
            name: status.individual_name.clone(),
            date: status.date,
            status: status.status,
            minutes_late: status.minutes_late,
        }
    }
}

// --- Aggregation ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusTally {
    pub present: u32,
    pub late: u32,
    pub absent: u32,
    pub excused: u32,
    pub unknown: u32,
    pub late_minutes: u32,
}

impl StatusTally {
    pub fn record(&mut self, status: AttendanceStatus, minutes_late: Option<u32>) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Late => {
                self.late += 1;
                self.late_minutes += minutes_late.unwrap_or(0);
            }
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Excused => self.excused += 1,
            AttendanceStatus::Unknown => self.unknown += 1,
        }
    }

    pub fn days(&self) -> u32 {
        self.present + self.late + self.absent + self.excused + self.unknown
    }

    fn merge(&mut self, other: &StatusTally) {
        self.present += other.present;
        self.late += other.late;
        self.absent += other.absent;
        self.excused += other.excused;
        self.unknown += other.unknown;
        self.late_minutes += other.late_minutes;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndividualTally {
    pub individual_id: IndividualId,
    pub name: String,
    pub tally: StatusTally,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceDigest {
    pub range: DateRange,
    /// Sorted by name, then id.
    pub individuals: Vec<IndividualTally>,
    pub totals: StatusTally,
}

/// Aggregates entries inside `range` per individual. Entries outside the range are
/// ignored, and a repeated (individual, date) only counts once.
pub fn build_digest<'a, I>(range: DateRange, entries: I) -> AttendanceDigest
where
    I: IntoIterator<Item = &'a DigestEntry>,
{
    let mut seen: HashSet<RowKey> = HashSet::new();
    let mut by_id: BTreeMap<IndividualId, IndividualTally> = BTreeMap::new();

    for entry in entries {
        if !range.contains(entry.date) {
            continue;
        }
        if !seen.insert(RowKey::new(&entry.individual_id, entry.date)) {
            continue;
        }
        by_id
            .entry(entry.individual_id.clone())
            .or_insert_with(|| IndividualTally {
                individual_id: entry.individual_id.clone(),
                name: entry.name.clone(),
                tally: StatusTally::default(),
            })
            .tally
            .record(entry.status, entry.minutes_late);
    }

    let mut individuals: Vec<IndividualTally> = by_id.into_values().collect();
    individuals.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.individual_id.cmp(&b.individual_id))
    });

    let mut totals = StatusTally::default();
    for individual in &individuals {
        totals.merge(&individual.tally);
    }

    AttendanceDigest {
        range,
        individuals,
        totals,
    }
}

// --- Rendering ---

/// Left-aligned table inside a Slack code block.
pub fn ascii_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let pad = |cell: &str, width: usize| {
        let fill = width.saturating_sub(cell.chars().count());
        format!("{}{}", cell, " ".repeat(fill))
    };
    let line = |cells: Vec<&str>| {
        widths
            .iter()
            .enumerate()
            .map(|(i, w)| pad(cells.get(i).copied().unwrap_or(""), *w))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(line(headers.to_vec()));
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-|-"),
    );
    for row in rows {
        lines.push(line(row.iter().map(String::as_str).collect()));
    }
    format!("```\n{}\n```", lines.join("\n"))
}

fn mention_line(mention_user_id: Option<&str>, title: &str) -> String {
    match mention_user_id {
        Some(id) => format!("<@{}> {}", id, title),
        None => title.to_string(),
    }
}

pub fn render_digest(digest: &AttendanceDigest, mention_user_id: Option<&str>) -> String {
    let mut parts = vec![mention_line(
        mention_user_id,
        &format!("*Attendance Summary* ({})", digest.range),
    )];

    if digest.individuals.is_empty() {
        parts.push("No attendance recorded for this period.".to_string());
        return parts.join("\n");
    }

    let rows: Vec<Vec<String>> = digest
        .individuals
        .iter()
        .map(|i| {
            vec![
                i.name.clone(),
                i.individual_id.clone(),
                i.tally.present.to_string(),
                i.tally.late.to_string(),
                i.tally.absent.to_string(),
                i.tally.excused.to_string(),
                i.tally.unknown.to_string(),
                i.tally.late_minutes.to_string(),
            ]
        })
        .collect();
    parts.push(ascii_table(
        &["Name", "Email", "Present", "Late", "Absent", "Excused", "Unknown", "Min Late"],
        &rows,
    ));

    let t = &digest.totals;
    parts.push(format!(
        "Totals over {} individual-days: {} present, {} late ({} min), {} absent, {} excused, {} unknown.",
        t.days(),
        t.present,
        t.late,
        t.late_minutes,
        t.absent,
        t.excused,
        t.unknown
    ));
    parts.join("\n")
}

/// The consolidated per-day report. Absentees are only listed once absence is final.
/// When departments are known the sections repeat per department, with anyone
/// unassigned under "Other".
pub fn render_daily_report(
    date: NaiveDate,
    statuses: &[DailyStatus],
    include_absent: bool,
    mention_user_id: Option<&str>,
) -> String {
    let day: Vec<&DailyStatus> = statuses.iter().filter(|s| s.date == date).collect();

    let mut parts = vec![mention_line(
        mention_user_id,
        &format!("*Attendance Report* ({})\n", date.format("%a %Y-%m-%d")),
    )];

    if day.iter().all(|s| s.department.is_none()) {
        parts.extend(status_sections(&day, include_absent));
        return parts.join("\n");
    }

    let mut by_department: BTreeMap<&str, Vec<&DailyStatus>> = BTreeMap::new();
    let mut unassigned: Vec<&DailyStatus> = Vec::new();
    for status in day {
        match status.department.as_deref() {
            Some(name) => by_department.entry(name).or_default().push(status),
            None => unassigned.push(status),
        }
    }
    let mut groups: Vec<(&str, Vec<&DailyStatus>)> = by_department.into_iter().collect();
    if !unassigned.is_empty() {
        groups.push(("Other", unassigned));
    }

    for (i, (name, members)) in groups.iter().enumerate() {
        let spacer = if i == 0 { "" } else { "\n" };
        parts.push(format!("{}*=== {} ===*", spacer, name));
        parts.extend(status_sections(members, include_absent));
    }
    parts.join("\n")
}

fn status_sections(day: &[&DailyStatus], include_absent: bool) -> Vec<String> {
    let of = |wanted: AttendanceStatus| {
        let mut matching: Vec<&DailyStatus> = day.iter().copied().filter(|s| s.status == wanted).collect();
        matching.sort_by(|a, b| a.individual_name.cmp(&b.individual_name));
        matching
    };
    let arrival = |s: &DailyStatus| {
        s.first_check_in
            .map(|t| t.format("%I:%M %p").to_string())
            .unwrap_or_default()
    };
    let mut parts = Vec::new();

    parts.push("*On-time Arrivals*".to_string());
    let on_time = of(AttendanceStatus::Present);
    if on_time.is_empty() {
        parts.push("No on-time arrivals.".to_string());
    } else {
        let rows: Vec<Vec<String>> = on_time
            .iter()
            .map(|s| vec![s.individual_name.clone(), s.individual_id.clone(), arrival(s)])
            .collect();
        parts.push(ascii_table(&["Name", "Email", "Time"], &rows));
    }

    parts.push("\n*Late Arrivals*".to_string());
    let late = of(AttendanceStatus::Late);
    if late.is_empty() {
        parts.push("No late arrivals.".to_string());
    } else {
        let rows: Vec<Vec<String>> = late
            .iter()
            .map(|s| {
                vec![
                    s.individual_name.clone(),
                    s.individual_id.clone(),
                    arrival(s),
                    s.minutes_late.unwrap_or(0).to_string(),
                ]
            })
            .collect();
        parts.push(ascii_table(&["Name", "Email", "Time", "Min Late"], &rows));
    }

    if include_absent {
        parts.push("\n*Absent*".to_string());
        let absent = of(AttendanceStatus::Absent);
        if absent.is_empty() {
            parts.push("No absentees.".to_string());
        } else {
            let rows: Vec<Vec<String>> = absent
                .iter()
                .map(|s| vec![s.individual_name.clone(), s.individual_id.clone()])
                .collect();
            parts.push(ascii_table(&["Name", "Email"], &rows));
        }
    }

    let excused = of(AttendanceStatus::Excused);
    if !excused.is_empty() {
        parts.push("\n*Excused*".to_string());
        let rows: Vec<Vec<String>> = excused
            .iter()
            .map(|s| {
                vec![
                    s.individual_name.clone(),
                    s.individual_id.clone(),
                    s.detail.clone().unwrap_or_default(),
                ]
            })
            .collect();
        parts.push(ascii_table(&["Name", "Email", "Reason"], &rows));
    }

    let unknown = of(AttendanceStatus::Unknown);
    if !unknown.is_empty() {
        parts.push("\n*Data Issues*".to_string());
        let rows: Vec<Vec<String>> = unknown
            .iter()
            .map(|s| {
                vec![
                    s.individual_name.clone(),
                    s.individual_id.clone(),
                    s.detail.clone().unwrap_or_default(),
                ]
            })
            .collect();
        parts.push(ascii_table(&["Name", "Email", "Issue"], &rows));
    }

    parts
}
