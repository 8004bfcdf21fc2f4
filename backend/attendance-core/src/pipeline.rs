// src/pipeline.rs
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::AttendancePolicy;
use crate::error::{DeliveryError, PipelineError, SheetError, SourceError};
use crate::excusals::Excusals;
use crate::interfaces::{
    AttendanceSource, MessagingSink, NotificationLog, OutboundMessage, RowWriteOutcome, SheetStore,
};
use crate::model::{
    normalize_id, AttendanceStatus, DailyStatus, DateRange, Individual, NotificationKey, RawEvent, RowKey,
};
use crate::notifier::Notifier;
use crate::reconciler::{reconcile, ReconcileInput};
use crate::report::{build_digest, render_daily_report, render_digest, AttendanceDigest, DigestEntry};
use crate::resolver::{is_settled, resolve_day};
use crate::retry::{with_retry, RetryPolicy};
use crate::roster::{assign_departments, select_tracked, TrackingRules};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub policy: AttendancePolicy,
    pub tracking: TrackingRules,
    pub retry: RetryPolicy,
    pub mention_user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest {
    /// Only weekdays up to today are resolved.
    pub dates: DateRange,
    /// Post the consolidated report for the last date afterwards.
    pub daily_report: bool,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub resolved: usize,
    /// Individual-days skipped because today is not settled yet.
    pub deferred: usize,
    pub rows_written: usize,
    pub rows_unchanged: usize,
    pub notifications_sent: usize,
    /// Data quality issues; reported but they do not fail the run.
    pub warnings: Vec<PipelineError>,
    pub errors: Vec<PipelineError>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, err: PipelineError) {
        if err.counts_as_failure() {
            error!("{}", err);
            self.errors.push(err);
        } else {
            warn!("{}", err);
            self.warnings.push(err);
        }
    }
}

pub struct Pipeline {
    source: Arc<dyn AttendanceSource>,
    sheets: Arc<dyn SheetStore>,
    sink: Arc<dyn MessagingSink>,
    log: Arc<dyn NotificationLog>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
    excusals: Excusals,
    notifier: Notifier,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn AttendanceSource>,
        sheets: Arc<dyn SheetStore>,
        sink: Arc<dyn MessagingSink>,
        log: Arc<dyn NotificationLog>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
        excusals: Excusals,
    ) -> Self {
        let notifier = Notifier::new(
            sink.clone(),
            log.clone(),
            clock.clone(),
            settings.retry.clone(),
            settings.mention_user_id.clone(),
        );
        Self {
            source,
            sheets,
            sink,
            log,
            clock,
            settings,
            excusals,
            notifier,
        }
    }

    /// Adds direct email notifications alongside the Slack channel.
    pub fn with_email(mut self, sink: Arc<dyn MessagingSink>, hr_contact: Option<String>) -> Self {
        self.notifier = self.notifier.with_email(sink, hr_contact);
        self
    }

    async fn fetch(&self, range: &DateRange) -> Result<(Vec<Individual>, Vec<RawEvent>), SourceError> {
        let roster = self.source.fetch_roster().await?;
        let events = self.source.fetch_events(range).await?;
        Ok((roster, events))
    }

    /// Individuals tracked on `date`, by name.
    pub async fn tracked_roster(&self, date: NaiveDate) -> Result<Vec<Individual>, SourceError> {
        let (roster, events) = self.fetch(&DateRange::single(date)).await?;
        let mut tracked = select_tracked(&roster, &events, &self.settings.tracking);
        tracked.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(tracked)
    }

    /// One reconciliation pass over the requested dates.
    pub async fn run(&self, request: &RunRequest) -> RunSummary {
        let mut summary = RunSummary::default();
        let now = self.clock.now();
        let today = now.date_naive();

        let days: Vec<NaiveDate> = request.dates.weekdays().filter(|d| *d <= today).collect();
        let (Some(first), Some(last)) = (days.first().copied(), days.last().copied()) else {
            info!("No weekdays to process in {}", request.dates);
            return summary;
        };
        let range = DateRange { start: first, end: last };
        info!("Starting attendance run for {} ({} weekdays)", range, days.len());

        // --- Fetch ---
        let (roster, events) = match self.fetch(&range).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.alert_source_failure(&range, &e).await;
                summary.record(PipelineError::SourceUnavailable(e));
                return summary;
            }
        };
        let tracked = select_tracked(&roster, &events, &self.settings.tracking);
        info!(
            "Fetched {} events; tracking {} individuals",
            events.len(),
            tracked.len()
        );

        // --- Resolve ---
        let departments = assign_departments(&events, &self.settings.policy.departments);
        let mut by_day: HashMap<RowKey, Vec<RawEvent>> = HashMap::new();
        for event in events {
            by_day
                .entry(RowKey::new(&event.individual_id, event.date()))
                .or_default()
                .push(event);
        }

        let mut statuses: Vec<DailyStatus> = Vec::new();
        for day in &days {
            for individual in &tracked {
                let day_events = by_day
                    .get(&RowKey::new(&individual.id, *day))
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                let department = departments.get(&normalize_id(&individual.id)).cloned();
                let thresholds = self
                    .settings
                    .policy
                    .thresholds_for(&individual.id, department.as_deref());
                if !is_settled(*day, day_events, &thresholds, now) {
                    summary.deferred += 1;
                    continue;
                }
                let excused = self.excusals.is_excused(&individual.id, *day);
                let mut resolution = resolve_day(individual, *day, day_events, &thresholds, excused);
                resolution.status.department = department;
                if resolution.status.status == AttendanceStatus::Excused {
                    if let Some(reason) = self.excusals.reason(&individual.id, *day) {
                        resolution.status.detail = Some(reason.to_string());
                    }
                }
                if let Some(issue) = resolution.issue {
                    summary.record(PipelineError::DataQuality {
                        individual_id: individual.id.clone(),
                        date: *day,
                        issue,
                    });
                }
                statuses.push(resolution.status);
            }
        }
        summary.resolved = statuses.len();
        debug!(
            "Resolved {} statuses, deferred {}",
            summary.resolved, summary.deferred
        );

        // --- Reconcile ---
        let keys: Vec<RowKey> = statuses.iter().map(DailyStatus::key).collect();
        let snapshot = match self.sheets.read_rows(&keys).await {
            Ok(rows) => Some(rows),
            Err(e) => {
                summary.record(PipelineError::from_sheet(e));
                None
            }
        };
        let logged = match self.log.load().await {
            Ok(keys) => Some(keys),
            Err(e) => {
                summary.record(PipelineError::NotificationLog(e));
                None
            }
        };

        let empty_log: HashSet<NotificationKey> = HashSet::new();
        let channels = self.notifier.channels();
        let plan = reconcile(&ReconcileInput {
            statuses: &statuses,
            snapshot: snapshot.as_deref().unwrap_or(&[]),
            logged: logged.as_ref().unwrap_or(&empty_log),
            anomaly_kinds: &self.settings.policy.anomaly_kinds,
            channels: &channels,
            run_at: now.fixed_offset(),
        });
        summary.rows_unchanged = plan.unchanged;

        // --- Write ---
        if snapshot.is_none() {
            warn!("Skipping sheet writes: the current sheet state could not be read");
        } else if !plan.writes.is_empty() {
            match self.sheets.upsert_rows(&plan.writes).await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            RowWriteOutcome::Written(_) => summary.rows_written += 1,
                            RowWriteOutcome::Failed { key, reason } => {
                                summary.record(PipelineError::RowWriteFailed {
                                    key: key.to_string(),
                                    reason,
                                })
                            }
                        }
                    }
                }
                Err(e) => summary.record(PipelineError::from_sheet(e)),
            }
        }

        // --- Notify ---
        if logged.is_none() {
            warn!("Skipping notifications: the notification log could not be read");
        } else if !plan.notifications.is_empty() {
            let report = self.notifier.dispatch(&plan.notifications).await;
            summary.notifications_sent = report.sent.len();
            for failure in report.failures {
                summary.record(failure);
            }
        }

        // --- Daily report ---
        if request.daily_report {
            let cutoff_passed = last < today || now.time() >= self.settings.policy.absence_cutoff;
            let text = render_daily_report(
                last,
                &statuses,
                cutoff_passed,
                self.settings.mention_user_id.as_deref(),
            );
            if let Err(e) = self.send_with_retry(&OutboundMessage::new(text), "daily report").await {
                summary.record(PipelineError::DeliveryFailed {
                    key: format!("daily-report@{}", last),
                    source: e,
                });
            }
        }

        info!(
            "Run finished: {} resolved, {} deferred, {} rows written, {} unchanged, {} notified, {} warnings, {} errors",
            summary.resolved,
            summary.deferred,
            summary.rows_written,
            summary.rows_unchanged,
            summary.notifications_sent,
            summary.warnings.len(),
            summary.errors.len()
        );
        summary
    }

    async fn send_with_retry(&self, message: &OutboundMessage, operation: &str) -> Result<(), DeliveryError> {
        with_retry(&self.settings.retry, operation, || self.sink.send(message)).await
    }

    /// Best effort: the run fails either way.
    async fn alert_source_failure(&self, range: &DateRange, err: &SourceError) {
        let mention = self
            .settings
            .mention_user_id
            .as_deref()
            .map(|id| format!("<@{}> ", id))
            .unwrap_or_default();
        let text = format!(
            "{}:rotating_light: *Attendance check failed*: could not fetch WebWork data for {}: {}",
            mention, range, err
        );
        if let Err(e) = self.sink.send(&OutboundMessage::new(text)).await {
            warn!("Could not deliver source failure alert: {}", e);
        }
    }

    /// Aggregates the sheet over `range`.
    pub async fn digest(&self, range: &DateRange) -> Result<AttendanceDigest, SheetError> {
        let rows = self.sheets.read_between(range).await?;
        let entries: Vec<DigestEntry> = rows.iter().map(DigestEntry::from).collect();
        Ok(build_digest(*range, &entries))
    }

    pub fn render_digest(&self, digest: &AttendanceDigest) -> String {
        render_digest(digest, self.settings.mention_user_id.as_deref())
    }

    pub async fn send_digest(&self, digest: &AttendanceDigest) -> Result<(), DeliveryError> {
        let message = OutboundMessage::new(self.render_digest(digest));
        self.send_with_retry(&message, "attendance digest").await?;
        info!("Posted attendance digest for {}", digest.range);
        Ok(())
    }
}
