// src/pipeline_tests.rs

#[cfg(test)]
mod tests {
    use crate::clock::TestClock;
    use crate::config::AttendancePolicy;
    use crate::error::{DeliveryError, PipelineError};
    use crate::excusals::Excusals;
    use crate::model::*;
    use crate::pipeline::*;
    use crate::retry::RetryPolicy;
    use crate::roster::{Department, TrackingRules};
    use crate::testing::*;
    use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone};
    use chrono_tz::America::New_York;
    use chrono_tz::Tz;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    // --- Fixtures ---

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at(day: &str, hh_mm: &str) -> DateTime<Tz> {
        let time = NaiveTime::parse_from_str(hh_mm, "%H:%M").unwrap();
        New_York
            .from_local_datetime(&date(day).and_time(time))
            .earliest()
            .unwrap()
    }

    fn event(id: &str, day: &str, hh_mm: &str, kind: EventKind) -> RawEvent {
        RawEvent {
            individual_id: id.to_string(),
            timestamp: at(day, hh_mm),
            kind,
            project: Some("HR".to_string()),
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            policy: AttendancePolicy {
                timezone: New_York,
                default_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                grace_minutes: 10,
                absence_cutoff: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                custom_start_times: HashMap::new(),
                anomaly_kinds: AnomalyKind::ALL.into_iter().collect(),
                departments: Vec::new(),
            },
            tracking: TrackingRules::default(),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                backoff_factor: 2,
                max_delay: Duration::from_millis(20),
                attempt_timeout: Duration::from_secs(5),
            },
            mention_user_id: None,
        }
    }

    struct Harness {
        source: StaticAttendanceSource,
        sheets: InMemorySheetStore,
        sink: Arc<RecordingSink>,
        log: Arc<InMemoryNotificationLog>,
        clock: TestClock,
        pipeline: Pipeline,
    }

    /// A present on 2024-03-01 at 09:05, B with no events at all.
    fn harness_with(events: Vec<RawEvent>, excusals: Excusals, now: DateTime<Tz>) -> Harness {
        harness_with_settings(events, excusals, now, settings())
    }

    fn harness_with_settings(
        events: Vec<RawEvent>,
        excusals: Excusals,
        now: DateTime<Tz>,
        settings: PipelineSettings,
    ) -> Harness {
        let roster = vec![
            Individual::new("a@example.com", "Alice"),
            Individual::new("b@example.com", "Bob"),
        ];
        let source = StaticAttendanceSource::new(roster, events);
        let sheets = InMemorySheetStore::new();
        let sink = Arc::new(RecordingSink::failing(0, || DeliveryError::RateLimitExceeded));
        let log = Arc::new(InMemoryNotificationLog::new());
        let clock = TestClock::new(now);
        let pipeline = Pipeline::new(
            Arc::new(source.clone()),
            Arc::new(sheets.clone()),
            sink.clone(),
            log.clone(),
            Arc::new(clock.clone()),
            settings,
            excusals,
        );
        Harness {
            source,
            sheets,
            sink,
            log,
            clock,
            pipeline,
        }
    }

    fn harness() -> Harness {
        harness_with(
            vec![
                event("a@example.com", "2024-03-01", "09:05", EventKind::In),
                event("a@example.com", "2024-03-01", "17:30", EventKind::Out),
            ],
            Excusals::default(),
            at("2024-03-01", "18:00"),
        )
    }

    fn request(day: &str) -> RunRequest {
        RunRequest {
            dates: DateRange::single(date(day)),
            daily_report: false,
        }
    }

    // --- Scenarios ---

    #[tokio::test(start_paused = true)]
    async fn absent_individual_is_notified_exactly_once() {
        let h = harness();

        let first = h.pipeline.run(&request("2024-03-01")).await;
        assert!(first.is_success(), "errors: {:?}", first.errors);
        assert_eq!(first.resolved, 2);
        assert_eq!(first.rows_written, 2);
        assert_eq!(first.notifications_sent, 1);
        let sent = h.sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("*Absent*"));
        assert!(sent[0].text.contains("b@example.com"));

        let alice = h
            .sheets
            .row(&RowKey::new("a@example.com", date("2024-03-01")))
            .unwrap();
        assert_eq!(alice.status, AttendanceStatus::Present);
        let bob = h
            .sheets
            .row(&RowKey::new("b@example.com", date("2024-03-01")))
            .unwrap();
        assert_eq!(bob.status, AttendanceStatus::Absent);

        h.sink.clear();
        let second = h.pipeline.run(&request("2024-03-01")).await;
        assert!(second.is_success());
        assert_eq!(second.rows_written, 0);
        assert_eq!(second.rows_unchanged, 2);
        assert_eq!(second.notifications_sent, 0);
        assert!(h.sink.sent().is_empty());
        assert_eq!(h.log.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_arrival_records_minutes_late() {
        let h = harness_with(
            vec![event("a@example.com", "2024-03-01", "09:15", EventKind::In)],
            Excusals::default(),
            at("2024-03-01", "18:00"),
        );
        h.pipeline.run(&request("2024-03-01")).await;

        let alice = h
            .sheets
            .row(&RowKey::new("a@example.com", date("2024-03-01")))
            .unwrap();
        assert_eq!(alice.status, AttendanceStatus::Late);
        assert_eq!(alice.minutes_late, Some(15));
        assert!(h
            .sink
            .sent()
            .iter()
            .any(|m| m.text.contains("*Late arrival*") && m.text.contains("15 minutes")));
    }

    #[tokio::test(start_paused = true)]
    async fn today_is_deferred_until_the_cutoff() {
        let h = harness_with(
            vec![event("a@example.com", "2024-03-04", "09:05", EventKind::In)],
            Excusals::default(),
            at("2024-03-04", "10:00"),
        );

        let morning = h.pipeline.run(&request("2024-03-04")).await;
        assert_eq!(morning.resolved, 1);
        assert_eq!(morning.deferred, 1);
        assert!(h.sink.sent().is_empty());

        h.clock.advance(chrono::Duration::minutes(7 * 60 + 5));
        let evening = h.pipeline.run(&request("2024-03-04")).await;
        assert_eq!(evening.deferred, 0);
        assert_eq!(evening.notifications_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sheet_failure_does_not_block_notifications() {
        let h = harness();
        h.sheets.set_fail_reads(true);

        let summary = h.pipeline.run(&request("2024-03-01")).await;
        assert!(!summary.is_success());
        assert!(matches!(summary.errors[0], PipelineError::SheetUnavailable(_)));
        assert_eq!(summary.rows_written, 0);
        assert_eq!(h.sheets.upsert_count(), 0);
        assert_eq!(summary.notifications_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn log_failure_skips_notifications_but_writes_rows() {
        let h = harness();
        h.log.set_fail_loads(true);

        let summary = h.pipeline.run(&request("2024-03-01")).await;
        assert!(!summary.is_success());
        assert_eq!(summary.rows_written, 2);
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_is_retried_on_the_next_run() {
        let h = harness();
        h.sink.fail_next(10);

        let first = h.pipeline.run(&request("2024-03-01")).await;
        assert_eq!(first.notifications_sent, 0);
        assert_eq!(first.errors.len(), 1);
        assert!(matches!(first.errors[0], PipelineError::DeliveryFailed { .. }));
        assert!(h.log.records().is_empty());
        assert_eq!(first.rows_written, 2);

        h.sink.fail_next(0);
        let second = h.pipeline.run(&request("2024-03-01")).await;
        assert!(second.is_success());
        assert_eq!(second.notifications_sent, 1);
        assert_eq!(h.sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn source_outage_alerts_and_fails_the_run() {
        let h = harness();
        h.source.set_unavailable(true);

        let summary = h.pipeline.run(&request("2024-03-01")).await;
        assert!(!summary.is_success());
        assert!(matches!(summary.errors[0], PipelineError::SourceUnavailable(_)));
        assert!(h.sheets.rows().is_empty());
        let sent = h.sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("Attendance check failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_events_are_warnings_with_an_unknown_status() {
        let h = harness_with(
            vec![event("a@example.com", "2024-03-01", "09:00", EventKind::Out)],
            Excusals::default(),
            at("2024-03-01", "18:00"),
        );

        let summary = h.pipeline.run(&request("2024-03-01")).await;
        assert!(summary.is_success());
        assert_eq!(summary.warnings.len(), 1);
        let alice = h
            .sheets
            .row(&RowKey::new("a@example.com", date("2024-03-01")))
            .unwrap();
        assert_eq!(alice.status, AttendanceStatus::Unknown);
        assert!(h
            .sink
            .sent()
            .iter()
            .any(|m| m.text.contains("Attendance data issue")));
    }

    #[tokio::test(start_paused = true)]
    async fn excused_absence_is_not_notified() {
        let mut excusals = Excusals::default();
        excusals.insert("b@example.com", date("2024-03-01"), "Vacation".to_string());
        let h = harness_with(
            vec![event("a@example.com", "2024-03-01", "09:05", EventKind::In)],
            excusals,
            at("2024-03-01", "18:00"),
        );

        let summary = h.pipeline.run(&request("2024-03-01")).await;
        assert_eq!(summary.notifications_sent, 0);
        let bob = h
            .sheets
            .row(&RowKey::new("b@example.com", date("2024-03-01")))
            .unwrap();
        assert_eq!(bob.status, AttendanceStatus::Excused);
    }

    #[tokio::test(start_paused = true)]
    async fn weekends_and_future_days_are_skipped() {
        let h = harness_with(Vec::new(), Excusals::default(), at("2024-03-04", "18:00"));
        let range = DateRange::new(date("2024-03-02"), date("2024-03-05")).unwrap();

        let summary = h
            .pipeline
            .run(&RunRequest {
                dates: range,
                daily_report: false,
            })
            .await;
        // Only Monday 2024-03-04 is a past-or-present weekday
        assert_eq!(summary.resolved, 2);
        assert!(h.sheets.rows().iter().all(|r| r.date == date("2024-03-04")));
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_covers_the_week_without_renotifying() {
        let h = harness_with(Vec::new(), Excusals::default(), at("2024-03-01", "18:00"));
        let week = RunRequest {
            dates: DateRange::week_to_date(date("2024-03-01")),
            daily_report: false,
        };

        let first = h.pipeline.run(&week).await;
        assert_eq!(first.resolved, 10);
        assert_eq!(first.notifications_sent, 10);

        h.source
            .push_event(event("a@example.com", "2024-02-26", "09:00", EventKind::In));
        let second = h.pipeline.run(&week).await;
        assert_eq!(second.rows_written, 1);
        assert_eq!(second.notifications_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn daily_report_is_posted_after_the_run() {
        let h = harness();
        let summary = h
            .pipeline
            .run(&RunRequest {
                dates: DateRange::single(date("2024-03-01")),
                daily_report: true,
            })
            .await;
        assert!(summary.is_success());

        let sent = h.sink.sent();
        assert_eq!(sent.len(), 2);
        let report = &sent[1].text;
        assert!(report.contains("*Attendance Report*"));
        assert!(report.contains("Alice"));
        assert!(report.contains("*Absent*"));
    }

    #[tokio::test(start_paused = true)]
    async fn digest_aggregates_the_sheet() {
        let h = harness();
        h.pipeline.run(&request("2024-03-01")).await;

        let digest = h
            .pipeline
            .digest(&DateRange::week_to_date(date("2024-03-01")))
            .await
            .unwrap();
        assert_eq!(digest.individuals.len(), 2);
        assert_eq!(digest.totals.present, 1);
        assert_eq!(digest.totals.absent, 1);

        h.pipeline.send_digest(&digest).await.unwrap();
        assert!(h
            .sink
            .sent()
            .last()
            .unwrap()
            .text
            .contains("*Attendance Summary*"));
    }

    #[tokio::test(start_paused = true)]
    async fn roster_listing_applies_tracking_rules() {
        let h = harness();
        let tracked = h.pipeline.tracked_roster(date("2024-03-01")).await.unwrap();
        let names: Vec<_> = tracked.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[tokio::test(start_paused = true)]
    async fn write_conflict_fails_the_run_but_still_notifies() {
        let h = harness();
        h.sheets.set_write_conflict(true);

        let summary = h.pipeline.run(&request("2024-03-01")).await;
        assert!(!summary.is_success());
        assert_eq!(summary.errors.len(), 1);
        assert!(matches!(summary.errors[0], PipelineError::SheetWriteConflict(_)));
        assert_eq!(summary.rows_written, 0);
        assert!(h.sheets.rows().is_empty());
        assert_eq!(summary.notifications_sent, 1);
        assert_eq!(h.log.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rows_are_counted_as_errors() {
        let h = harness();
        h.sheets
            .fail_row(RowKey::new("b@example.com", date("2024-03-01")));

        let summary = h.pipeline.run(&request("2024-03-01")).await;
        assert_eq!(summary.rows_written, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(matches!(
            &summary.errors[0],
            PipelineError::RowWriteFailed { key, reason } if key.contains("b@example.com") && reason == "protected range"
        ));
        assert!(h
            .sheets
            .row(&RowKey::new("b@example.com", date("2024-03-01")))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unrecorded_delivery_is_sent_again_next_run() {
        let h = harness();
        h.log.set_fail_appends(true);

        let first = h.pipeline.run(&request("2024-03-01")).await;
        assert!(!first.is_success());
        assert_eq!(first.notifications_sent, 0);
        assert!(matches!(first.errors[0], PipelineError::NotificationLog(_)));
        assert_eq!(h.sink.sent().len(), 1);
        assert!(h.log.records().is_empty());

        h.log.set_fail_appends(false);
        let second = h.pipeline.run(&request("2024-03-01")).await;
        assert!(second.is_success());
        assert_eq!(second.notifications_sent, 1);
        assert_eq!(h.sink.sent().len(), 2);
        assert_eq!(h.log.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn daily_report_lists_excusal_reasons() {
        let mut excusals = Excusals::default();
        excusals.insert("b@example.com", date("2024-03-01"), "Vacation".to_string());
        let h = harness_with(
            vec![event("a@example.com", "2024-03-01", "09:05", EventKind::In)],
            excusals,
            at("2024-03-01", "18:00"),
        );

        h.pipeline
            .run(&RunRequest {
                dates: DateRange::single(date("2024-03-01")),
                daily_report: true,
            })
            .await;
        let sent = h.sink.sent();
        let report = &sent.last().unwrap().text;
        assert!(report.contains("*Excused*"));
        assert!(report.contains("Vacation"));
    }

    #[tokio::test(start_paused = true)]
    async fn department_start_time_applies_to_its_members() {
        let mut settings = settings();
        settings.policy.departments = vec![Department::new(
            "Operations",
            &["Ops"],
            NaiveTime::from_hms_opt(8, 0, 0),
        )];
        let mut early = event("a@example.com", "2024-03-01", "08:30", EventKind::In);
        early.project = Some("Ops".to_string());
        let h = harness_with_settings(
            vec![
                early,
                event("b@example.com", "2024-03-01", "08:30", EventKind::In),
            ],
            Excusals::default(),
            at("2024-03-01", "18:00"),
            settings,
        );

        h.pipeline
            .run(&RunRequest {
                dates: DateRange::single(date("2024-03-01")),
                daily_report: true,
            })
            .await;

        let alice = h
            .sheets
            .row(&RowKey::new("a@example.com", date("2024-03-01")))
            .unwrap();
        assert_eq!(alice.status, AttendanceStatus::Late);
        assert_eq!(alice.minutes_late, Some(30));
        let bob = h
            .sheets
            .row(&RowKey::new("b@example.com", date("2024-03-01")))
            .unwrap();
        assert_eq!(bob.status, AttendanceStatus::Present);

        let sent = h.sink.sent();
        let report = &sent.last().unwrap().text;
        assert!(report.contains("*=== Operations ===*"));
        assert!(report.contains("*=== Other ===*"));
    }

    #[tokio::test(start_paused = true)]
    async fn email_is_sent_once_per_anomaly_alongside_slack() {
        let mut h = harness();
        let email = Arc::new(RecordingSink::new());
        h.pipeline = h.pipeline.with_email(email.clone(), Some("hr@example.com".to_string()));

        let first = h.pipeline.run(&request("2024-03-01")).await;
        assert!(first.is_success(), "errors: {:?}", first.errors);
        assert_eq!(first.notifications_sent, 2);
        assert_eq!(h.sink.sent().len(), 1);
        let emails = email.sent();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].recipient.as_deref(), Some("b@example.com"));
        assert_eq!(emails[0].subject.as_deref(), Some("Absence on Fri 2024-03-01"));

        let second = h.pipeline.run(&request("2024-03-01")).await;
        assert_eq!(second.notifications_sent, 0);
        assert_eq!(email.sent().len(), 1);
    }
}
