// src/main.rs
use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use attendance_core::clock::{Clock, SystemClock};
use attendance_core::config::AppConfig;
use attendance_core::email::EmailNotifier;
use attendance_core::excusals::Excusals;
use attendance_core::model::DateRange;
use attendance_core::notification_log::CsvNotificationLog;
use attendance_core::pipeline::{Pipeline, PipelineSettings, RunRequest};
use attendance_core::sheets_client::{GoogleSheetsClient, ServiceAccountKey};
use attendance_core::slack::SlackNotifier;
use attendance_core::webwork_client::WebWorkClient;

/// Reconciles WebWork check-ins into the attendance sheet and alerts Slack about anomalies
#[derive(Parser)]
#[command(name = "attendance-core", version = env!("CARGO_PKG_VERSION"), long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve attendance, update the sheet and send new anomaly notifications
    Run {
        /// Date to process (YYYY-MM-DD), defaults to today in the configured timezone
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Process every weekday from Monday of the date's week up to the date
        #[arg(long)]
        backfill_week: bool,

        /// Post the consolidated attendance report for the date afterwards
        #[arg(long)]
        daily_report: bool,
    },

    /// Summarize the sheet over a date range and post it
    Report {
        /// First day (YYYY-MM-DD), defaults to Monday of the current week
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last day (YYYY-MM-DD), defaults to today
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Print the report instead of posting it
        #[arg(long)]
        dry_run: bool,
    },

    /// List the individuals tracked on a date
    Roster {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // --- Setup ---
    dotenv::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    info!(
        "Configuration loaded. Timezone: {}, sheet tab: '{}', notification log: {}",
        config.policy.timezone,
        config.sheets.tab,
        config.notification_log_path.display()
    );

    // --- Wire Components ---
    let source = WebWorkClient::new(
        config.webwork.clone(),
        config.policy.timezone,
        config.retry.clone(),
    )
    .context("Failed to create WebWork client")?;
    let key = ServiceAccountKey::load(&config.sheets.service_account_file)
        .context("Failed to load Google service account key")?;
    let sheets = GoogleSheetsClient::new(config.sheets.clone(), key, config.retry.clone())
        .context("Failed to create Google Sheets client")?;
    let sink = SlackNotifier::new(&config.slack, config.retry.attempt_timeout)
        .context("Failed to create Slack client")?;
    let log = CsvNotificationLog::new(config.notification_log_path.clone());
    let clock = Arc::new(SystemClock::new(config.policy.timezone));
    let excusals = match &config.excusals_file {
        Some(path) => Excusals::load(path).context("Failed to load excusals")?,
        None => Excusals::default(),
    };

    let today = clock.now().date_naive();
    let mut pipeline = Pipeline::new(
        Arc::new(source),
        Arc::new(sheets),
        Arc::new(sink),
        Arc::new(log),
        clock,
        PipelineSettings {
            policy: config.policy.clone(),
            tracking: config.tracking.clone(),
            retry: config.retry.clone(),
            mention_user_id: config.slack.mention_user_id.clone(),
        },
        excusals,
    );
    if let Some(email) = &config.email {
        let notifier = EmailNotifier::new(email, config.retry.attempt_timeout)
            .context("Failed to create SMTP transport")?;
        info!(
            "Email automation enabled via {}:{} as {}",
            email.smtp_server, email.smtp_port, email.sender
        );
        pipeline = pipeline.with_email(Arc::new(notifier), email.hr_email.clone());
    }

    // --- Dispatch ---
    match cli.command {
        Commands::Run {
            date,
            backfill_week,
            daily_report,
        } => {
            let date = date.unwrap_or(today);
            let dates = if backfill_week {
                DateRange::week_to_date(date)
            } else {
                DateRange::single(date)
            };
            let summary = pipeline.run(&RunRequest { dates, daily_report }).await;
            if !summary.is_success() {
                error!("Run finished with {} error(s)", summary.errors.len());
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Report { from, to, dry_run } => {
            let to = to.unwrap_or(today);
            let from = from.unwrap_or(DateRange::week_to_date(to).start);
            let Some(range) = DateRange::new(from, to) else {
                bail!("--from {} is after --to {}", from, to);
            };
            let digest = pipeline
                .digest(&range)
                .await
                .context("Failed to read the attendance sheet")?;
            if dry_run {
                println!("{}", pipeline.render_digest(&digest));
            } else {
                pipeline
                    .send_digest(&digest)
                    .await
                    .context("Failed to post the attendance report")?;
            }
        }
        Commands::Roster { date } => {
            let date = date.unwrap_or(today);
            let tracked = pipeline
                .tracked_roster(date)
                .await
                .context("Failed to fetch the WebWork roster")?;
            for individual in &tracked {
                println!("{}\t{}", individual.id, individual.name);
            }
            info!("{} individuals tracked on {}", tracked.len(), date);
        }
    }

    Ok(ExitCode::SUCCESS)
}
