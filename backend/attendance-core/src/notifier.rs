// src/notifier.rs
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::{DeliveryError, PipelineError};
use crate::interfaces::{MessagingSink, NotificationLog, OutboundMessage};
use crate::model::{AnomalyKind, Channel, NotificationKey, NotificationRecord};
use crate::reconciler::NotifyInstruction;
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Keys that were delivered and committed to the log.
    pub sent: Vec<NotificationKey>,
    pub failures: Vec<PipelineError>,
}

struct EmailChannel {
    sink: Arc<dyn MessagingSink>,
    hr_contact: Option<String>,
}

pub struct Notifier {
    sink: Arc<dyn MessagingSink>,
    email: Option<EmailChannel>,
    log: Arc<dyn NotificationLog>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    mention_user_id: Option<String>,
}

impl Notifier {
    pub fn new(
        sink: Arc<dyn MessagingSink>,
        log: Arc<dyn NotificationLog>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        mention_user_id: Option<String>,
    ) -> Self {
        Self {
            sink,
            email: None,
            log,
            clock,
            retry,
            mention_user_id,
        }
    }

    /// Also emails late and absent individuals directly.
    pub fn with_email(mut self, sink: Arc<dyn MessagingSink>, hr_contact: Option<String>) -> Self {
        self.email = Some(EmailChannel { sink, hr_contact });
        self
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = vec![Channel::Slack];
        if self.email.is_some() {
            channels.push(Channel::Email);
        }
        channels
    }

    fn route(&self, instruction: &NotifyInstruction) -> Result<(&Arc<dyn MessagingSink>, OutboundMessage), DeliveryError> {
        match instruction.key.channel {
            Channel::Slack => Ok((
                &self.sink,
                format_message(instruction, self.mention_user_id.as_deref()),
            )),
            Channel::Email => {
                let email = self.email.as_ref().ok_or_else(|| {
                    DeliveryError::Rejected("email channel is not configured".to_string())
                })?;
                Ok((
                    &email.sink,
                    format_email(instruction, email.hr_contact.as_deref()),
                ))
            }
        }
    }

    /// Sends each instruction in order. A key is committed to the log only after its
    /// message was accepted, so anything that fails here is retried on the next run.
    pub async fn dispatch(&self, instructions: &[NotifyInstruction]) -> DispatchReport {
        let mut report = DispatchReport::default();

        for instruction in instructions {
            let operation = format!("notify {}", instruction.key);
            let sent = match self.route(instruction) {
                Ok((sink, message)) => with_retry(&self.retry, &operation, || sink.send(&message)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                error!("Failed to deliver notification {}: {}", instruction.key, e);
                report.failures.push(PipelineError::delivery(&instruction.key, e));
                continue;
            }

            let record = NotificationRecord {
                key: instruction.key.clone(),
                sent_at: self.clock.now().fixed_offset(),
            };
            match self.log.append(&record).await {
                Ok(()) => {
                    info!("Notified {}", instruction.key);
                    report.sent.push(instruction.key.clone());
                }
                Err(e) => {
                    // Delivered but not recorded: the next run may send it again.
                    warn!(
                        "Notification {} was delivered but could not be recorded: {}",
                        instruction.key, e
                    );
                    report.failures.push(PipelineError::NotificationLog(e));
                }
            }
        }
        report
    }
}

fn mention_prefix(mention_user_id: Option<&str>) -> String {
    mention_user_id
        .map(|id| format!("<@{}> ", id))
        .unwrap_or_default()
}

/// Renders one anomaly as Slack mrkdwn.
pub fn format_message(instruction: &NotifyInstruction, mention_user_id: Option<&str>) -> OutboundMessage {
    let status = &instruction.status;
    let who = format!("{} ({})", status.individual_name, status.individual_id);
    let date = status.date.format("%a %Y-%m-%d");

    let body = match instruction.key.kind {
        AnomalyKind::Late => {
            let checked_in = status
                .first_check_in
                .map(|t| t.format("%I:%M %p").to_string())
                .unwrap_or_else(|| "an unknown time".to_string());
            let minutes = status.minutes_late.unwrap_or(0);
            format!(
                ":warning: *Late arrival*: {} checked in at {} on {}, {} minute{} late.",
                who,
                checked_in,
                date,
                minutes,
                if minutes == 1 { "" } else { "s" }
            )
        }
        AnomalyKind::Absent => {
            let mut text = format!(":red_circle: *Absent*: {} has no check-in on {}.", who, date);
            if let Some(detail) = &status.detail {
                text.push_str(&format!(" ({})", detail));
            }
            text
        }
        AnomalyKind::Unknown => format!(
            ":grey_question: *Attendance data issue*: {} on {}: {}.",
            who,
            date,
            status.detail.as_deref().unwrap_or("events could not be paired")
        ),
    };
    OutboundMessage::new(format!("{}{}", mention_prefix(mention_user_id), body))
}

/// Renders one anomaly as a plain-text email to the individual concerned.
pub fn format_email(instruction: &NotifyInstruction, hr_contact: Option<&str>) -> OutboundMessage {
    let status = &instruction.status;
    let date = status.date.format("%a %Y-%m-%d");
    let contact = match hr_contact {
        Some(hr) => format!("please contact {}", hr),
        None => "please reply to this email".to_string(),
    };

    let (subject, what) = match instruction.key.kind {
        AnomalyKind::Late => {
            let checked_in = status
                .first_check_in
                .map(|t| t.format("%I:%M %p").to_string())
                .unwrap_or_else(|| "an unknown time".to_string());
            let minutes = status.minutes_late.unwrap_or(0);
            (
                format!("Late arrival on {}", date),
                format!(
                    "Our records show you checked in at {} on {}, {} minute{} after your expected start.",
                    checked_in,
                    date,
                    minutes,
                    if minutes == 1 { "" } else { "s" }
                ),
            )
        }
        AnomalyKind::Absent => (
            format!("Absence on {}", date),
            format!("Our records show no check-in from you on {}.", date),
        ),
        AnomalyKind::Unknown => (
            format!("Attendance record for {}", date),
            format!("Your attendance data for {} could not be read.", date),
        ),
    };

    let text = format!(
        "Hi {},\n\n{}\n\nIf this is incorrect or you had an arrangement, {}.\n",
        status.individual_name, what, contact
    );
    OutboundMessage::direct(status.individual_id.clone(), subject, text)
}
