// src/email.rs
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::{debug, error};

use crate::config::EmailConfig;
use crate::error::DeliveryError;
use crate::interfaces::{MessagingSink, OutboundMessage};

//=============================================================================
// Email Notifier
//=============================================================================

/// Delivers direct messages over SMTP. Messages without a recipient are rejected.
pub struct EmailNotifier {
    sender: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

fn setup_error(context: &str, e: lettre::transport::smtp::Error) -> DeliveryError {
    DeliveryError::Smtp {
        message: format!("{}: {}", context, e),
        transient: false,
    }
}

impl EmailNotifier {
    pub fn new(config: &EmailConfig, timeout: Duration) -> Result<Self, DeliveryError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let tls_parameters = TlsParameters::new(config.smtp_server.clone())
            .map_err(|e| setup_error("TLS error", e))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_server)
            .map_err(|e| setup_error("SMTP relay error", e))?
            .port(config.smtp_port)
            .credentials(creds)
            .tls(Tls::Required(tls_parameters))
            .timeout(Some(timeout))
            .build();

        Ok(Self {
            sender: config.sender.clone(),
            transport,
        })
    }
}

fn mailbox(role: &str, address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .trim()
        .parse()
        .map_err(|e| DeliveryError::Rejected(format!("invalid {} address '{}': {}", role, address, e)))
}

/// Builds the plain-text email for a direct message.
pub fn build_email(sender: &str, message: &OutboundMessage) -> Result<Message, DeliveryError> {
    let recipient = message
        .recipient
        .as_deref()
        .ok_or_else(|| DeliveryError::Rejected("email message has no recipient".to_string()))?;

    Message::builder()
        .from(mailbox("sender", sender)?)
        .to(mailbox("recipient", recipient)?)
        .subject(message.subject.clone().unwrap_or_else(|| "Attendance notice".to_string()))
        .header(ContentType::TEXT_PLAIN)
        .body(message.text.clone())
        .map_err(|e| DeliveryError::Rejected(format!("failed to build email: {}", e)))
}

#[async_trait]
impl MessagingSink for EmailNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let email = build_email(&self.sender, message)?;

        self.transport.send(email).await.map_err(|e| {
            error!("Failed to send email: {}", e);
            DeliveryError::Smtp {
                message: e.to_string(),
                transient: !e.is_permanent(),
            }
        })?;

        debug!(
            "Email delivered to {}",
            message.recipient.as_deref().unwrap_or_default()
        );
        Ok(())
    }
}
