// src/slack.rs
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::SlackConfig;
use crate::error::DeliveryError;
use crate::interfaces::{MessagingSink, OutboundMessage};

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Posts to a channel through `chat.postMessage` with a bot token.
pub struct SlackNotifier {
    client: Client,
    api_url: String,
    bot_token: String,
    channel_id: String,
}

impl SlackNotifier {
    pub fn new(config: &SlackConfig, timeout: Duration) -> Result<Self, DeliveryError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            channel_id: config.channel_id.clone(),
        })
    }
}

#[async_trait]
impl MessagingSink for SlackNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let payload = serde_json::json!({
            "channel": self.channel_id,
            "text": message.text,
        });

        let response = self
            .client
            .post(format!("{}/chat.postMessage", self.api_url))
            .bearer_auth(&self.bot_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DeliveryError::RateLimitExceeded);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Slack API error: Status={}, Body='{}'", status, body);
            return Err(DeliveryError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        // Slack answers 200 with ok=false for most failures
        let body: PostMessageResponse = response.json().await?;
        if !body.ok {
            let reason = body.error.unwrap_or_else(|| "unknown_error".to_string());
            error!("Slack rejected message to {}: {}", self.channel_id, reason);
            return Err(DeliveryError::Rejected(reason));
        }
        debug!("Message posted to Slack channel {}", self.channel_id);
        Ok(())
    }
}
