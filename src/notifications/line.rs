use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::config::NotificationSettings;

pub const LINE_PUSH_URL: &str = "https://api.line.me/v2/bot/message/push";

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    messages: [TextMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

/// Client for the LINE Messaging API push endpoint.
#[derive(Clone)]
pub struct LinePusher {
    client: Client,
    endpoint: String,
    user_id: String,
    channel_token: String,
}

impl LinePusher {
    pub fn new(user_id: impl Into<String>, channel_token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: LINE_PUSH_URL.to_string(),
            user_id: user_id.into(),
            channel_token: channel_token.into(),
        }
    }

    /// `None` unless both the user id and the channel token are configured.
    pub fn from_settings(settings: &NotificationSettings) -> Option<Self> {
        match (&settings.line_user_id, &settings.line_channel_token) {
            (Some(user), Some(token)) => {
                Some(Self::new(user.clone(), token.clone()).with_endpoint(settings.line_api_url.clone()))
            }
            _ => None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub async fn push(&self, text: &str) -> Result<()> {
        let body = PushRequest {
            to: &self.user_id,
            messages: [TextMessage { kind: "text", text }],
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.channel_token)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("LINE push failed ({}): {}", status, error_text));
        }

        debug!("LINE push delivered");
        Ok(())
    }
}
