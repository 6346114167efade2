//! Operator direct messages via a chat webhook.
//!
//! Posts `{"content": "**subject**\nbody"}`, the payload shape chat services
//! such as Discord and Mattermost accept for incoming webhooks.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use super::{DirectMessenger, TransportError};

/// Longest message body most chat webhooks accept.
const MAX_CONTENT_LEN: usize = 2000;

pub struct WebhookMessenger {
    client: Client,
    url: Option<String>,
}

impl WebhookMessenger {
    /// A messenger for `url`; `None` gives a disabled messenger that drops
    /// every message.
    pub fn new(url: Option<String>) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            url: url.filter(|u| !u.trim().is_empty()),
        })
    }

    fn build_payload(subject: &str, body: &str) -> serde_json::Value {
        let mut content = format!("**{subject}**\n{body}");
        if content.len() > MAX_CONTENT_LEN {
            let mut cut = MAX_CONTENT_LEN;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
        }
        json!({ "content": content })
    }
}

#[async_trait]
impl DirectMessenger for WebhookMessenger {
    fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn message(&self, subject: &str, body: &str) -> Result<(), TransportError> {
        let Some(url) = &self.url else {
            return Ok(());
        };

        self.client
            .post(url)
            .json(&Self::build_payload(subject, body))
            .send()
            .await?
            .error_for_status()?;
        debug!(subject, "operator direct message sent");
        Ok(())
    }
}
