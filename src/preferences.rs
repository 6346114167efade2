//! Subscriber preferences.
//!
//! The daemon only ever reads preferences; they are owned and edited by the
//! web app. [`PreferencesStore`] is the seam, [`RestPreferences`] reads them
//! from a Firebase-style JSON tree over HTTP:
//!
//! ```text
//! {base}/supported_subreddits.json
//!     -> ["rust", ...]
//! {base}/notification_preferences/subreddits/{feed}/user_preferences.json
//!     -> {user: {"emailNotification": bool}}
//! {base}/notification_preferences/users/{user}/global_preferences.json
//!     -> {"email": "..."}
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::PreferencesConfig;

#[derive(Debug, Error)]
pub enum PreferencesError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("preferences request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("no global preferences for user {0}")]
    UnknownUser(String),

    #[error("{0}")]
    Other(String),
}

/// One subscriber's settings for a single feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPreference {
    #[serde(rename = "emailNotification", default)]
    pub email_notifications_enabled: bool,
}

/// A user's feed-independent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPreference {
    pub email: String,
}

/// Read-only view of the preferences collaborator.
#[async_trait]
pub trait PreferencesStore: Send + Sync {
    /// Subscribers of `feed`, keyed by user id. Unknown feeds have none.
    async fn feed_subscribers(
        &self,
        feed: &str,
    ) -> Result<HashMap<String, FeedPreference>, PreferencesError>;

    async fn user_preferences(&self, user_id: &str) -> Result<GlobalPreference, PreferencesError>;

    /// The feeds this daemon should watch.
    async fn watched_feeds(&self) -> Result<Vec<String>, PreferencesError>;
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

pub struct RestPreferences {
    client: Client,
    base_uri: String,
    access_token: Option<String>,
}

impl RestPreferences {
    pub fn new(config: &PreferencesConfig) -> Result<Self, PreferencesError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(PreferencesError::Client)?;

        Ok(Self {
            client,
            base_uri: config.base_uri.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}.json", self.base_uri)
    }

    /// GET a JSON document. A JSON `null` (absent node) comes back as `None`.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, PreferencesError> {
        let url = self.url(path);
        let http = |source| PreferencesError::Http {
            url: url.clone(),
            source,
        };

        let mut request = self.client.get(&url);
        if let Some(token) = &self.access_token {
            request = request.query(&[("access_token", token)]);
        }

        let value = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http)?
            .json::<Option<T>>()
            .await
            .map_err(http)?;
        debug!(url = %url, found = value.is_some(), "fetched preferences");
        Ok(value)
    }
}

#[async_trait]
impl PreferencesStore for RestPreferences {
    async fn feed_subscribers(
        &self,
        feed: &str,
    ) -> Result<HashMap<String, FeedPreference>, PreferencesError> {
        let path = format!("notification_preferences/subreddits/{feed}/user_preferences");
        Ok(self.get_json(&path).await?.unwrap_or_default())
    }

    async fn user_preferences(&self, user_id: &str) -> Result<GlobalPreference, PreferencesError> {
        let path = format!("notification_preferences/users/{user_id}/global_preferences");
        self.get_json(&path)
            .await?
            .ok_or_else(|| PreferencesError::UnknownUser(user_id.to_string()))
    }

    async fn watched_feeds(&self) -> Result<Vec<String>, PreferencesError> {
        Ok(self.get_json("supported_subreddits").await?.unwrap_or_default())
    }
}
