//! Notification dispatch for a single post.
//!
//! [`Dispatcher::notify`] resolves who wants to hear about a post and sends
//! them one batched email. Any lookup or delivery failure fails the whole
//! post; the watcher keeps the post and tries again on its next pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::EmailConfig;
use crate::preferences::{PreferencesError, PreferencesStore};
use crate::source::Post;
use crate::transport::{MessageTransport, TransportError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("preferences lookup for {feed} failed: {source}")]
    Preferences {
        feed: String,
        #[source]
        source: PreferencesError,
    },

    #[error("sending notification for {feed} failed: {source}")]
    Transport {
        feed: String,
        #[source]
        source: TransportError,
    },
}

/// Subject and body layout of subscriber emails.
#[derive(Debug, Clone)]
pub struct NotificationEmail {
    pub subject: String,
    pub footer: String,
    pub link_base: String,
}

impl NotificationEmail {
    pub fn from_config(config: &EmailConfig) -> Self {
        Self {
            subject: config.subject.clone(),
            footer: config.footer.clone(),
            link_base: config.link_base.clone(),
        }
    }

    /// Absolute link to the post.
    pub fn link(&self, post: &Post) -> String {
        if post.permalink.starts_with("http://") || post.permalink.starts_with("https://") {
            post.permalink.clone()
        } else {
            format!("{}{}", self.link_base.trim_end_matches('/'), post.permalink)
        }
    }

    pub fn body(&self, post: &Post) -> String {
        format!("New post in {}.\n\n{}\n\n{}", post.feed, self.link(post), self.footer)
    }
}

pub struct Dispatcher {
    preferences: Arc<dyn PreferencesStore>,
    transport: Arc<dyn MessageTransport>,
    email: NotificationEmail,
}

impl Dispatcher {
    pub fn new(
        preferences: Arc<dyn PreferencesStore>,
        transport: Arc<dyn MessageTransport>,
        email: NotificationEmail,
    ) -> Self {
        Self {
            preferences,
            transport,
            email,
        }
    }

    /// Email every subscriber of `post.feed` who opted in.
    ///
    /// Returns how many addresses the post went to; zero interested
    /// subscribers is a successful no-op.
    pub async fn notify(&self, post: &Post) -> Result<usize, DispatchError> {
        let recipients = self.recipients(&post.feed).await?;
        if recipients.is_empty() {
            debug!(feed = %post.feed, post = %post.id, "no subscribers to notify");
            return Ok(0);
        }

        self.transport
            .send(&self.email.subject, &self.email.body(post), &recipients)
            .await
            .map_err(|source| DispatchError::Transport {
                feed: post.feed.clone(),
                source,
            })?;

        info!(
            feed = %post.feed,
            post = %post.id,
            author = post.author.as_deref().unwrap_or("unknown"),
            recipients = recipients.len(),
            "notification sent"
        );
        Ok(recipients.len())
    }

    async fn recipients(&self, feed: &str) -> Result<BTreeSet<String>, DispatchError> {
        let lookup = |source| DispatchError::Preferences {
            feed: feed.to_string(),
            source,
        };

        let subscribers = self.preferences.feed_subscribers(feed).await.map_err(lookup)?;

        let mut interested: Vec<&String> = subscribers
            .iter()
            .filter(|(_, pref)| pref.email_notifications_enabled)
            .map(|(user, _)| user)
            .collect();
        interested.sort();

        let mut addresses = BTreeSet::new();
        for user in interested {
            let global = self.preferences.user_preferences(user).await.map_err(lookup)?;
            if !global.email.trim().is_empty() {
                addresses.insert(global.email);
            }
        }
        Ok(addresses)
    }
}
