//! RSS feed source implementation.
//!
//! Turns a periodically polled RSS 2.0 document into a never-ending
//! [`PostStream`]. The first poll replays whatever the feed currently lists
//! (oldest first); every later poll yields only ids that have not been seen
//! before. Use it as a template when adding a JSON API or Atom source.
//!
//! ## For contributors
//!
//! Parsing is kept in the pure [`RssSource::parse_channel`] so tests can
//! exercise it without a network. The polling state machine lives in
//! [`PollState`] and is driven by [`futures::stream::unfold`].

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use tracing::debug;

use super::{FeedSource, Post, PostStream, RecentIds, SourceError};
use crate::config::SourceConfig;

/// How many post ids a subscription remembers for de-duplication.
const SEEN_CAPACITY: usize = 1000;

/// An RSS feed source.
///
/// Fetches the document at `url_template` (with `{feed}` replaced by the feed
/// name) using [`reqwest`] and parses it with the [`rss`] crate.
pub struct RssSource {
    client: Client,
    url_template: String,
    poll_interval: Duration,
}

impl RssSource {
    /// Build a source from its config section.
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(SourceError::Client)?;

        Ok(Self {
            client,
            url_template: config.url_template.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        })
    }

    /// The concrete URL polled for `feed`.
    pub fn feed_url(&self, feed: &str) -> String {
        self.url_template.replace("{feed}", feed)
    }

    /// Parse an already-fetched [`rss::Channel`] into [`Post`]s, oldest first.
    ///
    /// Items without a parsable `pubDate` are dropped: without a creation time
    /// they can never pass the admission filter.
    pub fn parse_channel(channel: &rss::Channel, feed: &str) -> Vec<Post> {
        let mut posts: Vec<Post> = channel
            .items()
            .iter()
            .filter_map(|item| {
                let created_at = item
                    .pub_date()
                    .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                    .map(|dt| dt.with_timezone(&Utc))?;

                // Prefer <guid>, fall back to <link>.
                let id = item
                    .guid()
                    .map(|g| g.value().to_string())
                    .or_else(|| item.link().map(String::from))?;

                Some(Post {
                    permalink: item.link().map(String::from).unwrap_or_else(|| id.clone()),
                    id,
                    created_at,
                    author: item.author().map(String::from),
                    feed: feed.to_string(),
                })
            })
            .collect();

        posts.sort();
        posts
    }
}

impl FeedSource for RssSource {
    fn name(&self) -> &str {
        "rss"
    }

    fn subscribe(&self, feed: &str) -> PostStream {
        let state = PollState {
            client: self.client.clone(),
            url: self.feed_url(feed),
            feed: feed.to_string(),
            poll_interval: self.poll_interval,
            seen: RecentIds::new(SEEN_CAPACITY),
            ready: VecDeque::new(),
            polled_once: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(post) = state.ready.pop_front() {
                    return Some((Ok(post), state));
                }
                if state.polled_once {
                    tokio::time::sleep(state.poll_interval).await;
                }
                state.polled_once = true;
                match state.fetch().await {
                    Ok(posts) => state.enqueue(posts),
                    Err(e) => return Some((Err(e), state)),
                }
            }
        })
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Polling state
// ---------------------------------------------------------------------------

/// Per-subscription state threaded through the stream.
struct PollState {
    client: Client,
    url: String,
    feed: String,
    poll_interval: Duration,
    seen: RecentIds,
    ready: VecDeque<Post>,
    polled_once: bool,
}

impl PollState {
    async fn fetch(&self) -> Result<Vec<Post>, SourceError> {
        let http = |source| SourceError::Http {
            url: self.url.clone(),
            source,
        };
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http)?
            .bytes()
            .await
            .map_err(http)?;

        let channel = rss::Channel::read_from(body.as_ref()).map_err(|source| SourceError::Parse {
            url: self.url.clone(),
            source,
        })?;
        Ok(RssSource::parse_channel(&channel, &self.feed))
    }

    fn enqueue(&mut self, posts: Vec<Post>) {
        let before = self.ready.len();
        for post in posts {
            if self.seen.insert(&post.id) {
                self.ready.push_back(post);
            }
        }
        debug!(feed = %self.feed, new = self.ready.len() - before, "polled feed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
