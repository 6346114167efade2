//! Test doubles for the collaborator traits.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt};

use crate::preferences::{FeedPreference, GlobalPreference, PreferencesError, PreferencesStore};
use crate::source::{FeedSource, Post, PostStream, SourceError};
use crate::transport::{DirectMessenger, MessageTransport, TransportError};

/// Shorthand constructor for a post on `feed` created at unix second `created`.
pub fn make_post(feed: &str, id: &str, created: i64) -> Post {
    Post {
        id: id.to_string(),
        permalink: format!("/r/{feed}/comments/{id}"),
        created_at: Utc.timestamp_opt(created, 0).unwrap(),
        author: Some("someone".to_string()),
        feed: feed.to_string(),
    }
}

/// Poll `check` until it holds, for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Feed source
// ---------------------------------------------------------------------------

pub enum Step {
    Post(Post),
    Fail(&'static str),
    Sleep(Duration),
}

/// Serves one pre-scripted stream per subscription, per feed.
///
/// Once a script runs out the stream hangs like a quiet upstream, unless
/// [`ending`](ScriptedSource::ending) was set. A feed with no scripts left
/// hangs immediately.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Vec<Step>>>>,
    subscriptions: Mutex<HashMap<String, usize>>,
    end_streams: bool,
}

impl ScriptedSource {
    pub fn script(self, feed: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(feed.to_string())
            .or_default()
            .push_back(steps);
        self
    }

    pub fn ending(mut self) -> Self {
        self.end_streams = true;
        self
    }

    pub fn subscriptions(&self, feed: &str) -> usize {
        self.subscriptions.lock().unwrap().get(feed).copied().unwrap_or(0)
    }
}

impl FeedSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn subscribe(&self, feed: &str) -> PostStream {
        *self.subscriptions.lock().unwrap().entry(feed.to_string()).or_default() += 1;
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(feed)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();

        let scripted = stream::iter(steps).filter_map(|step| async move {
            match step {
                Step::Post(post) => Some(Ok(post)),
                Step::Fail(message) => Some(Err(SourceError::Other(message.to_string()))),
                Step::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    None
                }
            }
        });

        if self.end_streams {
            scripted.boxed()
        } else {
            scripted.chain(stream::pending()).boxed()
        }
    }
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPreferences {
    subscribers: HashMap<String, HashMap<String, FeedPreference>>,
    emails: HashMap<String, String>,
    feeds: Vec<String>,
    failing: bool,
}

impl MemoryPreferences {
    pub fn subscriber(mut self, feed: &str, user: &str, enabled: bool, email: &str) -> Self {
        self.emails.insert(user.to_string(), email.to_string());
        self.insert_subscriber(feed, user, enabled);
        self
    }

    pub fn subscriber_without_email(mut self, feed: &str, user: &str) -> Self {
        self.insert_subscriber(feed, user, true);
        self
    }

    fn insert_subscriber(&mut self, feed: &str, user: &str, enabled: bool) {
        self.subscribers.entry(feed.to_string()).or_default().insert(
            user.to_string(),
            FeedPreference {
                email_notifications_enabled: enabled,
            },
        );
    }

    pub fn feeds(mut self, feeds: &[&str]) -> Self {
        self.feeds = feeds.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Every lookup fails.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    fn check(&self) -> Result<(), PreferencesError> {
        if self.failing {
            Err(PreferencesError::Other("preferences unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PreferencesStore for MemoryPreferences {
    async fn feed_subscribers(
        &self,
        feed: &str,
    ) -> Result<HashMap<String, FeedPreference>, PreferencesError> {
        self.check()?;
        Ok(self.subscribers.get(feed).cloned().unwrap_or_default())
    }

    async fn user_preferences(&self, user_id: &str) -> Result<GlobalPreference, PreferencesError> {
        self.check()?;
        self.emails
            .get(user_id)
            .map(|email| GlobalPreference { email: email.clone() })
            .ok_or_else(|| PreferencesError::UnknownUser(user_id.to_string()))
    }

    async fn watched_feeds(&self) -> Result<Vec<String>, PreferencesError> {
        self.check()?;
        Ok(self.feeds.clone())
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub subject: String,
    pub body: String,
    pub recipients: BTreeSet<String>,
}

fn sent_message(subject: &str, body: &str, recipients: &BTreeSet<String>) -> SentMessage {
    SentMessage {
        subject: subject.to_string(),
        body: body.to_string(),
        recipients: recipients.clone(),
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn send(
        &self,
        subject: &str,
        body: &str,
        recipients: &BTreeSet<String>,
    ) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(sent_message(subject, body, recipients));
        Ok(())
    }
}

pub struct FailingTransport;

#[async_trait]
impl MessageTransport for FailingTransport {
    async fn send(&self, _: &str, _: &str, _: &BTreeSet<String>) -> Result<(), TransportError> {
        Err(TransportError::Other("smtp down".to_string()))
    }
}

/// Fails the first `n` sends, then records deliveries.
pub struct FlakyTransport {
    fail_first: u32,
    attempts: AtomicU32,
    delivered: Mutex<Vec<SentMessage>>,
}

impl FlakyTransport {
    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_first: n,
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<SentMessage> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageTransport for FlakyTransport {
    async fn send(
        &self,
        subject: &str,
        body: &str,
        recipients: &BTreeSet<String>,
    ) -> Result<(), TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(TransportError::Other(format!("flaky send #{}", attempt + 1)));
        }
        self.delivered.lock().unwrap().push(sent_message(subject, body, recipients));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMessenger {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingMessenger {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl DirectMessenger for RecordingMessenger {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn message(&self, subject: &str, body: &str) -> Result<(), TransportError> {
        self.messages.lock().unwrap().push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

pub struct FailingMessenger;

#[async_trait]
impl DirectMessenger for FailingMessenger {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn message(&self, _: &str, _: &str) -> Result<(), TransportError> {
        Err(TransportError::Other("webhook down".to_string()))
    }
}
