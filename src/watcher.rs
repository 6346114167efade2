//! Per-feed watch loop.
//!
//! One [`Watcher`] runs per watched feed, on its own task:
//!
//! ```text
//!   start ──► streaming ──post──► admission ──accept──► processing ──┐
//!                ▲   │                │ reject                      │
//!                │   │                └──────────► (next post) ◄─────┘
//!                │   └──error──► cooldown ──retry──┘
//!                │                   │ exhausted
//!                └ shutdown ◄────────┴──► stopped
//! ```
//!
//! * **start**: the effective start time is the feed's checkpoint, or *now*
//!   on a cold start so a new feed never floods subscribers with history.
//!   It is computed once per watcher and kept across stream retries.
//! * **admission**: a post is dropped when shutdown was requested, when it is
//!   not newer than the start time, or when it is older than the max age.
//! * **processing**: the post joins the pending queue; the queue is flushed
//!   oldest first and stops at the first failure, which stays queued for the
//!   next pass. Each delivered post advances the checkpoint.
//! * **cooldown**: a stream error drops the subscription and sleeps before
//!   subscribing again. A received post resets the failure count.
//!
//! The shared [`WatcherStatus`] is how the supervisor sees the watcher. It is
//! forced to `alive = false, safe_to_stop = true` on every exit path,
//! including panics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertOnce, Alerter};
use crate::checkpoint::CheckpointStore;
use crate::notify::{DispatchError, Dispatcher};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::source::{FeedSource, Post, RecentIds};

/// How many delivered post ids a watcher remembers to suppress redeliveries.
const DELIVERED_CAPACITY: usize = 1000;

// ---------------------------------------------------------------------------
// Admission filter
// ---------------------------------------------------------------------------

/// Verdict of the admission filter for one observed post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// The running marker is gone.
    ShuttingDown,
    /// Created at or before the watcher's start time.
    AlreadySeen,
    /// Older than the max post age.
    TooStale,
    /// Already delivered by this watcher.
    Duplicate,
}

/// Decide whether a post created at `created` (unix seconds) is dispatched.
pub fn admit(
    created: i64,
    start_time: i64,
    now: i64,
    max_age: Duration,
    shutting_down: bool,
) -> Admission {
    let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    if shutting_down {
        Admission::ShuttingDown
    } else if created <= start_time {
        Admission::AlreadySeen
    } else if now.saturating_sub(created) > max_age {
        Admission::TooStale
    } else {
        Admission::Accept
    }
}

// ---------------------------------------------------------------------------
// Status shared with the supervisor
// ---------------------------------------------------------------------------

/// Runtime status of one watcher, readable from any task.
#[derive(Debug)]
pub struct WatcherStatus {
    alive: AtomicBool,
    safe_to_stop: AtomicBool,
    retry_count: AtomicU32,
}

impl WatcherStatus {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            safe_to_stop: AtomicBool::new(true),
            retry_count: AtomicU32::new(0),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_safe_to_stop(&self) -> bool {
        self.safe_to_stop.load(Ordering::Acquire)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_safe_to_stop(&self, safe: bool) {
        self.safe_to_stop.store(safe, Ordering::Release);
    }

    fn set_retry_count(&self, count: u32) {
        self.retry_count.store(count, Ordering::Release);
    }

    pub(crate) fn mark_stopped(&self) {
        self.safe_to_stop.store(true, Ordering::Release);
        self.alive.store(false, Ordering::Release);
    }
}

impl Default for WatcherStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the status stopped when the watcher's future ends or unwinds.
struct StoppedOnDrop(Arc<WatcherStatus>);

impl Drop for StoppedOnDrop {
    fn drop(&mut self) {
        self.0.mark_stopped();
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Why a watcher's run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Shutdown was requested.
    Shutdown,
    /// The stream failed `attempts` times in a row.
    RetriesExhausted { attempts: u32 },
    /// The upstream stream finished; sources are not expected to do this.
    StreamEnded,
}

/// Tunables shared by every watcher.
#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    pub max_post_age: Duration,
    pub stream_policy: RetryPolicy,
    pub dispatch_policy: RetryPolicy,
}

/// Collaborators shared by every watcher.
pub struct WatchContext {
    pub source: Arc<dyn FeedSource>,
    pub dispatcher: Arc<Dispatcher>,
    pub checkpoints: Arc<CheckpointStore>,
    pub alerter: Arc<Alerter>,
    pub settings: WatchSettings,
}

pub struct Watcher {
    feed: String,
    ctx: Arc<WatchContext>,
    shutdown: CancellationToken,
    status: Arc<WatcherStatus>,
    /// Accepted posts not yet delivered, in arrival order.
    pending: VecDeque<Post>,
    delivered: RecentIds,
    dispatch_alert: AlertOnce,
}

/// A spawned watcher as seen by the supervisor.
pub struct WatcherHandle {
    pub feed: String,
    pub status: Arc<WatcherStatus>,
    pub task: JoinHandle<WatchOutcome>,
}

impl WatcherHandle {
    pub fn is_alive(&self) -> bool {
        self.status.is_alive() && !self.task.is_finished()
    }

    pub fn is_safe_to_stop(&self) -> bool {
        self.status.is_safe_to_stop()
    }
}

impl Watcher {
    pub fn new(
        feed: impl Into<String>,
        ctx: Arc<WatchContext>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            feed: feed.into(),
            ctx,
            shutdown,
            status: Arc::new(WatcherStatus::new()),
            pending: VecDeque::new(),
            delivered: RecentIds::new(DELIVERED_CAPACITY),
            dispatch_alert: AlertOnce::new(),
        }
    }

    pub fn status(&self) -> Arc<WatcherStatus> {
        Arc::clone(&self.status)
    }

    /// Run on a new task.
    pub fn spawn(self) -> WatcherHandle {
        let feed = self.feed.clone();
        let status = self.status();
        let task = tokio::spawn(self.run());
        WatcherHandle { feed, status, task }
    }

    pub async fn run(mut self) -> WatchOutcome {
        let _stopped = StoppedOnDrop(self.status());

        let start_time = self.start_time().await;
        info!(feed = %self.feed, source = self.ctx.source.name(), start_time, "watching feed");

        let mut budget = self.ctx.settings.stream_policy.budget();
        loop {
            let mut stream = self.ctx.source.subscribe(&self.feed);

            let failure = loop {
                let next = tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => {
                        info!(feed = %self.feed, "watcher stopping");
                        return WatchOutcome::Shutdown;
                    }
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(post)) => {
                        budget.reset();
                        self.status.set_retry_count(0);
                        self.handle(post, start_time).await;
                    }
                    Some(Err(e)) => break e,
                    None => {
                        warn!(feed = %self.feed, "feed stream ended");
                        return WatchOutcome::StreamEnded;
                    }
                }
            };
            drop(stream);

            match budget.record_failure() {
                RetryDecision::Retry { attempt, cooldown } => {
                    self.status.set_retry_count(attempt);
                    warn!(
                        feed = %self.feed,
                        error = %failure,
                        retry_count = attempt,
                        "error listening for posts"
                    );
                    tokio::select! {
                        () = self.shutdown.cancelled() => return WatchOutcome::Shutdown,
                        () = tokio::time::sleep(cooldown) => {}
                    }
                }
                RetryDecision::Exhausted { attempts } => {
                    self.status.set_retry_count(attempts);
                    error!(
                        feed = %self.feed,
                        error = %failure,
                        attempts,
                        "max retries reached, watcher stopping"
                    );
                    self.ctx
                        .alerter
                        .alert(
                            &format!("Error listening for posts in {}", self.feed),
                            &format!("Max retries reached! Error: {failure}"),
                        )
                        .await;
                    return WatchOutcome::RetriesExhausted { attempts };
                }
            }
        }
    }

    /// The feed's checkpoint, or now when the feed has none.
    async fn start_time(&self) -> i64 {
        match self.ctx.checkpoints.get(&self.feed).await {
            0 => Utc::now().timestamp(),
            checkpoint => checkpoint,
        }
    }

    async fn handle(&mut self, post: Post, start_time: i64) {
        let verdict = if self.delivered.contains(&post.id) {
            Admission::Duplicate
        } else {
            admit(
                post.created_unix(),
                start_time,
                Utc::now().timestamp(),
                self.ctx.settings.max_post_age,
                self.shutdown.is_cancelled(),
            )
        };

        if verdict != Admission::Accept {
            debug!(feed = %self.feed, post = %post.id, ?verdict, "post skipped");
            return;
        }

        self.status.set_safe_to_stop(false);
        if !self.pending.iter().any(|p| p.id == post.id) {
            self.pending.push_back(post);
        }
        self.flush_pending().await;
        self.status.set_safe_to_stop(true);
    }

    /// Deliver pending posts oldest first, stopping at the first failure.
    async fn flush_pending(&mut self) {
        while let Some(post) = self.pending.front().cloned() {
            match self.dispatch(&post).await {
                Ok(_) => {
                    self.pending.pop_front();
                    self.delivered.insert(&post.id);
                    self.dispatch_alert.reset();
                    if let Err(e) = self
                        .ctx
                        .checkpoints
                        .update_and_persist(&self.feed, post.created_unix())
                        .await
                    {
                        error!(feed = %self.feed, error = %e, "failed to persist checkpoint");
                    }
                }
                Err(e) => {
                    error!(
                        feed = %self.feed,
                        post = %post.id,
                        pending = self.pending.len(),
                        error = %e,
                        "error sending notifications"
                    );
                    let body = format!("Error: {e}");
                    self.dispatch_alert
                        .fire(&self.ctx.alerter, "Error sending notifications", &body)
                        .await;
                    break;
                }
            }
        }
    }

    /// One post, with inline retries per the dispatch policy.
    async fn dispatch(&self, post: &Post) -> Result<usize, DispatchError> {
        let mut budget = self.ctx.settings.dispatch_policy.budget();
        loop {
            match self.ctx.dispatcher.notify(post).await {
                Ok(sent) => return Ok(sent),
                Err(e) => match budget.record_failure() {
                    RetryDecision::Retry { attempt, cooldown } => {
                        warn!(
                            feed = %self.feed,
                            post = %post.id,
                            attempt,
                            error = %e,
                            "dispatch failed, retrying"
                        );
                        tokio::time::sleep(cooldown).await;
                    }
                    RetryDecision::Exhausted { .. } => return Err(e),
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationEmail;
    use crate::test_support::{
        eventually, make_post, FlakyTransport, MemoryPreferences, RecordingMessenger,
        RecordingTransport,
        ScriptedSource, Step,
    };
    use crate::transport::MessageTransport;

    const MAX_AGE: Duration = Duration::from_secs(1800);

    struct Harness {
        ctx: Arc<WatchContext>,
        transport: Arc<RecordingTransport>,
        alerts: Arc<RecordingMessenger>,
        _dir: tempfile::TempDir,
    }

    async fn harness(
        source: ScriptedSource,
        checkpoint: &str,
        transport: Arc<dyn MessageTransport>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lastsubmission.txt");
        std::fs::write(&path, checkpoint).unwrap();

        let prefs = MemoryPreferences::default()
            .subscriber("programming", "alice", true, "alice@example.com")
            .subscriber("rust", "bob", true, "bob@example.com");
        let alert_transport = Arc::new(RecordingTransport::default());
        let alerts = Arc::new(RecordingMessenger::default());

        let ctx = Arc::new(WatchContext {
            source: Arc::new(source),
            dispatcher: Arc::new(Dispatcher::new(
                Arc::new(prefs),
                transport,
                NotificationEmail {
                    subject: "New Reddit Post Notification".to_string(),
                    footer: String::new(),
                    link_base: "https://www.reddit.com".to_string(),
                },
            )),
            checkpoints: Arc::new(CheckpointStore::load(&path).await.unwrap()),
            alerter: Arc::new(Alerter::new(
                alert_transport.clone(),
                alerts.clone(),
                "dev@example.com",
            )),
            settings: WatchSettings {
                max_post_age: MAX_AGE,
                stream_policy: RetryPolicy::new(5, Duration::from_millis(1)),
                dispatch_policy: RetryPolicy::new(1, Duration::ZERO),
            },
        });

        Harness {
            ctx,
            transport: alert_transport,
            alerts,
            _dir: dir,
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    // -- admission filter ----------------------------------------------------

    #[test]
    fn admits_fresh_post_after_start() {
        assert_eq!(admit(1_000, 900, 1_100, MAX_AGE, false), Admission::Accept);
    }

    #[test]
    fn rejects_post_at_or_before_start() {
        assert_eq!(admit(900, 900, 1_000, MAX_AGE, false), Admission::AlreadySeen);
        assert_eq!(admit(899, 900, 1_000, MAX_AGE, false), Admission::AlreadySeen);
    }

    #[test]
    fn rejects_stale_post_regardless_of_start() {
        assert_eq!(admit(1_000, 0, 1_000 + 1801, MAX_AGE, false), Admission::TooStale);
        assert_eq!(
            admit(1_000, 0, 1_000 + 1800, MAX_AGE, false),
            Admission::Accept,
            "exactly max age is allowed"
        );
    }

    #[test]
    fn rejects_everything_while_shutting_down() {
        assert_eq!(admit(1_000, 0, 1_000, MAX_AGE, true), Admission::ShuttingDown);
    }

    // -- status --------------------------------------------------------------

    #[test]
    fn status_starts_alive_and_safe() {
        let status = WatcherStatus::new();
        assert!(status.is_alive());
        assert!(status.is_safe_to_stop());
        assert_eq!(status.retry_count(), 0);
    }

    #[test]
    fn drop_guard_marks_stopped_and_safe() {
        let status = Arc::new(WatcherStatus::new());
        status.set_safe_to_stop(false);
        drop(StoppedOnDrop(Arc::clone(&status)));
        assert!(!status.is_alive());
        assert!(status.is_safe_to_stop());
    }

    // -- run loop ------------------------------------------------------------

    #[tokio::test]
    async fn checkpointed_feed_skips_old_post_and_delivers_new_one() {
        let created = now();
        let source = ScriptedSource::default().script(
            "programming",
            vec![
                Step::Post(make_post("programming", "old", 999_999_999)),
                Step::Post(make_post("programming", "new", created)),
            ],
        );
        let transport = Arc::new(RecordingTransport::default());
        let h = harness(source, "programming 1000000000\n", transport.clone()).await;
        let shutdown = CancellationToken::new();
        let handle = Watcher::new("programming", Arc::clone(&h.ctx), shutdown.clone()).spawn();

        let ctx = Arc::clone(&h.ctx);
        assert!(eventually(|| async { ctx.checkpoints.get("programming").await == created }).await);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1, "only the new post is dispatched");
        assert!(sent[0].body.contains("/r/programming/comments/new"));
        assert!(sent[0].recipients.contains("alice@example.com"));

        shutdown.cancel();
        assert_eq!(handle.task.await.unwrap(), WatchOutcome::Shutdown);
        assert!(!handle.status.is_alive());
    }

    #[tokio::test]
    async fn cold_start_ignores_history() {
        let source = ScriptedSource::default().script(
            "programming",
            vec![Step::Post(make_post("programming", "before-start", now() - 60))],
        );
        let transport = Arc::new(RecordingTransport::default());
        let h = harness(source, "", transport.clone()).await;
        let shutdown = CancellationToken::new();
        let handle = Watcher::new("programming", Arc::clone(&h.ctx), shutdown.clone()).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.task.await.unwrap();

        assert!(transport.sent().is_empty(), "posts before a cold start are never sent");
        assert_eq!(h.ctx.checkpoints.get("programming").await, 0);
    }

    #[tokio::test]
    async fn stale_posts_are_dropped() {
        let source = ScriptedSource::default().script(
            "programming",
            vec![Step::Post(make_post("programming", "stale", now() - 3600))],
        );
        let transport = Arc::new(RecordingTransport::default());
        let h = harness(source, "programming 1\n", transport.clone()).await;
        let shutdown = CancellationToken::new();
        let handle = Watcher::new("programming", Arc::clone(&h.ctx), shutdown.clone()).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.task.await.unwrap();

        assert!(transport.sent().is_empty());
        assert_eq!(h.ctx.checkpoints.get("programming").await, 1);
    }

    #[tokio::test]
    async fn failed_post_is_retried_before_later_post_on_next_pass() {
        let first = now() - 10;
        let second = now();
        let source = ScriptedSource::default().script(
            "programming",
            vec![
                Step::Post(make_post("programming", "first", first)),
                Step::Post(make_post("programming", "second", second)),
            ],
        );
        let transport = Arc::new(FlakyTransport::failing_first(1));
        let h = harness(source, "programming 1\n", transport.clone()).await;
        let shutdown = CancellationToken::new();
        let handle = Watcher::new("programming", Arc::clone(&h.ctx), shutdown.clone()).spawn();

        let ctx = Arc::clone(&h.ctx);
        assert!(eventually(|| async { ctx.checkpoints.get("programming").await == second }).await);

        let bodies: Vec<String> = transport.delivered().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].contains("comments/first"), "earlier post goes out first");
        assert!(bodies[1].contains("comments/second"));
        assert_eq!(h.alerts.messages().len(), 1, "one alert for the failure episode");

        shutdown.cancel();
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn repeated_dispatch_failures_alert_once_per_episode() {
        let source = ScriptedSource::default().script(
            "programming",
            vec![
                Step::Post(make_post("programming", "a", now() - 2)),
                Step::Post(make_post("programming", "b", now() - 1)),
                Step::Post(make_post("programming", "c", now())),
            ],
        );
        let transport = Arc::new(FlakyTransport::failing_first(u32::MAX));
        let h = harness(source, "programming 1\n", transport.clone()).await;
        let shutdown = CancellationToken::new();
        let handle = Watcher::new("programming", Arc::clone(&h.ctx), shutdown.clone()).spawn();

        let t = Arc::clone(&transport);
        assert!(eventually(|| async { t.attempts() >= 3 }).await);
        assert_eq!(h.alerts.messages().len(), 1);
        assert_eq!(
            h.ctx.checkpoints.get("programming").await,
            1,
            "nothing delivered, nothing advanced"
        );

        shutdown.cancel();
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn redelivered_post_after_resubscribe_is_not_resent() {
        let created = now();
        let post = make_post("programming", "same", created);
        let source = ScriptedSource::default()
            .script("programming", vec![Step::Post(post.clone()), Step::Fail("reset")])
            .script("programming", vec![Step::Post(post)]);
        let transport = Arc::new(RecordingTransport::default());
        let h = harness(source, "programming 1\n", transport.clone()).await;
        let shutdown = CancellationToken::new();
        let handle = Watcher::new("programming", Arc::clone(&h.ctx), shutdown.clone()).spawn();

        let status = Arc::clone(&handle.status);
        assert!(
            eventually(|| async { status.retry_count() == 0 && transport.sent().len() == 1 })
                .await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent().len(), 1);

        shutdown.cancel();
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn five_consecutive_stream_failures_stop_the_watcher() {
        let mut source = ScriptedSource::default();
        for _ in 0..5 {
            source = source.script("rust", vec![Step::Fail("connection reset")]);
        }
        let h = harness(source, "", Arc::new(RecordingTransport::default())).await;
        let handle = Watcher::new("rust", Arc::clone(&h.ctx), CancellationToken::new()).spawn();

        let outcome = handle.task.await.unwrap();

        assert_eq!(outcome, WatchOutcome::RetriesExhausted { attempts: 5 });
        assert!(!handle.status.is_alive());
        assert!(handle.status.is_safe_to_stop());
        assert_eq!(handle.status.retry_count(), 5);
        assert_eq!(h.transport.sent().len(), 1, "operator emailed once");
        assert_eq!(h.alerts.messages().len(), 1, "operator messaged once");
    }

    #[tokio::test]
    async fn a_received_post_resets_the_failure_count() {
        let mut source = ScriptedSource::default();
        for _ in 0..4 {
            source = source.script("rust", vec![Step::Fail("flaky")]);
        }
        source = source.script(
            "rust",
            vec![Step::Post(make_post("rust", "ok", 1)), Step::Fail("flaky")],
        );
        for _ in 0..4 {
            source = source.script("rust", vec![Step::Fail("flaky")]);
        }
        let h = harness(source, "", Arc::new(RecordingTransport::default())).await;
        let shutdown = CancellationToken::new();
        let handle = Watcher::new("rust", Arc::clone(&h.ctx), shutdown.clone()).spawn();

        // 4 failures, a post, then 5 more failures: only the last 5 count.
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WatchOutcome::RetriesExhausted { attempts: 5 });
    }

    #[tokio::test]
    async fn ended_stream_stops_the_watcher() {
        let source = ScriptedSource::default().ending().script("rust", vec![]);
        let h = harness(source, "", Arc::new(RecordingTransport::default())).await;
        let handle = Watcher::new("rust", Arc::clone(&h.ctx), CancellationToken::new()).spawn();

        assert_eq!(handle.task.await.unwrap(), WatchOutcome::StreamEnded);
        assert!(!handle.status.is_alive());
    }

    #[tokio::test]
    async fn shutdown_during_cooldown_returns_promptly() {
        let source = ScriptedSource::default().script("rust", vec![Step::Fail("down")]);
        let mut h = harness(source, "", Arc::new(RecordingTransport::default())).await;
        Arc::get_mut(&mut h.ctx).unwrap().settings.stream_policy =
            RetryPolicy::new(5, Duration::from_secs(3600));
        let shutdown = CancellationToken::new();
        let handle = Watcher::new("rust", Arc::clone(&h.ctx), shutdown.clone()).spawn();

        let status = Arc::clone(&handle.status);
        assert!(eventually(|| async { status.retry_count() == 1 }).await);
        shutdown.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Shutdown);
    }
}
