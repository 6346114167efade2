//! Process lifecycle.
//!
//! The supervisor owns everything that happens once per process:
//!
//! 1. Fetch the feed list. An unreachable preferences store alerts the
//!    operator and continues with no feeds unless `require-feeds` is set.
//! 2. Refuse to start when another instance holds the running marker. In
//!    development a leftover marker is removed first.
//! 3. Create the marker and load checkpoints.
//! 4. Run *cycles*: spawn one watcher per feed, poll their liveness, and on
//!    a dead watcher alert once and restart the whole cycle, within the
//!    restart budget.
//! 5. Before a restart or exit, wait a bounded number of polls for every
//!    live watcher to reach a safe point, then cancel the cycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::Alerter;
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::{DaemonConfig, Environment};
use crate::marker::{MarkerError, RunningMarker};
use crate::notify::Dispatcher;
use crate::preferences::PreferencesStore;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::source::FeedSource;
use crate::watcher::{WatchContext, WatchSettings, Watcher, WatcherHandle};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error("no feeds to watch: {0}")]
    NoFeeds(String),
}

/// How the supervisor finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// Another instance holds the running marker; nothing was started.
    AlreadyRunning,
    /// The running marker went away (or shutdown was requested).
    Shutdown,
    /// Watchers kept dying until the restart budget ran out.
    RestartsExhausted { cycles: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub environment: Environment,
    pub restart_policy: RetryPolicy,
    pub liveness_poll: Duration,
    pub exit_wait_polls: u32,
    pub exit_wait_interval: Duration,
    pub marker_poll: Duration,
    pub require_feeds: bool,
    pub watch: WatchSettings,
}

impl SupervisorSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            environment: config.environment,
            restart_policy: config.restart_policy(),
            liveness_poll: config.liveness_poll(),
            exit_wait_polls: config.exit_wait_polls,
            exit_wait_interval: config.exit_wait_interval(),
            marker_poll: config.marker_poll(),
            require_feeds: config.require_feeds,
            watch: WatchSettings {
                max_post_age: config.max_post_age(),
                stream_policy: config.stream_policy(),
                dispatch_policy: config.dispatch_policy(),
            },
        }
    }
}

/// External collaborators the supervisor hands to its watchers.
pub struct Collaborators {
    pub preferences: Arc<dyn PreferencesStore>,
    pub source: Arc<dyn FeedSource>,
    pub dispatcher: Arc<Dispatcher>,
    pub alerter: Arc<Alerter>,
}

enum CycleEnd {
    Shutdown,
    WatcherDied,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    deps: Collaborators,
    marker: RunningMarker,
    checkpoint_path: PathBuf,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        deps: Collaborators,
        marker: RunningMarker,
        checkpoint_path: impl Into<PathBuf>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            deps,
            marker,
            checkpoint_path: checkpoint_path.into(),
            shutdown,
        }
    }

    pub async fn run(&self) -> Result<SupervisorOutcome, SupervisorError> {
        info!("start");
        let feeds = self.watched_feeds().await?;

        if self.settings.environment == Environment::Development && self.marker.exists().await? {
            self.marker.remove().await?;
            info!("development mode, stale running marker removed");
        }
        if !self.marker.create().await? {
            error!(path = %self.marker.path().display(), "already running, will not start");
            return Ok(SupervisorOutcome::AlreadyRunning);
        }

        let checkpoints = match CheckpointStore::open(&self.checkpoint_path).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                if let Err(marker_err) = self.marker.remove().await {
                    warn!(error = %marker_err, "could not remove running marker");
                }
                return Err(e.into());
            }
        };
        let known = checkpoints.snapshot().await.len();
        info!(path = %checkpoints.path().display(), feeds = known, "checkpoints loaded");
        let ctx = Arc::new(WatchContext {
            source: Arc::clone(&self.deps.source),
            dispatcher: Arc::clone(&self.deps.dispatcher),
            checkpoints,
            alerter: Arc::clone(&self.deps.alerter),
            settings: self.settings.watch,
        });
        let marker_watch = self.marker.watch(self.settings.marker_poll, self.shutdown.clone());

        let mut restarts = self.settings.restart_policy.budget();
        let mut cycle_number = 1;
        let outcome = loop {
            let cycle = self.shutdown.child_token();
            let watchers: Vec<WatcherHandle> = feeds
                .iter()
                .map(|feed| Watcher::new(feed.clone(), Arc::clone(&ctx), cycle.clone()).spawn())
                .collect();
            info!(cycle = cycle_number, watchers = watchers.len(), "watchers started");

            let end = self.monitor(&watchers).await;
            self.wait_until_safe(&watchers).await;
            cycle.cancel();
            self.join(watchers).await;

            match end {
                CycleEnd::Shutdown => break SupervisorOutcome::Shutdown,
                CycleEnd::WatcherDied => match restarts.record_failure() {
                    RetryDecision::Retry { attempt, .. } => {
                        cycle_number += 1;
                        info!(attempt, "attempting restart");
                        self.deps
                            .alerter
                            .alert(
                                "Feed watcher restarted main loop",
                                &format!("Restart attempt number {attempt}"),
                            )
                            .await;
                    }
                    RetryDecision::Exhausted { attempts } => {
                        error!(cycles = attempts, "restart attempts exhausted, exiting");
                        break SupervisorOutcome::RestartsExhausted { cycles: attempts };
                    }
                },
            }
        };

        marker_watch.abort();
        info!(?outcome, "end");
        Ok(outcome)
    }

    pub fn marker(&self) -> &RunningMarker {
        &self.marker
    }

    async fn watched_feeds(&self) -> Result<Vec<String>, SupervisorError> {
        let feeds = match self.deps.preferences.watched_feeds().await {
            Ok(feeds) => feeds,
            Err(e) => {
                error!(error = %e, "could not load watched feeds");
                self.deps
                    .alerter
                    .alert("Could not load watched feeds", "Try to restart it manually.")
                    .await;
                if self.settings.require_feeds {
                    return Err(SupervisorError::NoFeeds(e.to_string()));
                }
                Vec::new()
            }
        };

        let mut unique: Vec<String> = Vec::with_capacity(feeds.len());
        for feed in feeds {
            if !unique.contains(&feed) {
                unique.push(feed);
            }
        }
        if unique.is_empty() {
            if self.settings.require_feeds {
                return Err(SupervisorError::NoFeeds("feed list is empty".to_string()));
            }
            warn!("no feeds to watch, idling until shutdown");
        }
        info!(feeds = ?unique, "watched feeds loaded");
        Ok(unique)
    }

    /// Poll until shutdown or until some watcher is found dead.
    async fn monitor(&self, watchers: &[WatcherHandle]) -> CycleEnd {
        loop {
            if self.shutdown.is_cancelled() {
                return CycleEnd::Shutdown;
            }

            let dead: Vec<&str> = watchers
                .iter()
                .filter(|w| !w.is_alive())
                .map(|w| w.feed.as_str())
                .collect();
            if !dead.is_empty() {
                warn!(?dead, "watcher unexpectedly dead, attempting restart");
                self.deps
                    .alerter
                    .alert(
                        "Feed watcher dead",
                        &format!(
                            "Watcher for {} is unexpectedly dead. Attempting restart.",
                            dead.join(", ")
                        ),
                    )
                    .await;
                return CycleEnd::WatcherDied;
            }

            let retrying = watchers.iter().filter(|w| w.status.retry_count() > 0).count();
            debug!(watchers = watchers.len(), retrying, "running marker present, waiting");
            tokio::select! {
                () = self.shutdown.cancelled() => {}
                () = tokio::time::sleep(self.settings.liveness_poll) => {}
            }
        }
    }

    /// Wait for every live watcher to be safe to stop, for at most
    /// `exit_wait_polls` polls. Returns `false` if the bound was hit.
    async fn wait_until_safe(&self, watchers: &[WatcherHandle]) -> bool {
        let mut polls = 0;
        loop {
            let busy = watchers
                .iter()
                .filter(|w| w.is_alive() && !w.is_safe_to_stop())
                .count();
            if busy == 0 {
                return true;
            }
            if polls >= self.settings.exit_wait_polls {
                warn!(busy, "max wait count hit, stopping before all watchers are idle");
                return false;
            }
            polls += 1;
            info!(busy, polls, "waiting for watchers to reach a safe point");
            tokio::time::sleep(self.settings.exit_wait_interval).await;
        }
    }

    /// Collect cancelled watchers, aborting any that do not stop in time.
    async fn join(&self, watchers: Vec<WatcherHandle>) {
        for mut watcher in watchers {
            match tokio::time::timeout(self.settings.exit_wait_interval, &mut watcher.task).await {
                Ok(Ok(outcome)) => debug!(feed = %watcher.feed, ?outcome, "watcher finished"),
                Ok(Err(e)) => error!(feed = %watcher.feed, error = %e, "watcher task failed"),
                Err(_) => {
                    warn!(feed = %watcher.feed, "watcher did not stop in time, aborting");
                    watcher.task.abort();
                }
            }
        }
    }
}
