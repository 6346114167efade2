//! Daemon configuration.
//!
//! Loaded once at startup from a TOML file (default `feedwatch.toml`). A
//! missing or invalid file is fatal: nothing is watched until the operator
//! fixes it.
//!
//! ```toml
//! [daemon]
//! environment = "production"
//!
//! [source]
//! url-template = "https://example.com/r/{feed}/new.rss"
//!
//! [preferences]
//! base-uri = "https://my-project.firebaseio.com"
//!
//! [email]
//! server = "smtp.gmail.com"
//! username = "bot@example.com"
//! password = "app-password"
//! from = "bot@example.com"
//!
//! [operator]
//! email = "dev@example.com"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Errors raised while loading configuration. All of them stop startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("`{0}` must not be empty")]
    Missing(&'static str),

    #[error("source url-template must contain `{{feed}}`, got {0:?}")]
    UrlTemplate(String),
}

/// Which kind of deployment this process is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    /// Local development: a stale running marker is removed on startup.
    Development,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    pub source: SourceConfig,
    pub preferences: PreferencesConfig,
    pub email: EmailConfig,
    pub operator: OperatorConfig,
}

/// Process lifecycle, checkpoint and timing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DaemonConfig {
    pub environment: Environment,
    pub checkpoint_file: PathBuf,
    pub running_file: PathBuf,
    /// Posts older than this (relative to now) are never dispatched.
    pub max_post_age_secs: u64,
    pub stream_retries: u32,
    pub stream_cooldown_secs: u64,
    pub restart_attempts: u32,
    pub liveness_poll_secs: u64,
    pub exit_wait_polls: u32,
    pub exit_wait_interval_secs: u64,
    pub marker_poll_secs: u64,
    /// Attempts per post within one processing pass; 1 disables inline retry.
    pub dispatch_attempts: u32,
    pub dispatch_cooldown_secs: u64,
    /// Treat an unavailable or empty feed list as a fatal startup error.
    pub require_feeds: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Production,
            checkpoint_file: PathBuf::from("lastsubmission.txt"),
            running_file: PathBuf::from("feedwatch.running"),
            max_post_age_secs: 1800,
            stream_retries: 5,
            stream_cooldown_secs: 60,
            restart_attempts: 5,
            liveness_poll_secs: 60,
            exit_wait_polls: 10,
            exit_wait_interval_secs: 5,
            marker_poll_secs: 5,
            dispatch_attempts: 1,
            dispatch_cooldown_secs: 5,
            require_feeds: false,
        }
    }
}

impl DaemonConfig {
    pub fn stream_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.stream_retries,
            Duration::from_secs(self.stream_cooldown_secs),
        )
    }

    pub fn dispatch_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.dispatch_attempts,
            Duration::from_secs(self.dispatch_cooldown_secs),
        )
    }

    /// Budget of watcher deaths: `restart-attempts` restarts, then the death
    /// of the last cycle ends the process. No cooldown; the exit wait spaces
    /// cycles.
    pub fn restart_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.restart_attempts.saturating_add(1), Duration::ZERO)
    }

    pub fn max_post_age(&self) -> Duration {
        Duration::from_secs(self.max_post_age_secs)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_secs(self.liveness_poll_secs)
    }

    pub fn exit_wait_interval(&self) -> Duration {
        Duration::from_secs(self.exit_wait_interval_secs)
    }

    pub fn marker_poll(&self) -> Duration {
        Duration::from_secs(self.marker_poll_secs)
    }
}

/// Upstream feed polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceConfig {
    /// Feed URL with a `{feed}` placeholder for the feed name.
    pub url_template: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

/// Where subscriber preferences are read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PreferencesConfig {
    pub base_uri: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

/// Outbound SMTP settings and the notification email layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EmailConfig {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_footer")]
    pub footer: String,
    /// Prefix for site-relative permalinks.
    #[serde(default = "default_link_base")]
    pub link_base: String,
}

/// Who gets told when something goes wrong.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OperatorConfig {
    pub email: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("feedwatch/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_smtp_port() -> u16 {
    465
}

fn default_subject() -> String {
    "New Reddit Post Notification".to_string()
}

fn default_footer() -> String {
    "Manage your notification preferences in the web app.".to_string()
}

fn default_link_base() -> String {
    "https://www.reddit.com".to_string()
}

impl Config {
    /// Load and validate the config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("source.url-template", &self.source.url_template),
            ("preferences.base-uri", &self.preferences.base_uri),
            ("email.server", &self.email.server),
            ("email.username", &self.email.username),
            ("email.from", &self.email.from),
            ("operator.email", &self.operator.email),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(key));
            }
        }
        if !self.source.url_template.contains("{feed}") {
            return Err(ConfigError::UrlTemplate(self.source.url_template.clone()));
        }
        Ok(())
    }
}
