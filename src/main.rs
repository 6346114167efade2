//! feedwatch: watches subreddit feeds and emails subscribers about new posts.
//!
//! ## Architecture overview
//!
//! ```text
//!                      ┌───────────────┐  watched feeds  ┌───────────────┐
//!                      │ supervisor.rs │ ◄────────────── │ preferences   │
//!                      │  (lifecycle)  │                 │  (REST store) │
//!                      └───────┬───────┘                 └───────▲───────┘
//!                  spawn/cycle │ liveness poll                   │ subscribers
//!              ┌───────────────┼───────────────┐                 │
//!              ▼               ▼               ▼                 │
//!        ┌──────────┐    ┌──────────┐    ┌──────────┐  notify ┌───┴──────┐  send  ┌────────────┐
//!        │ watcher  │    │ watcher  │ …  │ watcher  │ ──────► │ notify   │ ─────► │ transport/ │
//!        │ (feed A) │    │ (feed B) │    │ (feed N) │         │(dispatch)│        │ smtp, hook │
//!        └────▲─────┘    └──────────┘    └────┬─────┘         └──────────┘        └────────────┘
//!             │ PostStream                    │ advance
//!        ┌────┴─────┐                   ┌─────▼──────┐
//!        │ source/  │                   │ checkpoint │
//!        │  (rss)   │                   │   (file)   │
//!        └──────────┘                   └────────────┘
//! ```
//!
//! * **`source/`**: the `FeedSource` trait and the polling RSS source.
//! * **`watcher`**: one task per feed. Admission filter, pending queue,
//!   stream retries.
//! * **`notify`**: resolves opted-in subscribers and sends one batched email.
//! * **`checkpoint`**: per-feed high-water marks, persisted atomically.
//! * **`supervisor`**: single-instance guard, liveness polling, restarts.
//! * **`marker`**: the running-marker file and the shutdown signal it drives.
//! * **`alert`**: best-effort operator alerts, once per failure episode.
//! * **`main`**: wires everything together: parse args, load config, set up
//!   logging, and run the supervisor.

mod alert;
mod checkpoint;
mod config;
mod marker;
mod notify;
mod preferences;
mod retry;
mod source;
mod supervisor;
mod transport;
mod watcher;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use alert::Alerter;
use config::{Config, Environment};
use marker::RunningMarker;
use notify::{Dispatcher, NotificationEmail};
use preferences::RestPreferences;
use source::RssSource;
use supervisor::{Collaborators, Supervisor, SupervisorOutcome, SupervisorSettings};
use transport::{SmtpTransport, WebhookMessenger};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "feedwatch.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    /// Run in development mode (clears a stale running marker on startup).
    #[arg(long)]
    dev: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "feedwatch=debug" } else { "feedwatch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn build_supervisor(config: &Config, shutdown: CancellationToken) -> Result<Supervisor> {
    let preferences =
        Arc::new(RestPreferences::new(&config.preferences).context("preferences client")?);
    let source = Arc::new(RssSource::new(&config.source).context("feed source")?);
    let smtp = Arc::new(SmtpTransport::new(&config.email).context("smtp transport")?);
    let webhook = Arc::new(
        WebhookMessenger::new(config.operator.webhook_url.clone()).context("webhook messenger")?,
    );

    let dispatcher = Arc::new(Dispatcher::new(
        preferences.clone(),
        smtp.clone(),
        NotificationEmail::from_config(&config.email),
    ));
    let alerter = Arc::new(Alerter::new(smtp, webhook, config.operator.email.clone()));

    Ok(Supervisor::new(
        SupervisorSettings::from_config(&config.daemon),
        Collaborators {
            preferences,
            source,
            dispatcher,
            alerter,
        },
        RunningMarker::new(&config.daemon.running_file),
        &config.daemon.checkpoint_file,
        shutdown,
    ))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // -- parse arguments and configuration -----------------------------------
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if cli.dev {
        config.daemon.environment = Environment::Development;
    }
    info!(
        config = %cli.config.display(),
        environment = ?config.daemon.environment,
        "configuration loaded"
    );

    // -- wire collaborators --------------------------------------------------
    let shutdown = CancellationToken::new();
    let supervisor = build_supervisor(&config, shutdown.clone())?;

    // -- ctrl-c: same path as removing the running marker --------------------
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, shutting down");
                interrupted.store(true, Ordering::SeqCst);
                shutdown.cancel();
            }
        });
    }

    // -- run -----------------------------------------------------------------
    let outcome = supervisor.run().await?;

    if interrupted.load(Ordering::SeqCst) && outcome != SupervisorOutcome::AlreadyRunning {
        if let Err(e) = supervisor.marker().remove().await {
            error!(error = %e, "could not remove running marker");
        }
    }

    Ok(match outcome {
        SupervisorOutcome::Shutdown => ExitCode::SUCCESS,
        SupervisorOutcome::AlreadyRunning | SupervisorOutcome::RestartsExhausted { .. } => {
            ExitCode::FAILURE
        }
    })
}
