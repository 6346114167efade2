//! The running marker.
//!
//! A file whose *presence* means "this instance owns the feeds". It is
//! created at startup with the pid inside, refused when already present, and
//! its removal by an operator is the signal to stop watching. Inside the
//! process the signal is a [`CancellationToken`]; [`RunningMarker::watch`]
//! bridges the two.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
#[error("running marker {path}: {source}")]
pub struct MarkerError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

#[derive(Debug, Clone)]
pub struct RunningMarker {
    path: PathBuf,
}

impl RunningMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, source: io::Error) -> MarkerError {
        MarkerError {
            path: self.path.clone(),
            source,
        }
    }

    pub async fn exists(&self) -> Result<bool, MarkerError> {
        tokio::fs::try_exists(&self.path).await.map_err(|e| self.error(e))
    }

    /// Create the marker, recording this process's id.
    ///
    /// Returns `false`, leaving the file untouched, when a marker already
    /// exists. Creation is exclusive, so two racing starts cannot both win.
    pub async fn create(&self) -> Result<bool, MarkerError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(self.error(e)),
        };
        file.write_all(std::process::id().to_string().as_bytes())
            .await
            .map_err(|e| self.error(e))?;
        file.flush().await.map_err(|e| self.error(e))?;
        info!(path = %self.path.display(), "running marker created");
        Ok(true)
    }

    /// Remove the marker. Removing an absent marker is not an error.
    pub async fn remove(&self) -> Result<(), MarkerError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "running marker removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(e)),
        }
    }

    /// Cancel `shutdown` once the marker disappears, checking every `interval`.
    ///
    /// An error reading the marker counts as still present.
    pub fn watch(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let marker = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                match marker.exists().await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(path = %marker.path.display(), "running marker gone, shutting down");
                        shutdown.cancel();
                        return;
                    }
                    Err(e) => debug!(error = %e, "could not check running marker"),
                }
            }
        })
    }
}
