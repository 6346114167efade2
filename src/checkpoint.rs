//! Durable per-feed low-water marks.
//!
//! The checkpoint file is line oriented, one `"<feed> <unix_seconds>"` pair
//! per line, and is rewritten in full on every update. All watchers share one
//! [`CheckpointStore`]; a single async mutex serialises the whole
//! update-then-write sequence, which is plenty for one write per accepted
//! post.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint file {path} line {line}: expected `<feed> <timestamp>`, got {content:?}")]
    Malformed {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

/// Shared, synchronised feed → last-processed-timestamp mapping.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, i64>>,
}

impl CheckpointStore {
    /// Load the store from `path`, creating an empty file first if none exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        match tokio::fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => {
                info!(path = %path.display(), "no checkpoint file, starting empty");
                tokio::fs::write(&path, "")
                    .await
                    .map_err(|source| io_error(&path, source))?;
            }
            Err(source) => return Err(io_error(&path, source)),
        }
        Self::load(path).await
    }

    /// Load the store from an existing file. Missing or malformed files fail.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| io_error(&path, source))?;
        let entries = parse(&contents, &path)?;
        debug!(path = %path.display(), feeds = entries.len(), "loaded checkpoints");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Last processed timestamp for `feed`, or 0 when none is recorded.
    pub async fn get(&self, feed: &str) -> i64 {
        self.entries.lock().await.get(feed).copied().unwrap_or(0)
    }

    /// Copy of every recorded checkpoint.
    pub async fn snapshot(&self) -> BTreeMap<String, i64> {
        self.entries.lock().await.clone()
    }

    /// Advance `feed` to `timestamp` and rewrite the file.
    ///
    /// Checkpoints never move backwards: a timestamp at or below the current
    /// value is ignored and `Ok(false)` is returned without touching disk.
    pub async fn update_and_persist(
        &self,
        feed: &str,
        timestamp: i64,
    ) -> Result<bool, CheckpointError> {
        let mut entries = self.entries.lock().await;
        let current = entries.get(feed).copied().unwrap_or(0);
        if timestamp <= current {
            debug!(feed, timestamp, current, "checkpoint not advanced");
            return Ok(false);
        }
        entries.insert(feed.to_string(), timestamp);

        let rendered = render(&entries);
        write_atomically(&self.path, &rendered).await?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(path: &Path, source: io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parse(contents: &str, path: &Path) -> Result<BTreeMap<String, i64>, CheckpointError> {
    let mut entries = BTreeMap::new();
    for (index, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let malformed = || CheckpointError::Malformed {
            path: path.to_path_buf(),
            line: index + 1,
            content: line.to_string(),
        };
        let mut fields = trimmed.split_whitespace();
        let (Some(feed), Some(timestamp), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed());
        };
        let timestamp: i64 = timestamp.parse().map_err(|_| malformed())?;
        entries.insert(feed.to_string(), timestamp);
    }
    Ok(entries)
}

fn render(entries: &BTreeMap<String, i64>) -> String {
    entries
        .iter()
        .map(|(feed, timestamp)| format!("{feed} {timestamp}\n"))
        .collect()
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomically(path: &Path, contents: &str) -> Result<(), CheckpointError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|source| io_error(&tmp, source))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| io_error(path, source))
}
