//! The post type shared by every feed source.
//!
//! `Post` is a single newly created entry in a watched feed. Every source
//! implementation converts its native format into `Post`s so the watcher,
//! dispatcher and checkpoint logic stay source-agnostic.
//!
//! ## For contributors
//!
//! If you are adding a new feed source you do **not** need to modify this file
//! unless your source carries extra fields the dispatcher needs. Just construct
//! `Post` values in your source's stream.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// A single post observed on a watched feed.
///
/// ## Ordering
///
/// `Post` implements [`Ord`] **chronologically**: older posts sort before
/// newer ones, which is the order sources deliver them in. Ties are broken by
/// id so the ordering stays total.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Post {
    /// Stable unique identifier, used to de-duplicate redeliveries.
    pub id: String,

    /// Link to the post. May be absolute or site-relative.
    pub permalink: String,

    /// Creation time reported by the upstream feed.
    pub created_at: DateTime<Utc>,

    /// Author name, when the source provides one.
    pub author: Option<String>,

    /// Name of the feed this post was observed on (e.g. `programming`).
    pub feed: String,
}

impl Post {
    /// Creation time as whole unix seconds, the unit checkpoints are kept in.
    pub fn created_unix(&self) -> i64 {
        self.created_at.timestamp()
    }
}

// ---------------------------------------------------------------------------
// Ordering: chronological, oldest first
// ---------------------------------------------------------------------------

impl Ord for Post {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Post {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
