//! Feed source abstraction layer.
//!
//! This module defines the [`FeedSource`] trait and the common [`Post`] type.
//! Concrete source implementations live in sub-modules (currently only
//! [`rss`]).
//!
//! ## For contributors: adding a new source
//!
//! 1. Create a new file in this directory (e.g. `reddit_json.rs`).
//! 2. Define a struct and implement [`FeedSource`] for it.
//! 3. Add `mod reddit_json;` below and re-export your struct.
//! 4. Construct it in `main.rs` instead of (or next to) [`RssSource`].
//!
//! The watcher, dispatcher and checkpoint store are all source-agnostic.

mod post;
mod recent;
mod rss;

pub use post::Post;
pub(crate) use recent::RecentIds;
pub use rss::RssSource;

use futures::stream::BoxStream;
use thiserror::Error;

/// A lazy, never-ending sequence of posts for one feed.
///
/// Pulling the next item may suspend for as long as the upstream has nothing
/// new to say. An `Err` item is a stream failure: the consumer is expected to
/// drop the stream, cool down, and subscribe again.
pub type PostStream = BoxStream<'static, Result<Post, SourceError>>;

/// Failure pulling posts from the upstream feed. Always treated as transient.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not parse feed at {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ::rss::Error,
    },

    #[error("{0}")]
    Other(String),
}

/// Trait that every feed source must implement.
///
/// The watcher calls [`subscribe()`](FeedSource::subscribe) once per stream
/// attempt from its own task, so implementations must be [`Send`] + [`Sync`].
pub trait FeedSource: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Open a stream of posts for `feed`.
    ///
    /// The stream yields posts in the order the upstream delivers them. It
    /// does not reconnect on its own after yielding an error.
    fn subscribe(&self, feed: &str) -> PostStream;
}
