//! The candidate item discovered in a feed during one poll cycle.
//!
//! `FeedItem` is what every [`FeedFetcher`](super::FeedFetcher)
//! implementation produces.  It lives only for the duration of a cycle: the
//! orchestrator runs it through the filter gates, the dedup cache, and then
//! either drops it or turns it into a [`ResultDescriptor`] for submission.
//!
//! [`ResultDescriptor`]: crate::descriptor::ResultDescriptor

use chrono::{DateTime, Utc};

/// Magnet links carry everything the backend needs; no payload fetch.
const MAGNET_PREFIX: &str = "magnet:?xt=";

/// A single downloadable entry found in a source's feed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FeedItem {
    /// Headline, matched against the source's include/exclude patterns.
    pub title: String,

    /// MIME type announced by the feed for the resource (may be empty).
    pub content_type: String,

    /// Location of the downloadable resource.  Also the dedup key.
    pub url: String,

    /// Optional longer description text.
    pub description: Option<String>,

    /// Publication timestamp.
    ///
    /// `None` means the feed did not provide a parseable date; such items
    /// never pass a configured `download_after` threshold.
    pub published: Option<DateTime<Utc>>,
}

impl FeedItem {
    /// Whether the resource is a magnet link rather than a fetchable file.
    pub fn is_magnet(&self) -> bool {
        self.url.starts_with(MAGNET_PREFIX)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
