//! Feed source abstraction layer.
//!
//! This module defines the [`FeedFetcher`] trait and the common
//! [`FeedItem`] type.  Concrete fetchers live in sub-modules (currently only
//! [`rss`]).
//!
//! ## For contributors: adding a new feed format
//!
//! 1. Create a new file in this directory (e.g. `atom.rs`).
//! 2. Define a struct (e.g. `AtomFeed`) and implement [`FeedFetcher`] for it.
//! 3. Add `mod atom;` below and re-export your struct in the `pub use` block.
//! 4. Construct an instance in `main.rs` and hand it to [`crate::job::Job`].
//!
//! The orchestrator, filters, and dedup cache are all format-agnostic.

mod feed_item;
mod rss;

// Re-export the public API of this module so callers can write
// `use crate::source::{FeedFetcher, FeedItem, RssFeed};`
pub use feed_item::FeedItem;
pub use rss::RssFeed;

use anyhow::Result;
use async_trait::async_trait;

/// Trait that every feed fetcher must implement.
///
/// The orchestrator calls [`fetch_feed()`](FeedFetcher::fetch_feed) from
/// several partition workers at once, so implementations must be
/// [`Send`] + [`Sync`].  The caller wraps each call in its own timeout.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Fetch and parse the feed at `url`, returning its downloadable items
    /// in feed order.
    async fn fetch_feed(&self, url: &str) -> Result<Vec<FeedItem>>;
}
