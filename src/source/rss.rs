//! Feed fetcher.
//!
//! Fetches a feed over HTTP and turns every entry that carries an enclosure
//! into a [`FeedItem`].  Entries without an enclosure have nothing to
//! download and are skipped.
//!
//! RSS 2.0 is read with the `rss` crate.  A body that is not RSS is handed
//! to `feed-rs`, which covers Atom and JSON Feed; there the enclosure is the
//! link with `rel="enclosure"`, or failing that the first media content.
//!
//! Keep the HTTP part in [`FeedFetcher::fetch_feed`] and the pure conversion
//! in associated functions that tests can call directly.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed};

use super::{FeedFetcher, FeedItem};

/// Fetches RSS, Atom and JSON feeds with a shared [`reqwest::Client`].
pub struct RssFeed {
    client: reqwest::Client,
}

impl RssFeed {
    /// Create a fetcher on top of an existing HTTP client.
    ///
    /// The client's own timeout is only a backstop; the orchestrator applies
    /// the configured per-call ceiling.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Parse a fetched body, trying RSS 2.0 first.
    pub fn parse_body(body: &[u8]) -> Result<Vec<FeedItem>> {
        match rss::Channel::read_from(body) {
            Ok(channel) => Ok(Self::parse_channel(&channel)),
            Err(rss_err) => {
                let feed = feed_rs::parser::parse(body)
                    .map_err(|e| anyhow!("not an RSS, Atom or JSON feed: {e} (as RSS: {rss_err})"))?;
                Ok(Self::parse_entries(&feed))
            }
        }
    }

    /// Parse an already-fetched [`rss::Channel`] into [`FeedItem`]s.
    ///
    /// This is a pure function (no I/O) so that tests can exercise the
    /// parsing logic without hitting the network.  Feed order is preserved.
    pub fn parse_channel(channel: &rss::Channel) -> Vec<FeedItem> {
        channel
            .items()
            .iter()
            .filter_map(|item| {
                let enclosure = item.enclosure()?;

                // Parse RFC-2822 date; gracefully degrade to None on failure.
                let published = item
                    .pub_date()
                    .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                    .map(|dt| dt.with_timezone(&Utc));

                Some(FeedItem {
                    title: item.title().unwrap_or_default().to_string(),
                    content_type: enclosure.mime_type().to_string(),
                    url: enclosure.url().to_string(),
                    description: item.description().map(String::from),
                    published,
                })
            })
            .collect()
    }

    /// Parse an Atom or JSON feed decoded by `feed-rs`.  Feed order is
    /// preserved; the publish date falls back to the update date.
    pub fn parse_entries(feed: &Feed) -> Vec<FeedItem> {
        feed.entries
            .iter()
            .filter_map(|entry| {
                let (url, content_type) = enclosure(entry)?;
                Some(FeedItem {
                    title: entry
                        .title
                        .as_ref()
                        .map(|t| t.content.clone())
                        .unwrap_or_default(),
                    content_type,
                    url,
                    description: entry.summary.as_ref().map(|t| t.content.clone()),
                    published: entry.published.or(entry.updated),
                })
            })
            .collect()
    }
}

/// `(url, content type)` of an entry's downloadable resource.
fn enclosure(entry: &Entry) -> Option<(String, String)> {
    if let Some(link) = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("enclosure"))
    {
        return Some((link.href.clone(), link.media_type.clone().unwrap_or_default()));
    }

    entry
        .media
        .iter()
        .flat_map(|media| media.content.iter())
        .find_map(|content| {
            let url = content.url.as_ref()?;
            let content_type = content
                .content_type
                .as_ref()
                .map(|mime| mime.to_string())
                .unwrap_or_default();
            Some((url.to_string(), content_type))
        })
}

#[async_trait]
impl FeedFetcher for RssFeed {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<FeedItem>> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {status} when fetching {url}");
        }

        let body = response.bytes().await?;
        Self::parse_body(&body)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
