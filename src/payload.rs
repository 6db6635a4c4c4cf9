//! Turning a candidate item into a [`ResultDescriptor`].
//!
//! Magnet links are wrapped as-is.  Anything else is downloaded and decoded
//! as torrent metainfo; bytes that are not a v1 torrent (an HTML error page,
//! a truncated download) are rejected before they reach the backend.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_bencode::value::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::descriptor::{PayloadMeta, ResultDescriptor, TorrentPayload};
use crate::source::FeedItem;

#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    /// Fetch and parse the resource behind `item`.
    async fn fetch_payload(&self, item: &FeedItem) -> Result<ResultDescriptor>;
}

pub struct HttpPayloadFetcher {
    client: reqwest::Client,
}

impl HttpPayloadFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PayloadFetcher for HttpPayloadFetcher {
    async fn fetch_payload(&self, item: &FeedItem) -> Result<ResultDescriptor> {
        if item.is_magnet() {
            return Ok(ResultDescriptor::magnet(&item.url));
        }

        let mut request = self.client.get(&item.url);
        if !item.content_type.is_empty() {
            request = request.header(CONTENT_TYPE, &item.content_type);
        }

        let response = request.send().await.context("request failed")?;
        if response.status() != StatusCode::OK {
            bail!("status code: {}", response.status());
        }

        let bytes = response.bytes().await.context("read body failed")?;
        parse_payload(bytes.to_vec(), &item.content_type)
    }
}

/// Decode raw bytes as torrent metainfo and attach metadata.
pub fn parse_payload(bytes: Vec<u8>, content_type: &str) -> Result<ResultDescriptor> {
    let root: Value = serde_bencode::from_bytes(&bytes).with_context(|| {
        let preview = String::from_utf8_lossy(&bytes[..bytes.len().min(64)]).into_owned();
        format!("not a bencoded torrent file, starts with {preview:?}")
    })?;
    let Value::Dict(root) = root else {
        bail!("torrent metainfo is not a dictionary");
    };
    let Some(info) = root.get(b"info".as_slice()) else {
        bail!("torrent metainfo has no info dictionary");
    };
    let name = check_info(info)?;

    // Canonical bencode sorts keys, so re-encoding reproduces the original
    // info bytes.
    let info_bytes = serde_bencode::to_bytes(info).context("failed to re-encode info dictionary")?;

    let meta = PayloadMeta {
        content_type: content_type.to_string(),
        len: bytes.len(),
        sha256: hex::encode(Sha256::digest(&bytes)),
        name,
        info_hash: hex::encode(Sha1::digest(&info_bytes)),
    };

    Ok(ResultDescriptor::Payload(TorrentPayload { bytes, meta }))
}

/// Check the fields every v1 info dictionary needs and return its name.
fn check_info(info: &Value) -> Result<String> {
    let Value::Dict(fields) = info else {
        bail!("info is not a dictionary");
    };

    let name = match fields.get(b"name".as_slice()) {
        Some(Value::Bytes(name)) if !name.is_empty() => String::from_utf8_lossy(name).into_owned(),
        _ => bail!("info dictionary has no name"),
    };
    if !matches!(fields.get(b"piece length".as_slice()), Some(Value::Int(n)) if *n > 0) {
        bail!("info dictionary has no piece length");
    }
    match fields.get(b"pieces".as_slice()) {
        Some(Value::Bytes(pieces)) if !pieces.is_empty() && pieces.len() % 20 == 0 => {}
        _ => bail!("info dictionary has no piece hashes"),
    }
    if !fields.contains_key(b"length".as_slice()) && !fields.contains_key(b"files".as_slice()) {
        bail!("info dictionary lists neither length nor files");
    }

    Ok(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
