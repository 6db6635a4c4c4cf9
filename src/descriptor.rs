//! What gets handed to the download backend for one item.
//!
//! A [`ResultDescriptor`] is either a fetched torrent file or a magnet link.
//! The backend and the dedup cache both accept either variant.
//!
//! Encoded records carry an explicit `kind` tag.  Records written before the
//! tag existed are still readable: the full-payload shape is tried first,
//! then the bare magnet string.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Metadata recorded alongside a fetched payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMeta {
    /// Content type the feed announced for the resource.
    #[serde(default)]
    pub content_type: String,
    pub len: usize,
    /// Hex-encoded SHA-256 of the raw bytes.
    pub sha256: String,
    /// `name` from the info dictionary.  Empty in records written before it
    /// was tracked.
    #[serde(default)]
    pub name: String,
    /// Hex-encoded BitTorrent v1 info-hash.
    #[serde(default)]
    pub info_hash: String,
}

/// A fetched and validated torrent file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentPayload {
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    pub meta: PayloadMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultDescriptor {
    /// Raw torrent bytes plus parsed metadata.
    Payload(TorrentPayload),
    /// A magnet link that needs no separate fetch.
    Magnet { link: String },
}

/// Shapes written before records were tagged.  Order matters.
#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyRecord {
    Payload(TorrentPayload),
    Magnet(String),
}

impl ResultDescriptor {
    pub fn magnet(link: impl Into<String>) -> Self {
        ResultDescriptor::Magnet { link: link.into() }
    }

    /// Short human-readable form for log lines.
    pub fn summary(&self) -> String {
        match self {
            ResultDescriptor::Payload(p) if p.meta.name.is_empty() => {
                format!("torrent {} bytes", p.meta.len)
            }
            ResultDescriptor::Payload(p) => {
                format!("torrent {} ({} bytes, {})", p.meta.name, p.meta.len, p.meta.info_hash)
            }
            ResultDescriptor::Magnet { link } => {
                let end = link.char_indices().nth(60).map_or(link.len(), |(i, _)| i);
                format!("magnet {}", &link[..end])
            }
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a stored record, falling back to the untagged legacy shapes.
    pub fn decode(data: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<Self>(data) {
            Ok(descriptor) => Ok(descriptor),
            Err(tagged_err) => match serde_json::from_str::<LegacyRecord>(data) {
                Ok(LegacyRecord::Payload(p)) => Ok(ResultDescriptor::Payload(p)),
                Ok(LegacyRecord::Magnet(link)) => Ok(ResultDescriptor::Magnet { link }),
                Err(_) => Err(tagged_err),
            },
        }
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
