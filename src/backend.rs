//! Download backend: hands descriptors to a Transmission daemon.
//!
//! Transmission's RPC protects itself against CSRF with a session id.  The
//! first request answers `409 Conflict` with the id in a header; we remember
//! it and retry once.  The id changes when the daemon restarts, which the
//! same dance handles transparently.

use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::descriptor::ResultDescriptor;

const SESSION_HEADER: &str = "X-Transmission-Session-Id";

#[async_trait]
pub trait Submitter: Send + Sync {
    /// Queue `descriptor` for download into `download_dir`.
    async fn submit(
        &self,
        descriptor: &ResultDescriptor,
        download_dir: &str,
        labels: &[String],
    ) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    result: String,
}

pub struct TransmissionClient {
    client: reqwest::Client,
    endpoint: Url,
    username: Option<String>,
    password: Option<String>,
    session_id: Mutex<Option<String>>,
}

impl TransmissionClient {
    /// Credentials embedded in `rpc_url` are used for basic auth and
    /// stripped from the request URL.
    pub fn new(client: reqwest::Client, rpc_url: &str) -> Result<Self> {
        let mut endpoint = Url::parse(rpc_url).with_context(|| format!("invalid rpc url {rpc_url}"))?;

        let username = Some(endpoint.username().to_string()).filter(|u| !u.is_empty());
        let password = endpoint.password().map(String::from);
        // Only fails for cannot-be-a-base URLs, which reqwest rejects anyway.
        let _ = endpoint.set_username("");
        let _ = endpoint.set_password(None);

        Ok(Self {
            client,
            endpoint,
            username,
            password,
            session_id: Mutex::new(None),
        })
    }

    /// Round-trip a `session-get` to prove the daemon is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.call(&json!({ "method": "session-get" })).await
    }

    async fn call(&self, body: &Value) -> Result<()> {
        for _ in 0..2 {
            let mut request = self.client.post(self.endpoint.clone()).json(body);
            if let Some(id) = self.current_session()? {
                request = request.header(SESSION_HEADER, id);
            }
            if let Some(user) = &self.username {
                request = request.basic_auth(user, self.password.as_deref());
            }

            let response = request.send().await.context("rpc request failed")?;

            if response.status() == StatusCode::CONFLICT {
                let id = response
                    .headers()
                    .get(SESSION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| anyhow!("409 without {SESSION_HEADER} header"))?
                    .to_string();
                debug!("refreshed transmission session id");
                *self.session_lock()? = Some(id);
                continue;
            }

            if !response.status().is_success() {
                bail!("rpc returned HTTP {}", response.status());
            }

            let reply: RpcReply = response.json().await.context("invalid rpc reply")?;
            if reply.result != "success" {
                bail!("rpc failed: {}", reply.result);
            }
            return Ok(());
        }

        bail!("transmission rejected the session id twice")
    }

    fn current_session(&self) -> Result<Option<String>> {
        Ok(self.session_lock()?.clone())
    }

    fn session_lock(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>> {
        self.session_id
            .lock()
            .map_err(|_| anyhow!("session id lock poisoned"))
    }
}

#[async_trait]
impl Submitter for TransmissionClient {
    async fn submit(
        &self,
        descriptor: &ResultDescriptor,
        download_dir: &str,
        labels: &[String],
    ) -> Result<()> {
        self.call(&torrent_add_request(descriptor, download_dir, labels))
            .await
    }
}

/// Build the `torrent-add` request body for either descriptor variant.
fn torrent_add_request(
    descriptor: &ResultDescriptor,
    download_dir: &str,
    labels: &[String],
) -> Value {
    let mut arguments = json!({ "download-dir": download_dir });
    if !labels.is_empty() {
        arguments["labels"] = json!(labels);
    }
    match descriptor {
        ResultDescriptor::Payload(payload) => {
            arguments["metainfo"] = json!(STANDARD.encode(&payload.bytes));
        }
        ResultDescriptor::Magnet { link } => {
            arguments["filename"] = json!(link);
        }
    }
    json!({ "method": "torrent-add", "arguments": arguments })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
