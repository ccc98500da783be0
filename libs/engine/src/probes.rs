//! Concrete link probes.
//!
//! Two example probe implementations back the link verifier: an
//! elasticsearch-flavoured search index (liveness ping + `_search` record
//! query) and a newline-delimited TCP writer for the consumer side. Any
//! other protocol plugs in through the same traits.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::link::{LineSender, RecordStore};

/// A probe against a live service failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}")]
    Status { status: u16 },

    #[error("malformed response: {0}")]
    Decode(String),
}

/// Search-index record store probe (elasticsearch wire shape).
pub struct SearchIndexProbe {
    client: reqwest::Client,
    base_url: String,
}

impl SearchIndexProbe {
    pub fn new(host: &str, port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: format!("http://{host}:{port}"),
        }
    }

    async fn search(&self) -> Result<SearchResponse, ProbeError> {
        let url = format!("{}/_search", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProbeError::Status {
                status: response.status().as_u16(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ProbeError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RecordStore for SearchIndexProbe {
    async fn ping(&self) -> bool {
        match self.client.get(&self.base_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %self.base_url, error = %e, "Ping failed");
                false
            }
        }
    }

    async fn records(&self) -> Result<BTreeSet<String>, ProbeError> {
        let response = self.search().await?;
        Ok(response
            .hits
            .hits
            .into_iter()
            .map(|hit| hit.source.message)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: HitSource,
}

#[derive(Debug, Deserialize)]
struct HitSource {
    message: String,
}

/// Line-oriented TCP sender (telnet-style) for the consumer's ingest port.
pub struct TcpLineSender {
    host: String,
    port: u16,
}

impl TcpLineSender {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    fn addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

#[async_trait]
impl LineSender for TcpLineSender {
    async fn ready(&self) -> bool {
        match TcpStream::connect(self.addr()).await {
            Ok(_) => true,
            Err(e) => {
                debug!(host = %self.host, port = self.port, error = %e, "Connect failed");
                false
            }
        }
    }

    async fn send(&self, lines: &[String]) -> Result<(), ProbeError> {
        let mut stream = TcpStream::connect(self.addr())
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        for line in lines {
            stream
                .write_all(line.as_bytes())
                .await
                .map_err(|e| ProbeError::Transport(e.to_string()))?;
            stream
                .write_all(b"\n")
                .await
                .map_err(|e| ProbeError::Transport(e.to_string()))?;
        }

        stream
            .shutdown()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        debug!(host = %self.host, port = self.port, lines = lines.len(), "Lines sent");
        Ok(())
    }
}
