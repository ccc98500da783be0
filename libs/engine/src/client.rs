//! HTTP client for the node API.
//!
//! Nodes expose a small JSON API:
//! - `PUT /v1/applications/{name}` - start an application (idempotent)
//! - `DELETE /v1/applications/{name}` - stop an application (idempotent)
//! - `GET /v1/units` - the currently running unit set
//!
//! `NodeClient` implements both [`UnitApplier`] and [`StateObserver`] over
//! it; a node identifier is the `host:port` of this API.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stevedore_model::{ApplicationConfig, Unit, CONFIG_VERSION};
use tracing::debug;

use crate::driver::{ApplyError, UnitApplier};
use crate::observer::{ObservationError, StateObserver};

/// Client for the per-node unit API.
#[derive(Debug, Clone)]
pub struct NodeClient {
    client: reqwest::Client,
}

impl NodeClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Self { client }
    }
}

impl Default for NodeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnitApplier for NodeClient {
    async fn start_application(
        &self,
        node: &str,
        name: &str,
        app: &ApplicationConfig,
    ) -> Result<(), ApplyError> {
        let url = format!("http://{node}/v1/applications/{name}");
        debug!(url = %url, "Starting application");

        let request = StartApplicationRequest {
            version: CONFIG_VERSION,
            application: app.clone(),
        };

        let response = self
            .client
            .put(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ApplyError {
                node: node.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApplyError {
                node: node.to_string(),
                reason: format!("start {name} failed: {status} - {body}"),
            });
        }

        Ok(())
    }

    async fn stop_application(&self, node: &str, name: &str) -> Result<(), ApplyError> {
        let url = format!("http://{node}/v1/applications/{name}");
        debug!(url = %url, "Stopping application");

        let response = self.client.delete(&url).send().await.map_err(|e| ApplyError {
            node: node.to_string(),
            reason: e.to_string(),
        })?;

        // Stopping something already gone is a success.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApplyError {
                node: node.to_string(),
                reason: format!("stop {name} failed: {status} - {body}"),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl StateObserver for NodeClient {
    async fn observe(&self, node: &str) -> Result<BTreeSet<Unit>, ObservationError> {
        let url = format!("http://{node}/v1/units");

        let response = self.client.get(&url).send().await.map_err(|e| ObservationError {
            node: node.to_string(),
            reason: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(ObservationError {
                node: node.to_string(),
                reason: format!("unit query failed: {}", response.status()),
            });
        }

        let body: UnitsResponse = response.json().await.map_err(|e| ObservationError {
            node: node.to_string(),
            reason: format!("malformed unit listing: {e}"),
        })?;

        debug!(
            node = %node,
            unit_count = body.units.len(),
            observed_at = %body.observed_at,
            "Observed node state"
        );

        Ok(body.units.into_iter().collect())
    }
}

/// Body of `PUT /v1/applications/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartApplicationRequest {
    pub version: u32,
    #[serde(flatten)]
    pub application: ApplicationConfig,
}

/// Body of `GET /v1/units`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitsResponse {
    pub units: Vec<Unit>,
    pub observed_at: DateTime<Utc>,
}
