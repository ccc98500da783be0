//! Read-only observation of a node's actual state.

use std::collections::BTreeSet;

use async_trait::async_trait;
use stevedore_model::Unit;
use thiserror::Error;

/// A node could not be observed. Transient by policy: the deployment
/// verifier retries it until its deadline rather than failing outright.
#[derive(Debug, Clone, Error)]
#[error("node {node} unreachable: {reason}")]
pub struct ObservationError {
    pub node: String,
    pub reason: String,
}

/// Queries a node for its currently running unit set.
///
/// Must be a pure read with no side effects - the verifier calls it on
/// every poll tick.
#[async_trait]
pub trait StateObserver: Send + Sync {
    async fn observe(&self, node: &str) -> Result<BTreeSet<Unit>, ObservationError>;
}
