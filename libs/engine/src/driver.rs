//! Convergence driver: turns a desired-state config into apply operations.
//!
//! The driver:
//! - Validates the config/catalog pair before touching anything
//! - Diffs each node's desired application set against the last set it
//!   successfully issued
//! - Issues stop/start operations only for the differing applications
//!
//! It returns once operations have been *issued*; whether they *took
//! effect* is the deployment verifier's job. Re-running with the same
//! config after convergence is a no-op.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use stevedore_model::{ApplicationCatalog, ApplicationConfig, DeploymentConfig, ValidationError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::observer::{ObservationError, StateObserver};

/// A single apply operation failed on a node.
#[derive(Debug, Clone, Error)]
#[error("apply failed on node {node}: {reason}")]
pub struct ApplyError {
    pub node: String,
    pub reason: String,
}

/// Narrow interface to whatever actually runs units on a node.
///
/// Both operations must be idempotent on the node side: a retry after
/// partial failure may reissue a start for an application that is already
/// running or a stop for one that is already gone.
#[async_trait]
pub trait UnitApplier: Send + Sync {
    async fn start_application(
        &self,
        node: &str,
        name: &str,
        app: &ApplicationConfig,
    ) -> Result<(), ApplyError>;

    async fn stop_application(&self, node: &str, name: &str) -> Result<(), ApplyError>;
}

/// One node that could not be fully updated.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub node: String,
    pub reason: String,
}

/// Why an apply did not complete.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Bad input; nothing was mutated.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Some nodes were updated and some were not. `succeeded` and `failed`
    /// partition the nodes that needed changes, so a caller can retry the
    /// same config and only the unfinished operations are reissued. An
    /// empty `succeeded` set is the pure communication-failure case.
    #[error(
        "apply incomplete: {} node(s) updated, {} failed",
        succeeded.len(),
        failed.len()
    )]
    PartialApply {
        succeeded: Vec<String>,
        failed: Vec<NodeFailure>,
    },
}

/// Acknowledgment that apply operations were issued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    /// Nodes that had a non-empty delta and were updated.
    pub changed: Vec<String>,

    /// Nodes whose desired set already matched the last issued one.
    pub unchanged: Vec<String>,
}

/// Per-node delta between the last issued and the newly desired app sets.
#[derive(Debug, Clone)]
struct NodeDelta {
    node: String,
    to_stop: BTreeSet<String>,
    to_start: BTreeSet<String>,
}

/// The single writer of cluster state.
pub struct ConvergenceDriver<A> {
    applier: A,

    /// Last application set successfully issued per node. Updated op by op,
    /// so a partial failure leaves an accurate record behind.
    issued: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl<A: UnitApplier> ConvergenceDriver<A> {
    pub fn new(applier: A) -> Self {
        Self {
            applier,
            issued: Mutex::new(BTreeMap::new()),
        }
    }

    /// Seed the issued record from the cluster's actual state.
    ///
    /// A driver only remembers what it issued itself. A caller that does
    /// not outlive the cluster (one CLI invocation, say) calls this before
    /// `apply` so applications deployed by an earlier process are part of
    /// the diff and get stopped when they move or disappear.
    pub async fn sync_with_cluster<O: StateObserver>(
        &self,
        observer: &O,
        config: &DeploymentConfig,
    ) -> Result<(), ObservationError> {
        let mut issued = self.issued.lock().await;
        for node in config.nodes.keys() {
            let units = observer.observe(node).await?;
            let apps: BTreeSet<String> = units.into_iter().map(|unit| unit.name).collect();
            debug!(node = %node, running = apps.len(), "Synced node state");
            if apps.is_empty() {
                issued.remove(node);
            } else {
                issued.insert(node.clone(), apps);
            }
        }
        Ok(())
    }

    /// Issue the operations needed to move the cluster toward `config`.
    ///
    /// Stops are issued before any start so a relocation releases its name
    /// and volume on the source node before the destination starts. When a
    /// stop fails, the matching start is withheld and reported as failed -
    /// an application never runs on two nodes at once.
    pub async fn apply(
        &self,
        config: &DeploymentConfig,
        catalog: &ApplicationCatalog,
    ) -> Result<Ack, DeployError> {
        config.validate(catalog)?;

        let mut issued = self.issued.lock().await;

        let mut nodes: BTreeSet<String> = config.nodes.keys().cloned().collect();
        nodes.extend(issued.keys().cloned());

        let mut deltas = Vec::new();
        let mut ack = Ack::default();
        for node in nodes {
            let desired = config.applications_on(&node);
            let current = issued.get(&node).cloned().unwrap_or_default();
            let to_stop: BTreeSet<String> = current.difference(&desired).cloned().collect();
            let to_start: BTreeSet<String> = desired.difference(&current).cloned().collect();

            if to_stop.is_empty() && to_start.is_empty() {
                debug!(node = %node, "No delta, leaving node untouched");
                ack.unchanged.push(node);
            } else {
                debug!(
                    node = %node,
                    stops = to_stop.len(),
                    starts = to_start.len(),
                    "Computed node delta"
                );
                deltas.push(NodeDelta {
                    node,
                    to_stop,
                    to_start,
                });
            }
        }

        let mut failed: BTreeMap<String, String> = BTreeMap::new();
        // Applications still running on a node whose stop did not go
        // through, keyed to that node. Their starts must not be issued.
        let mut blocked: BTreeMap<String, String> = BTreeMap::new();

        // Phase 1: all stops, across all nodes.
        for delta in &deltas {
            for name in &delta.to_stop {
                if failed.contains_key(&delta.node) {
                    blocked.insert(name.clone(), delta.node.clone());
                    continue;
                }
                match self.applier.stop_application(&delta.node, name).await {
                    Ok(()) => {
                        info!(node = %delta.node, application = %name, "Stopped application");
                        if let Some(apps) = issued.get_mut(&delta.node) {
                            apps.remove(name);
                        }
                    }
                    Err(e) => {
                        warn!(node = %delta.node, application = %name, error = %e, "Stop failed");
                        blocked.insert(name.clone(), delta.node.clone());
                        failed.insert(delta.node.clone(), e.reason);
                    }
                }
            }
        }

        // Phase 2: all starts, skipping nodes that already failed and
        // applications still held by their source node.
        for delta in &deltas {
            for name in &delta.to_start {
                if failed.contains_key(&delta.node) {
                    break;
                }
                if let Some(source) = blocked.get(name) {
                    warn!(
                        node = %delta.node,
                        application = %name,
                        source = %source,
                        "Start withheld, application still running on its source node"
                    );
                    failed.insert(
                        delta.node.clone(),
                        format!("start {name} withheld: stop on {source} failed"),
                    );
                    continue;
                }
                // validate() guarantees presence
                let app = &catalog.applications[name];
                match self.applier.start_application(&delta.node, name, app).await {
                    Ok(()) => {
                        info!(node = %delta.node, application = %name, "Started application");
                        issued.entry(delta.node.clone()).or_default().insert(name.clone());
                    }
                    Err(e) => {
                        warn!(node = %delta.node, application = %name, error = %e, "Start failed");
                        failed.insert(delta.node.clone(), e.reason);
                    }
                }
            }
        }

        issued.retain(|_, apps| !apps.is_empty());

        if failed.is_empty() {
            ack.changed = deltas.into_iter().map(|d| d.node).collect();
            info!(
                changed = ack.changed.len(),
                unchanged = ack.unchanged.len(),
                "Apply issued"
            );
            Ok(ack)
        } else {
            let succeeded: Vec<String> = deltas
                .iter()
                .filter(|d| !failed.contains_key(&d.node))
                .map(|d| d.node.clone())
                .collect();
            Err(DeployError::PartialApply {
                succeeded,
                failed: failed
                    .into_iter()
                    .map(|(node, reason)| NodeFailure { node, reason })
                    .collect(),
            })
        }
    }
}
