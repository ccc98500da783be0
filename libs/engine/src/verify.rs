//! Deployment verification: does actual state equal expected state?
//!
//! The verifier re-checks *every* node within one poll tick. Convergence
//! only counts when all nodes match simultaneously, so a node that regresses
//! after another converged is still caught on the next tick.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::time::Duration;

use stevedore_converge::{poll_until, PollError};
use stevedore_model::Unit;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::observer::StateObserver;

/// Poll cadence and deadline for one verification. Both are explicit:
/// node convergence and network readiness have different natural latencies
/// and the deadline is part of the correctness contract.
#[derive(Debug, Clone, Copy)]
pub struct VerifyOpts {
    pub interval: Duration,
    pub timeout: Duration,
}

/// What one node looked like relative to its expected unit set, as of the
/// last completed poll tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDiff {
    pub node: String,

    /// Expected but not observed.
    pub missing: BTreeSet<Unit>,

    /// Observed but not expected.
    pub unexpected: BTreeSet<Unit>,

    /// Set when the node could not be observed at all on the last tick.
    pub unreachable: Option<String>,
}

impl std::fmt::Display for NodeDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {}:", self.node)?;
        if let Some(reason) = &self.unreachable {
            return write!(f, " unreachable ({reason})");
        }
        for unit in &self.missing {
            write!(f, " missing {}", unit.name)?;
        }
        for unit in &self.unexpected {
            write!(f, " unexpected {}", unit.name)?;
        }
        Ok(())
    }
}

/// The cluster did not reach the expected state.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error(
        "cluster did not converge within {timeout:?}: {} node(s) mismatched",
        diffs.len()
    )]
    Timeout {
        timeout: Duration,
        /// Per-node set difference from the last completed tick.
        diffs: Vec<NodeDiff>,
    },
}

/// Polls actual state until it matches expected state.
pub struct DeploymentVerifier<O> {
    observer: O,
}

impl<O: StateObserver> DeploymentVerifier<O> {
    pub fn new(observer: O) -> Self {
        Self { observer }
    }

    /// Assert that every node's unit set converges to `expected` within
    /// `opts.timeout`. Unreachable nodes are treated as not-yet-converged
    /// and retried; they only surface in the timeout diff.
    pub async fn verify(
        &self,
        expected: &BTreeMap<String, BTreeSet<Unit>>,
        opts: VerifyOpts,
    ) -> Result<(), VerificationError> {
        let last_diffs = Mutex::new(Vec::new());

        let observer = &self.observer;
        let last = &last_diffs;
        let probe = || async move {
            let mut diffs = Vec::new();
            for (node, want) in expected {
                match observer.observe(node).await {
                    Ok(actual) => {
                        let missing: BTreeSet<Unit> =
                            want.difference(&actual).cloned().collect();
                        let unexpected: BTreeSet<Unit> =
                            actual.difference(want).cloned().collect();
                        if !missing.is_empty() || !unexpected.is_empty() {
                            diffs.push(NodeDiff {
                                node: node.clone(),
                                missing,
                                unexpected,
                                unreachable: None,
                            });
                        }
                    }
                    Err(e) => {
                        debug!(node = %node, error = %e, "Node not observable yet");
                        diffs.push(NodeDiff {
                            node: node.clone(),
                            missing: want.clone(),
                            unexpected: BTreeSet::new(),
                            unreachable: Some(e.reason),
                        });
                    }
                }
            }

            let converged = diffs.is_empty();
            *last.lock().await = diffs;
            Ok::<bool, Infallible>(converged)
        };

        match poll_until(probe, opts.interval, opts.timeout).await {
            Ok(ticks) => {
                info!(nodes = expected.len(), ticks, "Deployment verified");
                Ok(())
            }
            Err(PollError::Timeout { .. }) => Err(VerificationError::Timeout {
                timeout: opts.timeout,
                diffs: last_diffs.into_inner(),
            }),
            Err(PollError::Probe(infallible)) => match infallible {},
        }
    }
}
