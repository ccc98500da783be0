//! Link reachability verification.
//!
//! Proves that a consumer unit can reach a dependency unit through a
//! declared link, and that data written through the link is observably
//! received. One run walks a fixed sequence of stages:
//!
//! ```text
//! EstablishingDependency -> VerifyingPriorState -> Sending
//!     -> AwaitingReceipt -> Verified
//! ```
//!
//! A run is re-runnable after the dependency relocates to another node:
//! construct new probes for the new address and verify again with `prior`
//! set to what the first run delivered. Links resolve by alias, not by
//! fixed address, so the same check passing on the new node proves the
//! link survived the topology change.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use stevedore_converge::{poll_until, PollError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::probes::ProbeError;

/// Stages of one link verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStage {
    /// Waiting for the dependency (and the consumer's ingest socket) to
    /// answer a liveness probe.
    EstablishingDependency,
    /// Checking the dependency's record store holds exactly the declared
    /// prior records before anything is sent.
    VerifyingPriorState,
    /// Writing the message set through the consumer's link.
    Sending,
    /// Waiting for the sent messages to show up in the record store.
    AwaitingReceipt,
    /// Final set comparison.
    Verified,
}

impl std::fmt::Display for LinkStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkStage::EstablishingDependency => "establishing-dependency",
            LinkStage::VerifyingPriorState => "verifying-prior-state",
            LinkStage::Sending => "sending",
            LinkStage::AwaitingReceipt => "awaiting-receipt",
            LinkStage::Verified => "verified",
        };
        write!(f, "{name}")
    }
}

/// The dependency's observable record store, reached through its
/// externally mapped port.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Liveness handshake. False means "not up yet", never an error.
    async fn ping(&self) -> bool;

    /// Every record payload currently queryable.
    async fn records(&self) -> Result<BTreeSet<String>, ProbeError>;
}

/// Writes lines into the consumer, which forwards them over its declared
/// link to the dependency.
#[async_trait]
pub trait LineSender: Send + Sync {
    /// True once the consumer accepts connections.
    async fn ready(&self) -> bool;

    async fn send(&self, lines: &[String]) -> Result<(), ProbeError>;
}

/// One link verification run.
#[derive(Debug, Clone)]
pub struct LinkCheck {
    /// Records expected to already be present. Empty for a fresh scenario -
    /// anything unexpected here is an environment-reuse bug, not a
    /// transient condition. For a re-run after relocation, the previously
    /// delivered set.
    pub prior: BTreeSet<String>,

    /// Distinguishable payloads to send through the link.
    pub messages: BTreeSet<String>,

    pub interval: Duration,
    pub timeout: Duration,
}

/// Why a link verification run failed.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The dependency never answered its liveness probe.
    #[error("link-unreachable: dependency not answering after {timeout:?}")]
    Unreachable { timeout: Duration },

    /// The record store did not hold the declared prior records. Fatal,
    /// not retried.
    #[error("empty-state-violated: expected prior records {expected:?}, found {found:?}")]
    PriorStateViolated {
        expected: BTreeSet<String>,
        found: BTreeSet<String>,
    },

    /// A probe failed in a stage where failure is not transient.
    #[error("probe failed during {stage}: {source}")]
    Probe {
        stage: LinkStage,
        #[source]
        source: ProbeError,
    },

    /// Sent messages never became queryable.
    #[error("receipt timeout: {received}/{sent} messages visible after {timeout:?}")]
    ReceiptTimeout {
        sent: usize,
        received: usize,
        timeout: Duration,
    },

    /// The received set differs from what was sent.
    #[error(
        "message-set-mismatch: {} missing, {} unexpected",
        missing.len(),
        unexpected.len()
    )]
    MessageSetMismatch {
        missing: BTreeSet<String>,
        unexpected: BTreeSet<String>,
    },
}

/// Drives the staged link check against a pair of probes.
pub struct LinkVerifier<S, L> {
    store: S,
    sender: L,
}

impl<S: RecordStore, L: LineSender> LinkVerifier<S, L> {
    pub fn new(store: S, sender: L) -> Self {
        Self { store, sender }
    }

    /// Run all five stages. Any failure aborts the rest of the run.
    pub async fn verify(&self, check: &LinkCheck) -> Result<(), LinkError> {
        self.establish(check).await?;

        info!(stage = %LinkStage::VerifyingPriorState, "Link stage");
        let found = self
            .store
            .records()
            .await
            .map_err(|source| LinkError::Probe {
                stage: LinkStage::VerifyingPriorState,
                source,
            })?;
        if found != check.prior {
            return Err(LinkError::PriorStateViolated {
                expected: check.prior.clone(),
                found,
            });
        }

        info!(stage = %LinkStage::Sending, count = check.messages.len(), "Link stage");
        let lines: Vec<String> = check.messages.iter().cloned().collect();
        self.sender
            .send(&lines)
            .await
            .map_err(|source| LinkError::Probe {
                stage: LinkStage::Sending,
                source,
            })?;

        self.await_receipt(check).await?;

        info!(stage = %LinkStage::Verified, "Link stage");
        let received = self
            .store
            .records()
            .await
            .map_err(|source| LinkError::Probe {
                stage: LinkStage::Verified,
                source,
            })?;
        let expected: BTreeSet<String> =
            check.prior.union(&check.messages).cloned().collect();
        if received != expected {
            return Err(LinkError::MessageSetMismatch {
                missing: expected.difference(&received).cloned().collect(),
                unexpected: received.difference(&expected).cloned().collect(),
            });
        }

        info!(delivered = check.messages.len(), "Link verified");
        Ok(())
    }

    async fn establish(&self, check: &LinkCheck) -> Result<(), LinkError> {
        info!(stage = %LinkStage::EstablishingDependency, "Link stage");
        let store = &self.store;
        let sender = &self.sender;
        let probe = || async move {
            let up = store.ping().await && sender.ready().await;
            if !up {
                debug!("Dependency not answering yet");
            }
            Ok::<bool, std::convert::Infallible>(up)
        };

        match poll_until(probe, check.interval, check.timeout).await {
            Ok(_) => Ok(()),
            Err(PollError::Timeout { .. }) => Err(LinkError::Unreachable {
                timeout: check.timeout,
            }),
            Err(PollError::Probe(infallible)) => match infallible {},
        }
    }

    async fn await_receipt(&self, check: &LinkCheck) -> Result<(), LinkError> {
        info!(stage = %LinkStage::AwaitingReceipt, "Link stage");
        let last_seen = Mutex::new(0usize);

        let store = &self.store;
        let seen = &last_seen;
        let probe = || async move {
            // Query errors while the store catches up are transient here.
            match store.records().await {
                Ok(records) => {
                    *seen.lock().await = records.len();
                    Ok::<bool, std::convert::Infallible>(
                        check.messages.is_subset(&records),
                    )
                }
                Err(e) => {
                    debug!(error = %e, "Record query failed, retrying");
                    Ok(false)
                }
            }
        };

        match poll_until(probe, check.interval, check.timeout).await {
            Ok(_) => Ok(()),
            Err(PollError::Timeout { .. }) => Err(LinkError::ReceiptTimeout {
                sent: check.messages.len(),
                received: last_seen.into_inner(),
                timeout: check.timeout,
            }),
            Err(PollError::Probe(infallible)) => match infallible {},
        }
    }
}
