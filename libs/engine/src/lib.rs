//! Convergence driver and verification engine.
//!
//! Given a declarative deployment (which applications run on which nodes)
//! this crate converges a cluster to it and proves the convergence happened:
//!
//! - **Driver**: diffs the newly desired per-node application sets against
//!   the last successfully issued ones and issues only the differing
//!   stop/start operations. Idempotent; reports partial failure exactly.
//! - **Observer**: read-only query of a node's actual unit set.
//! - **Deployment verifier**: polls all nodes with one combined predicate
//!   until actual state equals expected state, or times out with a per-node
//!   diff.
//! - **Link verifier**: staged proof that a consumer can reach a dependency
//!   through a declared link and that data written through the link arrives.
//!
//! The cluster is mutated only by the driver; everything else is a
//! read-only observer, so no locking beyond the driver's own bookkeeping is
//! needed. Concurrent runs against one cluster are not supported.

pub mod client;
pub mod driver;
pub mod link;
pub mod observer;
pub mod probes;
pub mod verify;

pub use client::NodeClient;
pub use driver::{Ack, ApplyError, ConvergenceDriver, DeployError, NodeFailure, UnitApplier};
pub use link::{LinkCheck, LinkError, LinkStage, LinkVerifier, LineSender, RecordStore};
pub use observer::{ObservationError, StateObserver};
pub use probes::{ProbeError, SearchIndexProbe, TcpLineSender};
pub use verify::{DeploymentVerifier, NodeDiff, VerificationError, VerifyOpts};
