//! Unit descriptors - the observed shape of one deployed service instance.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Namespace prefix for container names managed by stevedore.
///
/// Containers outside this namespace are invisible to the engine, so a node
/// can run unrelated workloads without confusing verification.
pub const BASE_NAMESPACE: &str = "stevedore--";

/// Activation state of a unit as reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    /// Unit is running.
    Active,
    /// Unit is starting up but not yet running.
    Activating,
    /// Unit exists but is stopped.
    Inactive,
}

impl std::fmt::Display for ActivationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivationState::Active => write!(f, "active"),
            ActivationState::Activating => write!(f, "activating"),
            ActivationState::Inactive => write!(f, "inactive"),
        }
    }
}

/// A single internal/external port mapping. Unique within a unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PortMap {
    pub internal_port: u16,
    pub external_port: u16,
}

/// A host path mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Volume {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
}

/// One deployed service instance on a node.
///
/// Units are ephemeral observations: recomputed on every state query, never
/// mutated in place. Two units are equal iff all attributes match, and a
/// node's state is a `BTreeSet<Unit>` - order is irrelevant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Unit {
    /// Application name, unique per node.
    pub name: String,

    /// Namespace-prefixed container name.
    pub container_name: String,

    /// Image including tag.
    pub image: String,

    pub activation_state: ActivationState,

    #[serde(default)]
    pub ports: BTreeSet<PortMap>,

    #[serde(default)]
    pub volumes: BTreeSet<Volume>,
}

impl Unit {
    /// The container name a unit with this application name will carry.
    pub fn container_name_for(name: &str) -> String {
        format!("{BASE_NAMESPACE}{name}")
    }
}
