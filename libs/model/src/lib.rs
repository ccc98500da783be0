//! Declarative deployment model.
//!
//! This library holds the value types shared by the convergence engine and
//! anything that talks to a node:
//!
//! - **Unit**: one observed service instance (name, image, ports, volumes,
//!   activation state). A node's actual state is a set of units compared by
//!   value.
//! - **DeploymentConfig / ApplicationCatalog**: the declarative documents a
//!   caller submits - which applications run where, and what each
//!   application looks like.
//! - **Expected state**: the resolution of config x catalog into the concrete
//!   per-node unit sets the cluster should converge to.
//!
//! # Invariants
//!
//! - Unit equality is value equality over every field; membership in the
//!   per-node set is the only observable property.
//! - An application is scheduled on at most one node at a time.
//! - Configs are immutable once submitted; a relocation is a brand-new
//!   `DeploymentConfig`, never a patch.

mod config;
mod error;
mod unit;

pub use config::{
    expected_state, resolve_unit, ApplicationCatalog, ApplicationConfig, DeploymentConfig, Link,
    PortMapping, VolumeSpec, CONFIG_VERSION, DEFAULT_VOLUME_ROOT,
};
pub use error::ValidationError;
pub use unit::{ActivationState, PortMap, Unit, Volume, BASE_NAMESPACE};
