//! Declarative deployment documents and expected-state resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::unit::{ActivationState, PortMap, Unit, Volume};

/// Document version accepted by this engine. The field exists for forward
/// compatibility; anything else is rejected up front.
pub const CONFIG_VERSION: u32 = 1;

/// Host directory under which application volumes are materialized.
///
/// The node side derives the host path the same way, so expected-state
/// resolution and observation agree without coordination.
pub const DEFAULT_VOLUME_ROOT: &str = "/var/lib/stevedore/volumes";

/// Which applications run on which node.
///
/// This is a complete desired-state description, not a delta: every node the
/// caller cares about is listed, and an application absent from all lists is
/// not deployed. Relocating an application means submitting a new config
/// with it listed under a different node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub version: u32,

    /// Node identifier (host:port of the node API) to scheduled applications.
    pub nodes: BTreeMap<String, Vec<String>>,
}

impl DeploymentConfig {
    /// Desired application set for one node. Empty for unknown nodes.
    pub fn applications_on(&self, node: &str) -> BTreeSet<String> {
        self.nodes
            .get(node)
            .map(|apps| apps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check this config against a catalog. Fatal errors only; a passing
    /// pair is safe to hand to the convergence driver.
    pub fn validate(&self, catalog: &ApplicationCatalog) -> Result<(), ValidationError> {
        if self.version != CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                version: self.version,
                expected: CONFIG_VERSION,
            });
        }
        if catalog.version != CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                version: catalog.version,
                expected: CONFIG_VERSION,
            });
        }

        let mut seen: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (node, apps) in &self.nodes {
            for app in apps {
                if !catalog.applications.contains_key(app) {
                    return Err(ValidationError::UnknownApplication {
                        node: node.clone(),
                        application: app.clone(),
                    });
                }
                seen.entry(app).or_default().push(node.clone());
            }
        }
        for (app, nodes) in seen {
            if nodes.len() > 1 {
                return Err(ValidationError::DuplicateApplication {
                    application: app.to_string(),
                    nodes,
                });
            }
        }

        for (name, app) in &catalog.applications {
            app.validate(name)?;
        }

        Ok(())
    }
}

/// Catalog entry: what one application looks like when run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Image reference; `:latest` is assumed when no tag is given.
    pub image: String,

    #[serde(default)]
    pub ports: Vec<PortMapping>,

    /// Declared dependencies on other applications' externally mapped ports,
    /// addressed by alias rather than node location.
    #[serde(default)]
    pub links: Vec<Link>,

    /// Environment variables injected into the running container. Passed
    /// through the apply interface unchanged.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub volume: Option<VolumeSpec>,
}

impl ApplicationConfig {
    fn validate(&self, name: &str) -> Result<(), ValidationError> {
        let mut internal = BTreeSet::new();
        let mut external = BTreeSet::new();
        for mapping in &self.ports {
            if !internal.insert(mapping.internal) {
                return Err(ValidationError::DuplicatePort {
                    application: name.to_string(),
                    port: mapping.internal,
                });
            }
            if !external.insert(mapping.external) {
                return Err(ValidationError::DuplicatePort {
                    application: name.to_string(),
                    port: mapping.external,
                });
            }
        }
        Ok(())
    }
}

/// Application catalog keyed by application name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationCatalog {
    pub version: u32,
    pub applications: BTreeMap<String, ApplicationConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub internal: u16,
    pub external: u16,
}

/// A link from a consumer application to a dependency's external port.
///
/// Traffic sent to `local_port` inside the consumer reaches the dependency's
/// `remote_port` wherever the dependency currently runs; resolution is by
/// `alias`, not by fixed address, so links survive relocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub local_port: u16,
    pub remote_port: u16,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub mountpoint: PathBuf,
}

/// Resolve one catalog entry into the concrete unit a node will report once
/// the application is running.
pub fn resolve_unit(name: &str, app: &ApplicationConfig, volume_root: &Path) -> Unit {
    let image = if app.image.contains(':') {
        app.image.clone()
    } else {
        format!("{}:latest", app.image)
    };

    let ports = app
        .ports
        .iter()
        .map(|p| PortMap {
            internal_port: p.internal,
            external_port: p.external,
        })
        .collect();

    let volumes = app
        .volume
        .iter()
        .map(|v| Volume {
            host_path: volume_root.join(name),
            container_path: v.mountpoint.clone(),
        })
        .collect();

    Unit {
        name: name.to_string(),
        container_name: Unit::container_name_for(name),
        image,
        activation_state: ActivationState::Active,
        ports,
        volumes,
    }
}

/// Resolve config x catalog into the per-node unit sets the cluster should
/// converge to. Nodes listed with no applications resolve to the empty set,
/// which the deployment verifier checks just like any other.
pub fn expected_state(
    config: &DeploymentConfig,
    catalog: &ApplicationCatalog,
    volume_root: &Path,
) -> Result<BTreeMap<String, BTreeSet<Unit>>, ValidationError> {
    config.validate(catalog)?;

    let mut expected = BTreeMap::new();
    for (node, apps) in &config.nodes {
        let units = apps
            .iter()
            .map(|name| {
                // validate() guarantees presence
                let app = &catalog.applications[name];
                resolve_unit(name, app, volume_root)
            })
            .collect();
        expected.insert(node.clone(), units);
    }
    Ok(expected)
}
