//! Validation errors for deployment documents.
//!
//! Validation failures are fatal and surface before any apply operation is
//! issued - a config that fails here mutates nothing.

use thiserror::Error;

/// A deployment/catalog pair that cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// An application is scheduled on a node but missing from the catalog.
    #[error("unknown application {application:?} scheduled on node {node:?}")]
    UnknownApplication { node: String, application: String },

    /// An application appears on more than one node in the same config.
    #[error("application {application:?} scheduled on multiple nodes: {nodes:?}")]
    DuplicateApplication {
        application: String,
        nodes: Vec<String>,
    },

    /// Two port mappings in one application claim the same port.
    #[error("application {application:?} maps port {port} more than once")]
    DuplicatePort { application: String, port: u16 },

    /// Document version this engine does not understand.
    #[error("unsupported config version {version} (expected {expected})")]
    UnsupportedVersion { version: u32, expected: u32 },
}
