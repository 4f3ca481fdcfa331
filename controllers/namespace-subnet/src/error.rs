//! Controller-specific error types.
//!
//! This module defines error types specific to the Namespace Subnet Controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use subnet_ipam::IpamError;
use thiserror::Error;

/// Errors that can occur in the Namespace Subnet Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Subnet allocation or pool configuration error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Writing the subnet binding back to the namespace failed
    #[error("Failed to write subnet binding for namespace {namespace}: {reason}")]
    BindingWrite {
        /// Namespace being annotated
        namespace: String,
        /// Underlying failure
        reason: String,
    },

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
