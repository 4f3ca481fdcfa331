//! Subnet bindings stored as namespace annotations.
//!
//! The allocated subnet lives on the namespace object itself, so the
//! controller keeps no persistent state of its own: everything it needs after
//! a restart is recovered by listing namespaces.

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Namespace;
use serde_json::json;
use std::net::Ipv4Addr;
use std::str::FromStr;
use subnet_ipam::{gateway_for, IpamError};

/// Annotation holding the namespace's subnet in CIDR notation
pub const SUBNET_ANNOTATION: &str = "ipam.dcops.microscaler.io/subnet";

/// Annotation holding the gateway address for node-side plumbing
pub const GATEWAY_ANNOTATION: &str = "ipam.dcops.microscaler.io/gateway";

/// The parts of a namespace this controller cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRef {
    /// Namespace name
    pub name: String,
    /// Raw value of the subnet annotation, if present
    pub subnet_annotation: Option<String>,
    /// Whether the namespace has a deletion timestamp
    pub terminating: bool,
}

impl NamespaceRef {
    /// Creates a reference without any metadata
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subnet_annotation: None,
            terminating: false,
        }
    }

    /// Sets the raw subnet annotation
    pub fn with_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnet_annotation = Some(subnet.into());
        self
    }

    /// The subnet recorded on the namespace.
    ///
    /// A missing or empty annotation means the namespace is unbound.
    pub fn binding(&self) -> Result<Option<Ipv4Net>, IpamError> {
        match self.subnet_annotation.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Ipv4Net::from_str(raw)
                .map(|subnet| Some(subnet.trunc()))
                .map_err(|e| {
                    IpamError::InvalidBindingMetadata(format!(
                        "namespace {} has {}={:?}: {}",
                        self.name, SUBNET_ANNOTATION, raw, e
                    ))
                }),
        }
    }
}

impl From<&Namespace> for NamespaceRef {
    fn from(namespace: &Namespace) -> Self {
        let subnet_annotation = namespace
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(SUBNET_ANNOTATION))
            .cloned();

        Self {
            name: namespace.metadata.name.clone().unwrap_or_default(),
            subnet_annotation,
            terminating: namespace.metadata.deletion_timestamp.is_some(),
        }
    }
}

/// A subnet assigned to a namespace together with its gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetBinding {
    /// Allocated subnet
    pub subnet: Ipv4Net,
    /// First usable address of the subnet
    pub gateway: Ipv4Addr,
}

impl SubnetBinding {
    /// Binding for a freshly allocated subnet
    pub fn for_subnet(subnet: Ipv4Net) -> Self {
        Self {
            subnet,
            gateway: gateway_for(subnet),
        }
    }

    /// JSON merge patch writing both annotations
    pub fn annotation_patch(&self) -> serde_json::Value {
        json!({
            "metadata": {
                "annotations": {
                    SUBNET_ANNOTATION: self.subnet.to_string(),
                    GATEWAY_ANNOTATION: self.gateway.to_string(),
                }
            }
        })
    }
}
