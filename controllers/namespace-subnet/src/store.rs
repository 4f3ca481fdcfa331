//! Namespace access for the reconciler.
//!
//! `NamespaceStore` abstracts the Kubernetes API so the reconciler can be unit
//! tested against an in-memory mock. The concrete `KubeNamespaceStore` talks to
//! the API server.

use crate::binding::{NamespaceRef, SubnetBinding};
use crate::error::ControllerError;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use tracing::debug;

/// Operations the reconciler needs on namespaces and their bindings.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait NamespaceStore: Send + Sync {
    /// Lists every namespace in the cluster
    async fn list_namespaces(&self) -> Result<Vec<NamespaceRef>, ControllerError>;

    /// Reads the current state of one namespace, `None` if it no longer exists
    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRef>, ControllerError>;

    /// Records the binding on the namespace
    async fn set_binding(&self, name: &str, binding: &SubnetBinding) -> Result<(), ControllerError>;
}

/// `NamespaceStore` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeNamespaceStore {
    api: Api<Namespace>,
}

impl KubeNamespaceStore {
    /// Creates a store over all namespaces visible to the client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    /// The underlying namespace API, shared with the watcher
    pub fn api(&self) -> Api<Namespace> {
        self.api.clone()
    }
}

#[async_trait::async_trait]
impl NamespaceStore for KubeNamespaceStore {
    async fn list_namespaces(&self) -> Result<Vec<NamespaceRef>, ControllerError> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(NamespaceRef::from).collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRef>, ControllerError> {
        let namespace = self.api.get_opt(name).await?;
        Ok(namespace.as_ref().map(NamespaceRef::from))
    }

    async fn set_binding(&self, name: &str, binding: &SubnetBinding) -> Result<(), ControllerError> {
        let patch = binding.annotation_patch();
        let pp = PatchParams::default();
        self.api
            .patch(name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| ControllerError::BindingWrite {
                namespace: name.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Patched namespace {} with subnet {}", name, binding.subnet);
        Ok(())
    }
}
