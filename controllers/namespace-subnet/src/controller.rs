//! Main controller implementation.
//!
//! This module contains the `Controller` struct that recovers existing
//! subnet bindings and starts the namespace watcher.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::store::KubeNamespaceStore;
use crate::watcher::Watcher;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for namespace subnet allocation.
pub struct Controller {
    namespace_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    ///
    /// Existing bindings are recovered before the watcher starts, so any
    /// failure here (API unreachable, invalid pools) aborts startup.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Namespace Subnet Controller");

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;

        let store = KubeNamespaceStore::new(kube_client);
        let namespace_api = store.api();

        // Recover bindings and build the pools
        let reconciler = Arc::new(Reconciler::start(&config.pools, store).await?);

        let watcher_instance = Watcher::new(reconciler, namespace_api);
        let namespace_watcher = tokio::spawn(async move {
            watcher_instance.watch_namespaces().await
        });

        Ok(Self { namespace_watcher })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Namespace Subnet Controller running");

        // The watcher should run forever
        self.namespace_watcher
            .await
            .map_err(|e| ControllerError::Watch(format!("Namespace watcher panicked: {}", e)))?
            .map_err(|e| ControllerError::Watch(format!("Namespace watcher error: {}", e)))?;

        Ok(())
    }
}
